//! Destination slot for a call's result.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::Codec;

/// Cost of the two measured phases of a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    /// Network round trip up to response headers.
    pub request: Duration,
    /// Body read plus decode. Zero when decoding was skipped.
    pub decode: Duration,
}

impl Timing {
    pub fn total(&self) -> Duration {
        self.request + self.decode
    }
}

/// Caller-owned response. `send` writes `http_code`, `body` and `timing`.
///
/// `http_code` stays 0 when no response was received.
pub struct Response<T> {
    pub http_code: u16,
    pub body: T,
    pub codec: Option<Arc<dyn Codec>>,
    pub timing: Timing,
}

impl<T: fmt::Debug> fmt::Debug for Response<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("http_code", &self.http_code)
            .field("body", &self.body)
            .field("codec", &self.codec)
            .field("timing", &self.timing)
            .finish()
    }
}

impl<T: Default> Response<T> {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            http_code: 0,
            body: T::default(),
            codec: Some(codec),
            timing: Timing::default(),
        }
    }
}

impl<T> Response<T> {
    pub fn with_body(body: T, codec: Arc<dyn Codec>) -> Self {
        Self {
            http_code: 0,
            body,
            codec: Some(codec),
            timing: Timing::default(),
        }
    }
}
