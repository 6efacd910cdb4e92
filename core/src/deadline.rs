//! Deadline propagation through a request header.
//!
//! The header carries the caller's remaining budget in whole milliseconds,
//! not an absolute timestamp, so client and server clocks do not need to
//! agree. Sub-millisecond remainders round up: a live context never sends 0.

use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::context::CallContext;
use crate::error::{CancelReason, Error};

/// Header carrying the remaining time budget in milliseconds.
pub const TIMEOUT_HEADER: HeaderName = HeaderName::from_static("timeout-millisecond");

/// Convert a remaining budget to its wire value.
pub fn header_value(remaining: Duration) -> HeaderValue {
    let millis = remaining.as_micros().div_ceil(1000);
    HeaderValue::from(u64::try_from(millis).unwrap_or(u64::MAX))
}

/// Read a budget back from headers. Missing or malformed values yield `None`.
pub fn parse(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(&TIMEOUT_HEADER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_millis)
}

/// Write the context's remaining budget into `headers`.
///
/// A context without a deadline leaves the headers untouched. A context that
/// has already expired fails, since the receiver could do nothing useful.
pub fn inject(ctx: &CallContext, headers: &mut HeaderMap) -> Result<(), Error> {
    let Some(remaining) = ctx.remaining() else {
        return Ok(());
    };
    if remaining.is_zero() {
        return Err(Error::Cancelled(CancelReason::DeadlineExceeded));
    }
    headers.insert(TIMEOUT_HEADER, header_value(remaining));
    Ok(())
}
