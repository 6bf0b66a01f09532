//! Error classification: which failures are worth a reconnect, and which are
//! serialization conflicts worth a transaction retry.

use crate::error::Error;

/// The substring set is the contract: drivers report lost transports with
/// these phrases and nothing more structured.
const RECONNECT_SUBSTRINGS: &[&str] = &[
    "broken pipe",
    "bad connection",
    "connection timed out",
    "connection refused",
    "try another node",
    "unexpected EOF",
];

/// True when the error indicates a lost transport: the node should be marked
/// dead and the call retried elsewhere.
///
/// Canceled contexts are excluded up front: some drivers word a deadline
/// expiry as "connection timed out", and retrying a call the caller already
/// gave up on would be wrong.
pub fn is_reconnect_error(err: &Error) -> bool {
    if err.is_canceled() {
        return false;
    }

    let msg = err.to_string();
    RECONNECT_SUBSTRINGS.iter().any(|s| msg.contains(s))
}

/// A transaction rollback reported by the driver with SQLSTATE 40001.
pub fn is_serialization_failure(err: &Error) -> bool {
    err.is_serialization_failure()
}
