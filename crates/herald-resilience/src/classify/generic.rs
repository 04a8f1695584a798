//! Platform-agnostic transient failure detection.

use super::ProviderError;

/// Network and gateway codes that are always worth retrying.
const TRANSIENT_CODES: &[&str] = &[
    "timeout",
    "timed-out",
    "etimedout",
    "esockettimedout",
    "connection-reset",
    "econnreset",
    "econnrefused",
    "econnaborted",
    "epipe",
    "eai_again",
    "ehostunreach",
    "enetunreach",
    "network-error",
    "socket-hang-up",
    "408",
    "500",
    "502",
    "503",
    "504",
];

/// Message fragments that identify a transport-level failure.
const TRANSIENT_MESSAGES: &[&str] = &[
    "socket hang up",
    "connection reset",
    "connection refused",
    "timed out",
    "temporarily unavailable",
    "bad gateway",
    "gateway timeout",
];

/// Whether `error` is a transient network condition on any platform.
pub fn is_transient(error: &ProviderError) -> bool {
    let code = error.code.trim().to_ascii_lowercase();
    if TRANSIENT_CODES.contains(&code.as_str()) {
        return true;
    }

    let message = error.message.to_ascii_lowercase();
    TRANSIENT_MESSAGES.iter().any(|m| message.contains(m))
}
