//! Status-code sets and validation.
//!
//! `http::StatusCode` already knows every registered code and its reason
//! phrase. What it does not know is how the response logic classifies them:
//!
//! | Set | Codes | Effect |
//! |---|---|---|
//! | **empty** | 204, 205, 304 | body is dropped, no Content-Type/Length |
//! | **redirect** | 300, 301, 302, 303, 305, 307, 308 | `redirect()` keeps the current code |
//! | **retry** | 502, 503, 504 | upstream may be retried |

use http::StatusCode;

use crate::error::{Error, Result};

/// Statuses that must not carry a body.
pub fn is_empty(code: StatusCode) -> bool {
    matches!(code.as_u16(), 204 | 205 | 304)
}

/// Redirection statuses.
pub fn is_redirect(code: StatusCode) -> bool {
    matches!(code.as_u16(), 300 | 301 | 302 | 303 | 305 | 307 | 308)
}

/// Statuses a client may retry.
///
/// ```rust
/// use http::StatusCode;
///
/// assert!(wharf::status::is_retry(StatusCode::SERVICE_UNAVAILABLE));
/// assert!(!wharf::status::is_retry(StatusCode::NOT_IMPLEMENTED));
/// ```
pub fn is_retry(code: StatusCode) -> bool {
    matches!(code.as_u16(), 502 | 503 | 504)
}

/// Parses an integer status, accepting only 100–999.
pub fn validate(code: u16) -> Result<StatusCode> {
    if !(100..=999).contains(&code) {
        return Err(Error::InvalidStatus(code));
    }
    StatusCode::from_u16(code).map_err(|_| Error::InvalidStatus(code))
}

/// Reason phrase, or the empty string for unregistered codes.
pub fn message(code: StatusCode) -> &'static str {
    code.canonical_reason().unwrap_or("")
}
