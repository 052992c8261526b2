//! Response status codes and the status-line mapping.

pub const OK: u16 = 200;
/// Sender must resume from the offset carried in `currentOffset`.
pub const RESET: u16 = 205;
pub const BAD_REQUEST: u16 = 400;
pub const FORBIDDEN: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const INTERNAL_SERVER_ERROR: u16 = 500;
pub const NOT_IMPLEMENTED: u16 = 501;
pub const SERVICE_UNAVAILABLE: u16 = 503;

/// Protocol version written on every response line.
pub const RESPONSE_VERSION: &str = "HTTP/1.0";

/// Reason phrase for a status code. Unknown codes render as `Other`.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        OK => "OK",
        RESET => "Reset",
        BAD_REQUEST => "Bad Request",
        FORBIDDEN => "Forbidden",
        NOT_FOUND => "Not Found",
        INTERNAL_SERVER_ERROR => "Internal Server Error",
        NOT_IMPLEMENTED => "Not Implemented",
        SERVICE_UNAVAILABLE => "Service Unavailable",
        _ => "Other",
    }
}

/// Full status line without the trailing CRLF, e.g. `HTTP/1.0 205 Reset`.
pub fn status_line(code: u16) -> String {
    format!("{RESPONSE_VERSION} {code} {}", reason_phrase(code))
}

/// 2xx codes other than [`RESET`].
pub fn is_success(code: u16) -> bool {
    (200..300).contains(&code) && code != RESET
}
