use crate::error::InvalidTransferId;

/// Longest accepted transfer id, in bytes.
const MAX_ID_LEN: usize = 200;

/// Validates that a transfer id can name a file inside the cache directory.
///
/// Rejects:
/// - Empty ids and ids longer than 200 bytes
/// - Path separators (`/`, `\`) and drive/stream separators (`:`)
/// - `.` and `..`
/// - NUL and other control characters
pub fn validate_transfer_id(id: &str) -> Result<(), InvalidTransferId> {
    if id.is_empty() {
        return Err(InvalidTransferId("empty id".into()));
    }

    if id.len() > MAX_ID_LEN {
        return Err(InvalidTransferId(format!(
            "id longer than {MAX_ID_LEN} bytes"
        )));
    }

    if id == "." || id == ".." {
        return Err(InvalidTransferId(format!("reserved name: {id}")));
    }

    if let Some(c) = id
        .chars()
        .find(|c| matches!(c, '/' | '\\' | ':') || c.is_control())
    {
        return Err(InvalidTransferId(format!(
            "character {c:?} not allowed: {id:?}"
        )));
    }

    Ok(())
}
