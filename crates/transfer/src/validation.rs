use std::path::{Component, Path};

use crate::TransferError;

/// Longest key accepted by S3-compatible stores, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Validates a destination key before any store call is made.
///
/// Keys usually come straight from a browser-supplied file name, so beyond
/// the store's length limit this also rejects anything that would escape a
/// directory when the key is mapped onto a filesystem:
/// - Empty keys and keys with control characters
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_destination_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidKey("empty key".into()));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::InvalidKey(format!(
            "key is {} bytes, limit is {MAX_KEY_LEN}",
            key.len()
        )));
    }

    if key.chars().any(char::is_control) {
        return Err(TransferError::InvalidKey(format!(
            "control characters not allowed: {key:?}"
        )));
    }

    let path = Path::new(key);

    if path.is_absolute() {
        return Err(TransferError::InvalidKey(format!(
            "absolute path not allowed: {key}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidKey(format!(
                    "parent directory traversal not allowed: {key}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidKey(format!(
                    "path prefix not allowed: {key}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidKey(format!(
                    "absolute path not allowed: {key}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_key() {
        assert!(validate_destination_key("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_destination_key("../../../etc/passwd").is_err());
        assert!(validate_destination_key("videos/../../escape").is_err());
        assert!(validate_destination_key("..").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_destination_key("/tmp/malicious").is_err());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_destination_key("clip\n.mp4").is_err());
        assert!(validate_destination_key("clip\0.mp4").is_err());
    }

    #[test]
    fn rejects_overlong_key() {
        let key = "a".repeat(MAX_KEY_LEN + 1);
        assert!(validate_destination_key(&key).is_err());
        assert!(validate_destination_key(&key[..MAX_KEY_LEN]).is_ok());
    }

    #[test]
    fn accepts_plain_file_name() {
        assert!(validate_destination_key("holiday.mp4").is_ok());
    }

    #[test]
    fn accepts_prefixed_key() {
        assert!(validate_destination_key("uploads/2024/holiday.mp4").is_ok());
        assert!(validate_destination_key("./holiday.mp4").is_ok());
    }

    #[test]
    fn accepts_spaces_and_unicode() {
        assert!(validate_destination_key("my video (final) é.mov").is_ok());
    }
}
