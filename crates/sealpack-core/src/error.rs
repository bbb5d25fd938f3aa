use thiserror::Error;

pub type SealResult<T> = Result<T, SealError>;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("format error: {0}")]
    Format(String),

    #[error("key format error: {0}")]
    KeyFormat(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("no matching recipient: the private key does not unlock any header packet")]
    NoMatchingRecipient,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`SealError`], used for user-facing
/// messages and process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    KeyFormat,
    Authentication,
    NoMatchingRecipient,
    Configuration,
    Cancelled,
    Io,
}

impl SealError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SealError::Format(_) => ErrorKind::Format,
            SealError::KeyFormat(_) => ErrorKind::KeyFormat,
            SealError::Authentication(_) => ErrorKind::Authentication,
            SealError::NoMatchingRecipient => ErrorKind::NoMatchingRecipient,
            SealError::Configuration(_) => ErrorKind::Configuration,
            SealError::Cancelled => ErrorKind::Cancelled,
            SealError::Io(_) => ErrorKind::Io,
        }
    }

    /// Map an I/O error raised while parsing a container or key file.
    ///
    /// A short read means the input was truncated, which is a format
    /// problem rather than a failing device.
    pub fn from_read(e: std::io::Error, what: &str) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SealError::Format(format!("truncated input while reading {what}"))
        } else {
            SealError::Io(e)
        }
    }
}

impl ErrorKind {
    /// Process exit code for the CLI. 1 is left to generic failures.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Format => 2,
            ErrorKind::KeyFormat => 3,
            ErrorKind::Authentication => 4,
            ErrorKind::NoMatchingRecipient => 5,
            ErrorKind::Configuration => 6,
            ErrorKind::Cancelled => 130,
            ErrorKind::Io => 7,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Format => "format error",
            ErrorKind::KeyFormat => "key format error",
            ErrorKind::Authentication => "authentication error",
            ErrorKind::NoMatchingRecipient => "no matching recipient",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "I/O error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_eof_is_format_error() {
        let e = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err = SealError::from_read(e, "header");
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(err.to_string().contains("header"));
    }

    #[test]
    fn test_other_io_errors_stay_io() {
        let e = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = SealError::from_read(e, "header");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::Format,
            ErrorKind::KeyFormat,
            ErrorKind::Authentication,
            ErrorKind::NoMatchingRecipient,
            ErrorKind::Configuration,
            ErrorKind::Cancelled,
            ErrorKind::Io,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_display_names_kind() {
        let err = SealError::Authentication("chunk 3".into());
        assert_eq!(err.kind().to_string(), "authentication error");
        assert_eq!(err.to_string(), "authentication failed: chunk 3");
    }
}
