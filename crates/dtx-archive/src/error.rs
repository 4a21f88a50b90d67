use std::fmt;

/// Errors produced while encoding or decoding keyed archives.
#[derive(Debug)]
pub enum ArchiveError {
    /// The bytes are not a parseable property list, or serialization of an
    /// archive failed.
    InvalidEncoding(plist::Error),
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding(e) => write!(f, "invalid keyed-archive encoding: {e}"),
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidEncoding(e) => Some(e),
        }
    }
}

impl From<plist::Error> for ArchiveError {
    fn from(e: plist::Error) -> Self {
        Self::InvalidEncoding(e)
    }
}
