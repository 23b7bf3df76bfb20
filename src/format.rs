use crate::error::{Error, Result};

/// Number of bytes to inspect when classifying a status file. Long enough
/// to cover the longest recognized banner, `OpenVPN STATISTICS`.
pub const PEEK_LEN: usize = 18;

/// The dialects of the OpenVPN server status file.
///
/// Version 2 and version 3 differ only in their field separator. The
/// client-mode format (`OpenVPN STATISTICS`) is detected so it can be
/// rejected with a useful message instead of a parse error further in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFormat {
    /// `--status-version 2`, comma separated.
    ServerV2,
    /// `--status-version 3`, tab separated.
    ServerV3,
}

impl StatusFormat {
    /// Classify a status file by its leading bytes.
    ///
    /// This is a pure prefix match; callers hand in at most [`PEEK_LEN`]
    /// bytes and no input is consumed.
    pub fn detect(prefix: &[u8]) -> Result<StatusFormat> {
        if prefix.starts_with(b"TITLE,") {
            Ok(StatusFormat::ServerV2)
        } else if prefix.starts_with(b"TITLE\t") {
            Ok(StatusFormat::ServerV3)
        } else if prefix.starts_with(b"OpenVPN STATISTICS") {
            Err(Error::ClientFormat)
        } else {
            Err(Error::UnrecognizedFormat {
                prefix: String::from_utf8_lossy(prefix).into_owned(),
            })
        }
    }

    /// The field separator used by this dialect.
    pub fn separator(self) -> char {
        match self {
            StatusFormat::ServerV2 => ',',
            StatusFormat::ServerV3 => '\t',
        }
    }
}
