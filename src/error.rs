use std::num::ParseFloatError;

/// Error types for the openvpn-exporter library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Status file is in the legacy client-mode format, which carries no
    /// per-client records worth exporting.
    #[error("client mode status files are not supported")]
    ClientFormat,

    /// Status file does not start with a recognized server banner.
    #[error("unexpected file contents: {prefix:?}")]
    UnrecognizedFormat { prefix: String },

    /// A data row appeared before the HEADER line declaring its columns.
    #[error("{record} should be preceded by HEADER")]
    MissingHeader { record: String },

    /// A data row's field count disagrees with its HEADER declaration.
    #[error("HEADER for {record} describes {expected} columns, row has {actual}")]
    ColumnMismatch {
        record: String,
        expected: usize,
        actual: usize,
    },

    /// A line starts with a keyword the status format does not define.
    #[error("unsupported key: {keyword:?}")]
    UnknownKeyword { keyword: String },

    /// A TIME line carried an unparsable UNIX timestamp.
    #[error("invalid status timestamp {value:?}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: ParseFloatError,
    },

    /// A metric column held something other than a number.
    #[error("invalid value {value:?} for column {column}")]
    InvalidValue {
        column: String,
        value: String,
        #[source]
        source: ParseFloatError,
    },

    /// An I/O error occurred while reading the status stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using the library error.
pub type Result<T> = std::result::Result<T, Error>;
