//! Append-only transaction log of a run's records.
//!
//! File layout: a 7-byte header (`:RHL`, magic `0xBEE1` little-endian,
//! version byte) followed by records framed as
//! `[crc32c u32 LE][length u32 LE][JSON record]`.

pub mod buffered;
pub mod store;

pub use buffered::BufferedReadSeeker;
pub use store::{LogReader, LogWriter, LOG_HEADER_LEN, LOG_IDENT, LOG_MAGIC, LOG_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum TxLogError {
    #[error("failed to open transaction log {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write transaction log {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read transaction log {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transaction log {path} has an invalid header")]
    BadHeader { path: String },
    #[error("transaction log {path} is corrupt at offset {offset}")]
    Corrupt { path: String, offset: u64 },
    #[error("failed to encode record for {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode record in {path} at offset {offset}: {source}")]
    Decode {
        path: String,
        offset: u64,
        #[source]
        source: serde_json::Error,
    },
}
