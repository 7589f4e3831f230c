use super::{BufferedReadSeeker, TxLogError};
use crate::record::Record;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const LOG_IDENT: [u8; 4] = *b":RHL";
pub const LOG_MAGIC: u16 = 0xBEE1;
pub const LOG_VERSION: u8 = 1;
pub const LOG_HEADER_LEN: usize = 7;
const RECORD_HEADER_LEN: usize = 8;
const MAX_RECORD_BYTES: u32 = 64 * 1024 * 1024;

fn encode_header() -> [u8; LOG_HEADER_LEN] {
    let mut header = [0u8; LOG_HEADER_LEN];
    header[..4].copy_from_slice(&LOG_IDENT);
    header[4..6].copy_from_slice(&LOG_MAGIC.to_le_bytes());
    header[6] = LOG_VERSION;
    header
}

pub struct LogWriter {
    path: PathBuf,
    file: BufWriter<File>,
    records: u64,
}

impl LogWriter {
    /// Creates (or truncates) the log at `path` and writes its header.
    pub fn create(path: &Path) -> Result<Self, TxLogError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| TxLogError::Open {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let file = File::create(path).map_err(|source| TxLogError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let mut writer = Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            records: 0,
        };
        let header = encode_header();
        writer.write_bytes(&header)?;
        writer.flush()?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn append(&mut self, record: &Record) -> Result<(), TxLogError> {
        let payload = serde_json::to_vec(record).map_err(|source| TxLogError::Encode {
            path: self.path.display().to_string(),
            source,
        })?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_BYTES)
            .ok_or_else(|| TxLogError::Write {
                path: self.path.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("record of {} bytes is too large", payload.len()),
                ),
            })?;
        let crc = crc32c::crc32c(&payload);
        self.write_bytes(&crc.to_le_bytes())?;
        self.write_bytes(&len.to_le_bytes())?;
        self.write_bytes(&payload)?;
        self.records += 1;
        Ok(())
    }

    /// Pushes buffered records to disk.
    pub fn flush(&mut self) -> Result<(), TxLogError> {
        self.file
            .flush()
            .and_then(|()| self.file.get_ref().sync_data())
            .map_err(|source| TxLogError::Write {
                path: self.path.display().to_string(),
                source,
            })
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TxLogError> {
        self.file.write_all(bytes).map_err(|source| TxLogError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }
}

/// Sequential reader over a transaction log.
///
/// A record that is only partly on disk is not an error: the reader rewinds
/// to its start and reports `None`, so calling again after the writer
/// catches up continues where it left off.
pub struct LogReader<R = File> {
    source: BufferedReadSeeker<R>,
    path: String,
}

impl LogReader<File> {
    pub fn open(path: &Path) -> Result<Self, TxLogError> {
        let file = File::open(path).map_err(|source| TxLogError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_reader(file, path.display().to_string())
    }
}

impl<R: Read + Seek> LogReader<R> {
    pub fn from_reader(reader: R, label: impl Into<String>) -> Result<Self, TxLogError> {
        let path = label.into();
        let source = BufferedReadSeeker::new(reader).map_err(|source| TxLogError::Read {
            path: path.clone(),
            source,
        })?;
        let mut reader = Self { source, path };
        let mut header = [0u8; LOG_HEADER_LEN];
        if !reader.fill(&mut header)? || header != encode_header() {
            return Err(TxLogError::BadHeader { path: reader.path });
        }
        reader.source.set_seek_cutoff(LOG_HEADER_LEN as u64);
        Ok(reader)
    }

    /// Offset of the next record to be read.
    pub fn offset(&self) -> u64 {
        self.source.position()
    }

    pub fn next_record(&mut self) -> Result<Option<Record>, TxLogError> {
        let start = self.source.position();
        let mut head = [0u8; RECORD_HEADER_LEN];
        if !self.fill(&mut head)? {
            self.rewind(start)?;
            return Ok(None);
        }
        let crc = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        if len > MAX_RECORD_BYTES {
            return Err(self.corrupt(start));
        }

        let mut payload = vec![0u8; len as usize];
        if !self.fill(&mut payload)? {
            self.rewind(start)?;
            return Ok(None);
        }
        if crc32c::crc32c(&payload) != crc {
            return Err(self.corrupt(start));
        }
        let record = serde_json::from_slice(&payload).map_err(|source| TxLogError::Decode {
            path: self.path.clone(),
            offset: start,
            source,
        })?;
        let end = self.source.position();
        self.source.set_seek_cutoff(end);
        Ok(Some(record))
    }

    /// Reads every complete record currently in the log.
    pub fn read_to_end(&mut self) -> Result<Vec<Record>, TxLogError> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    // Returns false when the source ran out before `out` was filled.
    fn fill(&mut self, out: &mut [u8]) -> Result<bool, TxLogError> {
        let mut filled = 0;
        while filled < out.len() {
            match self.source.read(&mut out[filled..]) {
                Ok(0) => return Ok(false),
                Ok(count) => filled += count,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(TxLogError::Read {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(true)
    }

    fn rewind(&mut self, offset: u64) -> Result<(), TxLogError> {
        self.source
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|source| TxLogError::Read {
                path: self.path.clone(),
                source,
            })
    }

    fn corrupt(&self, offset: u64) -> TxLogError {
        tracing::error!(path = %self.path, offset, "txlog: corrupt record");
        TxLogError::Corrupt {
            path: self.path.clone(),
            offset,
        }
    }
}
