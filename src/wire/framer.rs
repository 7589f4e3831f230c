use super::WireError;
use std::io::{self, Read, Write};

pub const FRAME_MAGIC: u8 = b'W';
/// Magic byte followed by a little-endian `u32` payload length.
pub const HEADER_LEN: usize = 5;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u8,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn new(payload_len: u32) -> Self {
        Self {
            magic: FRAME_MAGIC,
            payload_len,
        }
    }

    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.magic;
        out[1..].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..HEADER_LEN)?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&raw[1..]);
        Some(Self {
            magic: raw[0],
            payload_len: u32::from_le_bytes(len),
        })
    }

    pub fn is_valid(self) -> bool {
        self.magic == FRAME_MAGIC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split<'a> {
    /// Not enough bytes yet; call again with the same prefix plus more data.
    NeedMore,
    Frame { advance: usize, payload: &'a [u8] },
}

/// Stream-scanning split function over a growing byte prefix.
///
/// The parsed header is remembered between calls until its payload is
/// complete, then cleared so the next call parses a fresh header.
#[derive(Debug, Clone)]
pub struct FrameSplitter {
    header: Option<FrameHeader>,
    max_payload: usize,
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::new(u32::MAX as usize)
    }
}

impl FrameSplitter {
    pub fn new(max_payload: usize) -> Self {
        Self {
            header: None,
            max_payload,
        }
    }

    pub fn split<'a>(&mut self, data: &'a [u8], at_eof: bool) -> Result<Split<'a>, WireError> {
        let header = match self.header {
            Some(header) => header,
            None => {
                let Some(header) = FrameHeader::decode(data) else {
                    if at_eof && !data.is_empty() {
                        return Err(WireError::Truncated {
                            needed: HEADER_LEN,
                            available: data.len(),
                        });
                    }
                    return Ok(Split::NeedMore);
                };
                if !header.is_valid() {
                    tracing::error!(found = header.magic, "wire: invalid frame magic");
                    return Err(WireError::BadMagic {
                        found: header.magic,
                    });
                }
                let len = header.payload_len as usize;
                if len > self.max_payload {
                    return Err(WireError::FrameTooLarge {
                        len,
                        max: self.max_payload,
                    });
                }
                self.header = Some(header);
                header
            }
        };

        let total = HEADER_LEN + header.payload_len as usize;
        if data.len() < total {
            if at_eof {
                return Err(WireError::Truncated {
                    needed: total,
                    available: data.len(),
                });
            }
            return Ok(Split::NeedMore);
        }

        self.header = None;
        Ok(Split::Frame {
            advance: total,
            payload: &data[HEADER_LEN..total],
        })
    }
}

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = u32::try_from(payload.len()).map_err(|_| WireError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&FrameHeader::new(len).encode());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Writes one frame and flushes `writer`.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), WireError> {
    let len = u32::try_from(payload.len()).map_err(|_| WireError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&FrameHeader::new(len).encode())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Pulls whole frames out of a byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    splitter: FrameSplitter,
    eof: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_payload(inner, u32::MAX as usize)
    }

    pub fn with_max_payload(inner: R, max_payload: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            start: 0,
            splitter: FrameSplitter::new(max_payload),
            eof: false,
        }
    }

    /// Returns the next payload, `Ok(None)` on a clean end of stream.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        loop {
            match self.splitter.split(&self.buf[self.start..], self.eof)? {
                Split::Frame { advance, payload } => {
                    let payload = payload.to_vec();
                    self.start += advance;
                    if self.start == self.buf.len() {
                        self.buf.clear();
                        self.start = 0;
                    }
                    return Ok(Some(payload));
                }
                Split::NeedMore if self.eof => return Ok(None),
                Split::NeedMore => self.fill()?,
            }
        }
    }

    fn fill(&mut self) -> Result<(), WireError> {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        let filled = self.buf.len();
        self.buf.resize(filled + READ_CHUNK, 0);
        let read = loop {
            match self.inner.read(&mut self.buf[filled..]) {
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.buf.truncate(filled);
                    return Err(err.into());
                }
            }
        };
        self.buf.truncate(filled + read);
        if read == 0 {
            self.eof = true;
        }
        Ok(())
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}
