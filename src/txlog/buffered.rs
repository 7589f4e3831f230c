use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;

/// Read cache over a seekable source, tuned for seeking back a short
/// distance and re-reading the tail.
///
/// Bytes read from the source are kept in `buf`, covering
/// `[buf_start, buf_start + buf.len())`. Whenever `pos` lies outside that
/// range it equals `reader_end`, the source's own position. Not shared
/// between threads; the owner drives it.
pub struct BufferedReadSeeker<R> {
    inner: R,
    buf: Vec<u8>,
    buf_start: u64,
    pos: u64,
    reader_end: u64,
}

impl<R: Read + Seek> BufferedReadSeeker<R> {
    /// Wraps `inner` at its current position.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let reader_end = inner.stream_position()?;
        Ok(Self {
            inner,
            buf: Vec::new(),
            buf_start: reader_end,
            pos: reader_end,
            reader_end,
        })
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn buffered_range(&self) -> Range<u64> {
        self.buf_start..self.buf_end()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Promises that no later seek targets an offset before `offset`.
    ///
    /// The cached prefix is only released once that frees at least half of
    /// the buffer, so a cutoff advancing record by record stays amortized.
    pub fn set_seek_cutoff(&mut self, offset: u64) {
        let cutoff = offset.min(self.buf_end());
        if cutoff <= self.buf_start {
            return;
        }
        let discard = (cutoff - self.buf_start) as usize;
        if discard * 2 < self.buf.len() {
            return;
        }
        self.buf.drain(..discard);
        self.buf_start = cutoff;
    }

    fn buf_end(&self) -> u64 {
        self.buf_start + self.buf.len() as u64
    }

    fn in_buffer(&self, offset: u64) -> bool {
        offset >= self.buf_start && offset < self.buf_end()
    }
}

impl<R: Read + Seek> Read for BufferedReadSeeker<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.in_buffer(self.pos) {
            let offset = (self.pos - self.buf_start) as usize;
            let count = out.len().min(self.buf.len() - offset);
            out[..count].copy_from_slice(&self.buf[offset..offset + count]);
            self.pos += count as u64;
            return Ok(count);
        }

        if self.pos != self.reader_end {
            // Only reachable after a cutoff dropped the bytes at `pos`.
            self.reader_end = self.inner.seek(SeekFrom::Start(self.pos))?;
        }
        if self.buf_end() != self.reader_end {
            self.buf.clear();
            self.buf_start = self.reader_end;
        }

        let count = self.inner.read(out)?;
        self.buf.extend_from_slice(&out[..count]);
        self.reader_end += count as u64;
        self.pos = self.reader_end;
        Ok(count)
    }
}

impl<R: Read + Seek> Seek for BufferedReadSeeker<R> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let absolute = match target {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => match self.pos.checked_add_signed(delta) {
                Some(offset) => Some(offset),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek to a negative position",
                    ))
                }
            },
            SeekFrom::End(_) => None,
        };

        if let Some(offset) = absolute {
            if self.in_buffer(offset) || offset == self.reader_end {
                self.pos = offset;
                return Ok(offset);
            }
        }

        let target = match absolute {
            Some(offset) => SeekFrom::Start(offset),
            None => target,
        };
        let landed = self.inner.seek(target)?;
        self.pos = landed;
        self.reader_end = landed;
        Ok(landed)
    }
}
