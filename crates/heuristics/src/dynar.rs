#![forbid(unsafe_code)]

//! Growable byte buffer with a hard upper bound.
//!
//! All pipe traffic is accumulated and drained through a [`Dynar`]. Every
//! operation that would push the logical length past `max_size` fails and
//! leaves the buffer untouched; nothing is ever silently truncated.

use crate::error::Error;
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct Dynar {
    data: Vec<u8>,
    max_size: usize,
}

impl Dynar {
    pub fn new(max_size: usize) -> Self {
        Self {
            data: Vec::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Change the bound. Content already stored is kept even if it is now
    /// over the new bound; only further growth is refused.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Append `bytes` at the end.
    pub fn cat(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.ensure_room(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Insert `bytes` in front of the current content.
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.ensure_room(bytes.len())?;
        self.data.splice(0..0, bytes.iter().copied());
        Ok(())
    }

    /// Reset the length to zero. The allocation is kept for reuse.
    pub fn clean(&mut self) {
        self.data.clear();
    }

    /// Grow (zero filled) or truncate the logical length.
    pub fn set_size(&mut self, size: usize) -> Result<(), Error> {
        if size > self.max_size {
            return Err(Error::BufferFull {
                needed: size,
                max: self.max_size,
            });
        }
        self.data.resize(size, 0);
        Ok(())
    }

    /// Replace the content with `s`.
    pub fn str_cpy(&mut self, s: &str) -> Result<(), Error> {
        if s.len() > self.max_size {
            return Err(Error::BufferFull {
                needed: s.len(),
                max: self.max_size,
            });
        }
        self.clean();
        self.cat(s.as_bytes())
    }

    /// Drop the first `count` bytes, moving the rest to the front.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.drain(..count);
    }

    fn ensure_room(&self, extra: usize) -> Result<(), Error> {
        let needed = self.data.len().saturating_add(extra);
        if needed > self.max_size {
            return Err(Error::BufferFull {
                needed,
                max: self.max_size,
            });
        }
        Ok(())
    }
}

/// Lets `write!` format straight into the buffer. A capacity violation
/// surfaces as [`fmt::Error`] and leaves the partial write in place, so
/// callers [`clean`](Dynar::clean) before reuse.
impl fmt::Write for Dynar {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.cat(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

impl fmt::Debug for Dynar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dynar")
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("max_size", &self.max_size)
            .finish()
    }
}
