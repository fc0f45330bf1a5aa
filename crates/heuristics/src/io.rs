#![forbid(unsafe_code)]

//! Non-blocking pipe helpers shared by the parent and the worker.

use crate::dynar::Dynar;
use crate::error::Error;
use crate::protocol::has_line;
use crate::send_buffer::SendBuffer;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, OwnedFd};

/// Largest amount of data moved by a single read or write call.
pub const IO_CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Nothing more to read right now.
    WouldBlock,
    /// Data was appended, or a complete line is waiting in the buffer.
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Complete,
    Partial,
    WouldBlock,
}

pub fn set_nonblocking(fd: impl AsFd) -> Result<(), Error> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// A pipe as a pair of files, read end first.
pub fn pipe() -> Result<(std::fs::File, std::fs::File), Error> {
    let (read, write): (OwnedFd, OwnedFd) = nix::unistd::pipe()?;
    Ok((read.into(), write.into()))
}

/// Read one chunk from `src` into `dest`.
///
/// A read never asks for more than the room left in `dest`. End of file is
/// reported as [`Error::ConnectionLost`]; a full buffer without any line
/// terminator as [`Error::BufferFull`].
pub fn read_chunk(src: &mut impl Read, dest: &mut Dynar) -> Result<ReadStatus, Error> {
    let room = dest.max_size().saturating_sub(dest.len()).min(IO_CHUNK_SIZE);
    if room == 0 {
        if has_line(dest) {
            return Ok(ReadStatus::Data);
        }
        return Err(Error::BufferFull {
            needed: dest.len() + 1,
            max: dest.max_size(),
        });
    }

    let mut chunk = [0u8; IO_CHUNK_SIZE];
    loop {
        match src.read(&mut chunk[..room]) {
            Ok(0) => return Err(Error::ConnectionLost),
            Ok(n) => {
                dest.cat(&chunk[..n])?;
                return Ok(ReadStatus::Data);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadStatus::WouldBlock),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write at most one chunk of `msg`, advancing its sent offset.
pub fn write_chunk(dest: &mut impl Write, msg: &mut SendBuffer) -> Result<WriteStatus, Error> {
    let unsent = msg.unsent();
    let len = unsent.len().min(IO_CHUNK_SIZE);

    match dest.write(&unsent[..len]) {
        Ok(0) if len > 0 => Err(Error::ZeroWrite),
        Ok(n) => {
            msg.msg_already_sent_bytes += n;
            Ok(if msg.is_fully_sent() {
                WriteStatus::Complete
            } else {
                WriteStatus::Partial
            })
        }
        Err(e) if e.kind() == ErrorKind::Interrupted => Ok(WriteStatus::Partial),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(WriteStatus::WouldBlock),
        Err(e) => Err(e.into()),
    }
}

/// Write all of `buf`, spinning on a non-blocking descriptor until it is
/// accepted.
pub fn blocking_write(dest: &mut impl Write, buf: &[u8]) -> Result<(), Error> {
    let mut written = 0;

    while written < buf.len() {
        match dest.write(&buf[written..]) {
            Ok(0) => return Err(Error::ZeroWrite),
            Ok(n) => written += n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                std::thread::yield_now();
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
