//! Kernel async I/O seam.
//!
//! - [`UringDriver`]: io_uring. Submission never blocks, completions are reaped
//!   from the CQ.
//! - [`SyncDriver`]: `pwrite`/`pread` at push time, completion queued for the
//!   next reap. For kernels or sandboxes where io_uring is unavailable.

use core::fmt;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;

use io_uring::{opcode, types, IoUring};
use tracing::debug;

use super::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Read => f.write_str("read"),
            OpKind::Write => f.write_str("write"),
        }
    }
}

/// One prepared operation. `ptr` stays valid until its completion is reaped.
#[derive(Debug, Clone, Copy)]
pub struct IoRequest {
    pub kind: OpKind,
    pub fd: RawFd,
    pub ptr: *mut u8,
    pub len: u32,
    pub offset: u64,
    pub tag: u64,
}

/// Raw completion: the request tag and the kernel result (bytes, or `-errno`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCompletion {
    pub tag: u64,
    pub result: i32,
}

pub trait IoDriver {
    /// Queue one request. An error means nothing was queued.
    ///
    /// # Safety
    ///
    /// `req.ptr` must be valid for `req.len` bytes, and must not be read or
    /// written by anyone else until the completion carrying `req.tag` is reaped.
    unsafe fn push(&mut self, req: IoRequest) -> Result<()>;

    /// Hand queued requests to the kernel.
    ///
    /// On error the requests stay queued and may still run; their buffers
    /// remain borrowed until the completions are reaped.
    fn submit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Append every finished completion to `out`. Never blocks.
    fn reap(&mut self, out: &mut Vec<RawCompletion>) -> Result<()>;

    /// Block until at least one completion is ready to reap.
    fn wait(&mut self) -> Result<()>;
}

/// io_uring-backed driver. One ring per owner thread.
pub struct UringDriver {
    ring: IoUring,
}

impl UringDriver {
    /// Ring with room for `entries` in-flight operations.
    pub fn new(entries: u32) -> Result<Self> {
        let ring = IoUring::new(entries.max(1)).map_err(StorageError::Setup)?;
        debug!(entries, "io_uring context created");
        Ok(Self { ring })
    }
}

impl IoDriver for UringDriver {
    unsafe fn push(&mut self, req: IoRequest) -> Result<()> {
        let fd = types::Fd(req.fd);
        let entry = match req.kind {
            OpKind::Write => opcode::Write::new(fd, req.ptr as *const u8, req.len)
                .offset(req.offset)
                .build()
                .user_data(req.tag),
            OpKind::Read => opcode::Read::new(fd, req.ptr, req.len)
                .offset(req.offset)
                .build()
                .user_data(req.tag),
        };

        // SAFETY: the caller guarantees the buffer outlives the operation.
        unsafe {
            self.ring.submission().push(&entry).map_err(|_| StorageError::Submit {
                kind: req.kind,
                offset: req.offset,
                source: io::Error::new(io::ErrorKind::Other, "SQ full"),
            })
        }
    }

    fn submit(&mut self) -> Result<()> {
        loop {
            match self.ring.submit() {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Kernel is short on room; the entries stay in the SQ for `wait`.
                Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN | libc::EBUSY)) => {
                    debug!(error = %e, "io_uring submit deferred");
                    return Ok(());
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
    }

    fn reap(&mut self, out: &mut Vec<RawCompletion>) -> Result<()> {
        for cqe in self.ring.completion() {
            out.push(RawCompletion {
                tag: cqe.user_data(),
                result: cqe.result(),
            });
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        match self.ring.submit_and_wait(1) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// Synchronous fallback: the transfer happens inside `push`.
#[derive(Debug, Default)]
pub struct SyncDriver {
    done: VecDeque<RawCompletion>,
}

impl SyncDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IoDriver for SyncDriver {
    unsafe fn push(&mut self, req: IoRequest) -> Result<()> {
        let offset = req.offset as libc::off_t;
        let len = req.len as usize;
        // SAFETY: the caller guarantees `ptr` is valid for `len` bytes.
        let ret = unsafe {
            match req.kind {
                OpKind::Write => libc::pwrite(req.fd, req.ptr as *const libc::c_void, len, offset),
                OpKind::Read => libc::pread(req.fd, req.ptr as *mut libc::c_void, len, offset),
            }
        };

        let result = if ret < 0 {
            -io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
        } else {
            ret as i32
        };
        self.done.push_back(RawCompletion {
            tag: req.tag,
            result,
        });
        Ok(())
    }

    fn reap(&mut self, out: &mut Vec<RawCompletion>) -> Result<()> {
        out.extend(self.done.drain(..));
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persistence::buffer::AlignedBuffer;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_sync_driver_write_then_read() {
        let file = tempfile::tempfile().unwrap();
        let mut driver = SyncDriver::new();

        let mut out = AlignedBuffer::page_aligned(4096).unwrap();
        out.fill_from(b"hello").unwrap();
        let mut back = AlignedBuffer::page_aligned(4096).unwrap();

        unsafe {
            driver
                .push(IoRequest {
                    kind: OpKind::Write,
                    fd: file.as_raw_fd(),
                    ptr: out.as_mut_ptr(),
                    len: 4096,
                    offset: 8192,
                    tag: 7,
                })
                .unwrap();
            driver
                .push(IoRequest {
                    kind: OpKind::Read,
                    fd: file.as_raw_fd(),
                    ptr: back.as_mut_ptr(),
                    len: 4096,
                    offset: 8192,
                    tag: 8,
                })
                .unwrap();
        }

        let mut done = Vec::new();
        driver.reap(&mut done).unwrap();
        assert_eq!(
            done,
            vec![
                RawCompletion { tag: 7, result: 4096 },
                RawCompletion { tag: 8, result: 4096 },
            ]
        );
        assert_eq!(&back[..5], b"hello");
    }

    #[test]
    fn test_sync_driver_reports_errno() {
        let mut driver = SyncDriver::new();
        let mut buf = AlignedBuffer::page_aligned(4096).unwrap();
        unsafe {
            driver
                .push(IoRequest {
                    kind: OpKind::Write,
                    fd: 1_000_000,
                    ptr: buf.as_mut_ptr(),
                    len: 4096,
                    offset: 0,
                    tag: 1,
                })
                .unwrap();
        }
        let mut done = Vec::new();
        driver.reap(&mut done).unwrap();
        assert_eq!(done[0].result, -libc::EBADF);
    }
}
