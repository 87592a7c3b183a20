//! CPU pinning for the writer thread.
//!
//! Pinning the writer next to the target device keeps completion interrupts
//! and buffer memory on one locality domain. Injectable so tests and
//! unprivileged hosts do not need the syscall.

use std::io;

use tracing::debug;

pub trait AffinityPolicy: Send {
    /// Pin the calling thread to `core`.
    fn pin_current_thread(&self, core: usize) -> io::Result<()>;
}

/// Default: never pins.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAffinity;

impl AffinityPolicy for NoAffinity {
    #[inline(always)]
    fn pin_current_thread(&self, _core: usize) -> io::Result<()> {
        Ok(())
    }
}

/// `sched_setaffinity` on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedAffinity;

impl AffinityPolicy for SchedAffinity {
    fn pin_current_thread(&self, core: usize) -> io::Result<()> {
        if core >= libc::CPU_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("core {core} outside cpu set"),
            ));
        }

        // SAFETY: cpu_set_t is plain data; zeroed is the empty set.
        let rc = unsafe {
            let mut set: libc::cpu_set_t = core::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core, &mut set);
            libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(core, "writer thread pinned");
        Ok(())
    }
}
