use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;

/// A signalfd carrying SIGINT and SIGTERM. Creating one blocks both
/// signals from default delivery in the calling thread, so the reactor
/// becomes their only consumer. Only one of these should exist per
/// process.
#[derive(Debug)]
pub struct SignalFd {
    inner: FileDesc,
}

impl SignalFd {
    pub fn for_shutdown_signals() -> io::Result<SignalFd> {
        let mut set: libc::sigset_t = unsafe { mem::zeroed() };

        unsafe {
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);
        }

        syscall!(sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()))?;

        let sfd = syscall!(signalfd(-1, &set, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK))?;

        Ok(SignalFd {
            inner: FileDesc::new(sfd),
        })
    }

    /// Reads one pending signal, returning its number.
    pub fn read_signal(&self) -> io::Result<u32> {
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
        let size = mem::size_of::<libc::signalfd_siginfo>();

        let bytes = syscall!(read(
            self.inner.raw(),
            &mut info as *mut _ as *mut libc::c_void,
            size
        ))?;

        assert_eq!(bytes as usize, size);

        Ok(info.ssi_signo)
    }
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}
