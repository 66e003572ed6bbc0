use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// An owned file descriptor, closed on drop.
#[derive(Debug)]
pub struct FileDesc(RawFd);

impl FileDesc {
    pub fn new(fd: RawFd) -> Self {
        FileDesc(fd)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    pub fn into_raw(self) -> RawFd {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(read(
            self.0,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ))?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(
            self.0,
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        ))?;
        Ok(n as usize)
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        let flags = syscall!(fcntl(self.0, libc::F_GETFD))?;
        syscall!(fcntl(self.0, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
        Ok(())
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(fd)
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.into_raw()
    }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.0);
        }
    }
}
