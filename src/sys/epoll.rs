use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// Thin wrapper over the epoll facility. Event payloads carry the
/// registered file descriptor; interest masks are raw `EPOLL*` bits.
#[derive(Debug)]
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Epoll { epfd })
    }

    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }

    pub fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout_msecs: i32,
    ) -> io::Result<usize> {
        let cnt = syscall!(epoll_wait(
            self.epfd,
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout_msecs
        ))?;

        unsafe { events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}
