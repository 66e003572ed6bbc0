use std::ffi::CString;
use std::io;
use std::ptr;

use log::debug;

/// A named POSIX shared memory region. One side creates, the other
/// attaches; the creator unlinks the name when dropped.
#[derive(Debug)]
pub struct SharedMemory {
    name: CString,
    ptr: *mut u8,
    size: usize,
    owns: bool,
}

unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Creates (and truncates to `size`) a fresh region, replacing any
    /// stale one left behind under the same name.
    pub fn create(name: &str, size: usize) -> io::Result<SharedMemory> {
        let cname = cstring(name)?;

        // unlink if exists - ignores error
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }

        let fd = syscall!(shm_open(
            cname.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o666 as libc::mode_t
        ))?;

        if let Err(e) = syscall!(ftruncate(fd, size as libc::off_t)) {
            unsafe {
                libc::close(fd);
            }
            return Err(e);
        }

        let ptr = map(fd, size)?;

        debug!("created shared memory [{}], total size {}", name, size);

        Ok(SharedMemory {
            name: cname,
            ptr,
            size,
            owns: true,
        })
    }

    /// Attaches to a region created by another process.
    pub fn attach(name: &str, size: usize) -> io::Result<SharedMemory> {
        let cname = cstring(name)?;

        let fd = syscall!(shm_open(cname.as_ptr(), libc::O_RDWR, 0o666 as libc::mode_t))?;

        let ptr = map(fd, size)?;

        debug!("attached to shared memory [{}], total size {}", name, size);

        Ok(SharedMemory {
            name: cname,
            ptr,
            size,
            owns: false,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);

            if self.owns {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

fn cstring(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "shared memory name contains NUL")
    })
}

fn map(fd: libc::c_int, size: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };

    unsafe {
        libc::close(fd);
    }

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    Ok(ptr as *mut u8)
}
