macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod epoll;
pub mod fd;
pub mod shm;
pub mod signalfd;
pub mod socket;

/// Milliseconds on the monotonic clock. The scheduler's notion of "now".
pub fn monotonic_millis() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    match syscall!(clock_gettime(libc::CLOCK_MONOTONIC, &mut ts)) {
        Ok(_) => (ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000,
        Err(e) => panic!("clock_gettime(CLOCK_MONOTONIC) failed: {}", e),
    }
}
