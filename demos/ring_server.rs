//! Shared-memory ping server: owns the request (N→1) and echo (1→N)
//! rings, bounces every request back with its payload intact.
//!
//! `cargo run --example ring_server`, then any number of
//! `ring_client <id>` processes.

use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};

use strand_io::ring::{mpsc, spmc};
use strand_io::sys::shm::SharedMemory;

mod ring_common;
use ring_common::{Event, ECHO_NAME, QUEUE_SIZE, REQUEST_NAME};

static RUN: AtomicBool = AtomicBool::new(true);

extern "C" fn on_signal(_signo: libc::c_int) {
    RUN.store(false, Ordering::Relaxed);
}

fn main() {
    env_logger::init();

    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    let mut request = mpsc::Consumer::new(QUEUE_SIZE);
    let mut echo = spmc::Producer::new(QUEUE_SIZE);

    let request_shm = SharedMemory::create(REQUEST_NAME, request.memory_size()).unwrap();
    let echo_shm = SharedMemory::create(ECHO_NAME, echo.memory_size()).unwrap();

    unsafe {
        request.set_memory(request_shm.as_ptr(), true);
        echo.set_memory(echo_shm.as_ptr(), true);
    }

    println!("waiting for requests on {}", REQUEST_NAME);

    let mut rxd: u64 = 0;

    while RUN.load(Ordering::Relaxed) {
        let event = match request.next() {
            Some(msg) => Event::decode(msg),
            None => {
                hint::spin_loop();
                continue;
            }
        };
        request.consume();

        rxd += 1;

        let out = echo.reserve(Event::SIZE);
        event.encode(out);
        echo.publish();

        if rxd % 1_000_000 == 0 {
            println!("bounced {} requests", rxd);
        }
    }

    println!("done, bounced {} requests", rxd);
}
