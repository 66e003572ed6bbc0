//! Shared-memory ping client: publishes requests carrying its id and a
//! sequence number, waits for each echo, reports round-trip latency.
//!
//! `cargo run --example ring_client <client-id>` against a running
//! `ring_server`.

use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

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

    let client_id: u32 = std::env::args()
        .nth(1)
        .expect("usage: ring_client <client-id>")
        .parse()
        .expect("client id");

    let mut request = mpsc::Producer::new(QUEUE_SIZE);
    let mut echo = spmc::Consumer::new(QUEUE_SIZE);

    let request_shm = SharedMemory::attach(REQUEST_NAME, request.memory_size()).unwrap();
    let echo_shm = SharedMemory::attach(ECHO_NAME, echo.memory_size()).unwrap();

    unsafe {
        request.set_memory(request_shm.as_ptr(), false);
        echo.set_memory(echo_shm.as_ptr(), false);
    }

    println!("publishing to {} as client {}", REQUEST_NAME, client_id);

    let started = Instant::now();
    let mut seq: u32 = 0;
    let mut lag_total: u64 = 0;
    let mut lag_worst: u64 = 0;
    let mut report_at = Instant::now();

    while RUN.load(Ordering::Relaxed) {
        let sent_at = started.elapsed().as_nanos() as u64;

        let event = Event {
            ticks: sent_at,
            client_id,
            seq,
        };

        match request.reserve(Event::SIZE) {
            Some(buf) => {
                event.encode(buf);
                request.publish();
            }
            None => {
                // lost the reservation race, try again
                hint::spin_loop();
                continue;
            }
        }

        // wait for our pong, skipping other clients' echoes
        loop {
            if !RUN.load(Ordering::Relaxed) {
                return;
            }

            let pong = match echo.next(false) {
                Some(msg) => Event::decode(msg),
                None => {
                    hint::spin_loop();
                    continue;
                }
            };

            if pong.client_id != client_id {
                continue;
            }

            assert_eq!(pong.seq, seq, "echo out of sequence");

            let lag = started.elapsed().as_nanos() as u64 - pong.ticks;
            lag_total += lag;
            lag_worst = lag_worst.max(lag);
            break;
        }

        seq = seq.wrapping_add(1);

        if report_at.elapsed().as_secs() >= 5 {
            println!(
                "{} round trips, mean {}ns, worst {}ns",
                seq,
                lag_total / seq.max(1) as u64,
                lag_worst
            );
            report_at = Instant::now();
        }
    }
}
