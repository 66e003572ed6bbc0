//! Cross-thread ring scenarios over real POSIX shared memory: the
//! broadcast stream with a piggy-back reader, and many request
//! producers acknowledged over the broadcast ring.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use strand_io::ring::{mpsc, spmc};
use strand_io::sys::shm::SharedMemory;

fn shm_name(tag: &str) -> String {
    format!("/strand-io-{}-{}", tag, std::process::id())
}

#[test]
fn spmc_stream_in_order_with_piggy_back_reader() {
    const COUNT: u64 = 100_000;
    // large enough to retain the full stream for the late reader
    const QUEUE: u64 = 1 << 17;

    let mut producer = spmc::Producer::new(QUEUE);
    let shm = SharedMemory::create(&shm_name("spmc"), producer.memory_size()).unwrap();
    unsafe { producer.set_memory(shm.as_ptr(), true) };

    let mut consumer = spmc::Consumer::new(QUEUE);
    let mut reader = spmc::Consumer::new(QUEUE);
    unsafe {
        consumer.set_memory(shm.as_ptr(), false);
        reader.set_memory(shm.as_ptr(), false);
    }

    let producer_thread = thread::spawn(move || {
        let mut producer = producer;

        for seq in 0..COUNT {
            let buf = producer.reserve(42);
            buf[..8].copy_from_slice(&seq.to_ne_bytes());
            buf[8..].fill((seq % 251) as u8);
            producer.publish();
        }
    });

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut seen = 0u64;

    while seen < COUNT {
        match consumer.next(true) {
            Some(msg) => {
                assert_eq!(u64::from_ne_bytes(msg[..8].try_into().unwrap()), seen);
                assert!(msg[8..42].iter().all(|&b| b == (seen % 251) as u8));
                seen += 1;
            }
            None => {
                assert!(Instant::now() < deadline, "consumer starved at {}", seen);
                hint::spin_loop();
            }
        }
    }

    producer_thread.join().unwrap();

    // the piggy-back reader replays the identical stream
    for seq in 0..COUNT {
        let msg = reader.next(false).unwrap();
        assert_eq!(u64::from_ne_bytes(msg[..8].try_into().unwrap()), seq);
    }

    assert!(reader.next(false).is_none());
}

#[test]
fn spmc_randomized_sizes_survive_wrapping() {
    use rand::Rng;

    const QUEUE: u64 = 16;

    let mut producer = spmc::Producer::new(QUEUE);
    let shm = SharedMemory::create(&shm_name("spmc-rand"), producer.memory_size()).unwrap();
    unsafe { producer.set_memory(shm.as_ptr(), true) };

    let mut consumer = spmc::Consumer::new(QUEUE);
    unsafe { consumer.set_memory(shm.as_ptr(), false) };

    let mut rng = rand::rng();

    for round in 0..10_000u32 {
        // up to five records, forcing frequent skip records at the wrap
        let len = rng.random_range(1..=300usize);
        let marker = (round % 251) as u8;

        let buf = producer.reserve(len);
        buf.fill(marker);
        producer.publish();

        let msg = consumer.next(true).unwrap();
        assert!(msg[..len].iter().all(|&b| b == marker), "round {}", round);
        assert!(consumer.next(true).is_none());
    }
}

const EVENT_SIZE: usize = 16;

fn encode_event(buf: &mut [u8], client_id: u32, seq: u32) {
    buf[..4].copy_from_slice(&client_id.to_ne_bytes());
    buf[4..8].copy_from_slice(&seq.to_ne_bytes());
}

fn decode_event(msg: &[u8]) -> (u32, u32) {
    (
        u32::from_ne_bytes(msg[..4].try_into().unwrap()),
        u32::from_ne_bytes(msg[4..8].try_into().unwrap()),
    )
}

#[test]
fn mpsc_many_producers_with_spmc_acknowledgement() {
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 1000;
    const REQUEST_QUEUE: u64 = 4096;
    // holds every acknowledgement, so piggy-back readers never lag out
    const ECHO_QUEUE: u64 = 8192;

    let mut request_consumer = mpsc::Consumer::new(REQUEST_QUEUE);
    let request_shm =
        SharedMemory::create(&shm_name("request"), request_consumer.memory_size()).unwrap();
    unsafe { request_consumer.set_memory(request_shm.as_ptr(), true) };

    let mut echo_producer = spmc::Producer::new(ECHO_QUEUE);
    let echo_shm = SharedMemory::create(&shm_name("echo"), echo_producer.memory_size()).unwrap();
    unsafe { echo_producer.set_memory(echo_shm.as_ptr(), true) };

    let mut workers = Vec::new();

    for client_id in 0..PRODUCERS {
        let mut request_producer = mpsc::Producer::new(REQUEST_QUEUE);
        let mut echo_reader = spmc::Consumer::new(ECHO_QUEUE);
        unsafe {
            request_producer.set_memory(request_shm.as_ptr(), false);
            echo_reader.set_memory(echo_shm.as_ptr(), false);
        }

        workers.push(thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(30);

            for seq in 0..PER_PRODUCER {
                loop {
                    assert!(Instant::now() < deadline, "producer {} stuck", client_id);

                    match request_producer.reserve(EVENT_SIZE) {
                        Some(buf) => {
                            encode_event(buf, client_id, seq);
                            request_producer.publish();
                            break;
                        }
                        None => hint::spin_loop(),
                    }
                }
            }

            // wait for our acknowledgements, in our publish order
            let mut acked = 0u32;
            while acked < PER_PRODUCER {
                assert!(Instant::now() < deadline, "producer {} unacked", client_id);

                match echo_reader.next(false) {
                    Some(msg) => {
                        let (id, seq) = decode_event(msg);
                        if id == client_id {
                            assert_eq!(seq, acked);
                            acked += 1;
                        }
                    }
                    None => hint::spin_loop(),
                }
            }
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut per_client_seq = [0u32; PRODUCERS as usize];
    let mut received = 0u32;

    while received < PRODUCERS * PER_PRODUCER {
        let event = match request_consumer.next() {
            Some(msg) => decode_event(msg),
            None => {
                assert!(Instant::now() < deadline, "server starved at {}", received);
                hint::spin_loop();
                continue;
            }
        };
        request_consumer.consume();

        let (client_id, seq) = event;
        assert!(client_id < PRODUCERS);

        // each producer's subsequence arrives in its own order
        assert_eq!(per_client_seq[client_id as usize], seq);
        per_client_seq[client_id as usize] += 1;
        received += 1;

        // acknowledge over the broadcast ring
        let ack = echo_producer.reserve(EVENT_SIZE);
        encode_event(ack, client_id, seq);
        echo_producer.publish();
    }

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(per_client_seq.iter().all(|&seq| seq == PER_PRODUCER));
}
