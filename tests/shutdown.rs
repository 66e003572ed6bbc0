//! Signal-driven shutdown through the interrupt handler. Kept in its
//! own test binary: the scheduler masks SIGINT/SIGTERM for the
//! installing thread and must be the only consumer.

use std::time::{Duration, Instant};

use strand_io::{Deferred, Scheduler};

#[test]
fn sigterm_shuts_the_reactor_down() {
    let sched = Scheduler::new().unwrap();
    assert!(sched.has_interrupt_handler());

    // raise() targets the calling thread, where the scheduler holds
    // the signal mask
    let raise = Deferred::new(&sched, 0, || unsafe {
        libc::raise(libc::SIGTERM);
    });
    raise.call_later(100);

    let start = Instant::now();
    sched.run(false).unwrap();

    assert!(!sched.is_running());
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_secs(10));
}
