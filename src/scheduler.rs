use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use log::{info, warn};

use crate::selector::{Ops, SelectionKey, Selector};
use crate::sys;
use crate::sys::signalfd::SignalFd;

/// How long to sleep per iteration when no timer is pending.
const DEFAULT_SLEEP_MSECS: u64 = 60 * 1000;

/// Readiness callbacks dispatched by the scheduler.
///
/// Implement only the callbacks matching the registered interest; the
/// defaults treat a dispatch as a bug. `repr` identifies the handler in
/// logs and panics.
pub trait EventHandler {
    fn do_read(&self, _key: &Rc<SelectionKey>) {
        panic!("{}: do_read() not implemented, shouldn't be registered", self.repr());
    }

    fn do_write(&self, _key: &Rc<SelectionKey>) {
        panic!("{}: do_write() not implemented, shouldn't be registered", self.repr());
    }

    fn do_accept(&self, _key: &Rc<SelectionKey>) {
        panic!("{}: do_accept() not implemented, shouldn't be registered", self.repr());
    }

    fn do_connect(&self, _key: &Rc<SelectionKey>) {
        panic!("{}: do_connect() not implemented, shouldn't be registered", self.repr());
    }

    fn repr(&self) -> String;
}

/// The scheduler's view of one pending callback. An implementation
/// detail of [`Deferred`]: cancellation merely severs the back-reference
/// and leaves the memory for the scheduler to reclaim on next
/// observation.
pub(crate) struct Timer {
    deferred: RefCell<Option<Rc<DeferredCore>>>,
    scheduled: Cell<bool>,
    priority: u32,
    trigger_at: Cell<u64>,
}

struct HeapEntry {
    trigger_at: u64,
    seq: u64,
    timer: Rc<Timer>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &HeapEntry) -> bool {
        self.trigger_at == other.trigger_at && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &HeapEntry) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want the earliest
        // trigger time first, insertion order breaking ties
        match (self.trigger_at, self.seq).cmp(&(other.trigger_at, other.seq)) {
            Ordering::Equal => Ordering::Equal,
            Ordering::Greater => Ordering::Less,
            Ordering::Less => Ordering::Greater,
        }
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &HeapEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct DeferredCore {
    timer: RefCell<Option<Rc<Timer>>>,
    priority: u32,
    scheduler: Weak<Inner>,
    wakeup: RefCell<Box<dyn FnMut()>>,
}

impl DeferredCore {
    fn wakeup_from_scheduler(&self) {
        // clear first, so the callback may re-arm this deferred
        self.timer.borrow_mut().take();
        (self.wakeup.borrow_mut())();
    }
}

/// A user-owned "call me back in N milliseconds" handle.
///
/// Arming hands an internal [`Timer`] to the scheduler. Zero-delay
/// deferreds fire at the end of the current reactor tick, highest
/// priority first, FIFO within a priority. Dropping a `Deferred`
/// cancels it.
pub struct Deferred {
    core: Rc<DeferredCore>,
}

impl Deferred {
    pub fn new<F>(scheduler: &Scheduler, priority: u32, wakeup: F) -> Deferred
    where
        F: FnMut() + 'static,
    {
        Deferred {
            core: Rc::new(DeferredCore {
                timer: RefCell::new(None),
                priority,
                scheduler: Rc::downgrade(&scheduler.inner),
                wakeup: RefCell::new(Box::new(wakeup)),
            }),
        }
    }

    /// Arms the deferred unless it is already armed.
    pub fn call_later(&self, msecs: u64) {
        if !self.is_active() {
            self.arm(msecs);
        }
    }

    /// Cancels any pending arm, then arms.
    pub fn call_later_reset(&self, msecs: u64) {
        self.cancel();
        self.arm(msecs);
    }

    /// Severs the timer; the scheduler reclaims its memory later.
    /// A no-op when not armed.
    pub fn cancel(&self) {
        if let Some(timer) = self.core.timer.borrow_mut().take() {
            timer.deferred.borrow_mut().take();
        }
    }

    pub fn is_active(&self) -> bool {
        self.core.timer.borrow().is_some()
    }

    fn arm(&self, msecs: u64) {
        let scheduler = match self.core.scheduler.upgrade() {
            Some(inner) => Scheduler { inner },
            None => {
                warn!("call_later on a dropped scheduler");
                return;
            }
        };

        let timer = Rc::new(Timer {
            deferred: RefCell::new(Some(self.core.clone())),
            scheduled: Cell::new(false),
            priority: self.core.priority,
            trigger_at: Cell::new(0),
        });

        *self.core.timer.borrow_mut() = Some(timer.clone());

        scheduler.call_later(msecs, timer);
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Catches SIGINT/SIGTERM through a signalfd registered with the
/// selector and turns them into a scheduler shutdown. Installed by
/// [`Scheduler::new`]; only one may exist per process.
pub struct InterruptHandler {
    sfd: SignalFd,
    scheduler: Weak<Inner>,
}

impl EventHandler for InterruptHandler {
    fn do_read(&self, key: &Rc<SelectionKey>) {
        assert_eq!(key.fileno(), self.sfd.as_raw_fd());

        match self.sfd.read_signal() {
            Ok(signo) => {
                info!("signal received ({}) - doing shutdown", signal_name(signo));
                if let Some(inner) = self.scheduler.upgrade() {
                    inner.running.set(false);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("failed to read from signalfd: {}", e),
        }
    }

    fn repr(&self) -> String {
        "InterruptHandler".to_owned()
    }
}

fn signal_name(signo: u32) -> &'static str {
    match signo as libc::c_int {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        _ => "unexpected signal",
    }
}

struct Inner {
    running: Cell<bool>,
    selector: RefCell<Selector>,
    last_select_time: Cell<u64>,
    timers: RefCell<BinaryHeap<HeapEntry>>,
    zero_delay: RefCell<Vec<Rc<Timer>>>,
    seq: Cell<u64>,
    interrupt: RefCell<Option<Rc<InterruptHandler>>>,
}

/// The reactor: drives a [`Selector`], dispatches ready keys to their
/// handlers, then fires due timers. Single-threaded; handles are cheap
/// clones sharing one state, so callbacks may re-enter the scheduler
/// freely.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Scheduler {
    /// An epoll-backed scheduler with the interrupt handler installed.
    pub fn new() -> io::Result<Scheduler> {
        Scheduler::with_selector(Selector::new()?)
    }

    pub fn with_selector(selector: Selector) -> io::Result<Scheduler> {
        let scheduler = Scheduler::build(selector);
        scheduler.install_interrupt_handler()?;
        Ok(scheduler)
    }

    /// A scheduler without signal handling, for embedders (and tests)
    /// that manage their own.
    pub fn unattended(selector: Selector) -> Scheduler {
        Scheduler::build(selector)
    }

    fn build(selector: Selector) -> Scheduler {
        Scheduler {
            inner: Rc::new(Inner {
                running: Cell::new(false),
                selector: RefCell::new(selector),
                // set at creation time in case anyone adds a call_later
                // before the main loop starts
                last_select_time: Cell::new(sys::monotonic_millis()),
                timers: RefCell::new(BinaryHeap::new()),
                zero_delay: RefCell::new(Vec::new()),
                seq: Cell::new(0),
                interrupt: RefCell::new(None),
            }),
        }
    }

    fn install_interrupt_handler(&self) -> io::Result<()> {
        let handler = Rc::new(InterruptHandler {
            sfd: SignalFd::for_shutdown_signals()?,
            scheduler: Rc::downgrade(&self.inner),
        });

        let fd = handler.sfd.as_raw_fd();
        self.register_handler(&handler, fd, Ops::read())?;

        *self.inner.interrupt.borrow_mut() = Some(handler);

        Ok(())
    }

    /// Registers `handler` for readiness on `fd`. Delegates to the
    /// selector: one key per fd, empty `interests` cancels an existing
    /// registration.
    pub fn register_handler<H>(
        &self,
        handler: &Rc<H>,
        fd: RawFd,
        interests: Ops,
    ) -> io::Result<Option<Rc<SelectionKey>>>
    where
        H: EventHandler + 'static,
    {
        let handler: Rc<dyn EventHandler> = handler.clone();
        let weak: Weak<dyn EventHandler> = Rc::downgrade(&handler);
        self.inner.selector.borrow_mut().register(fd, interests, weak)
    }

    /// Hands a fresh timer to the scheduler. Zero-delay timers go on
    /// the priority list, the rest on the heap.
    pub(crate) fn call_later(&self, msecs: u64, timer: Rc<Timer>) {
        assert!(!timer.scheduled.get(), "timer is already scheduled");
        timer.scheduled.set(true);

        if msecs == 0 {
            timer.trigger_at.set(0);

            let mut list = self.inner.zero_delay.borrow_mut();
            // descending priority, FIFO within equal priorities
            let pos = list
                .iter()
                .position(|cur| timer.priority > cur.priority)
                .unwrap_or(list.len());
            list.insert(pos, timer);
        } else {
            timer
                .trigger_at
                .set(self.inner.last_select_time.get() + msecs);

            let seq = self.inner.seq.get();
            self.inner.seq.set(seq + 1);

            self.inner.timers.borrow_mut().push(HeapEntry {
                trigger_at: timer.trigger_at.get(),
                seq,
                timer,
            });
        }
    }

    /// Starts the reactor. With `polling_mode` the caller drives
    /// [`poll`](Scheduler::poll) itself.
    pub fn run(&self, polling_mode: bool) -> io::Result<()> {
        self.inner.running.set(true);

        if !polling_mode {
            self.main_loop()?;
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.running.set(false);
    }

    /// Whether this scheduler owns the process signal handler.
    pub fn has_interrupt_handler(&self) -> bool {
        self.inner.interrupt.borrow().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// One reactor iteration: wait for readiness, dispatch ready keys,
    /// fire due timers. Returns the recommended next timeout, or `None`
    /// after shutdown.
    pub fn poll(&self, timeout_msecs: u64) -> io::Result<Option<u64>> {
        if !self.inner.running.get() {
            return Ok(None);
        }

        self.inner.selector.borrow_mut().poll(timeout_msecs)?;

        self.inner.last_select_time.set(sys::monotonic_millis());

        let ready: Vec<Rc<SelectionKey>> = self.inner.selector.borrow().ready_keys().to_vec();

        for key in &ready {
            if key.is_cancelled() {
                key.reset();
                continue;
            }

            let handler = match key.handler() {
                Some(handler) => handler,
                None => {
                    warn!("dropping event for fd {}: handler is gone", key.fileno());
                    key.cancel();
                    key.reset();
                    continue;
                }
            };

            let ready_ops = key.ready_ops();
            if ready_ops.contains(Ops::read()) {
                handler.do_read(key);
            } else if ready_ops.contains(Ops::accept()) {
                handler.do_accept(key);
            }

            // a read-class callback may have torn this key down
            if !key.is_cancelled() {
                let ready_ops = key.ready_ops();
                if ready_ops.contains(Ops::write()) {
                    handler.do_write(key);
                } else if ready_ops.contains(Ops::connect()) {
                    handler.do_connect(key);
                }
            }

            key.reset();
        }

        // check the timers once the select batch is handled
        Ok(Some(self.schedule_laters()))
    }

    fn main_loop(&self) -> io::Result<()> {
        self.inner.last_select_time.set(sys::monotonic_millis());

        let mut timeout_msecs = self.schedule_laters();

        while self.inner.running.get() {
            match self.poll(timeout_msecs)? {
                Some(next) => timeout_msecs = next,
                None => break,
            }
        }

        Ok(())
    }

    /// Fires everything due: the zero-delay list drains fully between
    /// heap checks (a firing callback may enqueue new zero-delay
    /// timers), cancelled heap timers are reclaimed, and the first
    /// not-yet-due timer decides the returned timeout.
    fn schedule_laters(&self) -> u64 {
        loop {
            if !self.inner.zero_delay.borrow().is_empty() {
                self.schedule_laters_zero();
                continue;
            }

            let due = {
                let mut heap = self.inner.timers.borrow_mut();

                let (cancelled, trigger_at) = {
                    let entry = match heap.peek() {
                        Some(entry) => entry,
                        None => return DEFAULT_SLEEP_MSECS,
                    };
                    (entry.timer.deferred.borrow().is_none(), entry.trigger_at)
                };

                if cancelled {
                    heap.pop();
                    continue;
                }

                let now = self.inner.last_select_time.get();
                if trigger_at > now {
                    return trigger_at - now;
                }

                heap.pop()
            };

            if let Some(entry) = due {
                Self::fire(&entry.timer);
            }
        }
    }

    fn schedule_laters_zero(&self) {
        loop {
            let timer = {
                let mut list = self.inner.zero_delay.borrow_mut();
                if list.is_empty() {
                    break;
                }
                list.remove(0)
            };

            Self::fire(&timer);
        }
    }

    fn fire(timer: &Rc<Timer>) {
        // a cancelled timer has no deferred left behind it
        let deferred = timer.deferred.borrow_mut().take();

        if let Some(deferred) = deferred {
            deferred.wakeup_from_scheduler();
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::selector::Selector;

    fn scheduler() -> Scheduler {
        Scheduler::unattended(Selector::with_poll())
    }

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(&Scheduler, u32, u32) -> Deferred) {
        let order = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let order = order.clone();
            move |sched: &Scheduler, priority: u32, id: u32| {
                let order = order.clone();
                Deferred::new(sched, priority, move || order.borrow_mut().push(id))
            }
        };
        (order, make)
    }

    #[test]
    fn zero_delay_priority_order() {
        let sched = scheduler();
        let (order, make) = recorder();

        let d0 = make(&sched, 0, 0);
        let d5a = make(&sched, 5, 51);
        let d5b = make(&sched, 5, 52);
        let d1 = make(&sched, 1, 1);

        d0.call_later(0);
        d5a.call_later(0);
        d5b.call_later(0);
        d1.call_later(0);

        sched.run(true).unwrap();
        sched.poll(0).unwrap();

        // descending priority, FIFO within priority 5
        assert_eq!(*order.borrow(), vec![51, 52, 1, 0]);
    }

    #[test]
    fn timed_order_is_stable() {
        let sched = scheduler();
        let (order, make) = recorder();

        let late = make(&sched, 0, 3);
        let tie_a = make(&sched, 0, 1);
        let tie_b = make(&sched, 0, 2);

        late.call_later(40);
        tie_a.call_later(15);
        tie_b.call_later(15);

        sched.run(true).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while order.borrow().len() < 3 && std::time::Instant::now() < deadline {
            sched.poll(20).unwrap();
        }

        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn zero_delay_flushes_before_due_timers() {
        let sched = scheduler();
        let (order, make) = recorder();

        let timed = make(&sched, 0, 1);
        let zero = make(&sched, 0, 2);

        timed.call_later(10);
        zero.call_later(0);

        sched.run(true).unwrap();
        sched.poll(30).unwrap();

        assert_eq!(*order.borrow(), vec![2, 1]);
    }

    #[test]
    fn cancel_is_idempotent_and_uncancelled_fire() {
        let sched = scheduler();
        let (order, make) = recorder();

        let keep = make(&sched, 0, 1);
        let gone = make(&sched, 0, 2);

        keep.call_later(0);
        gone.call_later(0);

        gone.cancel();
        gone.cancel();
        assert!(!gone.is_active());

        sched.run(true).unwrap();
        sched.poll(0).unwrap();

        assert_eq!(*order.borrow(), vec![1]);
    }

    #[test]
    fn call_later_while_armed_is_noop() {
        let sched = scheduler();
        let (order, make) = recorder();

        let d = make(&sched, 0, 7);
        d.call_later(0);
        d.call_later(0);

        sched.run(true).unwrap();
        sched.poll(0).unwrap();

        assert_eq!(*order.borrow(), vec![7]);
    }

    #[test]
    fn rearm_from_inside_callback() {
        let sched = scheduler();
        let count = Rc::new(RefCell::new(0u32));

        let deferred = Rc::new(RefCell::new(None::<Deferred>));
        let d = {
            let count = count.clone();
            let slot = deferred.clone();
            Deferred::new(&sched, 0, move || {
                *count.borrow_mut() += 1;
                if *count.borrow() == 1 {
                    if let Some(d) = slot.borrow().as_ref() {
                        d.call_later(0);
                    }
                }
            })
        };

        *deferred.borrow_mut() = Some(d);
        if let Some(d) = deferred.borrow().as_ref() {
            d.call_later(0);
        }

        sched.run(true).unwrap();
        sched.poll(0).unwrap();

        // the re-arm landed on the zero-delay list and drained in the
        // same flush
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn poll_reports_next_timeout() {
        let sched = scheduler();
        sched.run(true).unwrap();

        // nothing pending: the default sleep
        assert_eq!(sched.poll(0).unwrap(), Some(DEFAULT_SLEEP_MSECS));

        let (_, make) = recorder();
        let d = make(&sched, 0, 1);
        d.call_later(500);

        let next = sched.poll(0).unwrap().unwrap();
        assert!(next > 400 && next <= 500, "next = {}", next);
    }

    #[test]
    fn shutdown_stops_poll() {
        let sched = scheduler();
        sched.run(true).unwrap();
        assert!(sched.is_running());

        sched.shutdown();
        assert!(!sched.is_running());
        assert_eq!(sched.poll(0).unwrap(), None);
    }

    #[test]
    fn drop_cancels_deferred() {
        let sched = scheduler();
        let (order, make) = recorder();

        {
            let d = make(&sched, 0, 9);
            d.call_later(0);
        }

        sched.run(true).unwrap();
        sched.poll(0).unwrap();

        assert!(order.borrow().is_empty());
    }
}
