use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::ops;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use log::{error, warn};

use crate::scheduler::EventHandler;
use crate::sys::epoll::Epoll;

/// Hard cap on simultaneous registrations. A compile-time change.
pub const MAX_KEYS: usize = 128;

const ACCEPT: u8 = 1 << 0;
const CONNECT: u8 = 1 << 1;
const READ: u8 = 1 << 2;
const WRITE: u8 = 1 << 3;

/// A set of interest/readiness operations.
///
/// `accept` and `read` form the read class, `connect` and `write` the
/// write class; the selector reports OS readiness intersected with the
/// registered interest per class.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Ops(u8);

impl Ops {
    #[inline]
    pub fn empty() -> Ops {
        Ops(0)
    }

    #[inline]
    pub fn accept() -> Ops {
        Ops(ACCEPT)
    }

    #[inline]
    pub fn connect() -> Ops {
        Ops(CONNECT)
    }

    #[inline]
    pub fn read() -> Ops {
        Ops(READ)
    }

    #[inline]
    pub fn write() -> Ops {
        Ops(WRITE)
    }

    #[inline]
    pub fn read_class() -> Ops {
        Ops(ACCEPT | READ)
    }

    #[inline]
    pub fn write_class() -> Ops {
        Ops(CONNECT | WRITE)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Ops) -> bool {
        (self & other) == other
    }

    #[inline]
    pub fn intersects(self, other: Ops) -> bool {
        !(self & other).is_empty()
    }

    #[inline]
    pub fn insert(&mut self, other: Ops) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ops) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for Ops {
    type Output = Ops;

    #[inline]
    fn bitor(self, other: Ops) -> Ops {
        Ops(self.0 | other.0)
    }
}

impl ops::BitAnd for Ops {
    type Output = Ops;

    #[inline]
    fn bitand(self, other: Ops) -> Ops {
        Ops(self.0 & other.0)
    }
}

impl ops::Sub for Ops {
    type Output = Ops;

    #[inline]
    fn sub(self, other: Ops) -> Ops {
        Ops(self.0 & !other.0)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ops::accept(), "Accept"),
            (Ops::connect(), "Connect"),
            (Ops::read(), "Read"),
            (Ops::write(), "Write"),
        ];

        write!(fmt, "Ops {{")?;

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        write!(fmt, "}}")?;

        Ok(())
    }
}

/// One registered file descriptor inside a selector.
///
/// Keys are shared handles: the selector owns one reference, handlers
/// usually keep another. Cancellation is cheap (a flag plus zeroed
/// interest); the selector drops its reference during the compaction
/// step at the start of the poll following cancellation, so clones held
/// by in-flight dispatches stay usable to the end of the tick.
pub struct SelectionKey {
    fd: RawFd,
    ops: Cell<Ops>,
    ready_ops: Cell<Ops>,
    cancelled: Cell<bool>,
    detached: Cell<bool>,
    shared: Weak<Shared>,
    handler: RefCell<Weak<dyn EventHandler>>,
}

impl SelectionKey {
    pub fn fileno(&self) -> RawFd {
        self.fd
    }

    pub fn ops(&self) -> Ops {
        self.ops.get()
    }

    pub fn ready_ops(&self) -> Ops {
        self.ready_ops.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// True until the selector has reaped this key.
    pub fn valid(&self) -> bool {
        !self.detached.get()
    }

    /// Idempotent. Interest drops to zero now; the OS-side registration
    /// and this key's table slot go away on the next poll.
    pub fn cancel(&self) {
        if self.detached.get() || self.cancelled.get() {
            return;
        }

        self.ops.set(Ops::empty());
        self.cancelled.set(true);

        if let Some(shared) = self.shared.upgrade() {
            shared.cancelled.set(shared.cancelled.get() + 1);
        }
    }

    /// Replaces the interest set. `ops` must be non-empty; use
    /// [`cancel`](SelectionKey::cancel) to stop watching. Re-arms a
    /// cancelled key.
    pub fn set_ops(&self, ops: Ops) {
        assert!(self.valid(), "set_ops on a reaped selection key");
        assert!(!ops.is_empty(), "set_ops with empty ops, use cancel()");

        if ops != self.ops.get() {
            self.ops.set(ops);

            if let Some(shared) = self.shared.upgrade() {
                shared.update(self.fd, ops);

                if self.cancelled.get() {
                    shared.cancelled.set(shared.cancelled.get() - 1);
                    self.cancelled.set(false);
                }
            }
        }
    }

    pub fn add_ops(&self, new_ops: Ops) {
        self.set_ops(self.ops.get() | new_ops);
    }

    pub fn remove_ops(&self, new_ops: Ops) {
        self.set_ops(self.ops.get() - new_ops);
    }

    /// Clears readiness at the end of a dispatch.
    pub fn reset(&self) {
        self.ready_ops.set(Ops::empty());
    }

    pub(crate) fn handler(&self) -> Option<Rc<dyn EventHandler>> {
        self.handler.borrow().upgrade()
    }

    fn mark_ready(&self, read: bool, write: bool, error: bool) {
        let ops = self.ops.get();
        let mut ready = self.ready_ops.get();

        if read {
            ready = ready | (ops & Ops::read_class());
        }

        if write {
            ready = ready | (ops & Ops::write_class());
        }

        if error {
            ready = ready | (ops & (Ops::read_class() | Ops::write_class()));
        }

        self.ready_ops.set(ready);
    }
}

impl fmt::Debug for SelectionKey {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "SelectionKey(fd={}, ops={:?}, ready_ops={:?}, cancelled={})",
            self.fd,
            self.ops.get(),
            self.ready_ops.get(),
            self.cancelled.get()
        )
    }
}

/// State the keys need to reach back into: the cancellation counter and
/// the OS-side interest updater.
struct Shared {
    cancelled: Cell<usize>,
    backend: BackendShared,
}

enum BackendShared {
    /// Interest changes only mark the pollfd array stale; it is rebuilt
    /// at the top of the next poll.
    Poll { dirty: Cell<bool> },
    /// Interest changes apply eagerly via `epoll_ctl`.
    Epoll(Epoll),
}

impl Shared {
    fn update(&self, fd: RawFd, ops: Ops) {
        match &self.backend {
            BackendShared::Poll { dirty } => dirty.set(true),
            BackendShared::Epoll(ep) => {
                let events = epoll_events(ops);
                if let Err(e) = ep.modify(fd, events) {
                    match e.raw_os_error() {
                        Some(libc::EBADF) => error!("epoll_ctl(MOD): fd {} is bad", fd),
                        // a closed fd leaves the epoll set on its own;
                        // a recycled fd number re-enters here
                        Some(libc::ENOENT) => {
                            if let Err(e) = ep.add(fd, events) {
                                panic!("epoll_ctl(ADD) failed for fd {}: {}", fd, e);
                            }
                        }
                        _ => panic!("epoll_ctl(MOD) failed for fd {}: {}", fd, e),
                    }
                }
            }
        }
    }
}

fn epoll_events(ops: Ops) -> u32 {
    let mut events = (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;

    if ops.intersects(Ops::read_class()) {
        events = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }

    if ops.intersects(Ops::write_class()) {
        events |= libc::EPOLLOUT as u32;
    }

    events
}

fn poll_events(ops: Ops) -> libc::c_short {
    let mut events = 0;

    if ops.intersects(Ops::read_class()) {
        events = libc::POLLIN | libc::POLLPRI;
    }

    if ops.intersects(Ops::write_class()) {
        events |= libc::POLLOUT;
    }

    events
}

enum Backend {
    Poll { pollfds: Vec<libc::pollfd> },
    Epoll { events: Vec<libc::epoll_event> },
}

/// Owns up to [`MAX_KEYS`] registrations keyed by file descriptor and
/// turns one OS wait into a batch of ready keys.
pub struct Selector {
    shared: Rc<Shared>,
    keys: IndexMap<RawFd, Rc<SelectionKey>>,
    ready: Vec<Rc<SelectionKey>>,
    backend: Backend,
}

impl Selector {
    /// An epoll-backed selector, the default on Linux.
    pub fn new() -> io::Result<Selector> {
        Selector::with_epoll()
    }

    pub fn with_epoll() -> io::Result<Selector> {
        Ok(Selector {
            shared: Rc::new(Shared {
                cancelled: Cell::new(0),
                backend: BackendShared::Epoll(Epoll::new()?),
            }),
            keys: IndexMap::with_capacity(MAX_KEYS),
            ready: Vec::with_capacity(MAX_KEYS),
            backend: Backend::Epoll {
                events: Vec::with_capacity(MAX_KEYS),
            },
        })
    }

    pub fn with_poll() -> Selector {
        Selector {
            shared: Rc::new(Shared {
                cancelled: Cell::new(0),
                backend: BackendShared::Poll {
                    dirty: Cell::new(false),
                },
            }),
            keys: IndexMap::with_capacity(MAX_KEYS),
            ready: Vec::with_capacity(MAX_KEYS),
            backend: Backend::Poll {
                pollfds: Vec::with_capacity(MAX_KEYS),
            },
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Registers interest for a file descriptor.
    ///
    /// At most one key exists per fd: re-registering updates the
    /// interest set and handler in place (and re-arms a cancelled key),
    /// while `ops == empty` cancels an existing key. `Ok(None)` is the
    /// no-op case of empty ops with no existing key.
    pub fn register(
        &mut self,
        fd: RawFd,
        ops: Ops,
        handler: Weak<dyn EventHandler>,
    ) -> io::Result<Option<Rc<SelectionKey>>> {
        if let Some(key) = self.keys.get(&fd) {
            if ops.is_empty() {
                key.cancel();
            } else {
                key.set_ops(ops);
            }

            *key.handler.borrow_mut() = handler;
            return Ok(Some(key.clone()));
        }

        if ops.is_empty() {
            return Ok(None);
        }

        if self.keys.len() == MAX_KEYS {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "exceeded number of selector registrations",
            ));
        }

        let key = Rc::new(SelectionKey {
            fd,
            ops: Cell::new(ops),
            ready_ops: Cell::new(Ops::empty()),
            cancelled: Cell::new(false),
            detached: Cell::new(false),
            shared: Rc::downgrade(&self.shared),
            handler: RefCell::new(handler),
        });

        match &self.shared.backend {
            BackendShared::Poll { dirty } => dirty.set(true),
            BackendShared::Epoll(ep) => {
                if let Err(e) = ep.add(fd, epoll_events(ops)) {
                    // the fd number may linger from a registration whose
                    // teardown raced a close
                    if e.raw_os_error() == Some(libc::EEXIST) {
                        ep.modify(fd, epoll_events(ops))?;
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        self.keys.insert(fd, key.clone());

        Ok(Some(key))
    }

    /// One readiness wait. Reaps keys cancelled since the previous call
    /// first, then fills the ready batch; returns its length.
    pub fn poll(&mut self, timeout_msecs: u64) -> io::Result<usize> {
        self.ready.clear();

        if self.shared.cancelled.get() > 0 {
            self.remove_cancelled()?;
        }

        // fake a timeout if nothing to poll
        if self.keys.is_empty() {
            thread::sleep(Duration::from_millis(timeout_msecs));
            return Ok(0);
        }

        let timeout = timeout_msecs.min(i32::MAX as u64) as i32;

        match &mut self.backend {
            Backend::Poll { pollfds } => {
                if let BackendShared::Poll { dirty } = &self.shared.backend {
                    if dirty.replace(false) || pollfds.len() != self.keys.len() {
                        pollfds.clear();
                        for key in self.keys.values() {
                            pollfds.push(libc::pollfd {
                                fd: key.fd,
                                events: poll_events(key.ops.get()),
                                revents: 0,
                            });
                        }
                    }
                }

                let ready_count =
                    match syscall!(poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout)) {
                        Ok(n) => n as usize,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
                        Err(e) => return Err(e),
                    };

                let mut done = 0;
                for (ii, pollfd) in pollfds.iter().enumerate() {
                    if done == ready_count {
                        break;
                    }

                    if pollfd.revents != 0 {
                        let key = match self.keys.get_index(ii) {
                            Some((_, key)) => key,
                            None => break,
                        };

                        key.mark_ready(
                            pollfd.revents & (libc::POLLIN | libc::POLLPRI) != 0,
                            pollfd.revents & libc::POLLOUT != 0,
                            pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
                        );

                        done += 1;
                        self.ready.push(key.clone());
                    }
                }

                debug_assert_eq!(done, ready_count);
            }
            Backend::Epoll { events } => {
                let ep = match &self.shared.backend {
                    BackendShared::Epoll(ep) => ep,
                    BackendShared::Poll { .. } => unreachable!(),
                };

                let ready_count = match ep.wait(events, timeout) {
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
                    Err(e) => return Err(e),
                };

                for event in events.iter().take(ready_count) {
                    let key = match self.keys.get(&(event.u64 as RawFd)) {
                        Some(key) => key,
                        None => continue,
                    };

                    let bits = event.events as libc::c_int;
                    key.mark_ready(
                        bits & (libc::EPOLLIN | libc::EPOLLPRI) != 0,
                        bits & libc::EPOLLOUT != 0,
                        bits & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) != 0,
                    );

                    self.ready.push(key.clone());
                }
            }
        }

        Ok(self.ready.len())
    }

    /// The batch filled by the previous [`poll`](Selector::poll). Valid
    /// until the next call.
    pub fn ready_keys(&self) -> &[Rc<SelectionKey>] {
        &self.ready
    }

    fn remove_cancelled(&mut self) -> io::Result<()> {
        let fds: Vec<RawFd> = self
            .keys
            .values()
            .filter(|key| key.cancelled.get())
            .map(|key| key.fd)
            .collect();

        let mut found = 0;

        for fd in fds {
            if let BackendShared::Epoll(ep) = &self.shared.backend {
                match ep.delete(fd) {
                    Ok(_) => {}
                    Err(ref e)
                        if e.raw_os_error() == Some(libc::EBADF)
                            || e.raw_os_error() == Some(libc::ENOENT) =>
                    {
                        warn!("epoll_ctl(DEL): fd {} already gone ({})", fd, e);
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(key) = self.keys.shift_remove(&fd) {
                key.cancelled.set(false);
                key.detached.set(true);
                found += 1;
            }
        }

        debug_assert_eq!(found, self.shared.cancelled.get());
        self.shared.cancelled.set(0);

        if let BackendShared::Poll { dirty } = &self.shared.backend {
            dirty.set(true);
        }

        Ok(())
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let backend = match self.backend {
            Backend::Poll { .. } => "poll",
            Backend::Epoll { .. } => "epoll",
        };
        write!(fmt, "Selector(backend={}, keys={})", backend, self.keys.len())
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;
    use crate::scheduler::EventHandler;
    use crate::sys::socket::Socket;

    struct Noop;

    impl EventHandler for Noop {
        fn repr(&self) -> String {
            "Noop".to_owned()
        }
    }

    fn noop() -> Rc<dyn EventHandler> {
        Rc::new(Noop)
    }

    fn pair() -> (Socket, Socket) {
        let (a, b) = Socket::new_pair(libc::AF_UNIX, libc::SOCK_STREAM).unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    fn both_backends() -> Vec<Selector> {
        vec![Selector::with_poll(), Selector::with_epoll().unwrap()]
    }

    #[test]
    fn register_and_readiness() {
        for mut selector in both_backends() {
            let handler = noop();
            let (a, b) = pair();

            let key = selector
                .register(a.raw(), Ops::read(), Rc::downgrade(&handler))
                .unwrap()
                .unwrap();

            // nothing to read yet
            assert_eq!(selector.poll(0).unwrap(), 0);

            b.send(b"x").unwrap();

            assert_eq!(selector.poll(1000).unwrap(), 1);
            assert_eq!(selector.ready_keys()[0].fileno(), a.raw());
            assert_eq!(key.ready_ops(), Ops::read());

            key.reset();
            assert!(key.ready_ops().is_empty());
        }
    }

    #[test]
    fn readiness_intersects_interest() {
        for mut selector in both_backends() {
            let handler = noop();
            let (a, b) = pair();

            // write interest on an empty socket buffer: writable now
            let key = selector
                .register(a.raw(), Ops::write(), Rc::downgrade(&handler))
                .unwrap()
                .unwrap();

            b.send(b"x").unwrap();

            assert_eq!(selector.poll(1000).unwrap(), 1);
            // readable at the OS level, but READ is not registered
            assert_eq!(key.ready_ops(), Ops::write());
            key.reset();
        }
    }

    #[test]
    fn one_key_per_fd() {
        for mut selector in both_backends() {
            let handler = noop();
            let (a, _b) = pair();

            let k1 = selector
                .register(a.raw(), Ops::read(), Rc::downgrade(&handler))
                .unwrap()
                .unwrap();
            let k2 = selector
                .register(a.raw(), Ops::read() | Ops::write(), Rc::downgrade(&handler))
                .unwrap()
                .unwrap();

            assert!(Rc::ptr_eq(&k1, &k2));
            assert_eq!(k1.ops(), Ops::read() | Ops::write());
            assert_eq!(selector.key_count(), 1);
        }
    }

    #[test]
    fn cancel_is_deferred_and_idempotent() {
        for mut selector in both_backends() {
            let handler = noop();
            let (a, b) = pair();

            let key = selector
                .register(a.raw(), Ops::read(), Rc::downgrade(&handler))
                .unwrap()
                .unwrap();

            key.cancel();
            key.cancel();

            assert!(key.is_cancelled());
            assert!(key.valid());
            assert_eq!(selector.key_count(), 1);

            b.send(b"x").unwrap();

            // reaped at the top of the next poll; no dispatch for it
            assert_eq!(selector.poll(0).unwrap(), 0);
            assert_eq!(selector.key_count(), 0);
            assert!(!key.valid());
        }
    }

    #[test]
    fn cancel_then_reregister_same_tick() {
        for mut selector in both_backends() {
            let handler = noop();
            let (a, b) = pair();

            let key = selector
                .register(a.raw(), Ops::read(), Rc::downgrade(&handler))
                .unwrap()
                .unwrap();

            key.cancel();

            let again = selector
                .register(a.raw(), Ops::read(), Rc::downgrade(&handler))
                .unwrap()
                .unwrap();

            assert!(Rc::ptr_eq(&key, &again));
            assert!(!key.is_cancelled());

            b.send(b"x").unwrap();
            assert_eq!(selector.poll(1000).unwrap(), 1);
            assert_eq!(selector.key_count(), 1);
        }
    }

    #[test]
    fn register_empty_ops_without_key_is_noop() {
        let mut selector = Selector::with_poll();
        let (a, _b) = pair();

        let res = selector.register(a.raw(), Ops::empty(), Rc::downgrade(&noop()));
        assert!(res.unwrap().is_none());
        assert_eq!(selector.key_count(), 0);
    }

    #[test]
    fn capacity_exhausted() {
        let mut selector = Selector::with_poll();
        let handler = noop();

        let mut pairs = Vec::new();
        for _ in 0..MAX_KEYS {
            let (a, b) = pair();
            selector
                .register(a.raw(), Ops::read(), Rc::downgrade(&handler))
                .unwrap()
                .unwrap();
            pairs.push((a, b));
        }

        let (a, _b) = pair();
        let err = selector
            .register(a.raw(), Ops::read(), Rc::downgrade(&handler))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
    }

    #[test]
    fn compaction_preserves_order() {
        let mut selector = Selector::with_poll();
        let handler = noop();

        let pairs: Vec<_> = (0..4).map(|_| pair()).collect();
        let keys: Vec<_> = pairs
            .iter()
            .map(|(a, _)| {
                selector
                    .register(a.raw(), Ops::read(), Rc::downgrade(&handler))
                    .unwrap()
                    .unwrap()
            })
            .collect();

        keys[1].cancel();
        assert_eq!(selector.poll(0).unwrap(), 0);

        let fds: Vec<_> = selector.keys.values().map(|k| k.fileno()).collect();
        assert_eq!(
            fds,
            vec![keys[0].fileno(), keys[2].fileno(), keys[3].fileno()]
        );
    }

    #[test]
    fn error_readiness_surfaces_for_both_classes() {
        for mut selector in both_backends() {
            let handler = noop();
            let (a, b) = pair();

            let key = selector
                .register(a.raw(), Ops::read() | Ops::write(), Rc::downgrade(&handler))
                .unwrap()
                .unwrap();

            // peer closes: hup surfaces as readable and writable
            drop(b);

            assert_eq!(selector.poll(1000).unwrap(), 1);
            assert!(key.ready_ops().contains(Ops::read()));
            assert!(key.ready_ops().contains(Ops::write()));
        }
    }
}
