//! Streaming transport over the reactor: a socket-owning transport
//! core, a user-facing protocol trait, and the connecting/accepting
//! variants built on both.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use log::{debug, info, warn};

use crate::buffer::ByteBuffer;
use crate::scheduler::{Deferred, Scheduler};
use crate::selector::{Ops, SelectionKey};
use crate::sys;
use crate::sys::socket::Socket;

pub mod client;
pub mod server;

const STREAM_BUF_SIZE: usize = 128 * 1024;

/// Successful reads reset the read timeout at most this often.
const READ_TIMEOUT_DEBOUNCE_MSECS: u64 = 500;

/// Parse/dispatch callbacks implemented by user code on top of a
/// stream transport.
pub trait StreamProtocol {
    /// Raw bytes landed in the inbound buffer. The default flips the
    /// buffer for reading, hands it to
    /// [`on_buffer`](StreamProtocol::on_buffer), then compacts whatever
    /// was left unconsumed.
    fn data_received(&self, buf: &mut ByteBuffer) {
        buf.flip();
        self.on_buffer(buf);
        buf.compact();
    }

    fn on_buffer(&self, _buf: &mut ByteBuffer) {
        warn!("stubbed - please implement: on_buffer() {}", self.repr());
    }

    fn connection_made(&self) {
        warn!("stubbed - please implement: connection_made() {}", self.repr());
    }

    fn connection_lost(&self) {
        warn!("stubbed - please implement: connection_lost() {}", self.repr());
    }

    /// A connect attempt failed (connecting clients only).
    fn connect_failed(&self, msg: &str) {
        log::error!("connection failed for {}: {}", self.repr(), msg);
    }

    fn repr(&self) -> String {
        "StreamProtocol".to_owned()
    }
}

/// Transport-level state shared by the client and child variants: the
/// socket, both buffers, the selection key and the read-timeout
/// deferred.
pub(crate) struct StreamCore {
    pub(crate) scheduler: Scheduler,
    pub(crate) key: RefCell<Option<Rc<SelectionKey>>>,
    pub(crate) sock: RefCell<Option<Socket>>,
    pub(crate) inbuf: RefCell<ByteBuffer>,
    pub(crate) outbuf: RefCell<ByteBuffer>,
    pub(crate) protocol: RefCell<Option<Rc<dyn StreamProtocol>>>,
    pub(crate) timeout_secs: Cell<u32>,
    pub(crate) write_waiting_for_os: Cell<bool>,
    pub(crate) last_read_timeout_reset: Cell<u64>,
    pub(crate) read_timeout_cb: RefCell<Option<Deferred>>,
    pub(crate) connected: Cell<bool>,
}

impl StreamCore {
    pub(crate) fn new(scheduler: Scheduler) -> StreamCore {
        StreamCore {
            scheduler,
            key: RefCell::new(None),
            sock: RefCell::new(None),
            inbuf: RefCell::new(ByteBuffer::with_capacity(STREAM_BUF_SIZE)),
            outbuf: RefCell::new(ByteBuffer::with_capacity(STREAM_BUF_SIZE)),
            protocol: RefCell::new(None),
            timeout_secs: Cell::new(0),
            write_waiting_for_os: Cell::new(false),
            last_read_timeout_reset: Cell::new(0),
            read_timeout_cb: RefCell::new(None),
            connected: Cell::new(false),
        }
    }

    pub(crate) fn set_protocol(&self, protocol: Rc<dyn StreamProtocol>) {
        *self.protocol.borrow_mut() = Some(protocol);
    }

    pub(crate) fn protocol(&self) -> Rc<dyn StreamProtocol> {
        match self.protocol.borrow().as_ref() {
            Some(protocol) => protocol.clone(),
            None => panic!("stream transport has no protocol attached"),
        }
    }

    pub(crate) fn protocol_repr(&self) -> String {
        match self.protocol.borrow().as_ref() {
            Some(protocol) => protocol.repr(),
            None => "unattached".to_owned(),
        }
    }

    pub(crate) fn key(&self) -> Option<Rc<SelectionKey>> {
        self.key.borrow().clone()
    }

    pub(crate) fn fileno(&self) -> RawFd {
        self.sock.borrow().as_ref().map(|sock| sock.raw()).unwrap_or(-1)
    }

    pub(crate) fn cleanup_socket(&self) {
        if let Some(sock) = self.sock.borrow_mut().take() {
            let _ = sock.shutdown();
        }
    }
}

/// The shared transport behaviour, parameterized over variant-specific
/// teardown. Event handlers delegate `do_read`/`do_write` here; user
/// code reaches it through [`StreamHandle`].
pub(crate) trait StreamTransport {
    fn core(&self) -> &StreamCore;

    /// Variant-specific teardown: clients schedule a reconnect, server
    /// children leave their parent's registry.
    fn disconnected(&self);

    fn is_connected(&self) -> bool {
        self.core().connected.get()
    }

    fn handle_read(&self) {
        let core = self.core();
        assert!(self.is_connected(), "read on a disconnected stream");

        let res = {
            let mut inbuf = core.inbuf.borrow_mut();
            let sock = core.sock.borrow();
            match sock.as_ref() {
                Some(sock) => sock.recv(inbuf.bytes_mut()),
                None => return,
            }
        };

        match res {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                info!(
                    "error reading from socket (fd={}) in {}: {}",
                    core.fileno(),
                    core.protocol_repr(),
                    e
                );
                self.disconnected();
            }
            Ok(0) => {
                debug!(
                    "zero length read from socket (fd={}) in {}",
                    core.fileno(),
                    core.protocol_repr()
                );
                self.disconnected();
            }
            Ok(count) => {
                core.inbuf.borrow_mut().advance(count);
                self.update_read_timeout();

                let protocol = core.protocol();
                let mut inbuf = core.inbuf.borrow_mut();
                protocol.data_received(&mut inbuf);
            }
        }
    }

    fn handle_write(&self) {
        let core = self.core();
        assert!(self.is_connected(), "write readiness on a disconnected stream");
        assert!(
            core.write_waiting_for_os.get(),
            "do_write without pending outbound data"
        );

        if let Some(key) = core.key() {
            key.remove_ops(Ops::write());
        }
        core.write_waiting_for_os.set(false);

        let mut outbuf = core.outbuf.borrow_mut();
        outbuf.flip();

        if outbuf.remaining() == 0 {
            outbuf.clear();
            return;
        }

        let res = {
            let sock = core.sock.borrow();
            match sock.as_ref() {
                Some(sock) => sock.send(outbuf.bytes()),
                None => return,
            }
        };

        let count = match res {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                warn!(
                    "error writing to socket (fd={}) in {}: {}",
                    core.fileno(),
                    core.protocol_repr(),
                    e
                );
                drop(outbuf);
                self.disconnected();
                return;
            }
            Ok(count) => count,
        };

        if count < outbuf.remaining() {
            // the OS did not take everything, wait for another drain
            if let Some(key) = core.key() {
                key.add_ops(Ops::write());
            }
            core.write_waiting_for_os.set(true);
        }

        if count == 0 {
            outbuf.compact();
            return;
        }

        outbuf.advance(count);
        outbuf.compact();
    }

    fn transport_write(&self, data: &[u8]) {
        let core = self.core();
        assert!(self.is_connected(), "write on a disconnected stream");

        if core.write_waiting_for_os.get() {
            // drain in progress, queue behind it
            if core.outbuf.borrow_mut().write(data).is_err() {
                warn!(
                    "outbound buffer overflow in {}, disconnecting",
                    core.protocol_repr()
                );
                self.disconnected();
            }
            return;
        }

        let res = {
            let sock = core.sock.borrow();
            match sock.as_ref() {
                Some(sock) => sock.send(data),
                None => return,
            }
        };

        let written = match res {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                warn!(
                    "error writing to socket (fd={}) in {}: {}",
                    core.fileno(),
                    core.protocol_repr(),
                    e
                );
                self.disconnected();
                return;
            }
            Ok(written) => written,
        };

        if written == data.len() {
            return;
        }

        // append the remainder and ask for write readiness
        if core.outbuf.borrow_mut().write(&data[written..]).is_err() {
            warn!(
                "outbound buffer overflow in {}, disconnecting",
                core.protocol_repr()
            );
            self.disconnected();
            return;
        }

        if let Some(key) = core.key() {
            key.add_ops(Ops::write());
        }
        core.write_waiting_for_os.set(true);
    }

    fn set_read_timeout(&self, secs: u32) {
        self.core().timeout_secs.set(secs);

        if self.is_connected() {
            self.update_read_timeout();
        }
    }

    fn update_read_timeout(&self) {
        let core = self.core();

        let cb = core.read_timeout_cb.borrow();
        let cb = match cb.as_ref() {
            Some(cb) => cb,
            None => return,
        };

        let secs = core.timeout_secs.get();
        if secs == 0 {
            cb.cancel();
            return;
        }

        // fudge it: keep the armed timer within the debounce window
        // rather than recreating it on every read
        let now = sys::monotonic_millis();
        if cb.is_active() && now < core.last_read_timeout_reset.get() + READ_TIMEOUT_DEBOUNCE_MSECS
        {
            return;
        }

        core.last_read_timeout_reset.set(now);
        cb.call_later_reset(secs as u64 * 1000);
    }

    fn handle_read_timeout(&self) {
        let core = self.core();

        if !self.is_connected() {
            return;
        }

        warn!(
            "read timeout on socket (fd={}) in {}",
            core.fileno(),
            core.protocol_repr()
        );
        self.disconnected();
    }

    /// Forces a disconnection: shuts the socket down and lets OS
    /// readiness deliver the teardown through the reactor.
    fn transport_disconnect(&self) {
        let sock = self.core().sock.borrow();
        if let Some(sock) = sock.as_ref() {
            let _ = sock.shutdown();
        }
    }
}

/// What user protocols hold to talk back to their transport: write,
/// disconnect, read-timeout control. Holds a weak reference, so a
/// handle may outlive its stream harmlessly.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Weak<dyn StreamTransport>,
}

impl StreamHandle {
    pub(crate) fn new(inner: Weak<dyn StreamTransport>) -> StreamHandle {
        StreamHandle { inner }
    }

    /// Sends `data`, buffering whatever the OS does not take
    /// immediately. Dropped with a warning when not connected.
    pub fn write(&self, data: &[u8]) {
        if let Some(transport) = self.inner.upgrade() {
            if transport.is_connected() {
                transport.transport_write(data);
            } else {
                warn!(
                    "call to write being dropped - not connected: {}",
                    transport.core().protocol_repr()
                );
            }
        }
    }

    /// Writes out the readable window of `buf` and consumes it.
    pub fn write_buf(&self, buf: &mut ByteBuffer) {
        if let Some(transport) = self.inner.upgrade() {
            if transport.is_connected() {
                let len = buf.remaining();
                transport.transport_write(buf.bytes());
                buf.advance(len);
                buf.compact();
            } else {
                warn!(
                    "call to write being dropped - not connected: {}",
                    transport.core().protocol_repr()
                );
            }
        }
    }

    pub fn disconnect(&self) {
        if let Some(transport) = self.inner.upgrade() {
            if transport.is_connected() {
                transport.transport_disconnect();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .upgrade()
            .map(|transport| transport.is_connected())
            .unwrap_or(false)
    }

    /// `secs == 0` disables the read timeout.
    pub fn set_read_timeout(&self, secs: u32) {
        if let Some(transport) = self.inner.upgrade() {
            transport.set_read_timeout(secs);
        }
    }
}
