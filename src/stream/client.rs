//! The connecting side: async connect with a bounded exponential
//! reconnect backoff.

use std::cell::Cell;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use log::{info, warn};

use crate::scheduler::{Deferred, EventHandler, Scheduler};
use crate::selector::{Ops, SelectionKey};
use crate::stream::{StreamCore, StreamHandle, StreamProtocol, StreamTransport};
use crate::sys::socket::{RawAddr, Socket};

const CONNECT_TIMEOUT_MSECS: u64 = 1000;

/// Ceiling for the reconnect backoff, in seconds.
const MAX_RECONNECT_SECS: u32 = 16;

/// Creates sockets with a connect in flight; one impl per address
/// family.
pub trait Connector {
    /// Returns a non-blocking socket whose connect has been initiated.
    /// A synchronous connect error is logged and left for the
    /// write-class readiness to surface.
    fn begin_connect(&self) -> io::Result<Socket>;

    fn repr(&self) -> String;
}

pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> TcpConnector {
        TcpConnector { addr }
    }
}

impl Connector for TcpConnector {
    fn begin_connect(&self) -> io::Result<Socket> {
        let sock = Socket::stream(&self.addr)?;
        sock.set_nonblocking(true)?;

        if let Err(e) = sock.connect(&RawAddr::from_inet(&self.addr)) {
            warn!("connect error {}", e);
        }

        Ok(sock)
    }

    fn repr(&self) -> String {
        format!("TcpConnector({})", self.addr)
    }
}

pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new<P: AsRef<Path>>(path: P) -> UnixConnector {
        UnixConnector {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Connector for UnixConnector {
    fn begin_connect(&self) -> io::Result<Socket> {
        let sock = Socket::stream_unix()?;
        sock.set_nonblocking(true)?;

        if let Err(e) = sock.connect(&RawAddr::from_unix(&self.path)?) {
            warn!("connect error {}", e);
        }

        Ok(sock)
    }

    fn repr(&self) -> String {
        format!("UnixConnector({})", self.path.display())
    }
}

/// Client transport state machine: INITIAL → CONNECTING → CONNECTED,
/// with failed or lost connections re-entering CONNECTING after the
/// current backoff delay.
pub(crate) struct ConnectingHandler {
    core: StreamCore,
    connector: Box<dyn Connector>,
    reconnecting_secs: Cell<u32>,
    reset_reconnecting_secs: Cell<u32>,
    connect_in_progress: Cell<bool>,
    nodelay: Cell<bool>,
    max_buffers: Cell<bool>,
    connect_initiate_cb: RefCell<Option<Deferred>>,
    connect_timeout_cb: RefCell<Option<Deferred>>,
}

impl ConnectingHandler {
    pub(crate) fn new(
        scheduler: &Scheduler,
        connector: Box<dyn Connector>,
    ) -> Rc<ConnectingHandler> {
        let handler = Rc::new(ConnectingHandler {
            core: StreamCore::new(scheduler.clone()),
            connector,
            reconnecting_secs: Cell::new(1),
            reset_reconnecting_secs: Cell::new(1),
            connect_in_progress: Cell::new(false),
            nodelay: Cell::new(false),
            max_buffers: Cell::new(false),
            connect_initiate_cb: RefCell::new(None),
            connect_timeout_cb: RefCell::new(None),
        });

        let weak = Rc::downgrade(&handler);

        *handler.connect_initiate_cb.borrow_mut() = Some(Deferred::new(scheduler, 0, {
            let weak = weak.clone();
            move || {
                if let Some(handler) = weak.upgrade() {
                    handler.initiate_connect();
                }
            }
        }));

        *handler.connect_timeout_cb.borrow_mut() = Some(Deferred::new(scheduler, 0, {
            let weak = weak.clone();
            move || {
                if let Some(handler) = weak.upgrade() {
                    handler.connect_timeout();
                }
            }
        }));

        *handler.core.read_timeout_cb.borrow_mut() = Some(Deferred::new(scheduler, 0, move || {
            if let Some(handler) = weak.upgrade() {
                handler.handle_read_timeout();
            }
        }));

        handler
    }

    /// Queues the first connect into the reactor.
    pub(crate) fn start(&self) {
        if let Some(cb) = self.connect_initiate_cb.borrow().as_ref() {
            cb.call_later(0);
        }
    }

    pub(crate) fn set_reconnect_secs(&self, secs: u32) {
        self.reconnecting_secs.set(secs);
        self.reset_reconnecting_secs.set(secs);
    }

    pub(crate) fn set_nodelay(&self, enable: bool) {
        self.nodelay.set(enable);

        if self.is_connected() {
            let sock = self.core.sock.borrow();
            if let Some(sock) = sock.as_ref() {
                if let Err(e) = sock.set_nodelay(enable) {
                    warn!("failed to set TCP_NODELAY: {}", e);
                }
            }
        }
    }

    pub(crate) fn set_max_buffers(&self, enable: bool) {
        self.max_buffers.set(enable);
    }

    pub(crate) fn initiate_connect(self: &Rc<Self>) {
        // cancel just in case
        if let Some(cb) = self.connect_initiate_cb.borrow().as_ref() {
            cb.cancel();
        }

        self.connect_in_progress.set(true);

        let sock = match self.connector.begin_connect() {
            Ok(sock) => sock,
            Err(e) => {
                self.connect_failed(&e.to_string());
                return;
            }
        };

        // buffer sizing wants to happen before the handshake completes
        if self.max_buffers.get() {
            let grown = sock
                .set_max_recv_buffer()
                .and_then(|_| sock.set_max_send_buffer());
            if let Err(e) = grown {
                warn!("failed to grow socket buffers: {}", e);
            }
        }

        let fd = sock.raw();
        *self.core.sock.borrow_mut() = Some(sock);

        let registered = self
            .core
            .scheduler
            .register_handler(self, fd, Ops::connect());

        let key = match registered {
            Ok(Some(key)) => key,
            Ok(None) => {
                self.connect_failed("selector refused the registration");
                return;
            }
            Err(e) => {
                self.connect_failed(&e.to_string());
                return;
            }
        };

        *self.core.key.borrow_mut() = Some(key);

        if let Some(cb) = self.connect_timeout_cb.borrow().as_ref() {
            cb.call_later(CONNECT_TIMEOUT_MSECS);
        }
    }

    fn connected(&self) {
        if let Some(cb) = self.connect_timeout_cb.borrow().as_ref() {
            cb.cancel();
        }

        self.connect_in_progress.set(false);
        self.core.connected.set(true);
        self.reconnecting_secs.set(self.reset_reconnecting_secs.get());

        // anything left over from a previous connection is stale
        self.core.inbuf.borrow_mut().clear();
        self.core.outbuf.borrow_mut().clear();

        if self.nodelay.get() {
            let sock = self.core.sock.borrow();
            if let Some(sock) = sock.as_ref() {
                if let Err(e) = sock.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY: {}", e);
                }
            }
        }

        if let Some(key) = self.core.key() {
            key.set_ops(Ops::read());
        }

        self.update_read_timeout();
        self.core.protocol().connection_made();
    }

    fn connect_timeout(&self) {
        self.connect_failed("timeout waiting for connect");
    }

    fn connect_failed(&self, msg: &str) {
        assert!(self.connect_in_progress.get() && !self.is_connected());

        self.core.protocol().connect_failed(msg);

        if let Some(key) = self.core.key.borrow_mut().take() {
            key.cancel();
        }
        self.core.cleanup_socket();

        let wait_secs = self.reconnecting_secs.get();

        // back off to the threshold; the current value decides this
        // attempt's wait, the doubled one the next
        if wait_secs > 0 && wait_secs < MAX_RECONNECT_SECS {
            self.reconnecting_secs.set(wait_secs * 2);
        }

        if wait_secs > 0 {
            info!("retrying to connect in {} seconds", wait_secs);
            if let Some(cb) = self.connect_initiate_cb.borrow().as_ref() {
                cb.call_later(wait_secs as u64 * 1000);
            }
        } else {
            info!("connect failed and not retrying");
        }

        if let Some(cb) = self.connect_timeout_cb.borrow().as_ref() {
            cb.cancel();
        }

        self.connect_in_progress.set(false);
    }
}

impl StreamTransport for ConnectingHandler {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn disconnected(&self) {
        if !self.is_connected() {
            return;
        }

        if let Some(key) = self.core.key.borrow_mut().take() {
            key.cancel();
        }

        // teardown may be reached from inside a parse with the inbound
        // buffer borrowed; the next successful connect clears both
        // buffers again anyway
        if let Ok(mut outbuf) = self.core.outbuf.try_borrow_mut() {
            outbuf.clear();
        }
        if let Ok(mut inbuf) = self.core.inbuf.try_borrow_mut() {
            inbuf.clear();
        }

        if let Some(cb) = self.core.read_timeout_cb.borrow().as_ref() {
            cb.cancel();
        }

        self.core.write_waiting_for_os.set(false);
        self.core.connected.set(false);

        self.core.protocol().connection_lost();

        self.core.cleanup_socket();

        let secs = self.reconnecting_secs.get();
        if secs > 0 {
            info!("retrying to connect in {} seconds", secs);
            if let Some(cb) = self.connect_initiate_cb.borrow().as_ref() {
                cb.call_later(secs as u64 * 1000);
            }
        } else {
            info!("disconnected and not attempting to reconnect");
        }
    }
}

impl EventHandler for ConnectingHandler {
    fn do_read(&self, _key: &Rc<SelectionKey>) {
        self.handle_read();
    }

    fn do_write(&self, _key: &Rc<SelectionKey>) {
        self.handle_write();
    }

    fn do_connect(&self, _key: &Rc<SelectionKey>) {
        assert!(self.connect_in_progress.get());

        let res = {
            let sock = self.core.sock.borrow();
            sock.as_ref().map(|sock| sock.finish_connect())
        };

        match res {
            Some(Ok(true)) => self.connected(),
            Some(Ok(false)) => {}
            Some(Err(e)) => self.connect_failed(&e.to_string()),
            None => {}
        }
    }

    fn repr(&self) -> String {
        format!(
            "ConnectingHandler({}, fd={})",
            self.connector.repr(),
            self.core.fileno()
        )
    }
}

/// A reconnecting stream client. Owns the transport; the protocol
/// object built by `factory` receives a [`StreamHandle`] for talking
/// back.
pub struct Client {
    handler: Rc<ConnectingHandler>,
}

impl Client {
    pub fn new<F>(scheduler: &Scheduler, connector: Box<dyn Connector>, factory: F) -> Client
    where
        F: FnOnce(StreamHandle) -> Rc<dyn StreamProtocol>,
    {
        let handler = ConnectingHandler::new(scheduler, connector);

        let handler_dyn: Rc<dyn StreamTransport> = handler.clone();
        let weak: Weak<dyn StreamTransport> = Rc::downgrade(&handler_dyn);
        let protocol = factory(StreamHandle::new(weak));
        handler.core.set_protocol(protocol);

        handler.start();

        Client { handler }
    }

    pub fn tcp<F>(scheduler: &Scheduler, addr: SocketAddr, factory: F) -> Client
    where
        F: FnOnce(StreamHandle) -> Rc<dyn StreamProtocol>,
    {
        Client::new(scheduler, Box::new(TcpConnector::new(addr)), factory)
    }

    pub fn unix<F, P>(scheduler: &Scheduler, path: P, factory: F) -> Client
    where
        F: FnOnce(StreamHandle) -> Rc<dyn StreamProtocol>,
        P: AsRef<Path>,
    {
        Client::new(scheduler, Box::new(UnixConnector::new(path)), factory)
    }

    pub fn handle(&self) -> StreamHandle {
        let handler_dyn: Rc<dyn StreamTransport> = self.handler.clone();
        let weak: Weak<dyn StreamTransport> = Rc::downgrade(&handler_dyn);
        StreamHandle::new(weak)
    }

    pub fn is_connected(&self) -> bool {
        self.handler.is_connected()
    }

    /// Kicks a connect off immediately when idle; a no-op while
    /// connected.
    pub fn connect(&self) {
        if !self.handler.is_connected() {
            self.handler.initiate_connect();
        }
    }

    /// The initial and post-success reconnect delay. Zero disables
    /// reconnecting entirely.
    pub fn set_reconnect_secs(&self, secs: u32) {
        self.handler.set_reconnect_secs(secs);
    }

    /// Disables Nagle on the connected socket, now and on every
    /// reconnect. TCP only.
    pub fn set_nodelay(&self, enable: bool) {
        self.handler.set_nodelay(enable);
    }

    /// Maximizes the kernel send/receive buffers of each new
    /// connection's socket.
    pub fn set_max_buffers(&self, enable: bool) {
        self.handler.set_max_buffers(enable);
    }

    pub fn set_read_timeout(&self, secs: u32) {
        StreamTransport::set_read_timeout(&*self.handler, secs);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(key) = self.handler.core.key.borrow_mut().take() {
            key.cancel();
        }
        self.handler.core.cleanup_socket();
    }
}
