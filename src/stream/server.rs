//! The accepting side: a listener handler, an accept-drain loop and a
//! registry of per-connection children.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::{Rc, Weak};

use log::{debug, warn};
use slab::Slab;

use crate::scheduler::{Deferred, EventHandler, Scheduler};
use crate::selector::{Ops, SelectionKey};
use crate::stream::{StreamCore, StreamHandle, StreamProtocol, StreamTransport};
use crate::sys::socket::Socket;

const DEFAULT_BACKLOG: libc::c_int = 10;

/// Transport for one accepted connection. Registered with connect
/// interest, which the kernel reports ready immediately, promoting the
/// child straight to connected and read interest. No reconnect: a lost
/// child leaves the server's registry and is gone.
pub(crate) struct ChildHandler {
    core: StreamCore,
    parent: Weak<ServerHandler>,
    registry_key: Cell<usize>,
}

impl ChildHandler {
    fn new(
        scheduler: &Scheduler,
        sock: Socket,
        parent: Weak<ServerHandler>,
    ) -> io::Result<Rc<ChildHandler>> {
        let handler = Rc::new(ChildHandler {
            core: StreamCore::new(scheduler.clone()),
            parent,
            registry_key: Cell::new(usize::MAX),
        });

        let weak = Rc::downgrade(&handler);
        *handler.core.read_timeout_cb.borrow_mut() = Some(Deferred::new(scheduler, 0, move || {
            if let Some(handler) = weak.upgrade() {
                handler.handle_read_timeout();
            }
        }));

        let fd = sock.raw();
        *handler.core.sock.borrow_mut() = Some(sock);

        let key = scheduler
            .register_handler(&handler, fd, Ops::connect())?
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "selector refused the registration"))?;
        *handler.core.key.borrow_mut() = Some(key);

        Ok(handler)
    }

    fn connected(&self) {
        self.core.connected.set(true);

        if let Some(key) = self.core.key() {
            key.set_ops(Ops::read());
        }

        self.update_read_timeout();
        self.core.protocol().connection_made();

        if let Some(parent) = self.parent.upgrade() {
            parent.child_connected(self);
        }
    }
}

impl StreamTransport for ChildHandler {
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

        // teardown may be reached from inside a parse holding a buffer
        if let Ok(mut outbuf) = self.core.outbuf.try_borrow_mut() {
            outbuf.clear();
        }

        if let Some(cb) = self.core.read_timeout_cb.borrow().as_ref() {
            cb.cancel();
        }

        self.core.write_waiting_for_os.set(false);
        self.core.connected.set(false);

        self.core.protocol().connection_lost();

        if let Some(parent) = self.parent.upgrade() {
            parent.child_disconnected(self.registry_key.get());
        }

        self.core.cleanup_socket();
    }
}

impl EventHandler for ChildHandler {
    fn do_read(&self, _key: &Rc<SelectionKey>) {
        self.handle_read();
    }

    fn do_write(&self, _key: &Rc<SelectionKey>) {
        self.handle_write();
    }

    fn do_connect(&self, _key: &Rc<SelectionKey>) {
        self.connected();
    }

    fn repr(&self) -> String {
        format!("ChildHandler(fd={})", self.core.fileno())
    }
}

/// Adopts a pre-created bound socket and turns accept readiness into
/// child transports. Initialization is deferred one tick so client
/// code may finish wiring up before listen happens.
pub(crate) struct ServerHandler {
    scheduler: Scheduler,
    accept_sock: Socket,
    backlog: libc::c_int,
    key: RefCell<Option<Rc<SelectionKey>>>,
    initialized: Cell<bool>,
    nodelay: Cell<bool>,
    max_buffers: Cell<bool>,
    init_cb: RefCell<Option<Deferred>>,
    factory: Box<dyn Fn(StreamHandle) -> Rc<dyn StreamProtocol>>,
    children: RefCell<Slab<Rc<ChildHandler>>>,
    self_ref: RefCell<Weak<ServerHandler>>,
}

impl ServerHandler {
    fn new(
        scheduler: &Scheduler,
        accept_sock: Socket,
        backlog: libc::c_int,
        factory: Box<dyn Fn(StreamHandle) -> Rc<dyn StreamProtocol>>,
    ) -> Rc<ServerHandler> {
        let handler = Rc::new(ServerHandler {
            scheduler: scheduler.clone(),
            accept_sock,
            backlog,
            key: RefCell::new(None),
            initialized: Cell::new(false),
            nodelay: Cell::new(false),
            max_buffers: Cell::new(false),
            init_cb: RefCell::new(None),
            factory,
            children: RefCell::new(Slab::new()),
            self_ref: RefCell::new(Weak::new()),
        });

        *handler.self_ref.borrow_mut() = Rc::downgrade(&handler);

        let weak = Rc::downgrade(&handler);
        *handler.init_cb.borrow_mut() = Some(Deferred::new(scheduler, 0, move || {
            if let Some(handler) = weak.upgrade() {
                handler.init();
            }
        }));

        // initialise inside the main loop
        if let Some(cb) = handler.init_cb.borrow().as_ref() {
            cb.call_later(0);
        }

        handler
    }

    fn init(self: &Rc<Self>) {
        let res = (|| -> io::Result<()> {
            self.accept_sock.listen(self.backlog)?;
            self.accept_sock.set_nonblocking(true)?;

            let key = self
                .scheduler
                .register_handler(self, self.accept_sock.raw(), Ops::accept())?
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "selector refused the registration")
                })?;
            *self.key.borrow_mut() = Some(key);

            Ok(())
        })();

        match res {
            Ok(()) => self.initialized.set(true),
            Err(e) => panic!("server failed to start listening: {}", e),
        }
    }

    fn spawn_child(self: &Rc<Self>, sock: Socket) {
        if self.nodelay.get() {
            if let Err(e) = sock.set_nodelay(true) {
                warn!("failed to set TCP_NODELAY on accepted socket: {}", e);
            }
        }

        if self.max_buffers.get() {
            let grown = sock
                .set_max_recv_buffer()
                .and_then(|_| sock.set_max_send_buffer());
            if let Err(e) = grown {
                warn!("failed to grow accepted socket buffers: {}", e);
            }
        }

        let child = match ChildHandler::new(&self.scheduler, sock, Rc::downgrade(self)) {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to register accepted connection: {}", e);
                return;
            }
        };

        let child_dyn: Rc<dyn StreamTransport> = child.clone();
        let weak: Weak<dyn StreamTransport> = Rc::downgrade(&child_dyn);
        let protocol = (self.factory)(StreamHandle::new(weak));
        child.core.set_protocol(protocol);

        let registry_key = self.children.borrow_mut().insert(child.clone());
        child.registry_key.set(registry_key);
    }

    fn child_connected(&self, child: &ChildHandler) {
        debug!("child connected (fd={})", child.core.fileno());
    }

    fn child_disconnected(&self, registry_key: usize) {
        if self.children.borrow_mut().try_remove(registry_key).is_some() {
            debug!("child left the registry (slot {})", registry_key);
        }
    }

    fn cleanup(&self) {
        if self.initialized.get() {
            if let Some(key) = self.key.borrow_mut().take() {
                key.cancel();
            }
            let _ = self.accept_sock.shutdown();
            self.initialized.set(false);
        }
    }
}

impl EventHandler for ServerHandler {
    fn do_accept(&self, _key: &Rc<SelectionKey>) {
        assert!(self.initialized.get());

        let this = match self.self_ref.borrow().upgrade() {
            Some(this) => this,
            None => return,
        };

        loop {
            match self.accept_sock.accept() {
                Ok(Some(child_sock)) => {
                    if let Err(e) = child_sock.set_nonblocking(true) {
                        warn!("failed to make accepted socket non-blocking: {}", e);
                        continue;
                    }
                    this.spawn_child(child_sock);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn repr(&self) -> String {
        "ServerHandler".to_owned()
    }
}

/// An accepting stream server. `factory` builds one protocol object
/// per accepted connection.
pub struct Server {
    handler: Rc<ServerHandler>,
}

impl Server {
    pub fn new<F>(scheduler: &Scheduler, accept_sock: Socket, backlog: i32, factory: F) -> Server
    where
        F: Fn(StreamHandle) -> Rc<dyn StreamProtocol> + 'static,
    {
        Server {
            handler: ServerHandler::new(scheduler, accept_sock, backlog, Box::new(factory)),
        }
    }

    pub fn tcp<F>(scheduler: &Scheduler, addr: SocketAddr, factory: F) -> io::Result<Server>
    where
        F: Fn(StreamHandle) -> Rc<dyn StreamProtocol> + 'static,
    {
        let accept_sock = Socket::bind_tcp(&addr)?;
        Ok(Server::new(scheduler, accept_sock, DEFAULT_BACKLOG, factory))
    }

    pub fn unix<F, P>(scheduler: &Scheduler, path: P, factory: F) -> io::Result<Server>
    where
        F: Fn(StreamHandle) -> Rc<dyn StreamProtocol> + 'static,
        P: AsRef<Path>,
    {
        let accept_sock = Socket::bind_unix(path)?;
        Ok(Server::new(scheduler, accept_sock, DEFAULT_BACKLOG, factory))
    }

    /// Disables Nagle on connections accepted from now on. TCP only.
    pub fn set_nodelay(&self, enable: bool) {
        self.handler.nodelay.set(enable);
    }

    /// Maximizes the kernel send/receive buffers of connections
    /// accepted from now on.
    pub fn set_max_buffers(&self, enable: bool) {
        self.handler.max_buffers.set(enable);
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.handler.accept_sock.local_addr()
    }

    pub fn child_count(&self) -> usize {
        self.handler.children.borrow().len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handler.cleanup();
    }
}
