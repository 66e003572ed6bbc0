//! Building blocks for single-threaded, event-driven network services
//! and shared-memory messaging between cooperating processes.
//!
//! Three tightly coupled pieces make up the crate:
//!
//! * a non-blocking I/O reactor: a [`Selector`] over `poll`/`epoll`
//!   plus a timer- and signal-aware [`Scheduler`] dispatching readiness
//!   and [`Deferred`] callbacks,
//! * a streaming protocol framework on top of it: transport handlers
//!   with buffering and back-pressure, the [`StreamProtocol`] user
//!   layer, a reconnecting [`Client`] and an accepting [`Server`],
//! * two lock-free shared-memory rings in [`ring`]: a broadcast
//!   (1→N) queue and a request (N→1) queue in cache-line-sized
//!   records.
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//!
//! use strand_io::{ByteBuffer, Scheduler, Server, StreamHandle, StreamProtocol};
//!
//! struct Echo {
//!     stream: StreamHandle,
//! }
//!
//! impl StreamProtocol for Echo {
//!     fn on_buffer(&self, buf: &mut ByteBuffer) {
//!         let data = buf.get_bytes(buf.remaining()).unwrap();
//!         self.stream.write(&data);
//!     }
//!
//!     fn connection_made(&self) {}
//!     fn connection_lost(&self) {}
//!
//!     fn repr(&self) -> String {
//!         "Echo".to_owned()
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let scheduler = Scheduler::new()?;
//!
//!     let _server = Server::tcp(&scheduler, "127.0.0.1:9000".parse().unwrap(), |stream| {
//!         Rc::new(Echo { stream }) as Rc<dyn StreamProtocol>
//!     })?;
//!
//!     scheduler.run(false)
//! }
//! ```

#[macro_use]
pub mod sys;

pub mod buffer;
pub mod ring;
pub mod scheduler;
pub mod selector;
pub mod stream;

pub use buffer::{BufferError, ByteBuffer};
pub use scheduler::{Deferred, EventHandler, InterruptHandler, Scheduler};
pub use selector::{Ops, SelectionKey, Selector, MAX_KEYS};
pub use stream::client::{Client, Connector, TcpConnector, UnixConnector};
pub use stream::server::Server;
pub use stream::{StreamHandle, StreamProtocol};
