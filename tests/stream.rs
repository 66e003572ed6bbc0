//! End-to-end stream scenarios over loopback TCP: echo, reconnect
//! backoff, read timeout.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use strand_io::{
    ByteBuffer, Client, Scheduler, Selector, Server, StreamHandle, StreamProtocol,
};

fn scheduler() -> Scheduler {
    let _ = env_logger::builder().is_test(true).try_init();
    Scheduler::unattended(Selector::with_epoll().unwrap())
}

fn drive<F: FnMut() -> bool>(sched: &Scheduler, deadline: Duration, mut done: F) {
    let end = Instant::now() + deadline;

    while !done() {
        assert!(Instant::now() < end, "condition not reached before deadline");
        sched.poll(10).unwrap();
    }
}

struct EchoChild {
    stream: StreamHandle,
    lost: Rc<Cell<bool>>,
}

impl StreamProtocol for EchoChild {
    fn on_buffer(&self, buf: &mut ByteBuffer) {
        let data = buf.get_bytes(buf.remaining()).unwrap();
        self.stream.write(&data);
    }

    fn connection_made(&self) {}

    fn connection_lost(&self) {
        self.lost.set(true);
    }

    fn repr(&self) -> String {
        "EchoChild".to_owned()
    }
}

fn echo_server(sched: &Scheduler, addr: SocketAddr, lost: &Rc<Cell<bool>>) -> Server {
    let lost = lost.clone();
    Server::tcp(sched, addr, move |stream| {
        Rc::new(EchoChild {
            stream,
            lost: lost.clone(),
        }) as Rc<dyn StreamProtocol>
    })
    .unwrap()
}

#[derive(Default)]
struct ClientState {
    received: RefCell<Vec<u8>>,
    made: Cell<u32>,
    lost: Cell<bool>,
    failed: Cell<u32>,
}

struct EchoClient {
    stream: StreamHandle,
    state: Rc<ClientState>,
    payload: Vec<u8>,
}

impl StreamProtocol for EchoClient {
    fn connection_made(&self) {
        self.state.made.set(self.state.made.get() + 1);
        self.stream.write(&self.payload);
    }

    fn on_buffer(&self, buf: &mut ByteBuffer) {
        let data = buf.get_bytes(buf.remaining()).unwrap();
        self.state.received.borrow_mut().extend_from_slice(&data);

        if self.state.received.borrow().len() >= self.payload.len() {
            self.stream.disconnect();
        }
    }

    fn connection_lost(&self) {
        self.state.lost.set(true);
    }

    fn connect_failed(&self, _msg: &str) {
        self.state.failed.set(self.state.failed.get() + 1);
    }

    fn repr(&self) -> String {
        "EchoClient".to_owned()
    }
}

fn echo_client(
    sched: &Scheduler,
    addr: SocketAddr,
    payload: Vec<u8>,
) -> (Client, Rc<ClientState>) {
    let state = Rc::new(ClientState::default());

    let client = Client::tcp(sched, addr, {
        let state = state.clone();
        move |stream| {
            Rc::new(EchoClient {
                stream,
                state,
                payload,
            }) as Rc<dyn StreamProtocol>
        }
    });

    (client, state)
}

#[test]
fn echo_loopback() {
    let sched = scheduler();

    let server_lost = Rc::new(Cell::new(false));
    let server = echo_server(&sched, "127.0.0.1:0".parse().unwrap(), &server_lost);
    server.set_nodelay(true);
    let addr = server.local_addr().unwrap();

    let (client, state) = echo_client(&sched, addr, b"hello\n".to_vec());
    client.set_reconnect_secs(0);
    client.set_nodelay(true);

    sched.run(true).unwrap();
    drive(&sched, Duration::from_secs(10), || {
        state.lost.get() && server_lost.get()
    });

    assert_eq!(state.made.get(), 1);
    assert_eq!(&*state.received.borrow(), b"hello\n");
    assert!(!client.is_connected());
    assert_eq!(server.child_count(), 0);
}

#[test]
fn echo_loopback_large_payload() {
    let sched = scheduler();

    let server_lost = Rc::new(Cell::new(false));
    let server = echo_server(&sched, "127.0.0.1:0".parse().unwrap(), &server_lost);
    server.set_max_buffers(true);
    let addr = server.local_addr().unwrap();

    // large enough to need several reads on the way back
    let payload: Vec<u8> = (0..64 * 1024u32).map(|ii| (ii % 251) as u8).collect();

    let (client, state) = echo_client(&sched, addr, payload.clone());
    client.set_reconnect_secs(0);
    client.set_max_buffers(true);

    sched.run(true).unwrap();
    drive(&sched, Duration::from_secs(10), || state.lost.get());

    assert_eq!(&*state.received.borrow(), &payload);
}

#[test]
fn reconnect_after_failures() {
    let sched = scheduler();

    // reserve a port, then free it so the first attempts are refused
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let (client, state) = echo_client(&sched, addr, b"hello\n".to_vec());

    sched.run(true).unwrap();
    drive(&sched, Duration::from_secs(10), || state.failed.get() >= 2);

    assert!(!client.is_connected());
    assert_eq!(state.made.get(), 0);

    // bring the server up; the next backed-off attempt lands
    let server_lost = Rc::new(Cell::new(false));
    let _server = echo_server(&sched, addr, &server_lost);

    drive(&sched, Duration::from_secs(15), || state.made.get() >= 1);

    assert_eq!(state.made.get(), 1);
    assert!(state.failed.get() >= 2);
}

struct SilentClient {
    stream: StreamHandle,
    state: Rc<ClientState>,
}

impl StreamProtocol for SilentClient {
    fn connection_made(&self) {
        self.state.made.set(self.state.made.get() + 1);
        self.stream.set_read_timeout(1);
    }

    fn on_buffer(&self, _buf: &mut ByteBuffer) {
        panic!("server should never send");
    }

    fn connection_lost(&self) {
        self.state.lost.set(true);
    }

    fn repr(&self) -> String {
        "SilentClient".to_owned()
    }
}

struct MuteChild;

impl StreamProtocol for MuteChild {
    fn on_buffer(&self, _buf: &mut ByteBuffer) {}
    fn connection_made(&self) {}
    fn connection_lost(&self) {}

    fn repr(&self) -> String {
        "MuteChild".to_owned()
    }
}

#[test]
fn read_timeout_disconnects() {
    let sched = scheduler();

    let server = Server::tcp(&sched, "127.0.0.1:0".parse().unwrap(), |_stream| {
        Rc::new(MuteChild) as Rc<dyn StreamProtocol>
    })
    .unwrap();
    let addr = server.local_addr().unwrap();

    let state = Rc::new(ClientState::default());
    let client = Client::tcp(&sched, addr, {
        let state = state.clone();
        move |stream| Rc::new(SilentClient { stream, state }) as Rc<dyn StreamProtocol>
    });
    client.set_reconnect_secs(0);

    let start = Instant::now();
    sched.run(true).unwrap();
    drive(&sched, Duration::from_secs(10), || state.lost.get());

    assert_eq!(state.made.get(), 1);
    assert!(
        start.elapsed() >= Duration::from_secs(1),
        "timed out too early: {:?}",
        start.elapsed()
    );
}
