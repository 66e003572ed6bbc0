//! Ping-pong client for the echo server:
//! `cargo run --example echo_client [addr]`. Reconnects with backoff
//! when the server goes away.

use std::rc::Rc;

use strand_io::{ByteBuffer, Client, Scheduler, StreamHandle, StreamProtocol};

struct Pinger {
    stream: StreamHandle,
}

impl StreamProtocol for Pinger {
    fn connection_made(&self) {
        println!("connected, sending ping");
        self.stream.write(b"ping\n");
    }

    fn on_buffer(&self, buf: &mut ByteBuffer) {
        let data = buf.get_bytes(buf.remaining()).unwrap();
        print!("{}", String::from_utf8_lossy(&data));
        self.stream.write(&data);
    }

    fn connection_lost(&self) {
        println!("connection lost");
    }

    fn repr(&self) -> String {
        "Pinger".to_owned()
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4242".to_owned())
        .parse()
        .expect("server address");

    let scheduler = Scheduler::new()?;

    let client = Client::tcp(&scheduler, addr, |stream| {
        Rc::new(Pinger { stream }) as Rc<dyn StreamProtocol>
    });
    client.set_read_timeout(5);
    client.set_nodelay(true);

    scheduler.run(false)
}
