//! Line-for-line echo server: `cargo run --example echo_server [addr]`.

use std::rc::Rc;

use strand_io::{ByteBuffer, Scheduler, Server, StreamHandle, StreamProtocol};

struct Echo {
    stream: StreamHandle,
}

impl StreamProtocol for Echo {
    fn on_buffer(&self, buf: &mut ByteBuffer) {
        let data = buf.get_bytes(buf.remaining()).unwrap();
        self.stream.write(&data);
    }

    fn connection_made(&self) {
        println!("client connected");
    }

    fn connection_lost(&self) {
        println!("client disconnected");
    }

    fn repr(&self) -> String {
        "Echo".to_owned()
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4242".to_owned())
        .parse()
        .expect("listen address");

    let scheduler = Scheduler::new()?;

    let server = Server::tcp(&scheduler, addr, |stream| {
        Rc::new(Echo { stream }) as Rc<dyn StreamProtocol>
    })?;
    server.set_nodelay(true);

    println!("echoing on {}", server.local_addr()?);

    scheduler.run(false)
}
