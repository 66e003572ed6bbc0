//! Shared bits of the ring demo pair.

pub const QUEUE_SIZE: u64 = 4096;

pub const REQUEST_NAME: &str = "/strand-io-request-queue";
pub const ECHO_NAME: &str = "/strand-io-echo-queue";

/// The ping payload both rings carry.
pub struct Event {
    pub ticks: u64,
    pub client_id: u32,
    pub seq: u32,
}

impl Event {
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.ticks.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.client_id.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.seq.to_ne_bytes());
    }

    pub fn decode(msg: &[u8]) -> Event {
        Event {
            ticks: u64::from_ne_bytes(msg[..8].try_into().unwrap()),
            client_id: u32::from_ne_bytes(msg[8..12].try_into().unwrap()),
            seq: u32::from_ne_bytes(msg[12..16].try_into().unwrap()),
        }
    }
}
