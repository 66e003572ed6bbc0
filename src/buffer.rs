use std::fmt;

const BLOCK_SIZE: usize = 1024;

/// Recoverable window violations: parsers catch `Underflow` and wait
/// for more bytes; writers catch `Overflow` and apply back-pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    Underflow,
    Overflow,
}

impl fmt::Display for BufferError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BufferError::Underflow => write!(fmt, "buffer underflow"),
            BufferError::Overflow => write!(fmt, "buffer overflow"),
        }
    }
}

impl std::error::Error for BufferError {}

/// A `pos`/`limit`/`capacity` byte window over owned storage.
///
/// Writes advance `pos` toward `limit`; `flip` turns written data into
/// a readable window; `compact` moves any unread remainder back to the
/// front and reopens the buffer for writing. Scalar accessors use
/// native-endian fixed-width encodings.
pub struct ByteBuffer {
    buf: Box<[u8]>,
    pos: usize,
    limit: usize,
    mark: usize,
}

macro_rules! get_scalar {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, BufferError> {
            let size = std::mem::size_of::<$ty>();
            if size > self.remaining() {
                return Err(BufferError::Underflow);
            }

            let mut bytes = [0u8; std::mem::size_of::<$ty>()];
            bytes.copy_from_slice(&self.buf[self.pos..self.pos + size]);
            self.pos += size;
            Ok(<$ty>::from_ne_bytes(bytes))
        }
    };
}

macro_rules! put_scalar {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, data: $ty) -> Result<(), BufferError> {
            let size = std::mem::size_of::<$ty>();
            if size > self.remaining() {
                return Err(BufferError::Overflow);
            }

            self.buf[self.pos..self.pos + size].copy_from_slice(&data.to_ne_bytes());
            self.pos += size;
            Ok(())
        }
    };
}

impl ByteBuffer {
    pub fn new() -> ByteBuffer {
        ByteBuffer::with_capacity(BLOCK_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> ByteBuffer {
        ByteBuffer {
            buf: vec![0; capacity].into_boxed_slice(),
            pos: 0,
            limit: capacity,
            mark: 0,
        }
    }

    /// A buffer holding a copy of `data`, positioned for reading.
    pub fn from_slice(data: &[u8]) -> ByteBuffer {
        ByteBuffer {
            buf: data.to_vec().into_boxed_slice(),
            pos: 0,
            limit: data.len(),
            mark: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// Resets the window without touching contents.
    pub fn clear(&mut self) {
        self.pos = 0;
        self.limit = self.capacity();
    }

    /// Call to start reading back what was written.
    pub fn flip(&mut self) {
        self.limit = self.pos;
        self.pos = 0;
    }

    /// Like `clear`, but moves any unread data back to the front first.
    pub fn compact(&mut self) {
        let remaining = self.remaining();
        self.buf.copy_within(self.pos..self.limit, 0);
        self.pos = remaining;
        self.limit = self.capacity();
    }

    pub fn mark(&mut self) {
        self.mark = self.pos;
    }

    pub fn reset_to_mark(&mut self) {
        self.pos = self.mark;
    }

    pub fn skip(&mut self, size: usize) -> Result<(), BufferError> {
        if size > self.remaining() {
            return Err(BufferError::Underflow);
        }

        self.pos += size;
        Ok(())
    }

    /// Advances `pos` after bytes were produced directly into
    /// `bytes_mut`. The caller must not advance past what it filled.
    pub(crate) fn advance(&mut self, size: usize) {
        assert!(size <= self.remaining());
        self.pos += size;
    }

    /// The window between `pos` and `limit`. Be careful: reading from
    /// it does not advance `pos`.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.pos..self.limit]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.pos..self.limit]
    }

    get_scalar!(get_u8, u8);
    get_scalar!(get_u16, u16);
    get_scalar!(get_u32, u32);
    get_scalar!(get_u64, u64);
    get_scalar!(get_i8, i8);
    get_scalar!(get_i16, i16);
    get_scalar!(get_i32, i32);
    get_scalar!(get_i64, i64);
    get_scalar!(get_f32, f32);
    get_scalar!(get_f64, f64);

    put_scalar!(put_u8, u8);
    put_scalar!(put_u16, u16);
    put_scalar!(put_u32, u32);
    put_scalar!(put_u64, u64);
    put_scalar!(put_i8, i8);
    put_scalar!(put_i16, i16);
    put_scalar!(put_i32, i32);
    put_scalar!(put_i64, i64);
    put_scalar!(put_f32, f32);
    put_scalar!(put_f64, f64);

    pub fn get_bool(&mut self) -> Result<bool, BufferError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn put_bool(&mut self, data: bool) -> Result<(), BufferError> {
        self.put_u8(data as u8)
    }

    pub fn get_bytes(&mut self, size: usize) -> Result<Vec<u8>, BufferError> {
        if size > self.remaining() {
            return Err(BufferError::Underflow);
        }

        let data = self.buf[self.pos..self.pos + size].to_vec();
        self.pos += size;
        Ok(data)
    }

    pub fn get_str(&mut self, size: usize) -> Result<String, BufferError> {
        let data = self.get_bytes(size)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub fn put_str(&mut self, data: &str) -> Result<(), BufferError> {
        self.write(data.as_bytes())
    }

    pub fn read(&mut self, data: &mut [u8]) -> Result<(), BufferError> {
        if data.len() > self.remaining() {
            return Err(BufferError::Underflow);
        }

        data.copy_from_slice(&self.buf[self.pos..self.pos + data.len()]);
        self.pos += data.len();
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if data.len() > self.remaining() {
            return Err(BufferError::Overflow);
        }

        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }
}

impl Default for ByteBuffer {
    fn default() -> ByteBuffer {
        ByteBuffer::new()
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "ByteBuffer(pos={}, limit={}, capacity={})",
            self.pos,
            self.limit,
            self.capacity()
        )
    }
}
