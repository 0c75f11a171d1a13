//! Growable byte store with independent read/write cursors, used for socket
//! ingress and egress.

/// Invariant: `read_index <= write_index <= capacity`. Readable bytes are
/// `write_index - read_index`; writable bytes are `capacity - write_index`.
/// The buffer doubles when writable space hits zero and compacts unread bytes
/// to the front once the read cursor passes a third of capacity.
pub struct ByteBuffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
    total_written: usize,
    total_consumed: usize,
}

impl ByteBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(16)],
            read_index: 0,
            write_index: 0,
            total_written: 0,
            total_consumed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn readable(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable(&self) -> usize {
        self.buf.len() - self.write_index
    }

    /// Lifetime count of bytes ever written into the buffer.
    pub fn total_written(&self) -> usize {
        self.total_written
    }

    /// Lifetime count of bytes consumed past the read cursor.
    pub fn total_consumed(&self) -> usize {
        self.total_consumed
    }

    /// The unread region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// The writable spare region; pair with `advance_write` after a read
    /// syscall fills it.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_index..]
    }

    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(self.write_index + n <= self.buf.len());
        self.write_index += n;
        self.total_written += n;
    }

    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(n <= self.readable());
        self.read_index += n;
        self.total_consumed += n;
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
        } else if self.read_index > self.buf.len() / 3 {
            self.compact();
        }
    }

    /// Double the backing store, preserving unread bytes.
    pub fn grow(&mut self) {
        let new_len = (self.buf.len() * 2).max(32);
        self.buf.resize(new_len, 0);
    }

    pub fn write_slice(&mut self, data: &[u8]) {
        while self.writable() < data.len() {
            if self.read_index > 0 {
                self.compact();
                continue;
            }
            self.grow();
        }
        self.buf[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.advance_write(data.len());
    }

    fn compact(&mut self) {
        let len = self.readable();
        self.buf.copy_within(self.read_index..self.write_index, 0);
        self.read_index = 0;
        self.write_index = len;
    }
}
