// Network module - buffer pooling and re-exports
//
// Each listener owns two pools: small read buffers and send buffers
// sized for the largest frame the codec will produce. Buffers come back
// zeroed because the send path relies on zero padding.

use parking_lot::Mutex;

use crate::MAX_FRAME_BODY;
use crate::crypt::frame::HEADER_SIZE;

/// Read buffer size class.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Send buffer size class: header plus the largest encrypted body.
pub const SEND_BUFFER_SIZE: usize = HEADER_SIZE + MAX_FRAME_BODY;

/// A stack of reusable fixed-size buffers.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize) -> Self {
        BufferPool {
            buffers: Mutex::new(Vec::new()),
            buf_size,
        }
    }

    /// Pool for the small read size class.
    pub fn for_reads() -> Self {
        Self::new(READ_BUFFER_SIZE)
    }

    /// Pool for the large send size class.
    pub fn for_sends() -> Self {
        Self::new(SEND_BUFFER_SIZE)
    }

    /// Take a zeroed buffer of the pool's size class.
    pub fn take(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size])
    }

    /// Return a buffer; it is re-zeroed before going back on the stack.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.len() != self.buf_size {
            return;
        }
        buf.fill(0);
        self.buffers.lock().push(buf);
    }

    /// Buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// Re-export tokio networking types for convenience
pub use tokio::io::{AsyncReadExt, AsyncWriteExt};
pub use tokio::net::{TcpListener, TcpStream};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_put_cycle() {
        let pool = BufferPool::new(64);
        let mut buf = pool.take();
        assert_eq!(buf.len(), 64);
        buf[10] = 0xFF;
        pool.put(buf);
        assert_eq!(pool.idle(), 1);

        let buf = pool.take();
        assert!(buf.iter().all(|&b| b == 0), "returned buffers are zeroed");
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_foreign_size_dropped() {
        let pool = BufferPool::new(64);
        pool.put(vec![0u8; 32]);
        assert_eq!(pool.idle(), 0);
    }
}
