//! Fixed-size byte buffers leased on the hot path
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Default size of a leased buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
// 空闲列表上限，归还超过这个数量的直接丢弃
const MAX_IDLE_BUFFERS: usize = 1024;

/// A pool of fixed-capacity byte blocks.
///
/// Cloning a `BufferPool` is cheap, all clones share the same free list.
#[derive(Clone)]
pub struct BufferPool {
  inner: Arc<PoolInner>,
}

struct PoolInner {
  buffer_size: usize,
  idle: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
  /// Create a pool leasing blocks of `buffer_size` bytes.
  pub fn new(buffer_size: usize) -> Self {
    Self {
      inner: Arc::new(PoolInner {
        buffer_size: buffer_size.max(1),
        idle: Mutex::new(Vec::new()),
      }),
    }
  }
  /// Size in bytes of every block handed out by this pool.
  pub fn buffer_size(&self) -> usize {
    self.inner.buffer_size
  }
  /// Lease a block. It goes back to the pool when the guard is dropped.
  pub fn lease(&self) -> PooledBuffer {
    let block = self
      .inner
      .idle
      .lock()
      .ok()
      .and_then(|mut idle| idle.pop())
      .unwrap_or_else(|| vec![0u8; self.inner.buffer_size].into_boxed_slice());
    PooledBuffer {
      block: Some(block),
      pool: self.inner.clone(),
    }
  }
  /// Number of blocks currently sitting in the free list.
  pub fn idle_count(&self) -> usize {
    self.inner.idle.lock().map(|idle| idle.len()).unwrap_or_default()
  }
}

impl Default for BufferPool {
  fn default() -> Self {
    BufferPool::new(DEFAULT_BUFFER_SIZE)
  }
}

impl fmt::Debug for BufferPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BufferPool")
      .field("buffer_size", &self.inner.buffer_size)
      .field("idle", &self.idle_count())
      .finish()
  }
}

/// A leased block, exclusively owned until dropped.
pub struct PooledBuffer {
  block: Option<Box<[u8]>>,
  pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    self.block.as_deref().unwrap_or_default()
  }
}

impl DerefMut for PooledBuffer {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.block.as_deref_mut().unwrap_or_default()
  }
}

impl Drop for PooledBuffer {
  fn drop(&mut self) {
    if let Some(block) = self.block.take() {
      if block.len() != self.pool.buffer_size {
        return;
      }
      if let Ok(mut idle) = self.pool.idle.lock() {
        if idle.len() < MAX_IDLE_BUFFERS {
          idle.push(block);
        }
      }
    }
  }
}

impl fmt::Debug for PooledBuffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PooledBuffer")
      .field("len", &self.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lease_returns_block_on_drop() {
    let pool = BufferPool::new(16);
    assert_eq!(pool.idle_count(), 0);
    {
      let mut buffer = pool.lease();
      assert_eq!(buffer.len(), 16);
      buffer[0] = 7;
    }
    assert_eq!(pool.idle_count(), 1);
    let again = pool.lease();
    assert_eq!(again.len(), 16);
    assert_eq!(pool.idle_count(), 0);
  }

  #[test]
  fn concurrent_leases_are_distinct() {
    let pool = BufferPool::new(8);
    let handles: Vec<_> = (0..8)
      .map(|i| {
        let pool = pool.clone();
        std::thread::spawn(move || {
          let mut buffer = pool.lease();
          buffer.fill(i as u8);
          assert!(buffer.iter().all(|b| *b == i as u8));
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    assert!(pool.idle_count() <= 8);
  }
}
