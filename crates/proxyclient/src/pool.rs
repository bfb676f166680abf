//! Call context pool
//!
//! A fixed set of reusable call contexts, one per session slot. The pool is
//! the admission bound on concurrent calls: with every context handed out,
//! further callers wait in FIFO order until one is released.

use crate::error::{ProxyError, Result};
use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};

/// One reusable RPC slot
#[derive(Debug)]
pub struct CallContext {
    slot_id: u32,
    seq_id: u32,
    session_gen: u64,
    send_capacity: usize,
    recv_capacity: usize,
    pub(crate) send_buf: BytesMut,
    pub(crate) recv_buf: BytesMut,
}

impl CallContext {
    fn new(slot_id: u32, send_capacity: usize, recv_capacity: usize) -> Self {
        Self {
            slot_id,
            seq_id: 0,
            session_gen: 0,
            send_capacity,
            recv_capacity,
            send_buf: BytesMut::with_capacity(send_capacity),
            recv_buf: BytesMut::with_capacity(recv_capacity),
        }
    }

    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    /// Last sequence id sent on this slot
    pub fn seq_id(&self) -> u32 {
        self.seq_id
    }

    pub fn send_capacity(&self) -> usize {
        self.send_capacity
    }

    pub fn recv_capacity(&self) -> usize {
        self.recv_capacity
    }

    /// Sequence id for the next call on this slot.
    ///
    /// A slot's sequence starts over whenever a new session is installed,
    /// since the server creates its slot table afresh.
    pub fn next_sequence(&mut self, session_gen: u64) -> u32 {
        if self.session_gen != session_gen {
            self.session_gen = session_gen;
            self.seq_id = 0;
        }
        self.seq_id = self.seq_id.wrapping_add(1);
        self.seq_id
    }

    /// Empty both buffers, restoring their capacity if a previous call gave
    /// the receive buffer away and never got it back
    pub(crate) fn prepare(&mut self) {
        self.send_buf.clear();
        self.recv_buf.clear();
        if self.send_buf.capacity() < self.send_capacity {
            self.send_buf.reserve(self.send_capacity);
        }
        if self.recv_buf.capacity() < self.recv_capacity {
            self.recv_buf.reserve(self.recv_capacity);
        }
    }
}

/// Fixed-size pool of call contexts
pub struct CallPool {
    capacity: usize,
    permits: Semaphore,
    free: Mutex<Vec<CallContext>>,
    in_use: AtomicUsize,
}

impl CallPool {
    /// Build `slots` contexts with slot ids `0..slots`
    pub fn new(slots: usize, send_capacity: usize, recv_capacity: usize) -> Self {
        // Popped from the back, so slot 0 is handed out first.
        let free = (0..slots as u32)
            .rev()
            .map(|slot| CallContext::new(slot, send_capacity, recv_capacity))
            .collect();
        Self {
            capacity: slots,
            permits: Semaphore::new(slots),
            free: Mutex::new(free),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Wait for a free context.
    ///
    /// Fails with `ShuttingDown` once the pool is closed, including for
    /// callers already waiting.
    pub async fn acquire(&self) -> Result<PooledContext<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProxyError::ShuttingDown)?;
        self.take(permit)
    }

    /// Take a free context without waiting
    pub fn try_acquire(&self) -> Option<PooledContext<'_>> {
        let permit = self.permits.try_acquire().ok()?;
        self.take(permit).ok()
    }

    fn take<'a>(&'a self, permit: SemaphorePermit<'a>) -> Result<PooledContext<'a>> {
        let mut ctx = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .ok_or_else(|| ProxyError::protocol_error("call pool permit without a context"))?;
        ctx.prepare();
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(PooledContext {
            pool: self,
            ctx,
            _permit: permit,
        })
    }

    fn release(&self, ctx: CallContext) {
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ctx);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Fail all current and future `acquire` calls
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A context on loan from the pool; returned to the free list when dropped
pub struct PooledContext<'a> {
    pool: &'a CallPool,
    ctx: CallContext,
    // Released after the context is back on the free list.
    _permit: SemaphorePermit<'a>,
}

impl Deref for PooledContext<'_> {
    type Target = CallContext;

    fn deref(&self) -> &CallContext {
        &self.ctx
    }
}

impl DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut CallContext {
        &mut self.ctx
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        // Zero-capacity stand-in; nothing is allocated.
        let empty = CallContext::new(self.ctx.slot_id, 0, 0);
        let ctx = std::mem::replace(&mut self.ctx, empty);
        self.pool.release(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_basic() {
        let pool = CallPool::new(2, 1024, 2048);
        assert_eq!(pool.capacity(), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(a.slot_id(), 0);
        assert_eq!(b.slot_id(), 1);
        assert_eq!(a.recv_capacity(), 2048);
        assert_eq!(pool.in_use(), 2);
        assert!(pool.try_acquire().is_none());

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.try_acquire().map(|c| c.slot_id()), Some(0));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_context() {
        let pool = Arc::new(CallPool::new(1, 1024, 1024));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.slot_id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let slot = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(slot, 0);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let pool = Arc::new(CallPool::new(1, 1024, 1024));
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ProxyError::ShuttingDown)));
        assert!(matches!(pool.acquire().await, Err(ProxyError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_context_is_reset_but_keeps_sequence() {
        let pool = CallPool::new(1, 1024, 1024);
        {
            let mut ctx = pool.acquire().await.unwrap();
            ctx.send_buf.extend_from_slice(b"stale");
            // Simulates a receive buffer handed to the dispatcher and lost.
            ctx.recv_buf = BytesMut::new();
            assert_eq!(ctx.next_sequence(1), 1);
            assert_eq!(ctx.next_sequence(1), 2);
        }
        let ctx = pool.acquire().await.unwrap();
        assert!(ctx.send_buf.is_empty());
        assert!(ctx.recv_buf.capacity() >= 1024);
        assert_eq!(ctx.seq_id(), 2);
    }

    #[test]
    fn test_sequence_restarts_with_new_session() {
        let mut ctx = CallContext::new(3, 512, 512);
        assert_eq!(ctx.next_sequence(1), 1);
        assert_eq!(ctx.next_sequence(1), 2);
        assert_eq!(ctx.next_sequence(2), 1);

        ctx.seq_id = u32::MAX;
        assert_eq!(ctx.next_sequence(2), 0);
    }
}
