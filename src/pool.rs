//! 定长对象池
//!
//! 池中对象按需懒创建，总数不超过 `capacity`。池耗尽时 `acquire` 阻塞直到有对象归还，
//! 这是刻意的反压而不是错误。取出的对象包在 [`Pooled`] 守卫里，Drop 时自动归还，
//! 错误路径上也不会漏还。

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct PoolState<T> {
    free:    Vec<T>,
    created: usize,
}

struct PoolInner<T> {
    state:     Mutex<PoolState<T>>,
    available: Condvar,
    capacity:  usize,
    factory:   Factory<T>,
}

pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + 'static> ObjectPool<T> {
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                state:     Mutex::new(PoolState { free: Vec::new(), created: 0 }),
                available: Condvar::new(),
                capacity:  capacity.max(1),
                factory:   Box::new(factory),
            }),
        }
    }

    /// 取出一个对象；池耗尽时阻塞
    pub fn acquire(&self) -> Pooled<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(item) = state.free.pop() {
                return self.wrap(item);
            }
            if state.created < self.inner.capacity {
                state.created += 1;
                drop(state);
                return self.wrap((self.inner.factory)());
            }
            tracing::debug!(capacity = self.inner.capacity, "object pool exhausted, waiting");
            self.inner.available.wait(&mut state);
        }
    }

    /// 非阻塞版本
    pub fn try_acquire(&self) -> Option<Pooled<T>> {
        let mut state = self.inner.state.lock();
        if let Some(item) = state.free.pop() {
            return Some(self.wrap(item));
        }
        if state.created < self.inner.capacity {
            state.created += 1;
            drop(state);
            return Some(self.wrap((self.inner.factory)()));
        }
        None
    }

    pub fn capacity(&self) -> usize { self.inner.capacity }

    /// 当前被借出的对象数
    pub fn in_use(&self) -> usize {
        let state = self.inner.state.lock();
        state.created - state.free.len()
    }

    fn wrap(&self, item: T) -> Pooled<T> {
        Pooled { item: Some(item), pool: Arc::clone(&self.inner) }
    }
}

impl ObjectPool<Vec<u8>> {
    /// 每个缓冲区 `size` 字节的缓冲池
    pub fn buffers(capacity: usize, size: usize) -> Self {
        Self::new(capacity, move || vec![0u8; size])
    }
}

// ── Pooled 守卫 ───────────────────────────────────────────────────────────────

pub struct Pooled<T> {
    item: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // item 只在 Drop 中被取走
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item accessed after release"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled item accessed after release"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.state.lock().free.push(item);
            self.pool.available.notify_one();
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn reuses_returned_buffers() {
        let pool = ObjectPool::buffers(2, 16);
        let a = pool.acquire();
        assert_eq!(a.len(), 16);
        let b = pool.acquire();
        assert_eq!(pool.in_use(), 2);
        assert!(pool.try_acquire().is_none());
        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.try_acquire().is_some());
        drop(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = ObjectPool::buffers(1, 4);
        let held = pool.acquire();
        let got = Arc::new(AtomicBool::new(false));

        let handle = {
            let pool = pool.clone();
            let got = Arc::clone(&got);
            std::thread::spawn(move || {
                let _b = pool.acquire();
                got.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!got.load(Ordering::SeqCst));
        drop(held);
        handle.join().unwrap();
        assert!(got.load(Ordering::SeqCst));
    }
}
