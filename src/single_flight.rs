//! 并发冷加载去重（single-flight）
//!
//! 同一个 key 同时只有一个调用者（leader）真正执行加载，其余调用者阻塞等待并拿到
//! 同一个结果（包括同一个错误）。leader 若在加载中 panic，等待者被唤醒后重新竞争。

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

enum CallState<V> {
    Pending,
    Done(V),
    Abandoned,
}

struct Call<V> {
    state: Mutex<CallState<V>>,
    done:  Condvar,
}

pub struct SingleFlight<K, V> {
    calls: Mutex<HashMap<K, Arc<Call<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self { Self::new() }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self { calls: Mutex::new(HashMap::new()) }
    }

    /// 对 `key` 执行 `f`；若已有同 key 的调用在进行，则等待并共享其结果
    pub fn work<F>(&self, key: K, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        let call = loop {
            let (call, leader) = {
                let mut calls = self.calls.lock();
                match calls.get(&key) {
                    Some(c) => (Arc::clone(c), false),
                    None => {
                        let c = Arc::new(Call { state: Mutex::new(CallState::Pending), done: Condvar::new() });
                        calls.insert(key.clone(), Arc::clone(&c));
                        (c, true)
                    }
                }
            };
            if leader {
                break call;
            }

            tracing::debug!("single-flight: joining in-flight load");
            let mut state = call.state.lock();
            while matches!(*state, CallState::Pending) {
                call.done.wait(&mut state);
            }
            if let CallState::Done(v) = &*state {
                return v.clone();
            }
            // leader 放弃了，重新竞争
        };

        let mut guard = LeaderGuard { flight: self, key: &key, call: &call, finished: false };
        let value = f();
        guard.finish(CallState::Done(value.clone()));
        value
    }

    /// 正在进行中的 key 数量
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    fn complete(&self, key: &K, call: &Arc<Call<V>>, outcome: CallState<V>) {
        {
            let mut calls = self.calls.lock();
            if calls.get(key).map(|c| Arc::ptr_eq(c, call)).unwrap_or(false) {
                calls.remove(key);
            }
        }
        *call.state.lock() = outcome;
        call.done.notify_all();
    }
}

struct LeaderGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    flight:   &'a SingleFlight<K, V>,
    key:      &'a K,
    call:     &'a Arc<Call<V>>,
    finished: bool,
}

impl<K, V> LeaderGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn finish(&mut self, outcome: CallState<V>) {
        self.finished = true;
        self.flight.complete(self.key, self.call, outcome);
    }
}

impl<K, V> Drop for LeaderGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.finished {
            self.flight.complete(self.key, self.call, CallState::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn concurrent_callers_share_one_execution() {
        let flight: Arc<SingleFlight<u32, Result<u64, String>>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let runs = Arc::clone(&runs);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    flight.work(7, || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(100));
                        Err::<u64, _>("disk on fire".to_string())
                    })
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), Err("disk on fire".to_string()));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[test]
    fn sequential_calls_run_again() {
        let flight: SingleFlight<&str, u32> = SingleFlight::new();
        assert_eq!(flight.work("a", || 1), 1);
        assert_eq!(flight.work("a", || 2), 2);
    }

    #[test]
    fn panicking_leader_releases_key() {
        let flight: Arc<SingleFlight<u8, u8>> = Arc::new(SingleFlight::new());
        let f2 = Arc::clone(&flight);
        let r = std::thread::spawn(move || f2.work(1, || panic!("boom"))).join();
        assert!(r.is_err());
        assert_eq!(flight.in_flight(), 0);
        assert_eq!(flight.work(1, || 5), 5);
    }
}
