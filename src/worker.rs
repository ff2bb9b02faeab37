//! 查询 worker 池
//!
//! ```text
//!  query ──submit──► bounded channel ──► worker 0 ─┐
//!   │                  (ChunkTask)        worker 1 ─┼─► QueryStatus (合并结果 / 首个错误)
//!   └──── wait ◄──────────────────────────worker N ─┘
//! ```
//!
//! 每个 worker 独占一份 [`ChunkScratch`]。任务无论成功、失败、被跳过还是 panic 都会计入完成数，
//! 所以 `wait` 不会因为某个 chunk 出错而挂住；panic 之后 worker 重建 scratch 继续取任务。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::common::{EngineError, Result};
use crate::executor::{execute_chunk, ChunkOutcome, ChunkScratch};
use crate::planner::QueryPlan;
use crate::query::AggregateState;
use crate::slab_manager::SlabManager;

// ── 取消 ──────────────────────────────────────────────────────────────────────

/// 协作式取消标记，可跨线程克隆
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ── 单个查询的完成状态 ────────────────────────────────────────────────────────

struct StatusState {
    finished: usize,
    error:    Option<EngineError>,
    outcome:  ChunkOutcome,
}

pub struct QueryStatus {
    total: usize,
    state: Mutex<StatusState>,
    done:  Condvar,
}

impl QueryStatus {
    pub fn new(total: usize, selectors: usize) -> Self {
        Self {
            total,
            state: Mutex::new(StatusState {
                finished: 0,
                error:    None,
                outcome:  ChunkOutcome {
                    aggregates: vec![AggregateState::default(); selectors],
                    ..Default::default()
                },
            }),
            done: Condvar::new(),
        }
    }

    pub fn total(&self) -> usize { self.total }

    /// 记一个 chunk 完成；只保留第一个错误
    pub fn complete(&self, result: Result<ChunkOutcome>) {
        let mut st = self.state.lock();
        match result {
            Ok(o) => {
                st.outcome.matched_rows += o.matched_rows;
                st.outcome.stats.merge(&o.stats);
                for (acc, a) in st.outcome.aggregates.iter_mut().zip(&o.aggregates) {
                    acc.merge(a);
                }
            }
            Err(e) => {
                if st.error.is_none() {
                    st.error = Some(e);
                }
            }
        }
        st.finished += 1;
        if st.finished >= self.total {
            self.done.notify_all();
        }
    }

    pub fn failed(&self) -> bool {
        self.state.lock().error.is_some()
    }

    pub fn finished(&self) -> usize {
        self.state.lock().finished
    }

    /// 阻塞到全部 chunk 计数完成
    pub fn wait(&self) -> Result<ChunkOutcome> {
        let mut st = self.state.lock();
        while st.finished < self.total {
            self.done.wait(&mut st);
        }
        match st.error.take() {
            Some(e) => Err(e),
            None    => Ok(std::mem::take(&mut st.outcome)),
        }
    }
}

// ── 任务 ──────────────────────────────────────────────────────────────────────

struct ChunkTask {
    plan:   Arc<QueryPlan>,
    index:  usize,
    status: Arc<QueryStatus>,
    cancel: CancelToken,
}

// ── WorkerPool ────────────────────────────────────────────────────────────────

pub struct WorkerPool {
    sender:  Option<Sender<ChunkTask>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        threads:    usize,
        capacity:   usize,
        chunk_size: usize,
        slabs:      Arc<SlabManager>,
    ) -> Result<Self> {
        let (sender, receiver) = bounded::<ChunkTask>(capacity);
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = receiver.clone();
            let slabs = Arc::clone(&slabs);
            let handle = thread::Builder::new()
                .name(format!("slab-worker-{i}"))
                .spawn(move || worker_loop(i, rx, slabs, chunk_size))?;
            handles.push(handle);
        }
        tracing::info!(threads, capacity, "worker pool started");
        Ok(Self { sender: Some(sender), handles })
    }

    pub fn threads(&self) -> usize { self.handles.len() }

    /// 把计划中的每个 chunk 入队；队列满时阻塞调用方
    pub fn submit(&self, plan: Arc<QueryPlan>, cancel: &CancelToken) -> Result<Arc<QueryStatus>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let sender = self.sender.as_ref().ok_or(EngineError::WorkerPoolClosed)?;
        let total = plan.chunks.len();
        let status = Arc::new(QueryStatus::new(total, plan.selectors.len()));

        for index in 0..total {
            if cancel.is_cancelled() {
                for _ in index..total {
                    status.complete(Err(EngineError::Cancelled));
                }
                break;
            }
            let task = ChunkTask {
                plan:   Arc::clone(&plan),
                index,
                status: Arc::clone(&status),
                cancel: cancel.clone(),
            };
            if sender.send(task).is_err() {
                // 接收端已全部退出，剩余 chunk 直接记失败
                for _ in index..total {
                    status.complete(Err(EngineError::WorkerPoolClosed));
                }
                break;
            }
        }
        Ok(status)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
        tracing::debug!("worker pool stopped");
    }
}

fn worker_loop(id: usize, rx: Receiver<ChunkTask>, slabs: Arc<SlabManager>, chunk_size: usize) {
    let mut scratch = ChunkScratch::new(chunk_size);
    while let Ok(task) = rx.recv() {
        let result = run_guarded(task.index, || {
            if task.cancel.is_cancelled() {
                Err(EngineError::Cancelled)
            } else if task.status.failed() {
                // 同一查询已有 chunk 失败，结果不会再被使用
                Ok(ChunkOutcome::default())
            } else {
                execute_chunk(&slabs, &task.plan, task.index, &mut scratch, &task.cancel)
            }
        });
        match &result {
            Err(EngineError::Cancelled) => {}
            Err(EngineError::WorkerPanicked(_)) => {
                tracing::error!(worker = id, chunk = task.index, "chunk panicked");
                scratch = ChunkScratch::new(chunk_size);
            }
            Err(e) => tracing::warn!(worker = id, chunk = task.index, error = %e, "chunk failed"),
            Ok(_)  => {}
        }
        task.status.complete(result);
    }
}

/// 执行一个 chunk，panic 转成 `WorkerPanicked(index)`
fn run_guarded<F>(index: usize, f: F) -> Result<ChunkOutcome>
where
    F: FnOnce() -> Result<ChunkOutcome>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(Err(EngineError::WorkerPanicked(index)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_keeps_first_error_and_counts_everything() {
        let st = QueryStatus::new(3, 0);
        st.complete(Ok(ChunkOutcome { matched_rows: 5, ..Default::default() }));
        st.complete(Err(EngineError::Cancelled));
        st.complete(Err(EngineError::EmptyQuery));
        assert_eq!(st.finished(), 3);
        assert!(matches!(st.wait(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn status_merges_outcomes_across_threads() {
        let st = Arc::new(QueryStatus::new(8, 1));
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let st = Arc::clone(&st);
                thread::spawn(move || {
                    let mut agg = AggregateState::default();
                    agg.fold(i as f64);
                    st.complete(Ok(ChunkOutcome {
                        matched_rows: i,
                        aggregates:   vec![agg],
                        ..Default::default()
                    }));
                })
            })
            .collect();
        let out = st.wait().unwrap();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(out.matched_rows, 28);
        assert_eq!(out.aggregates[0].count, 8);
        assert_eq!(out.aggregates[0].max, 7.0);
    }

    #[test]
    fn panicking_chunk_becomes_an_error() {
        let r = run_guarded(4, || panic!("kernel blew up"));
        assert!(matches!(r, Err(EngineError::WorkerPanicked(4))));
        let ok = run_guarded(0, || Ok(ChunkOutcome { matched_rows: 3, ..Default::default() }));
        assert_eq!(ok.unwrap().matched_rows, 3);
    }

    #[test]
    fn cancel_token_is_shared() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }
}
