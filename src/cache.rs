//! 存储层缓存：slab 头缓存、slab 数据缓存、块缓存
//!
//! - [`HeaderCache`] 定容分片表，满且所有条目都被引用时返回 `NoFreeEntries`（可重试）
//! - [`DataCache`]   解压后的整 slab 数据区，缓冲区来自定长缓冲池，先进先出淘汰
//! - [`BlockCache`]  解码后的定宽数组，按 `(slab_id, block_idx)` 做 LRU
//!
//! 调用方拿到的都是 `Arc`，条目被淘汰后持有者仍可安全使用，最后一个引用释放时
//! 池化缓冲区自动归还。

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::common::{BlockIdx, EngineError, Result, SlabId};
use crate::field_type::ColumnArray;
use crate::pool::Pooled;
use crate::slab::SlabHeader;

// ── 缓存条目 ──────────────────────────────────────────────────────────────────

/// 一个 slab 解压后的数据区
pub struct SlabData {
    pub slab_id:   SlabId,
    pub loaded_at: Instant,
    buf:           Pooled<Vec<u8>>,
    len:           usize,
    reads:         AtomicU64,
}

impl SlabData {
    pub fn new(slab_id: SlabId, buf: Pooled<Vec<u8>>, len: usize) -> Self {
        Self { slab_id, loaded_at: Instant::now(), buf, len, reads: AtomicU64::new(0) }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn reads(&self) -> u64 { self.reads.load(Ordering::Relaxed) }
    fn touch(&self) { self.reads.fetch_add(1, Ordering::Relaxed); }
}

/// 一个块解码后的数组，长度即块内有效行数
#[derive(Debug)]
pub struct BlockData {
    pub slab_id:   SlabId,
    pub block_idx: BlockIdx,
    pub values:    ColumnArray,
}

impl BlockData {
    pub fn items(&self) -> usize { self.values.len() }
}

// ── 统计 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CacheStats {
    pub header_hits:   AtomicU64,
    pub header_loads:  AtomicU64,
    pub data_hits:     AtomicU64,
    pub data_loads:    AtomicU64,
    pub block_hits:    AtomicU64,
    pub block_decodes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub header_hits:   u64,
    /// 真正读盘的次数
    pub header_loads:  u64,
    pub data_hits:     u64,
    pub data_loads:    u64,
    pub block_hits:    u64,
    pub block_decodes: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            header_hits:   self.header_hits.load(Ordering::Relaxed),
            header_loads:  self.header_loads.load(Ordering::Relaxed),
            data_hits:     self.data_hits.load(Ordering::Relaxed),
            data_loads:    self.data_loads.load(Ordering::Relaxed),
            block_hits:    self.block_hits.load(Ordering::Relaxed),
            block_decodes: self.block_decodes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Header 缓存（分片）────────────────────────────────────────────────────────

const HEADER_SHARDS: usize = 16;

pub struct HeaderCache {
    shards:          Vec<RwLock<HashMap<SlabId, Arc<SlabHeader>>>>,
    shard_capacity:  usize,
}

impl HeaderCache {
    pub fn new(capacity: usize) -> Self {
        let shards = (0..HEADER_SHARDS).map(|_| RwLock::new(HashMap::new())).collect();
        Self { shards, shard_capacity: capacity.div_ceil(HEADER_SHARDS).max(1) }
    }

    fn shard(&self, id: &SlabId) -> &RwLock<HashMap<SlabId, Arc<SlabHeader>>> {
        let mut h = DefaultHasher::new();
        id.hash(&mut h);
        &self.shards[(h.finish() as usize) % HEADER_SHARDS]
    }

    pub fn get(&self, id: &SlabId) -> Option<Arc<SlabHeader>> {
        self.shard(id).read().get(id).cloned()
    }

    /// 放入缓存；分片已满时淘汰一个无人引用的条目，找不到则返回 `NoFreeEntries`
    pub fn insert(&self, header: SlabHeader) -> Result<Arc<SlabHeader>> {
        let id = header.id;
        let header = Arc::new(header);
        let mut shard = self.shard(&id).write();
        if !shard.contains_key(&id) && shard.len() >= self.shard_capacity {
            let victim = shard.iter()
                .find(|(_, h)| Arc::strong_count(h) == 1)
                .map(|(k, _)| *k);
            match victim {
                Some(k) => {
                    shard.remove(&k);
                    tracing::debug!(evicted = %k, "header cache eviction");
                }
                None => return Err(EngineError::NoFreeEntries),
            }
        }
        shard.insert(id, Arc::clone(&header));
        Ok(header)
    }

    pub fn invalidate(&self, id: &SlabId) {
        self.shard(id).write().remove(id);
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

// ── 数据缓存 ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct DataCacheInner {
    map:   HashMap<SlabId, Arc<SlabData>>,
    order: VecDeque<SlabId>,
}

pub struct DataCache {
    capacity: usize,
    inner:    RwLock<DataCacheInner>,
}

impl DataCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), inner: RwLock::new(DataCacheInner::default()) }
    }

    pub fn get(&self, id: &SlabId) -> Option<Arc<SlabData>> {
        let inner = self.inner.read();
        let data = inner.map.get(id)?;
        data.touch();
        Some(Arc::clone(data))
    }

    /// 为即将到来的插入腾位置；需在向缓冲池申请缓冲区之前调用，
    /// 否则缓存自己攥着的缓冲区会让申请永远等不到
    pub fn make_room(&self) {
        let mut inner = self.inner.write();
        while inner.map.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else { break };
            if inner.map.remove(&oldest).is_some() {
                tracing::debug!(slab = %oldest, "data cache eviction");
            }
        }
    }

    pub fn insert(&self, data: Arc<SlabData>) {
        let mut inner = self.inner.write();
        let id = data.slab_id;
        if inner.map.insert(id, data).is_none() {
            inner.order.push_back(id);
        }
        while inner.map.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else { break };
            inner.map.remove(&oldest);
        }
    }

    pub fn invalidate(&self, id: &SlabId) {
        let mut inner = self.inner.write();
        if inner.map.remove(id).is_some() {
            inner.order.retain(|k| k != id);
        }
    }

    pub fn len(&self) -> usize { self.inner.read().map.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

// ── 块缓存 ────────────────────────────────────────────────────────────────────

/// LRU 的 get 需要移动链表节点，所以用 Mutex 而不是 RwLock
pub struct BlockCache {
    inner: Mutex<LruCache<(SlabId, BlockIdx), Arc<BlockData>>>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { inner: Mutex::new(LruCache::new(cap)) }
    }

    pub fn get(&self, slab: SlabId, block: BlockIdx) -> Option<Arc<BlockData>> {
        self.inner.lock().get(&(slab, block)).cloned()
    }

    pub fn insert(&self, data: Arc<BlockData>) {
        self.inner.lock().put((data.slab_id, data.block_idx), data);
    }

    /// 清掉某个 slab 的全部块
    pub fn invalidate_slab(&self, slab: &SlabId) {
        let mut inner = self.inner.lock();
        let keys: Vec<_> = inner.iter()
            .filter(|((s, _), _)| s == slab)
            .map(|(k, _)| *k)
            .collect();
        for k in keys {
            inner.pop(&k);
        }
    }

    pub fn len(&self) -> usize { self.inner.lock().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
