//! 全局基础类型、引擎配置与错误定义

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::field_type::{CompressionType, ElementType};

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

pub type SlabId   = Uuid;
pub type BlockId  = Uuid;
/// 块在所属 slab 内的序号
pub type BlockIdx = u16;

// ── 常量 ──────────────────────────────────────────────────────────────────────

/// 每个块的默认行容量（32K 行，行号可用 u16 表示）
pub const BLOCK_ROWS: usize = 32 * 1024;
/// 单个 slab 未压缩数据区的默认目标大小
pub const SLAB_TARGET_BYTES: usize = 10 * 1024 * 1024;
/// 每个 slab 最多容纳的块数
pub const MAX_BLOCKS_PER_SLAB: usize = 65_000;
/// 每个查询分片包含的块数（ExecutorChunkSizeBlocks）
pub const CHUNK_SIZE_BLOCKS: usize = 10;
pub const SLAB_FORMAT_VERSION: u16 = 1;

// ── 引擎配置 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage_path:          PathBuf,
    pub worker_threads:        usize,
    /// 有界任务队列长度
    pub queue_capacity:        usize,
    pub rows_per_block:        usize,
    pub slab_target_bytes:     usize,
    pub chunk_size_blocks:     usize,
    /// 新建 slab 使用的压缩方式
    pub compression:           CompressionType,
    pub header_cache_capacity: usize,
    pub data_cache_slabs:      usize,
    pub block_cache_blocks:    usize,
    pub slab_buffer_pool:      usize,
}

impl EngineConfig {
    pub fn new(storage_path: impl AsRef<Path>) -> Self {
        let workers = num_cpus::get().max(1);
        Self {
            storage_path:          storage_path.as_ref().to_path_buf(),
            worker_threads:        workers,
            queue_capacity:        workers * 4,
            rows_per_block:        BLOCK_ROWS,
            slab_target_bytes:     SLAB_TARGET_BYTES,
            chunk_size_blocks:     CHUNK_SIZE_BLOCKS,
            compression:           CompressionType::None,
            header_cache_capacity: 4096,
            data_cache_slabs:      16,
            block_cache_blocks:    1024,
            slab_buffer_pool:      20,
        }
    }

    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self.queue_capacity = n * 4;
        self
    }
    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n; self
    }
    pub fn with_rows_per_block(mut self, n: usize) -> Self {
        self.rows_per_block = n; self
    }
    pub fn with_slab_target_bytes(mut self, n: usize) -> Self {
        self.slab_target_bytes = n; self
    }
    pub fn with_chunk_size_blocks(mut self, n: usize) -> Self {
        self.chunk_size_blocks = n; self
    }
    pub fn with_compression(mut self, c: CompressionType) -> Self {
        self.compression = c; self
    }
    pub fn with_header_cache_capacity(mut self, n: usize) -> Self {
        self.header_cache_capacity = n; self
    }
    /// 同时调整数据缓存与缓冲池大小，缓冲池总比缓存多留 4 个给写路径
    pub fn with_data_cache_slabs(mut self, n: usize) -> Self {
        self.data_cache_slabs = n;
        self.slab_buffer_pool = n + 4;
        self
    }
    pub fn with_block_cache_blocks(mut self, n: usize) -> Self {
        self.block_cache_blocks = n; self
    }

    /// 给定元素类型时每个 slab 的块数
    pub fn blocks_per_slab(&self, ty: ElementType) -> usize {
        let per_block = self.rows_per_block * ty.size();
        (self.slab_target_bytes / per_block).clamp(1, MAX_BLOCKS_PER_SLAB)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows_per_block == 0 || self.rows_per_block % 64 != 0 || self.rows_per_block > BLOCK_ROWS {
            return Err(EngineError::InvalidArgument(format!(
                "rows_per_block must be a non-zero multiple of 64 and <= {BLOCK_ROWS}, got {}",
                self.rows_per_block
            )));
        }
        if self.worker_threads == 0 || self.queue_capacity == 0 {
            return Err(EngineError::InvalidArgument("worker_threads and queue_capacity must be > 0".into()));
        }
        if self.chunk_size_blocks == 0 {
            return Err(EngineError::InvalidArgument("chunk_size_blocks must be > 0".into()));
        }
        if self.header_cache_capacity == 0 || self.data_cache_slabs == 0 || self.block_cache_blocks == 0 {
            return Err(EngineError::InvalidArgument("cache capacities must be > 0".into()));
        }
        if self.slab_buffer_pool <= self.data_cache_slabs {
            return Err(EngineError::InvalidArgument(
                "slab_buffer_pool must be larger than data_cache_slabs".into(),
            ));
        }
        Ok(())
    }

    /// 最大未压缩 slab 数据区，决定缓冲池中每个缓冲区的大小
    pub fn max_payload_bytes(&self) -> usize {
        ElementType::ALL.iter()
            .map(|&t| self.blocks_per_slab(t) * self.rows_per_block * t.size())
            .max()
            .unwrap_or(self.slab_target_bytes)
    }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("schema not found: {0}")]
    SchemaNotFound(String),
    #[error("schema already exists: {0}")]
    SchemaExists(String),
    #[error("column not found: schema={schema} column={column}")]
    ColumnNotFound { schema: String, column: String },
    #[error("slab not found: {0}")]
    SlabNotFound(SlabId),
    #[error("block not found: slab={slab} block={block}")]
    BlockNotFound { slab: SlabId, block: usize },
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("unsupported slab version: {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported element type tag: {0}")]
    UnsupportedElementType(u8),
    #[error("unsupported compression tag: {0}")]
    UnsupportedCompression(u8),
    #[error("corrupt header: {0}")]
    CorruptHeader(String),
    #[error("checksum mismatch: slab={slab} block={block}")]
    ChecksumMismatch { slab: SlabId, block: usize },
    #[error("compression error: {0}")]
    Compression(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("type mismatch: expected {expected:?}, got {actual:?}")]
    TypeMismatch { expected: ElementType, actual: ElementType },
    #[error("query has no filters")]
    EmptyQuery,
    #[error("no free entries")]
    NoFreeEntries,
    #[error("query cancelled")]
    Cancelled,
    #[error("ingest error: {0}")]
    Ingest(String),
    #[error("schema persistence error: {0}")]
    SchemaPersist(String),
    #[error("worker pool closed")]
    WorkerPoolClosed,
    #[error("worker panicked while executing chunk {0}")]
    WorkerPanicked(usize),
}

impl EngineError {
    /// 固定容量缓存已满，调用方可以稍后重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoFreeEntries)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::SchemaPersist(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_slab_geometry() {
        let cfg = EngineConfig::new("/tmp/x");
        assert_eq!(cfg.blocks_per_slab(ElementType::Uint64), 40);
        assert_eq!(cfg.blocks_per_slab(ElementType::Float32), 80);
        assert_eq!(cfg.blocks_per_slab(ElementType::Uint8), 320);
        assert_eq!(cfg.max_payload_bytes(), SLAB_TARGET_BYTES);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_odd_block_sizes() {
        let cfg = EngineConfig::new("/tmp/x").with_rows_per_block(100);
        assert!(matches!(cfg.validate(), Err(EngineError::InvalidArgument(_))));
        let cfg = EngineConfig::new("/tmp/x").with_rows_per_block(65536);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn only_no_free_entries_is_retryable() {
        assert!(EngineError::NoFreeEntries.is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }
}
