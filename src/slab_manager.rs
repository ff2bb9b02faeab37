//! 存储层：slab 头/数据/块的加载、缓存与写回
//!
//! 读路径：
//! ```text
//! load_block ──► BlockCache ─miss─► load_slab_data ──► DataCache ─miss─► 读盘 + 解压
//!                                        │
//!                                        └─► load_slab_header ──► HeaderCache ─miss─► 读盘
//! ```
//! 头和数据的冷加载都经过 single-flight：同一个 slab 并发未命中时只读一次盘。
//!
//! 写路径（ingest 使用）采用写后失效：落盘后清掉该 slab 在三层缓存中的全部条目。
//! 同一个 slab 只允许一个写者，由上层 [`crate::storage::StorageEngine`] 保证。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{
    BlockCache, BlockData, CacheStats, CacheStatsSnapshot, DataCache, HeaderCache, SlabData,
};
use crate::common::{BlockIdx, EngineConfig, EngineError, Result, SlabId};
use crate::compression;
use crate::field_type::{ColumnArray, CompressionType, ElementType};
use crate::file::SlabFile;
use crate::pool::ObjectPool;
use crate::single_flight::SingleFlight;
use crate::slab::{SlabHeader, BLOCK_HEADER_SIZE, SLAB_HEADER_SIZE};

/// 压缩数据读缓冲的个数
const IO_BUFFERS: usize = 4;

/// 写入前的 slab 状态，写入失败时据此回滚。
///
/// 未压缩 slab 中已有的行在追加时原样重写，只需恢复头；LZ4 slab 的数据区整体重压，
/// 所以另存一份原压缩字节。
pub struct SlabSnapshot {
    header: SlabHeader,
    packed: Vec<u8>,
}

impl SlabSnapshot {
    pub fn id(&self) -> SlabId { self.header.id }
}

pub struct SlabManager {
    root:          PathBuf,
    config:        EngineConfig,
    headers:       HeaderCache,
    data:          DataCache,
    blocks:        BlockCache,
    slab_buffers:  ObjectPool<Vec<u8>>,
    io_buffers:    ObjectPool<Vec<u8>>,
    header_flight: SingleFlight<SlabId, Result<Arc<SlabHeader>>>,
    data_flight:   SingleFlight<SlabId, Result<Arc<SlabData>>>,
    stats:         CacheStats,
}

impl SlabManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            root:          config.storage_path.clone(),
            config:        config.clone(),
            headers:       HeaderCache::new(config.header_cache_capacity),
            data:          DataCache::new(config.data_cache_slabs),
            blocks:        BlockCache::new(config.block_cache_blocks),
            slab_buffers:  ObjectPool::buffers(config.slab_buffer_pool, config.max_payload_bytes()),
            io_buffers:    ObjectPool::new(IO_BUFFERS, Vec::new),
            header_flight: SingleFlight::new(),
            data_flight:   SingleFlight::new(),
            stats:         CacheStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub fn stats(&self) -> CacheStatsSnapshot { self.stats.snapshot() }

    // ── 路径 ──────────────────────────────────────────────────────────────────

    pub fn schema_dir(&self, schema: &str) -> PathBuf {
        self.root.join(schema)
    }

    pub fn slab_path(&self, schema: &str, id: &SlabId) -> PathBuf {
        self.schema_dir(schema).join(format!("{id}.slab"))
    }

    // ── 读路径 ────────────────────────────────────────────────────────────────

    /// 读取 slab 头及其 finalized（+活动）块头
    pub fn load_slab_header(&self, schema: &str, id: SlabId) -> Result<Arc<SlabHeader>> {
        if let Some(h) = self.headers.get(&id) {
            CacheStats::bump(&self.stats.header_hits);
            return Ok(h);
        }
        self.header_flight.work(id, || {
            if let Some(h) = self.headers.get(&id) {
                return Ok(h);
            }
            let header = read_header(&self.slab_path(schema, &id)).map_err(|e| match e {
                EngineError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => EngineError::SlabNotFound(id),
                e => e,
            })?;
            if header.id != id {
                return Err(EngineError::CorruptHeader(format!(
                    "slab file {id} carries id {}", header.id
                )));
            }
            CacheStats::bump(&self.stats.header_loads);
            tracing::debug!(schema, slab = %id, blocks = header.blocks.len(), "slab header loaded");
            self.headers.insert(header)
        })
    }

    /// 读取并解压整个 slab 数据区
    pub fn load_slab_data(&self, schema: &str, id: SlabId) -> Result<Arc<SlabData>> {
        if let Some(d) = self.data.get(&id) {
            CacheStats::bump(&self.stats.data_hits);
            return Ok(d);
        }
        self.data_flight.work(id, || {
            if let Some(d) = self.data.get(&id) {
                return Ok(d);
            }
            let header = self.load_slab_header(schema, id)?;
            let data = Arc::new(self.read_payload(schema, &header)?);
            CacheStats::bump(&self.stats.data_loads);
            tracing::debug!(schema, slab = %id, bytes = data.len(), "slab data loaded");
            self.data.insert(Arc::clone(&data));
            Ok(data)
        })
    }

    fn read_payload(&self, schema: &str, header: &SlabHeader) -> Result<SlabData> {
        let path = self.slab_path(schema, &header.id);
        let mut file = SlabFile::open(&path)?;

        self.data.make_room();
        let mut buf = self.slab_buffers.acquire();

        let len = header.stored_payload_len();
        if buf.len() < len {
            buf.resize(len, 0);
        }

        match header.compression {
            CompressionType::None => {
                file.read_exact_at(header.payload_offset(), &mut buf[..len])?;
            }
            CompressionType::Lz4 if len == 0 => {}
            CompressionType::Lz4 => {
                let stored = header.compressed_size as usize;
                let mut io = self.io_buffers.acquire();
                if io.len() < stored {
                    io.resize(stored, 0);
                }
                file.read_exact_at(header.payload_offset(), &mut io[..stored])?;
                compression::decompress_into(&io[..stored], CompressionType::Lz4, len, &mut buf)?;
            }
        }
        Ok(SlabData::new(header.id, buf, len))
    }

    /// 取块 `idx` 的定宽数组
    pub fn load_block(&self, schema: &str, header: &SlabHeader, idx: BlockIdx) -> Result<Arc<BlockData>> {
        if let Some(b) = self.blocks.get(header.id, idx) {
            CacheStats::bump(&self.stats.block_hits);
            return Ok(b);
        }
        let bh = header.blocks.get(idx as usize)
            .ok_or(EngineError::BlockNotFound { slab: header.id, block: idx as usize })?;

        let values = if bh.items == 0 {
            ColumnArray::empty(header.element_type)
        } else {
            let data  = self.load_slab_data(schema, header.id)?;
            let start = bh.start_offset as usize;
            let end   = start + bh.byte_len();
            if end > data.len() {
                return Err(EngineError::CorruptHeader(format!(
                    "block {idx} of slab {} spans [{start}, {end}) past payload of {} bytes",
                    header.id, data.len()
                )));
            }
            let raw = &data.bytes()[start..end];
            if bh.checksum != 0 && crc32fast::hash(raw) != bh.checksum {
                return Err(EngineError::ChecksumMismatch { slab: header.id, block: idx as usize });
            }
            ColumnArray::decode(header.element_type, raw, bh.items as usize)?
        };

        CacheStats::bump(&self.stats.block_decodes);
        let block = Arc::new(BlockData { slab_id: header.id, block_idx: idx, values });
        self.blocks.insert(Arc::clone(&block));
        Ok(block)
    }

    // ── 写路径 ────────────────────────────────────────────────────────────────

    /// 预分配一个新 slab 文件，写入 slab 头与第一个空块头
    pub fn create_slab_for_column(
        &self,
        schema:        &str,
        column_id:     u8,
        element_type:  ElementType,
        offset_blocks: u64,
    ) -> Result<SlabHeader> {
        let blocks_total = self.config.blocks_per_slab(element_type) as u16;
        let header = SlabHeader::new(
            column_id,
            element_type,
            self.config.compression,
            self.config.rows_per_block as u16,
            blocks_total,
            offset_blocks,
        );

        std::fs::create_dir_all(self.schema_dir(schema))?;
        let preallocated = match header.compression {
            CompressionType::None => header.payload_len() as u64,
            CompressionType::Lz4  => 0,
        };
        let mut file = SlabFile::create(
            &self.slab_path(schema, &header.id),
            header.payload_offset() + preallocated,
        )?;
        file.write_all_at(0, &header.encode_prefix())?;
        file.write_all_at(SlabHeader::block_header_offset(0), &header.blocks[0].encode())?;
        file.sync()?;

        tracing::info!(
            schema, slab = %header.id, column_id, ?element_type,
            blocks_total, offset_blocks, "slab created"
        );
        Ok(header)
    }

    /// 重写 slab 头前缀和全部已知块头
    pub fn update_slab_header_on_disk(&self, schema: &str, header: &SlabHeader) -> Result<()> {
        let mut buf = Vec::with_capacity(SLAB_HEADER_SIZE + header.blocks.len() * BLOCK_HEADER_SIZE);
        buf.extend_from_slice(&header.encode_prefix());
        for b in &header.blocks {
            buf.extend_from_slice(&b.encode());
        }
        let mut file = SlabFile::open_rw(&self.slab_path(schema, &header.id))?;
        file.write_all_at(0, &buf)?;
        file.sync()?;
        self.invalidate(&header.id);
        Ok(())
    }

    /// 用 `values` 覆盖块 `idx` 的数据并写回其块头。
    ///
    /// `header` 原地更新（块头的行数、校验和；LZ4 slab 的 compressed_size），
    /// slab 级字段由调用方随后通过 [`Self::update_slab_header_on_disk`] 持久化。
    pub fn update_block_header_and_data_on_disk(
        &self,
        schema: &str,
        header: &mut SlabHeader,
        idx:    BlockIdx,
        values: &ColumnArray,
    ) -> Result<()> {
        if values.element_type() != header.element_type {
            return Err(EngineError::TypeMismatch {
                expected: header.element_type,
                actual:   values.element_type(),
            });
        }
        if values.len() > header.rows_per_block as usize {
            return Err(EngineError::Ingest(format!(
                "{} values exceed block capacity {}", values.len(), header.rows_per_block
            )));
        }
        let slab_id  = header.id;
        let payload  = header.payload_offset();
        let bytes    = values.encode();
        let path     = self.slab_path(schema, &slab_id);
        let mut file = SlabFile::open_rw(&path)?;

        let block = header.blocks.get_mut(idx as usize)
            .ok_or(EngineError::BlockNotFound { slab: slab_id, block: idx as usize })?;
        block.items           = values.len() as u16;
        block.compressed_size = bytes.len() as u64;
        block.checksum        = crc32fast::hash(&bytes);
        let start             = block.start_offset as usize;
        let block_header      = block.encode();

        match header.compression {
            CompressionType::None => {
                file.write_all_at(payload + start as u64, &bytes)?;
            }
            CompressionType::Lz4 => {
                let mut plain = vec![0u8; header.payload_len()];
                if header.compressed_size > 0 {
                    let mut packed = vec![0u8; header.compressed_size as usize];
                    file.read_exact_at(payload, &mut packed)?;
                    compression::decompress_into(&packed, CompressionType::Lz4, plain.len(), &mut plain)?;
                }
                plain[start..start + bytes.len()].copy_from_slice(&bytes);
                let packed = compression::compress(&plain, CompressionType::Lz4)?;
                file.write_all_at(payload, &packed)?;
                header.compressed_size = packed.len() as u64;
            }
        }
        file.write_all_at(SlabHeader::block_header_offset(idx as usize), &block_header)?;
        file.sync()?;
        self.invalidate(&slab_id);
        Ok(())
    }

    // ── 回滚 ──────────────────────────────────────────────────────────────────

    pub fn snapshot_slab(&self, schema: &str, id: SlabId) -> Result<SlabSnapshot> {
        let header = SlabHeader::clone(&*self.load_slab_header(schema, id)?);
        let mut packed = Vec::new();
        if header.compression == CompressionType::Lz4 && header.compressed_size > 0 {
            packed.resize(header.compressed_size as usize, 0);
            let mut file = SlabFile::open(&self.slab_path(schema, &id))?;
            file.read_exact_at(header.payload_offset(), &mut packed)?;
        }
        Ok(SlabSnapshot { header, packed })
    }

    /// 把 slab 写回快照时的状态
    pub fn restore_slab(&self, schema: &str, snapshot: &SlabSnapshot) -> Result<()> {
        let header = &snapshot.header;
        self.invalidate(&header.id);
        if !snapshot.packed.is_empty() {
            let mut file = SlabFile::open_rw(&self.slab_path(schema, &header.id))?;
            file.write_all_at(header.payload_offset(), &snapshot.packed)?;
            file.sync()?;
        }
        self.update_slab_header_on_disk(schema, header)
    }

    /// 删除 slab 文件；文件已不存在不算错误
    pub fn remove_slab(&self, schema: &str, id: SlabId) -> Result<()> {
        self.invalidate(&id);
        match std::fs::remove_file(self.slab_path(schema, &id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => {
                tracing::debug!(schema, slab = %id, "slab removed");
                Ok(())
            }
        }
    }

    /// 清掉某个 slab 在三层缓存中的条目
    pub fn invalidate(&self, id: &SlabId) {
        self.headers.invalidate(id);
        self.data.invalidate(id);
        self.blocks.invalidate_slab(id);
    }
}

fn read_header(path: &Path) -> Result<SlabHeader> {
    let mut file = SlabFile::open(path)?;
    let mut prefix = [0u8; SLAB_HEADER_SIZE];
    file.read_exact_at(0, &mut prefix)?;
    let mut header = SlabHeader::decode_prefix(&prefix)?;

    let count = header.header_count();
    let mut raw = vec![0u8; count * BLOCK_HEADER_SIZE];
    file.read_exact_at(SlabHeader::block_header_offset(0), &mut raw)?;
    header.decode_blocks(&raw, count)?;
    Ok(header)
}
