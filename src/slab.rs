//! slab 文件格式（小端序）
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  SLAB HEADER (64 bytes)                      │
//! │    version            u16                    │
//! │    offset_blocks      u64  列内全局块偏移      │
//! │    uuid               16B                    │
//! │    blocks_total       u16                    │
//! │    blocks_finalized   u16                    │
//! │    rows_per_block     u16                    │
//! │    column_id          u8                     │
//! │    element_type       u8                     │
//! │    compression        u8                     │
//! │    compressed_size    u64                    │
//! │    bounds             max f64, min f64       │
//! │    (padding)                                 │
//! ├──────────────────────────────────────────────┤
//! │  BLOCK HEADERS  blocks_total × 128 bytes     │
//! │    uuid 16B · items u16 · start_offset u64   │
//! │    compressed_size u64 · element_type u8     │
//! │    bounds (max f64, min f64) · crc32 u32     │
//! │    (padding)                                 │
//! ├──────────────────────────────────────────────┤
//! │  PAYLOAD（可选 LZ4，整体压缩）                 │
//! │    block i 位于解压后 i × rows × size 处      │
//! └──────────────────────────────────────────────┘
//! ```

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::bounds::Bounds;
use crate::common::{BlockId, EngineError, Result, SlabId, BLOCK_ROWS, SLAB_FORMAT_VERSION};
use crate::field_type::{CompressionType, ElementType};

pub const SLAB_HEADER_SIZE:  usize = 64;
pub const BLOCK_HEADER_SIZE: usize = 128;
/// 实际使用的字节数，其余为保留区
const SLAB_HEADER_USED:  usize = 2 + 8 + 16 + 2 + 2 + 2 + 1 + 1 + 1 + 8 + 16;
const BLOCK_HEADER_USED: usize = 16 + 2 + 8 + 8 + 1 + 16 + 4;

// ── BlockHeader ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub id:              BlockId,
    /// 已写入的有效行数
    pub items:           u16,
    /// 在解压后数据区中的字节偏移
    pub start_offset:    u64,
    pub compressed_size: u64,
    pub element_type:    ElementType,
    pub bounds:          Bounds,
    /// 块原始字节的 CRC32，0 表示未设置
    pub checksum:        u32,
}

impl BlockHeader {
    pub fn new(element_type: ElementType, start_offset: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            items: 0,
            start_offset,
            compressed_size: 0,
            element_type,
            bounds: Bounds::new(),
            checksum: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE);
        out.extend_from_slice(self.id.as_bytes());
        // Vec<u8> 的 Write 不会失败
        let _ = self.encode_fields(&mut out);
        out.resize(BLOCK_HEADER_SIZE, 0);
        out
    }

    fn encode_fields(&self, w: &mut Vec<u8>) -> std::io::Result<()> {
        w.write_u16::<LittleEndian>(self.items)?;
        w.write_u64::<LittleEndian>(self.start_offset)?;
        w.write_u64::<LittleEndian>(self.compressed_size)?;
        w.write_u8(self.element_type.tag())?;
        w.write_f64::<LittleEndian>(self.bounds.max)?;
        w.write_f64::<LittleEndian>(self.bounds.min)?;
        w.write_u32::<LittleEndian>(self.checksum)?;
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(EngineError::ShortRead { expected: BLOCK_HEADER_SIZE, actual: data.len() });
        }
        let mut r = Cursor::new(&data[..BLOCK_HEADER_USED]);
        let mut id = [0u8; 16];
        r.read_exact(&mut id)?;
        let items           = r.read_u16::<LittleEndian>()?;
        let start_offset    = r.read_u64::<LittleEndian>()?;
        let compressed_size = r.read_u64::<LittleEndian>()?;
        let element_type    = ElementType::from_tag(r.read_u8()?)?;
        let max             = r.read_f64::<LittleEndian>()?;
        let min             = r.read_f64::<LittleEndian>()?;
        let checksum        = r.read_u32::<LittleEndian>()?;
        let bounds = if items == 0 { Bounds::new() } else { Bounds::from_disk(min, max) };
        Ok(Self {
            id: Uuid::from_bytes(id),
            items, start_offset, compressed_size,
            element_type, bounds, checksum,
        })
    }

    /// 有效数据的字节长度
    pub fn byte_len(&self) -> usize {
        self.items as usize * self.element_type.size()
    }
}

// ── SlabHeader ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SlabHeader {
    pub version:          u16,
    /// 本 slab 第一个块在列内的全局块号
    pub offset_blocks:    u64,
    pub id:               SlabId,
    pub blocks_total:     u16,
    pub blocks_finalized: u16,
    pub rows_per_block:   u16,
    pub column_id:        u8,
    pub element_type:     ElementType,
    pub compression:      CompressionType,
    pub compressed_size:  u64,
    pub bounds:           Bounds,
    /// 已加载的块头：finalized 个，外加一个仍可写入的活动块（如果存在）
    pub blocks:           Vec<BlockHeader>,
}

impl SlabHeader {
    /// 新建 slab 头，附带第一个空块头
    pub fn new(
        column_id:      u8,
        element_type:   ElementType,
        compression:    CompressionType,
        rows_per_block: u16,
        blocks_total:   u16,
        offset_blocks:  u64,
    ) -> Self {
        Self {
            version: SLAB_FORMAT_VERSION,
            offset_blocks,
            id: Uuid::new_v4(),
            blocks_total,
            blocks_finalized: 0,
            rows_per_block,
            column_id,
            element_type,
            compression,
            compressed_size: 0,
            bounds: Bounds::new(),
            blocks: vec![BlockHeader::new(element_type, 0)],
        }
    }

    pub fn encode_prefix(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SLAB_HEADER_SIZE);
        let _ = self.encode_fields(&mut out);
        out.resize(SLAB_HEADER_SIZE, 0);
        out
    }

    fn encode_fields(&self, w: &mut Vec<u8>) -> std::io::Result<()> {
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_u64::<LittleEndian>(self.offset_blocks)?;
        w.write_all(self.id.as_bytes())?;
        w.write_u16::<LittleEndian>(self.blocks_total)?;
        w.write_u16::<LittleEndian>(self.blocks_finalized)?;
        w.write_u16::<LittleEndian>(self.rows_per_block)?;
        w.write_u8(self.column_id)?;
        w.write_u8(self.element_type.tag())?;
        w.write_u8(self.compression.tag())?;
        w.write_u64::<LittleEndian>(self.compressed_size)?;
        w.write_f64::<LittleEndian>(self.bounds.max)?;
        w.write_f64::<LittleEndian>(self.bounds.min)?;
        Ok(())
    }

    /// 解码固定前缀，返回的 `blocks` 为空
    pub fn decode_prefix(data: &[u8]) -> Result<Self> {
        if data.len() < SLAB_HEADER_SIZE {
            return Err(EngineError::ShortRead { expected: SLAB_HEADER_SIZE, actual: data.len() });
        }
        let mut r = Cursor::new(&data[..SLAB_HEADER_USED]);
        let version = r.read_u16::<LittleEndian>()?;
        if version != SLAB_FORMAT_VERSION {
            return Err(EngineError::UnsupportedVersion(version));
        }
        let offset_blocks = r.read_u64::<LittleEndian>()?;
        let mut id = [0u8; 16];
        r.read_exact(&mut id)?;
        let blocks_total     = r.read_u16::<LittleEndian>()?;
        let blocks_finalized = r.read_u16::<LittleEndian>()?;
        let rows_per_block   = r.read_u16::<LittleEndian>()?;
        let column_id        = r.read_u8()?;
        let element_type     = ElementType::from_tag(r.read_u8()?)?;
        let compression      = CompressionType::from_tag(r.read_u8()?)?;
        let compressed_size  = r.read_u64::<LittleEndian>()?;
        let max              = r.read_f64::<LittleEndian>()?;
        let min              = r.read_f64::<LittleEndian>()?;

        if blocks_total == 0 || blocks_finalized > blocks_total {
            return Err(EngineError::CorruptHeader(format!(
                "blocks_finalized={blocks_finalized} blocks_total={blocks_total}"
            )));
        }
        if rows_per_block == 0 || rows_per_block as usize > BLOCK_ROWS {
            return Err(EngineError::CorruptHeader(format!(
                "rows_per_block={rows_per_block}, must be in 1..={BLOCK_ROWS}"
            )));
        }
        Ok(Self {
            version, offset_blocks,
            id: Uuid::from_bytes(id),
            blocks_total, blocks_finalized, rows_per_block,
            column_id, element_type, compression, compressed_size,
            bounds: Bounds::from_disk(min, max),
            blocks: Vec::new(),
        })
    }

    /// 解码 `count` 个连续块头并校验其与 slab 的一致性
    pub fn decode_blocks(&mut self, data: &[u8], count: usize) -> Result<()> {
        let need = count * BLOCK_HEADER_SIZE;
        if data.len() < need {
            return Err(EngineError::ShortRead { expected: need, actual: data.len() });
        }
        self.blocks.clear();
        for raw in data[..need].chunks_exact(BLOCK_HEADER_SIZE) {
            let bh = BlockHeader::decode(raw)?;
            if bh.element_type != self.element_type {
                return Err(EngineError::CorruptHeader(format!(
                    "block {} has type {:?}, slab {} has {:?}",
                    bh.id, bh.element_type, self.id, self.element_type
                )));
            }
            if bh.items > self.rows_per_block {
                return Err(EngineError::CorruptHeader(format!(
                    "block {} holds {} rows, capacity {}", bh.id, bh.items, self.rows_per_block
                )));
            }
            self.blocks.push(bh);
        }
        Ok(())
    }

    /// 需要从磁盘读取的块头个数：finalized 个，未写满时再加活动块
    pub fn header_count(&self) -> usize {
        let f = self.blocks_finalized as usize;
        if f < self.blocks_total as usize { f + 1 } else { f }
    }

    /// 含数据的块个数
    pub fn live_blocks(&self) -> usize {
        let f = self.blocks_finalized as usize;
        match self.blocks.get(f) {
            Some(active) if active.items > 0 => f + 1,
            _ => f,
        }
    }

    pub fn is_full(&self) -> bool {
        self.blocks_finalized >= self.blocks_total
    }

    pub fn block_bytes(&self) -> usize {
        self.rows_per_block as usize * self.element_type.size()
    }

    /// 未压缩数据区总长
    pub fn payload_len(&self) -> usize {
        self.blocks_total as usize * self.block_bytes()
    }

    /// 数据区在文件中的起始偏移
    pub fn payload_offset(&self) -> u64 {
        (SLAB_HEADER_SIZE + self.blocks_total as usize * BLOCK_HEADER_SIZE) as u64
    }

    pub fn block_header_offset(idx: usize) -> u64 {
        (SLAB_HEADER_SIZE + idx * BLOCK_HEADER_SIZE) as u64
    }

    /// 数据区中需要读取并解码的未压缩字节数
    pub fn stored_payload_len(&self) -> usize {
        match self.compression {
            CompressionType::None => self.live_blocks() * self.block_bytes(),
            CompressionType::Lz4 if self.compressed_size == 0 => 0,
            CompressionType::Lz4 => self.payload_len(),
        }
    }

    /// 按列内全局块号排列时，本 slab 覆盖的区间末端（不含）
    pub fn end_block(&self) -> u64 {
        self.offset_blocks + self.blocks_total as u64
    }
}
