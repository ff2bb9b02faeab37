//! 列写入器：把一段定宽数组追加到某列的 slab 链尾部
//!
//! 写入顺序总是"活动块 → 写满则 finalize → 下一个块 → slab 满则新建 slab"。
//! 每个块写回时重新计算块边界并扩展 slab 边界；slab 头在切换 slab 前和每次 append 结束时落盘。

use crate::bounds::Bounds;
use crate::common::{BlockIdx, EngineError, Result};
use crate::field_type::ColumnArray;
use crate::meta::SchemaColumn;
use crate::slab::{BlockHeader, SlabHeader};
use crate::slab_manager::SlabManager;

pub struct ColumnWriter<'a> {
    slabs:     &'a SlabManager,
    schema:    &'a str,
    column_id: u8,
    column:    SchemaColumn,
    /// 活动 slab 头的工作副本
    active:    Option<SlabHeader>,
    /// 本次写入是否新建过 slab
    rolled:    bool,
    rows:      u64,
}

impl<'a> ColumnWriter<'a> {
    pub fn new(slabs: &'a SlabManager, schema: &'a str, column_id: u8, column: SchemaColumn) -> Self {
        Self { slabs, schema, column_id, column, active: None, rolled: false, rows: 0 }
    }

    pub fn rows_written(&self) -> u64 { self.rows }

    /// 当前的列定义，包含本次写入新建的 slab
    pub fn column(&self) -> &SchemaColumn { &self.column }

    pub fn append(&mut self, values: &ColumnArray) -> Result<()> {
        if values.element_type() != self.column.element_type {
            return Err(EngineError::TypeMismatch {
                expected: self.column.element_type,
                actual:   values.element_type(),
            });
        }
        let mut pos = 0;
        while pos < values.len() {
            let full = self.active_header()?.is_full();
            if full {
                self.roll_slab()?;
                continue;
            }
            pos += self.fill_active_block(values, pos)?;
        }
        // 下次 append 可能要回读活动块，磁盘上的 slab 头必须先跟上
        self.flush()?;
        self.rows += values.len() as u64;
        Ok(())
    }

    /// 持久化活动 slab 头，返回更新后的列定义以及 schema 是否需要重写
    pub fn finish(mut self) -> Result<(SchemaColumn, bool)> {
        self.flush()?;
        Ok((self.column, self.rolled))
    }

    // ── 内部 ──────────────────────────────────────────────────────────────────

    fn active_header(&mut self) -> Result<&mut SlabHeader> {
        if self.active.is_none() {
            let header = match self.column.active_slab {
                Some(id) => (*self.slabs.load_slab_header(self.schema, id)?).clone(),
                None => {
                    let h = self.slabs.create_slab_for_column(
                        self.schema, self.column_id, self.column.element_type, 0,
                    )?;
                    self.column.slabs.push(h.id);
                    self.column.active_slab = Some(h.id);
                    self.rolled = true;
                    h
                }
            };
            self.active = Some(header);
        }
        self.active.as_mut().ok_or_else(|| EngineError::Ingest("no active slab".into()))
    }

    /// 写一部分数据进活动块，返回消耗的行数
    fn fill_active_block(&mut self, values: &ColumnArray, pos: usize) -> Result<usize> {
        let (slabs, schema) = (self.slabs, self.schema);
        let header = self.active_header()?;
        let idx = header.blocks_finalized as usize;
        let cap = header.rows_per_block as usize;
        let items = header.blocks.get(idx)
            .ok_or(EngineError::BlockNotFound { slab: header.id, block: idx })?
            .items as usize;

        let n = (cap - items).min(values.len() - pos);
        let mut combined = if items > 0 {
            slabs.load_block(schema, header, idx as BlockIdx)?.values.clone()
        } else {
            ColumnArray::empty(header.element_type)
        };
        combined.extend_from(values, pos, pos + n)?;

        let bounds = Bounds::from_values((0..combined.len()).map(|i| combined.value_f64(i)));
        header.blocks[idx].bounds = bounds;
        header.bounds.morph(&bounds);
        slabs.update_block_header_and_data_on_disk(schema, header, idx as BlockIdx, &combined)?;

        if combined.len() == cap {
            header.blocks_finalized += 1;
            let next = header.blocks_finalized as usize;
            if next < header.blocks_total as usize {
                let start = (next * header.block_bytes()) as u64;
                header.blocks.push(BlockHeader::new(header.element_type, start));
            }
        }
        Ok(n)
    }

    fn roll_slab(&mut self) -> Result<()> {
        self.flush()?;
        let offset = match &self.active {
            Some(h) => h.end_block(),
            None    => 0,
        };
        let header = self.slabs.create_slab_for_column(
            self.schema, self.column_id, self.column.element_type, offset,
        )?;
        tracing::debug!(schema = self.schema, column = %self.column.name, slab = %header.id, offset, "rolled to new slab");
        self.column.slabs.push(header.id);
        self.column.active_slab = Some(header.id);
        self.active = Some(header);
        self.rolled = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(h) = &self.active {
            self.slabs.update_slab_header_on_disk(self.schema, h)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::EngineConfig;
    use crate::field_type::ElementType;

    fn manager(dir: &std::path::Path) -> SlabManager {
        // Int32：64 行一块，4 块一个 slab
        let cfg = EngineConfig::new(dir).with_rows_per_block(64).with_slab_target_bytes(1024);
        SlabManager::new(&cfg)
    }

    #[test]
    fn appends_across_blocks_and_slabs() {
        let dir = tempfile::tempdir().unwrap();
        let slabs = manager(dir.path());
        let col = SchemaColumn::new("v", ElementType::Int32);

        let mut w = ColumnWriter::new(&slabs, "s", 0, col);
        w.append(&ColumnArray::Int32((0..200).collect())).unwrap();
        w.append(&ColumnArray::Int32((200..300).collect())).unwrap();
        assert_eq!(w.rows_written(), 300);
        let (col, rolled) = w.finish().unwrap();
        assert!(rolled);
        assert_eq!(col.slabs.len(), 2);
        assert_eq!(col.active_slab, Some(col.slabs[1]));

        let first = slabs.load_slab_header("s", col.slabs[0]).unwrap();
        assert!(first.is_full());
        assert_eq!((first.bounds.min, first.bounds.max), (0.0, 255.0));

        let second = slabs.load_slab_header("s", col.slabs[1]).unwrap();
        assert_eq!(second.offset_blocks, 4);
        assert_eq!(second.blocks_finalized, 0);
        assert_eq!(second.blocks[0].items, 44);
        let tail = slabs.load_block("s", &second, 0).unwrap();
        assert_eq!(tail.values, ColumnArray::Int32((256..300).collect()));
        assert_eq!((second.blocks[0].bounds.min, second.blocks[0].bounds.max), (256.0, 299.0));
    }

    #[test]
    fn partial_block_is_extended_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let slabs = manager(dir.path());

        let w = ColumnWriter::new(&slabs, "s", 0, SchemaColumn::new("v", ElementType::Int32));
        let (col, _) = w.finish().unwrap();
        assert!(col.slabs.is_empty());

        let mut w = ColumnWriter::new(&slabs, "s", 0, col);
        w.append(&ColumnArray::Int32(vec![5; 10])).unwrap();
        let (col, rolled) = w.finish().unwrap();
        assert!(rolled);

        let mut w = ColumnWriter::new(&slabs, "s", 0, col);
        w.append(&ColumnArray::Int32(vec![-3; 60])).unwrap();
        let (col, rolled) = w.finish().unwrap();
        assert!(!rolled);

        let h = slabs.load_slab_header("s", col.slabs[0]).unwrap();
        assert_eq!(h.blocks_finalized, 1);
        assert_eq!(h.blocks[1].items, 6);
        let b0 = slabs.load_block("s", &h, 0).unwrap();
        assert_eq!(&b0.values.slice(0, 10), &ColumnArray::Int32(vec![5; 10]));
        assert_eq!((h.blocks[0].bounds.min, h.blocks[0].bounds.max), (-3.0, 5.0));
    }

    #[test]
    fn rejects_wrong_type() {
        let dir = tempfile::tempdir().unwrap();
        let slabs = manager(dir.path());
        let mut w = ColumnWriter::new(&slabs, "s", 0, SchemaColumn::new("v", ElementType::Int32));
        assert!(matches!(
            w.append(&ColumnArray::Float32(vec![1.0])),
            Err(EngineError::TypeMismatch { .. })
        ));
    }
}
