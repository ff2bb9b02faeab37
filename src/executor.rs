//! chunk 执行器
//!
//! 一个 chunk 内，对每个过滤列组依次：
//! 1. 预处理：逐块用块头边界重新分类每个条件；任一条件 No 则整块跳过且不读数据，
//!    全部 Full 也不读数据，其余情况经存储层加载块数组
//! 2. 过滤：Full 的条件直接并入全集，其余条件跑向量内核，把命中行号并入该块槽位的位图
//!
//! 所有列组处理完后汇总：merge 次数等于计划中条件总数的槽位，其位图 popcount 即命中行数。
//! scratch 由 worker 线程独占，每个任务开始时重置。

use std::sync::Arc;

use crate::bitset::RowBitset;
use crate::bounds::IntersectKind;
use crate::cache::BlockData;
use crate::common::{BlockIdx, EngineError, Result, SlabId, BLOCK_ROWS};
use crate::planner::{BlockChunk, FilterGroup, QueryPlan};
use crate::query::{AggregateState, QueryStats};
use crate::slab_manager::SlabManager;
use crate::worker::CancelToken;

// ── Scratch ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct BlockSlot {
    block:        Option<Arc<BlockData>>,
    header_match: Vec<IntersectKind>,
}

/// worker 私有的可复用缓冲：块槽位、位图、内核结果行号
pub struct ChunkScratch {
    slots:   Vec<BlockSlot>,
    bitsets: Vec<RowBitset>,
    indices: Vec<u16>,
}

impl ChunkScratch {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            slots:   (0..chunk_size).map(|_| BlockSlot::default()).collect(),
            bitsets: (0..chunk_size).map(|_| RowBitset::new(BLOCK_ROWS)).collect(),
            indices: vec![0; BLOCK_ROWS],
        }
    }

    /// 重置前 `n` 个槽位，不够时扩容
    fn reset(&mut self, n: usize) {
        while self.slots.len() < n {
            self.slots.push(BlockSlot::default());
            self.bitsets.push(RowBitset::new(BLOCK_ROWS));
        }
        for (slot, bits) in self.slots.iter_mut().zip(self.bitsets.iter_mut()).take(n) {
            slot.block = None;
            slot.header_match.clear();
            bits.reset();
        }
    }
}

// ── 结果 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkOutcome {
    pub matched_rows: u64,
    pub stats:        QueryStats,
    /// 与 plan.selectors 一一对应
    pub aggregates:   Vec<AggregateState>,
}

// ── 执行 ──────────────────────────────────────────────────────────────────────

pub fn execute_chunk(
    slabs:   &SlabManager,
    plan:    &QueryPlan,
    index:   usize,
    scratch: &mut ChunkScratch,
    cancel:  &CancelToken,
) -> Result<ChunkOutcome> {
    let chunk = plan.chunks.get(index)
        .ok_or_else(|| EngineError::InvalidArgument(format!("chunk {index} out of range")))?;
    let n_slots = (0..chunk.segments_by_column.len())
        .map(|c| chunk.block_count(c))
        .max()
        .unwrap_or(0);
    scratch.reset(n_slots);

    let mut out = ChunkOutcome {
        aggregates: vec![AggregateState::default(); plan.selectors.len()],
        ..Default::default()
    };

    for group in &plan.groups {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let visited = preprocess(slabs, plan, chunk, group, scratch, cancel, &mut out.stats)?;
        filter(group, scratch, visited, &mut out.stats)?;
    }

    aggregate(slabs, plan, chunk, scratch, n_slots, &mut out)?;
    Ok(out)
}

/// 块头分类并加载需要逐行计算的块，返回访问过的槽位数
fn preprocess(
    slabs:   &SlabManager,
    plan:    &QueryPlan,
    chunk:   &BlockChunk,
    group:   &FilterGroup,
    scratch: &mut ChunkScratch,
    cancel:  &CancelToken,
    stats:   &mut QueryStats,
) -> Result<usize> {
    let schema = &plan.schema.name;
    let mut slot = 0usize;

    for seg in &chunk.segments_by_column[group.column_index] {
        let header = slabs.load_slab_header(schema, seg.slab_id)?;
        for b in seg.start_block as usize..seg.start_block as usize + seg.size {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let bh = header.blocks.get(b)
                .ok_or(EngineError::BlockNotFound { slab: seg.slab_id, block: b })?;
            let bits = &mut scratch.bitsets[slot];
            let info = &mut scratch.slots[slot];
            info.block = None;
            info.header_match.clear();
            slot += 1;

            bits.limit_rows(bh.items as usize);
            if bits.full_skip() {
                continue;
            }
            if bh.items == 0 || !bh.bounds.is_initialized() {
                bits.set_full_skip();
                stats.full_skips += 1;
                continue;
            }

            info.header_match.extend(group.filters.iter().map(|f| f.predicate.classify(&bh.bounds)));
            if info.header_match.contains(&IntersectKind::NoIntersection) {
                bits.set_full_skip();
                stats.full_skips += 1;
                continue;
            }
            if info.header_match.iter().all(|m| *m == IntersectKind::FullIntersection) {
                continue;
            }
            info.block = Some(slabs.load_block(schema, &header, b as BlockIdx)?);
            stats.processed_blocks += 1;
        }
    }
    Ok(slot)
}

fn filter(
    group:   &FilterGroup,
    scratch: &mut ChunkScratch,
    visited: usize,
    stats:   &mut QueryStats,
) -> Result<()> {
    let ChunkScratch { slots, bitsets, indices } = scratch;
    for (info, bits) in slots.iter().zip(bitsets.iter_mut()).take(visited) {
        if bits.full_skip() {
            continue;
        }
        for (f, m) in group.filters.iter().zip(&info.header_match) {
            if *m == IntersectKind::FullIntersection {
                bits.with(&[], false, true);
                stats.skipped_by_header += 1;
                continue;
            }
            let block = info.block.as_ref().ok_or_else(|| {
                EngineError::InvalidArgument(format!("block for filter on `{}` was not loaded", group.column))
            })?;
            let n = f.predicate.evaluate(&block.values, indices)?;
            bits.with(&indices[..n], n == 0, false);
        }
    }
    Ok(())
}

fn aggregate(
    slabs:   &SlabManager,
    plan:    &QueryPlan,
    chunk:   &BlockChunk,
    scratch: &ChunkScratch,
    n_slots: usize,
    out:     &mut ChunkOutcome,
) -> Result<()> {
    let mut value_slots: Vec<Option<Vec<(SlabId, BlockIdx)>>> = vec![None; plan.schema.num_columns()];

    for (slot, bits) in scratch.bitsets.iter().enumerate().take(n_slots) {
        if bits.full_skip() {
            continue;
        }
        if bits.merges() as usize != plan.filter_count {
            out.stats.wasted_merges += 1;
            tracing::error!(
                chunk = chunk.global_block_offset, slot,
                merges = bits.merges(), filters = plan.filter_count,
                "block slot finished with an incomplete merge count"
            );
            debug_assert!(false, "incomplete merge count in slot {slot}");
            continue;
        }
        let matched = bits.count();
        out.matched_rows += matched as u64;
        if matched == 0 {
            continue;
        }

        for (sel, state) in plan.selectors.iter().zip(out.aggregates.iter_mut()) {
            let Some(col) = sel.column else { continue };
            let map = value_slots[col].get_or_insert_with(|| slot_blocks(chunk, col));
            let &(slab_id, b) = map.get(slot).ok_or(EngineError::BlockNotFound {
                slab: SlabId::nil(),
                block: slot,
            })?;
            let header = slabs.load_slab_header(&plan.schema.name, slab_id)?;
            let block = slabs.load_block(&plan.schema.name, &header, b)?;
            for i in bits.iter_ones().take_while(|&i| i < block.items()) {
                state.fold(block.values.value_f64(i));
            }
        }
    }
    Ok(())
}

/// 一列在本 chunk 中逐槽位对应的 (slab, 块号)
fn slot_blocks(chunk: &BlockChunk, column: usize) -> Vec<(SlabId, BlockIdx)> {
    chunk.segments_by_column[column].iter()
        .flat_map(|s| (0..s.size).map(move |i| (s.slab_id, s.start_block + i as BlockIdx)))
        .collect()
}
