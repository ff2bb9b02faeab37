//! 查询规划
//!
//! 1. 校验过滤列存在、参数能绑定到列类型（不碰磁盘）
//! 2. 按列名分组过滤条件，组按列名排序
//! 3. 块头剪枝：对有过滤条件的列，逐个 finalized 块比较边界，
//!    任一条件为 NoIntersection 即在全局跳过表中标记该块的绝对位置
//! 4. 切分：每一列按顺序遍历自己的 slab 与块，跳过被标记的块，
//!    把连续块打成 Segment，累计满 `chunk_size_blocks` 块就封一个 chunk
//! 5. chunk 数取各列 chunk 数的最大值；第 i 个 chunk 内所有列由同一个 worker 处理
//!
//! 各列按行对齐写入，同一行区间在各列上的绝对块号相同，
//! 所以同一个跳过表对所有列给出相同的块序列，chunk 内第 j 个块槽位在各列上对应同一批行。

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bounds::IntersectKind;
use crate::common::{BlockIdx, EngineError, Result, SlabId};
use crate::field_type::ElementType;
use crate::kernels::TypedPredicate;
use crate::meta::Schema;
use crate::query::{AggregateKind, FilterCondition, Query, Selector};
use crate::slab::SlabHeader;
use crate::slab_manager::SlabManager;

// ── 计划结构 ──────────────────────────────────────────────────────────────────

/// 一个 slab 内的连续块区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub slab_id:     SlabId,
    pub start_block: BlockIdx,
    pub size:        usize,
}

/// 并行执行单元
#[derive(Debug, Clone, PartialEq)]
pub struct BlockChunk {
    /// chunk 中第一个块的列内绝对块号
    pub global_block_offset: u64,
    /// 下标为 schema 列序号
    pub segments_by_column:  Vec<Vec<Segment>>,
}

impl BlockChunk {
    pub fn block_count(&self, column: usize) -> usize {
        self.segments_by_column.get(column)
            .map(|segs| segs.iter().map(|s| s.size).sum())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub condition: FilterCondition,
    pub predicate: TypedPredicate,
}

/// 同一列上的全部过滤条件
#[derive(Debug, Clone)]
pub struct FilterGroup {
    pub column:       String,
    pub column_index: usize,
    pub element_type: ElementType,
    pub filters:      Vec<CompiledFilter>,
}

#[derive(Debug, Clone)]
pub struct CompiledSelector {
    pub kind:   AggregateKind,
    pub alias:  String,
    /// Count 为 None
    pub column: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub schema:        Arc<Schema>,
    pub groups:        Vec<FilterGroup>,
    pub chunks:        Vec<BlockChunk>,
    pub filter_count:  usize,
    pub selectors:     Vec<CompiledSelector>,
    pub chunk_size:    usize,
    /// 块头剪枝掉的块数（绝对块号去重）
    pub pruned_blocks: u64,
}

// ── 规划器 ────────────────────────────────────────────────────────────────────

pub struct QueryPlanner<'a> {
    slabs:      &'a SlabManager,
    chunk_size: usize,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(slabs: &'a SlabManager, chunk_size: usize) -> Self {
        Self { slabs, chunk_size: chunk_size.max(1) }
    }

    pub fn plan(&self, schema: &Arc<Schema>, query: &Query) -> Result<QueryPlan> {
        if query.filters.is_empty() {
            return Err(EngineError::EmptyQuery);
        }
        let groups    = compile_filters(schema, &query.filters)?;
        let selectors = compile_selectors(schema, &query.selectors)?;

        // 各列 slab 头，按块偏移排序。规划要同时看全部 slab，取副本而不是持有缓存条目，
        // 否则 slab 数超过单个 header 分片容量时缓存无法淘汰
        let mut headers: Vec<Vec<Arc<SlabHeader>>> = Vec::with_capacity(schema.num_columns());
        for col in &schema.columns {
            let mut hs = col.slabs.iter()
                .map(|id| {
                    let cached = self.slabs.load_slab_header(&schema.name, *id)?;
                    Ok(Arc::new(SlabHeader::clone(&cached)))
                })
                .collect::<Result<Vec<_>>>()?;
            hs.sort_by_key(|h| h.offset_blocks);
            headers.push(hs);
        }

        let max_blocks = headers.iter()
            .flat_map(|hs| hs.iter().map(|h| h.end_block()))
            .max()
            .unwrap_or(0) as usize;
        let mut skip = vec![false; max_blocks];
        let pruned_blocks = prune(&groups, &headers, &mut skip);

        let per_column: Vec<Vec<(u64, Vec<Segment>)>> = headers.iter()
            .map(|hs| chunk_column(hs, &skip, self.chunk_size))
            .collect();
        warn_if_misaligned(schema, &headers);

        let n_chunks = per_column.iter().map(Vec::len).max().unwrap_or(0);
        let chunks = (0..n_chunks)
            .map(|i| BlockChunk {
                global_block_offset: per_column.iter()
                    .find_map(|c| c.get(i).map(|(first, _)| *first))
                    .unwrap_or(0),
                segments_by_column: per_column.iter()
                    .map(|c| c.get(i).map(|(_, segs)| segs.clone()).unwrap_or_default())
                    .collect(),
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            schema = %schema.name,
            groups = groups.len(),
            chunks = chunks.len(),
            pruned_blocks,
            "query planned"
        );

        Ok(QueryPlan {
            schema: Arc::clone(schema),
            filter_count: groups.iter().map(|g| g.filters.len()).sum(),
            groups,
            chunks,
            selectors,
            chunk_size: self.chunk_size,
            pruned_blocks,
        })
    }
}

fn compile_filters(schema: &Schema, filters: &[FilterCondition]) -> Result<Vec<FilterGroup>> {
    let mut grouped: BTreeMap<&str, Vec<CompiledFilter>> = BTreeMap::new();
    for f in filters {
        let idx = schema.column_index(&f.field)?;
        let predicate = f.compile(schema.columns[idx].element_type)?;
        grouped.entry(f.field.as_str())
            .or_default()
            .push(CompiledFilter { condition: f.clone(), predicate });
    }
    grouped.into_iter()
        .map(|(name, filters)| {
            let column_index = schema.column_index(name)?;
            Ok(FilterGroup {
                column: name.to_string(),
                column_index,
                element_type: schema.columns[column_index].element_type,
                filters,
            })
        })
        .collect()
}

fn compile_selectors(schema: &Schema, selectors: &[Selector]) -> Result<Vec<CompiledSelector>> {
    selectors.iter()
        .map(|s| {
            let column = match (s.kind, s.arguments.as_slice()) {
                (AggregateKind::Count, [])  => None,
                (AggregateKind::Count, _)   => {
                    return Err(EngineError::InvalidArgument(format!(
                        "selector `{}`: count takes no arguments", s.alias
                    )))
                }
                (_, [column])               => Some(schema.column_index(column)?),
                (kind, args)                => {
                    return Err(EngineError::InvalidArgument(format!(
                        "selector `{}`: {kind:?} takes one column, got {}", s.alias, args.len()
                    )))
                }
            };
            Ok(CompiledSelector { kind: s.kind, alias: s.alias.clone(), column })
        })
        .collect()
}

/// 标记块头判定不可能命中的块，返回新标记的块数
fn prune(groups: &[FilterGroup], headers: &[Vec<Arc<SlabHeader>>], skip: &mut [bool]) -> u64 {
    let mut pruned = 0;
    for g in groups {
        for h in &headers[g.column_index] {
            for (i, bh) in h.blocks.iter().take(h.blocks_finalized as usize).enumerate() {
                if !bh.bounds.is_initialized() {
                    continue;
                }
                let abs = h.offset_blocks as usize + i;
                if skip[abs] {
                    continue;
                }
                let none = g.filters.iter()
                    .any(|f| f.predicate.classify(&bh.bounds) == IntersectKind::NoIntersection);
                if none {
                    skip[abs] = true;
                    pruned += 1;
                }
            }
        }
    }
    pruned
}

/// 一列的切分结果：每个 chunk 的首个绝对块号及其 segment 列表
fn chunk_column(
    headers:    &[Arc<SlabHeader>],
    skip:       &[bool],
    chunk_size: usize,
) -> Vec<(u64, Vec<Segment>)> {
    let mut chunks = Vec::new();
    let mut current: Vec<Segment> = Vec::new();
    let mut first: Option<u64> = None;
    let mut blocks = 0usize;

    for h in headers {
        let mut seg: Option<Segment> = None;
        for local in 0..h.live_blocks() {
            let abs = h.offset_blocks + local as u64;
            if skip.get(abs as usize).copied().unwrap_or(false) {
                current.extend(seg.take());
                continue;
            }
            match seg.as_mut() {
                Some(s) => s.size += 1,
                None => seg = Some(Segment { slab_id: h.id, start_block: local as BlockIdx, size: 1 }),
            }
            first.get_or_insert(abs);
            blocks += 1;
            if blocks == chunk_size {
                current.extend(seg.take());
                chunks.push((first.take().unwrap_or(abs), std::mem::take(&mut current)));
                blocks = 0;
            }
        }
        current.extend(seg.take());
    }
    if blocks > 0 {
        chunks.push((first.unwrap_or(0), current));
    }
    chunks
}

fn warn_if_misaligned(schema: &Schema, headers: &[Vec<Arc<SlabHeader>>]) {
    let live: Vec<u64> = headers.iter()
        .map(|hs| hs.iter().map(|h| h.live_blocks() as u64).sum())
        .collect();
    if live.windows(2).any(|w| w[0] != w[1]) {
        tracing::warn!(schema = %schema.name, ?live, "columns hold different block counts");
    }
}
