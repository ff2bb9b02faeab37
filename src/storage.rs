//! 顶层存储协调器

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::cache::CacheStatsSnapshot;
use crate::column_writer::ColumnWriter;
use crate::common::{EngineConfig, EngineError, Result, SlabId};
use crate::field_type::{ColumnArray, ElementType};
use crate::meta::{Schema, SchemaCatalog, SchemaColumn};
use crate::planner::{QueryPlan, QueryPlanner};
use crate::query::{AggregateValue, Query, QueryResult, QueryStats};
use crate::slab_manager::{SlabManager, SlabSnapshot};
use crate::worker::{CancelToken, WorkerPool};

/// 单进程嵌入式列存引擎
pub struct StorageEngine {
    config:  EngineConfig,
    slabs:   Arc<SlabManager>,
    catalog: SchemaCatalog,
    workers: WorkerPool,
    /// 写入独占、查询共享：查询看到的 slab 头与数据始终一致
    gate:    RwLock<()>,
}

impl StorageEngine {
    /// 打开（或初始化）存储目录并启动 worker 池
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let catalog = SchemaCatalog::new(&config.storage_path);
        let schemas = catalog.load_from_disk()?;
        let slabs   = Arc::new(SlabManager::new(&config));
        let workers = WorkerPool::start(
            config.worker_threads,
            config.queue_capacity,
            config.chunk_size_blocks,
            Arc::clone(&slabs),
        )?;
        tracing::info!(
            path = %config.storage_path.display(), schemas,
            workers = config.worker_threads, "storage engine opened"
        );
        Ok(Self { config, slabs, catalog, workers, gate: RwLock::new(()) })
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub fn slabs(&self) -> &SlabManager { &self.slabs }

    // ── DDL ───────────────────────────────────────────────────────────────────

    /// 创建 schema，并为每一列预分配第一个 slab
    pub fn create_schema(&self, name: &str, columns: &[(&str, ElementType)]) -> Result<Arc<Schema>> {
        let _w = self.gate.write();
        if self.catalog.contains(name) {
            return Err(EngineError::SchemaExists(name.into()));
        }
        let mut schema = Schema::new(
            name,
            columns.iter().map(|&(n, t)| SchemaColumn::new(n, t)).collect(),
        );
        schema.validate()?;

        for (i, col) in schema.columns.iter_mut().enumerate() {
            let header = self.slabs.create_slab_for_column(name, i as u8, col.element_type, 0)?;
            col.slabs.push(header.id);
            col.active_slab = Some(header.id);
        }
        let schema = self.catalog.put(schema)?;
        tracing::info!(schema = name, columns = schema.num_columns(), "schema created");
        Ok(schema)
    }

    pub fn schema(&self, name: &str) -> Result<Arc<Schema>> {
        self.catalog.get(name)
    }

    pub fn schema_names(&self) -> Vec<String> {
        self.catalog.names()
    }

    // ── 写入 ──────────────────────────────────────────────────────────────────

    /// 追加一批按行对齐的列数据；batch 必须覆盖 schema 的全部列且行数相同
    pub fn ingest(&self, schema_name: &str, batch: Vec<(&str, ColumnArray)>) -> Result<u64> {
        let _w = self.gate.write();
        let schema = self.catalog.get(schema_name)?;
        let mut by_name: HashMap<&str, ColumnArray> = HashMap::with_capacity(batch.len());
        for (name, values) in batch {
            if by_name.insert(name, values).is_some() {
                return Err(EngineError::Ingest(format!("column `{name}` given twice")));
            }
        }
        let rows = validate_batch(&schema, &by_name)?;
        if rows == 0 {
            return Ok(0);
        }

        // 先给每列的活动 slab 拍快照，任何一列写失败都整体回滚，保证各列块号对齐
        let snapshots = schema.columns.iter()
            .filter_map(|c| c.active_slab)
            .map(|id| self.slabs.snapshot_slab(schema_name, id))
            .collect::<Result<Vec<_>>>()?;

        let mut updated = (*schema).clone();
        let mut created = Vec::new();
        let mut changed = false;
        for (i, col) in schema.columns.iter().enumerate() {
            let values = &by_name[col.name.as_str()];
            let mut w = ColumnWriter::new(&self.slabs, schema_name, i as u8, col.clone());
            let appended = w.append(values);
            created.extend_from_slice(&w.column().slabs[col.slabs.len()..]);
            match appended.and_then(|_| w.finish()) {
                Ok((col, rolled)) => {
                    changed |= rolled;
                    updated.columns[i] = col;
                }
                Err(e) => {
                    tracing::warn!(schema = schema_name, column = %col.name, error = %e, "ingest failed, rolling back");
                    self.rollback(schema_name, &snapshots, &created);
                    return Err(e);
                }
            }
        }
        if changed {
            if let Err(e) = self.catalog.put(updated) {
                self.rollback(schema_name, &snapshots, &created);
                return Err(e);
            }
        }
        tracing::debug!(schema = schema_name, rows, "batch ingested");
        Ok(rows as u64)
    }

    /// 恢复写入前的 slab 头并删掉本次新建的 slab；回滚自身出错只能记日志
    fn rollback(&self, schema_name: &str, snapshots: &[SlabSnapshot], created: &[SlabId]) {
        for snap in snapshots {
            if let Err(e) = self.slabs.restore_slab(schema_name, snap) {
                tracing::error!(schema = schema_name, slab = %snap.id(), error = %e, "failed to restore slab");
            }
        }
        for id in created {
            if let Err(e) = self.slabs.remove_slab(schema_name, *id) {
                tracing::error!(schema = schema_name, slab = %id, error = %e, "failed to remove slab");
            }
        }
    }

    // ── 查询 ──────────────────────────────────────────────────────────────────

    pub fn plan(&self, schema_name: &str, query: &Query) -> Result<QueryPlan> {
        let schema = self.catalog.get(schema_name)?;
        QueryPlanner::new(&self.slabs, self.config.chunk_size_blocks).plan(&schema, query)
    }

    pub fn query(&self, schema_name: &str, query: &Query) -> Result<QueryResult> {
        self.query_with_cancel(schema_name, query, &CancelToken::new())
    }

    /// 规划、分发到 worker 池并等待全部 chunk 完成
    pub fn query_with_cancel(
        &self,
        schema_name: &str,
        query:       &Query,
        cancel:      &CancelToken,
    ) -> Result<QueryResult> {
        let _r = self.gate.read();
        let started = Instant::now();
        let plan = Arc::new(self.plan(schema_name, query)?);
        let mut stats = QueryStats {
            pruned_blocks: plan.pruned_blocks,
            chunks:        plan.chunks.len() as u64,
            ..Default::default()
        };

        let status = self.workers.submit(Arc::clone(&plan), cancel)?;
        let outcome = status.wait()?;
        stats.merge(&outcome.stats);
        if stats.wasted_merges > 0 {
            tracing::error!(schema = schema_name, wasted = stats.wasted_merges, "query finished with wasted merges");
        }

        let aggregates = plan.selectors.iter()
            .zip(&outcome.aggregates)
            .map(|(sel, state)| AggregateValue {
                alias: sel.alias.clone(),
                kind:  sel.kind,
                value: state.finish(sel.kind, outcome.matched_rows),
            })
            .collect();

        tracing::debug!(
            schema = schema_name, matched = outcome.matched_rows,
            chunks = stats.chunks, pruned = stats.pruned_blocks,
            elapsed_us = started.elapsed().as_micros() as u64, "query done"
        );
        Ok(QueryResult { matched_rows: outcome.matched_rows, aggregates, stats })
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.slabs.stats()
    }
}

/// 列齐全、类型一致、行数相同且没有 NaN，返回行数
fn validate_batch(schema: &Schema, batch: &HashMap<&str, ColumnArray>) -> Result<usize> {
    if let Some(extra) = batch.keys().find(|n| schema.column(n).is_none()) {
        return Err(EngineError::ColumnNotFound { schema: schema.name.clone(), column: (*extra).into() });
    }
    let mut rows = None;
    for col in &schema.columns {
        let values = batch.get(col.name.as_str())
            .ok_or_else(|| EngineError::Ingest(format!("column `{}` missing from batch", col.name)))?;
        if values.element_type() != col.element_type {
            return Err(EngineError::TypeMismatch {
                expected: col.element_type,
                actual:   values.element_type(),
            });
        }
        match rows {
            None => rows = Some(values.len()),
            Some(n) if n != values.len() => {
                return Err(EngineError::Ingest(format!(
                    "column `{}` has {} rows, expected {n}", col.name, values.len()
                )));
            }
            _ => {}
        }
        if col.element_type.is_float() && (0..values.len()).any(|i| values.value_f64(i).is_nan()) {
            return Err(EngineError::Ingest(format!("column `{}` contains NaN", col.name)));
        }
    }
    Ok(rows.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{AggregateKind, FilterCondition, Selector};

    fn engine(dir: &std::path::Path) -> StorageEngine {
        let cfg = EngineConfig::new(dir)
            .with_rows_per_block(64)
            .with_slab_target_bytes(1024)
            .with_chunk_size_blocks(3)
            .with_worker_threads(2);
        StorageEngine::open(cfg).unwrap()
    }

    #[test]
    fn create_ingest_query() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        e.create_schema("t", &[("k", ElementType::Int32), ("v", ElementType::Float64)]).unwrap();
        assert!(matches!(
            e.create_schema("t", &[("k", ElementType::Int32)]),
            Err(EngineError::SchemaExists(_))
        ));

        let n = 1000;
        e.ingest("t", vec![
            ("k", ColumnArray::Int32((0..n).collect())),
            ("v", ColumnArray::Float64((0..n).map(|i| (i % 10) as f64).collect())),
        ]).unwrap();

        let q = Query::new()
            .filter(FilterCondition::range("k", 100i32, 499i32))
            .filter(FilterCondition::lt("v", 5.0f64))
            .select(Selector::count("n"))
            .select(Selector::of(AggregateKind::Sum, "v", "s"));
        let r = e.query("t", &q).unwrap();
        assert_eq!(r.matched_rows, 200);
        assert_eq!(r.aggregate("n"), Some(200.0));
        assert_eq!(r.aggregate("s"), Some(400.0));
        assert!(r.stats.pruned_blocks > 0);
        assert_eq!(r.stats.wasted_merges, 0);
    }

    #[test]
    fn ingest_rejects_bad_batches() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        e.create_schema("t", &[("a", ElementType::Int8), ("b", ElementType::Float32)]).unwrap();

        let ragged = e.ingest("t", vec![
            ("a", ColumnArray::Int8(vec![1, 2])),
            ("b", ColumnArray::Float32(vec![1.0])),
        ]);
        assert!(matches!(ragged, Err(EngineError::Ingest(_))));

        let nan = e.ingest("t", vec![
            ("a", ColumnArray::Int8(vec![1])),
            ("b", ColumnArray::Float32(vec![f32::NAN])),
        ]);
        assert!(matches!(nan, Err(EngineError::Ingest(_))));

        let missing = e.ingest("t", vec![("a", ColumnArray::Int8(vec![1]))]);
        assert!(matches!(missing, Err(EngineError::Ingest(_))));

        let wrong = e.ingest("t", vec![
            ("a", ColumnArray::Int16(vec![1])),
            ("b", ColumnArray::Float32(vec![1.0])),
        ]);
        assert!(matches!(wrong, Err(EngineError::TypeMismatch { .. })));

        let extra = e.ingest("t", vec![
            ("a", ColumnArray::Int8(vec![1])),
            ("b", ColumnArray::Float32(vec![1.0])),
            ("c", ColumnArray::Float32(vec![1.0])),
        ]);
        assert!(matches!(extra, Err(EngineError::ColumnNotFound { .. })));

        assert!(matches!(e.ingest("nope", vec![]), Err(EngineError::SchemaNotFound(_))));
    }

    fn slab_files(e: &StorageEngine, schema: &str) -> usize {
        std::fs::read_dir(e.slabs().schema_dir(schema)).unwrap()
            .filter(|f| f.as_ref().unwrap().path().extension().is_some_and(|x| x == "slab"))
            .count()
    }

    fn pair(range: std::ops::Range<i32>) -> Vec<(&'static str, ColumnArray)> {
        vec![
            ("a", ColumnArray::Int32(range.clone().collect())),
            ("b", ColumnArray::Int32(range.collect())),
        ]
    }

    #[test]
    fn failed_ingest_rolls_back_every_column() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        e.create_schema("t", &[("a", ElementType::Int32), ("b", ElementType::Int32)]).unwrap();
        e.ingest("t", pair(0..200)).unwrap();
        let q = Query::new()
            .filter(FilterCondition::gt("a", -1i32))
            .filter(FilterCondition::lt("b", 1000i32));
        assert_eq!(e.query("t", &q).unwrap().matched_rows, 200);

        // b 的头已在缓存里，快照能拍成；a 写完（并切到新 slab）之后 b 才读不到文件
        let b_slab = e.schema("t").unwrap().columns[1].slabs[0];
        let b_path = e.slabs().slab_path("t", &b_slab);
        let moved  = b_path.with_extension("moved");
        std::fs::rename(&b_path, &moved).unwrap();
        assert!(e.ingest("t", pair(200..300)).is_err());
        std::fs::rename(&moved, &b_path).unwrap();

        let r = e.query("t", &q).unwrap();
        assert_eq!(r.matched_rows, 200);
        assert_eq!(r.stats.wasted_merges, 0);
        assert_eq!(e.schema("t").unwrap().columns[0].slabs.len(), 1);
        assert_eq!(slab_files(&e, "t"), 2);

        e.ingest("t", pair(200..300)).unwrap();
        let r = e.query("t", &q).unwrap();
        assert_eq!(r.matched_rows, 300);
        assert_eq!(r.stats.wasted_merges, 0);
    }

    /// 绕过 ingest 只给一列追加数据，执行时 merge 次数不足触发 debug 断言
    #[cfg(debug_assertions)]
    #[test]
    fn panicking_chunk_fails_query_and_keeps_pool() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::new(dir.path())
            .with_rows_per_block(64)
            .with_slab_target_bytes(1024)
            .with_chunk_size_blocks(1)
            .with_worker_threads(1);
        let e = Arc::new(StorageEngine::open(cfg).unwrap());
        e.create_schema("bad", &[("a", ElementType::Int32), ("b", ElementType::Int32)]).unwrap();
        e.create_schema("good", &[("a", ElementType::Int32)]).unwrap();
        e.ingest("bad", pair(0..100)).unwrap();
        e.ingest("good", vec![("a", ColumnArray::Int32((0..100).collect()))]).unwrap();

        let schema = e.schema("bad").unwrap();
        let mut w = ColumnWriter::new(e.slabs(), "bad", 0, schema.columns[0].clone());
        w.append(&ColumnArray::Int32((100..200).collect())).unwrap();
        w.finish().unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let engine = Arc::clone(&e);
        std::thread::spawn(move || {
            let q = Query::new()
                .filter(FilterCondition::gt("a", -1i32))
                .filter(FilterCondition::lt("b", 1000i32));
            let _ = tx.send(engine.query("bad", &q));
        });
        let r = rx.recv_timeout(std::time::Duration::from_secs(10)).expect("query never returned");
        assert!(matches!(r, Err(EngineError::WorkerPanicked(_))));

        let q = Query::new().filter(FilterCondition::lt("a", 50i32));
        assert_eq!(e.query("good", &q).unwrap().matched_rows, 50);
    }

    #[test]
    fn more_slabs_than_header_cache_entries() {
        let dir = tempfile::tempdir().unwrap();
        // 16 个分片各 1 个条目；40 个 slab 必然有分片要淘汰
        let cfg = EngineConfig::new(dir.path())
            .with_rows_per_block(64)
            .with_slab_target_bytes(1024)
            .with_header_cache_capacity(16)
            .with_worker_threads(1);
        let e = StorageEngine::open(cfg).unwrap();
        e.create_schema("t", &[("a", ElementType::Int32)]).unwrap();
        e.ingest("t", vec![("a", ColumnArray::Int32((0..40 * 256).collect()))]).unwrap();
        assert_eq!(e.schema("t").unwrap().columns[0].slabs.len(), 40);

        let q = Query::new().filter(FilterCondition::range("a", 1000i32, 8999i32));
        for _ in 0..2 {
            assert_eq!(e.query("t", &q).unwrap().matched_rows, 8000);
        }
    }

    #[test]
    fn empty_filters_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        e.create_schema("t", &[("a", ElementType::Int8)]).unwrap();
        assert!(matches!(e.query("t", &Query::new()), Err(EngineError::EmptyQuery)));
    }

    #[test]
    fn cancelled_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        e.create_schema("t", &[("a", ElementType::Int32)]).unwrap();
        e.ingest("t", vec![("a", ColumnArray::Int32((0..500).collect()))]).unwrap();

        let token = CancelToken::new();
        token.cancel();
        let q = Query::new().filter(FilterCondition::gt("a", 10i32));
        assert!(matches!(e.query_with_cancel("t", &q, &token), Err(EngineError::Cancelled)));
        assert_eq!(e.query("t", &q).unwrap().matched_rows, 489);
    }
}
