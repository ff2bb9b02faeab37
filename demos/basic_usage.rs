//! # slab-column-engine 使用案例
//!
//! 1. 打开 StorageEngine
//! 2. 创建 schema `events (created_at u64, value f32)`
//! 3. 分批写入 100 万行
//! 4. 查询最近 30 天且 value > 0.7 的行数与 value 的均值
//! 5. 查看剪枝统计与缓存命中

use rand::{Rng, SeedableRng};
use slab_column_engine::{
    AggregateKind, ColumnArray, ElementType, EngineConfig, FilterCondition, Query, Selector,
    StorageEngine,
};

const DAY: u64 = 86_400;

fn main() -> slab_column_engine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("═══════════════════════════════════════════════════════════");
    println!("   slab-column-engine 演示                                 ");
    println!("═══════════════════════════════════════════════════════════\n");

    // =========================================================================
    // 1. 启动
    // =========================================================================
    let dir = tempfile::tempdir()?;
    println!("【1】打开 StorageEngine @ {}", dir.path().display());
    let engine = StorageEngine::open(EngineConfig::new(dir.path()))?;
    println!("    workers = {}\n", engine.config().worker_threads);

    // =========================================================================
    // 2. Schema
    // =========================================================================
    println!("【2】创建 schema `events` ...");
    engine.create_schema("events", &[
        ("created_at", ElementType::Uint64),
        ("value",      ElementType::Float32),
    ])?;
    println!("    ✓ OK\n");

    // =========================================================================
    // 3. 写入：时间戳递增，一年跨度
    // =========================================================================
    let rows: u64 = 1_000_000;
    let start: u64 = 1_700_000_000;
    let step = 365 * DAY / rows;
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    println!("【3】写入 {rows} 行 ...");
    for batch in 0..10 {
        let lo = batch * rows / 10;
        let hi = (batch + 1) * rows / 10;
        engine.ingest("events", vec![
            ("created_at", ColumnArray::Uint64((lo..hi).map(|i| start + i * step).collect())),
            ("value",      ColumnArray::Float32((lo..hi).map(|_| rng.gen::<f32>()).collect())),
        ])?;
    }
    let schema = engine.schema("events")?;
    for c in &schema.columns {
        println!("    {:<10} slabs = {}", c.name, c.slabs.len());
    }
    println!();

    // =========================================================================
    // 4. 查询
    // =========================================================================
    let end = start + (rows - 1) * step;
    let q = Query::new()
        .filter(FilterCondition::range("created_at", end - 30 * DAY, end))
        .filter(FilterCondition::gt("value", 0.7f64))
        .select(Selector::count("n"))
        .select(Selector::of(AggregateKind::Avg, "value", "avg_value"));

    println!("【4】最近 30 天且 value > 0.7 ...");
    let r = engine.query("events", &q)?;
    println!("    matched   = {}", r.matched_rows);
    println!("    avg_value = {:.4}\n", r.aggregate("avg_value").unwrap_or(f64::NAN));

    // =========================================================================
    // 5. 统计
    // =========================================================================
    println!("【5】执行统计");
    println!("    pruned blocks     = {}", r.stats.pruned_blocks);
    println!("    chunks            = {}", r.stats.chunks);
    println!("    processed blocks  = {}", r.stats.processed_blocks);
    println!("    skipped by header = {}", r.stats.skipped_by_header);
    println!("    cache             = {:?}", engine.cache_stats());
    Ok(())
}
