//! 随机数据 + 随机过滤条件下的规划与执行性质：
//! - 结果与朴素扫描一致，且没有 merge 次数不足的槽位
//! - chunk 覆盖每个未剪枝的块恰好一次
//! - 被剪掉的块上至少有一个条件在逐行计算时零命中

use std::collections::BTreeSet;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slab_column_engine::{
    ColumnArray, ElementType, EngineConfig, FilterCondition, Operand, Query, StorageEngine, Value,
};

#[derive(Debug, Clone)]
struct Filter {
    on_a:    bool,
    operand: Operand,
    x:       i32,
    y:       i32,
}

impl Filter {
    fn condition(&self) -> FilterCondition {
        let (field, x, y): (&str, Value, Value) = if self.on_a {
            ("a", self.x.into(), self.y.into())
        } else {
            ("b", (self.x as f64).into(), (self.y as f64).into())
        };
        match self.operand {
            Operand::Range => FilterCondition::new(field, Operand::Range, vec![x, y]),
            op             => FilterCondition::new(field, op, vec![x]),
        }
    }

    fn matches(&self, v: f64) -> bool {
        let (x, y) = (self.x as f64, self.y as f64);
        match self.operand {
            Operand::Eq    => v == x,
            Operand::Gt    => v > x,
            Operand::Lt    => v < x,
            Operand::Range => v >= x.min(y) && v <= x.max(y),
        }
    }
}

fn filter() -> impl Strategy<Value = Filter> {
    let operand = prop_oneof![
        Just(Operand::Eq),
        Just(Operand::Gt),
        Just(Operand::Lt),
        Just(Operand::Range),
    ];
    (any::<bool>(), operand, -50i32..1600, -50i32..1600)
        .prop_map(|(on_a, operand, x, y)| Filter { on_a, operand, x, y })
}

/// a：近似递增的 i32；b：0..100 的整数值 f64
fn dataset(rows: usize, seed: u64) -> (Vec<i32>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let a = (0..rows as i32).map(|i| i + rng.gen_range(-20..20)).collect();
    let b = (0..rows).map(|_| rng.gen_range(0..100) as f64).collect();
    (a, b)
}

fn engine(dir: &std::path::Path, chunk: usize) -> StorageEngine {
    // a：64 行一块、4 块一个 slab；b：2 块一个 slab
    let cfg = EngineConfig::new(dir)
        .with_rows_per_block(64)
        .with_slab_target_bytes(1024)
        .with_chunk_size_blocks(chunk)
        .with_worker_threads(2);
    let e = StorageEngine::open(cfg).unwrap();
    e.create_schema("p", &[("a", ElementType::Int32), ("b", ElementType::Float64)]).unwrap();
    e
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn plans_are_sound_and_complete(
        rows    in 1usize..1500,
        seed    in any::<u64>(),
        split   in 0.0f64..1.0,
        chunk   in 1usize..6,
        filters in prop::collection::vec(filter(), 1..4),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path(), chunk);
        let (a, b) = dataset(rows, seed);
        let cut = (rows as f64 * split) as usize;
        for (lo, hi) in [(0, cut), (cut, rows)] {
            e.ingest("p", vec![
                ("a", ColumnArray::Int32(a[lo..hi].to_vec())),
                ("b", ColumnArray::Float64(b[lo..hi].to_vec())),
            ]).unwrap();
        }

        let query = filters.iter().fold(Query::new(), |q, f| q.filter(f.condition()));
        let matches_row = |i: usize, f: &Filter| f.matches(if f.on_a { a[i] as f64 } else { b[i] });
        let expected = (0..rows).filter(|&i| filters.iter().all(|f| matches_row(i, f))).count() as u64;

        let r = e.query("p", &query).unwrap();
        prop_assert_eq!(r.matched_rows, expected);
        prop_assert_eq!(r.stats.wasted_merges, 0);

        // 覆盖：每列的 segment 并集恰好是未剪枝的存活块
        let plan = e.plan("p", &query).unwrap();
        let schema = e.schema("p").unwrap();
        let live_blocks = rows.div_ceil(64) as u64;
        let mut per_column = Vec::new();
        for (c, col) in schema.columns.iter().enumerate() {
            let mut seen = Vec::new();
            for chunk in &plan.chunks {
                prop_assert!(chunk.block_count(c) <= plan.chunk_size);
                for s in &chunk.segments_by_column[c] {
                    let h = e.slabs().load_slab_header("p", s.slab_id).unwrap();
                    prop_assert!(col.slabs.contains(&s.slab_id));
                    for k in 0..s.size as u64 {
                        seen.push(h.offset_blocks + s.start_block as u64 + k);
                    }
                }
            }
            let unique: BTreeSet<u64> = seen.iter().copied().collect();
            prop_assert_eq!(unique.len(), seen.len(), "block listed twice");
            prop_assert!(unique.iter().all(|&abs| abs < live_blocks));
            per_column.push(unique);
        }
        prop_assert_eq!(&per_column[0], &per_column[1]);
        prop_assert_eq!((live_blocks as usize - per_column[0].len()) as u64, plan.pruned_blocks);

        // 剪枝无漏报：每个被剪的块上总有一个条件逐行零命中
        for abs in (0..live_blocks).filter(|x| !per_column[0].contains(x)) {
            let rows_in_block = (abs as usize * 64)..((abs as usize + 1) * 64).min(rows);
            let some_filter_empty = filters.iter()
                .any(|f| rows_in_block.clone().all(|i| !matches_row(i, f)));
            prop_assert!(some_filter_empty, "block {} pruned but every filter has matches", abs);
        }
    }
}
