//! # slab-column-engine
//!
//! 嵌入式列存引擎：定宽数值列按块（32K 行）写入 slab 文件，
//! 查询时先用块头 min/max 剪枝，再把剩余块切成 chunk 交给 worker 池并行做谓词扫描。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        StorageEngine                          │
//! │   SchemaCatalog (schema.json)        RwLock gate (写独占)     │
//! │          │                                                    │
//! │   QueryPlanner ── 块头剪枝 + 切分 ──► QueryPlan { chunks }    │
//! │          │                                                    │
//! │   WorkerPool ── bounded channel ──► execute_chunk × N         │
//! │          │          预处理(块头分类) → 内核 → RowBitset AND    │
//! │          │                                                    │
//! │   SlabManager                                                 │
//! │   ┌────────────────────────────────────────────────────┐     │
//! │   │  HeaderCache (16 分片)  DataCache (FIFO)  BlockCache │     │
//! │   │  SingleFlight 冷加载    ObjectPool 缓冲区            │     │
//! │   │  ColumnWriter ── 块追加 / 边界维护 / CRC / LZ4        │     │
//! │   └────────────────────────────────────────────────────┘     │
//! │   <root>/<schema>/<slab-uuid>.slab                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ── 存储层 ────────────────────────────────────────────────────────────────────
pub mod common;
pub mod field_type;
pub mod bounds;
pub mod compression;
pub mod slab;
pub mod file;
pub mod pool;
pub mod single_flight;
pub mod cache;
pub mod slab_manager;
pub mod meta;
pub mod column_writer;

// ── 查询层 ────────────────────────────────────────────────────────────────────
pub mod bitset;
pub mod intersect;
pub mod kernels;
pub mod query;
pub mod planner;
pub mod executor;
pub mod worker;
pub mod storage;

pub use common::{EngineConfig, EngineError, Result};
pub use field_type::{ColumnArray, CompressionType, ElementType, Value};
pub use query::{AggregateKind, FilterCondition, Operand, Query, QueryResult, QueryStats, Selector};
pub use storage::StorageEngine;
pub use worker::CancelToken;
