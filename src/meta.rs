//! Schema 元数据与持久化
//!
//! 每个 schema 一个目录，目录下 `schema.json` 记录列名、类型、slab 列表与活动 slab：
//! ```text
//! <root>/<schema>/schema.json
//! <root>/<schema>/<slab-uuid>.slab
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::common::{EngineError, Result, SlabId};
use crate::field_type::ElementType;

pub const SCHEMA_FILE: &str = "schema.json";

// ── 列定义 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name:         String,
    pub element_type: ElementType,
    /// 按列内块偏移升序排列
    #[serde(default)]
    pub slabs:        Vec<SlabId>,
    #[serde(default)]
    pub active_slab:  Option<SlabId>,
}

impl SchemaColumn {
    pub fn new(name: &str, element_type: ElementType) -> Self {
        Self { name: name.into(), element_type, slabs: Vec::new(), active_slab: None }
    }
}

// ── Schema ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name:    String,
    pub columns: Vec<SchemaColumn>,
}

impl Schema {
    pub fn new(name: &str, columns: Vec<SchemaColumn>) -> Self {
        Self { name: name.into(), columns }
    }

    pub fn column(&self, name: &str) -> Option<(usize, &SchemaColumn)> {
        self.columns.iter().enumerate().find(|(_, c)| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.column(name)
            .map(|(i, _)| i)
            .ok_or_else(|| EngineError::ColumnNotFound {
                schema: self.name.clone(),
                column: name.into(),
            })
    }

    pub fn num_columns(&self) -> usize { self.columns.len() }

    /// 名称与列定义是否合法
    pub fn validate(&self) -> Result<()> {
        let bad_name = |n: &str| n.is_empty() || n.contains(['/', '\\']) || n == "." || n == "..";
        if bad_name(&self.name) {
            return Err(EngineError::InvalidArgument(format!("bad schema name `{}`", self.name)));
        }
        if self.columns.is_empty() || self.columns.len() > u8::MAX as usize {
            return Err(EngineError::InvalidArgument(format!(
                "schema `{}` must have between 1 and 255 columns", self.name
            )));
        }
        for (i, c) in self.columns.iter().enumerate() {
            if c.name.is_empty() {
                return Err(EngineError::InvalidArgument(format!("column {i} has an empty name")));
            }
            if self.columns[..i].iter().any(|o| o.name == c.name) {
                return Err(EngineError::InvalidArgument(format!("duplicate column `{}`", c.name)));
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// 先写临时文件再改名，避免半截 JSON
    pub fn store(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = dir.join(format!("{SCHEMA_FILE}.tmp"));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, dir.join(SCHEMA_FILE))?;
        Ok(())
    }
}

// ── SchemaCatalog ─────────────────────────────────────────────────────────────

/// 进程内的 schema 注册表；读者拿到的是不可变快照
pub struct SchemaCatalog {
    root:    PathBuf,
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaCatalog {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf(), schemas: RwLock::new(HashMap::new()) }
    }

    pub fn schema_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// 扫描根目录下所有含 schema.json 的子目录
    pub fn load_from_disk(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.root)?;
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path().join(SCHEMA_FILE);
            if !path.is_file() {
                continue;
            }
            let schema = Schema::load(&path)?;
            tracing::info!(schema = %schema.name, columns = schema.columns.len(), "schema loaded");
            self.schemas.write().insert(schema.name.clone(), Arc::new(schema));
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Schema>> {
        self.schemas.read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::SchemaNotFound(name.into()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.schemas.read().keys().cloned().collect();
        v.sort();
        v
    }

    /// 持久化并替换内存中的快照
    pub fn put(&self, schema: Schema) -> Result<Arc<Schema>> {
        schema.store(&self.schema_dir(&schema.name))?;
        let schema = Arc::new(schema);
        self.schemas.write().insert(schema.name.clone(), Arc::clone(&schema));
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        let mut c = SchemaColumn::new("created_at", ElementType::Uint64);
        let id = uuid::Uuid::new_v4();
        c.slabs.push(id);
        c.active_slab = Some(id);
        Schema::new("events", vec![c, SchemaColumn::new("value", ElementType::Float32)])
    }

    #[test]
    fn json_uses_lowercase_type_names() {
        let schema = sample();
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("\"uint64\""));
        assert!(json.contains("\"float32\""));
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schema);
    }

    #[test]
    fn catalog_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cat = SchemaCatalog::new(dir.path());
        let stored = cat.put(sample()).unwrap();

        let fresh = SchemaCatalog::new(dir.path());
        assert_eq!(fresh.load_from_disk().unwrap(), 1);
        assert_eq!(*fresh.get("events").unwrap(), *stored);
        assert!(matches!(fresh.get("nope"), Err(EngineError::SchemaNotFound(_))));
    }

    #[test]
    fn validation() {
        assert!(sample().validate().is_ok());
        let dup = Schema::new("x", vec![
            SchemaColumn::new("a", ElementType::Int8),
            SchemaColumn::new("a", ElementType::Int16),
        ]);
        assert!(dup.validate().is_err());
        assert!(Schema::new("../x", vec![SchemaColumn::new("a", ElementType::Int8)]).validate().is_err());
        assert!(Schema::new("x", vec![]).validate().is_err());
        assert!(matches!(sample().column_index("zzz"), Err(EngineError::ColumnNotFound { .. })));
    }
}
