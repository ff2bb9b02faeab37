//! 查询输入与输出
//!
//! 输入：若干个列过滤条件（按 AND 组合）加上聚合选择器。
//! ```text
//! filters:   [{field, operand ∈ {EQ, GT, LT, RANGE}, arguments}]
//! selectors: [{kind, arguments, alias}]
//! ```

use crate::common::{EngineError, Result};
use crate::field_type::{ElementType, NativeType, Value};
use crate::kernels::{Predicate, TypedPredicate};

// ── 过滤条件 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Eq,
    Gt,
    Lt,
    /// 闭区间，两个参数，顺序任意
    Range,
}

impl Operand {
    pub fn arity(self) -> usize {
        match self {
            Self::Range => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCondition {
    pub field:     String,
    pub operand:   Operand,
    pub arguments: Vec<Value>,
}

impl FilterCondition {
    pub fn new(field: &str, operand: Operand, arguments: Vec<Value>) -> Self {
        Self { field: field.into(), operand, arguments }
    }
    pub fn eq(field: &str, v: impl Into<Value>) -> Self {
        Self::new(field, Operand::Eq, vec![v.into()])
    }
    pub fn gt(field: &str, v: impl Into<Value>) -> Self {
        Self::new(field, Operand::Gt, vec![v.into()])
    }
    pub fn lt(field: &str, v: impl Into<Value>) -> Self {
        Self::new(field, Operand::Lt, vec![v.into()])
    }
    pub fn range(field: &str, from: impl Into<Value>, to: impl Into<Value>) -> Self {
        Self::new(field, Operand::Range, vec![from.into(), to.into()])
    }

    /// 绑定列类型：检查参数个数，并把每个参数精确转换为列的原生类型
    pub fn compile(&self, ty: ElementType) -> Result<TypedPredicate> {
        match ty {
            ElementType::Int8    => self.build::<i8>().map(Into::into),
            ElementType::Int16   => self.build::<i16>().map(Into::into),
            ElementType::Int32   => self.build::<i32>().map(Into::into),
            ElementType::Int64   => self.build::<i64>().map(Into::into),
            ElementType::Uint8   => self.build::<u8>().map(Into::into),
            ElementType::Uint16  => self.build::<u16>().map(Into::into),
            ElementType::Uint32  => self.build::<u32>().map(Into::into),
            ElementType::Uint64  => self.build::<u64>().map(Into::into),
            ElementType::Float32 => self.build::<f32>().map(Into::into),
            ElementType::Float64 => self.build::<f64>().map(Into::into),
        }
    }

    fn build<T: NativeType>(&self) -> Result<Predicate<T>> {
        if self.arguments.len() != self.operand.arity() {
            return Err(EngineError::InvalidArgument(format!(
                "{:?} on `{}` takes {} argument(s), got {}",
                self.operand, self.field, self.operand.arity(), self.arguments.len()
            )));
        }
        let arg = |i: usize| -> Result<T> {
            let v = &self.arguments[i];
            match T::from_value(v) {
                Some(x) if !x.to_f64().is_nan() => Ok(x),
                _ => Err(EngineError::InvalidArgument(format!(
                    "argument {v} of filter on `{}` is not representable as {:?}",
                    self.field, T::TYPE
                ))),
            }
        };
        Ok(match self.operand {
            Operand::Eq    => Predicate::Eq(arg(0)?),
            Operand::Gt    => Predicate::Gt(arg(0)?),
            Operand::Lt    => Predicate::Lt(arg(0)?),
            Operand::Range => Predicate::range(arg(0)?, arg(1)?),
        })
    }
}

// ── 选择器 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub kind:      AggregateKind,
    /// Count 不带参数，其余为一个列名
    pub arguments: Vec<String>,
    pub alias:     String,
}

impl Selector {
    pub fn count(alias: &str) -> Self {
        Self { kind: AggregateKind::Count, arguments: vec![], alias: alias.into() }
    }
    pub fn of(kind: AggregateKind, column: &str, alias: &str) -> Self {
        Self { kind, arguments: vec![column.into()], alias: alias.into() }
    }
}

// ── Query ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters:   Vec<FilterCondition>,
    pub selectors: Vec<Selector>,
}

impl Query {
    pub fn new() -> Self { Self::default() }

    pub fn filter(mut self, f: FilterCondition) -> Self {
        self.filters.push(f); self
    }
    pub fn select(mut self, s: Selector) -> Self {
        self.selectors.push(s); self
    }
}

// ── 聚合状态 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateState {
    pub count: u64,
    pub sum:   f64,
    pub min:   f64,
    pub max:   f64,
}

impl Default for AggregateState {
    fn default() -> Self {
        Self { count: 0, sum: 0.0, min: f64::INFINITY, max: f64::NEG_INFINITY }
    }
}

impl AggregateState {
    #[inline]
    pub fn fold(&mut self, v: f64) {
        self.count += 1;
        self.sum += v;
        if v < self.min { self.min = v; }
        if v > self.max { self.max = v; }
    }

    pub fn merge(&mut self, o: &AggregateState) {
        self.count += o.count;
        self.sum += o.sum;
        self.min = self.min.min(o.min);
        self.max = self.max.max(o.max);
    }

    /// 空集上的 Min/Max/Avg 为 None
    pub fn finish(&self, kind: AggregateKind, matched_rows: u64) -> Option<f64> {
        match kind {
            AggregateKind::Count => Some(matched_rows as f64),
            AggregateKind::Sum   => Some(self.sum),
            _ if self.count == 0 => None,
            AggregateKind::Min   => Some(self.min),
            AggregateKind::Max   => Some(self.max),
            AggregateKind::Avg   => Some(self.sum / self.count as f64),
        }
    }
}

// ── 查询结果 ──────────────────────────────────────────────────────────────────

/// 执行期计数器
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// 规划阶段按块头剪掉的块
    pub pruned_blocks:     u64,
    pub chunks:            u64,
    /// 真正加载并计算过的块（按列计）
    pub processed_blocks:  u64,
    /// 执行期整块跳过的槽位
    pub full_skips:        u64,
    /// 块头判定 Full 而省掉的内核调用
    pub skipped_by_header: u64,
    /// merge 次数不足的槽位，非零即说明有 bug
    pub wasted_merges:     u64,
}

impl QueryStats {
    pub fn merge(&mut self, o: &QueryStats) {
        self.processed_blocks  += o.processed_blocks;
        self.full_skips        += o.full_skips;
        self.skipped_by_header += o.skipped_by_header;
        self.wasted_merges     += o.wasted_merges;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateValue {
    pub alias: String,
    pub kind:  AggregateKind,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub matched_rows: u64,
    pub aggregates:   Vec<AggregateValue>,
    pub stats:        QueryStats,
}

impl QueryResult {
    pub fn aggregate(&self, alias: &str) -> Option<f64> {
        self.aggregates.iter().find(|a| a.alias == alias).and_then(|a| a.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_binds_argument_types() {
        let p = FilterCondition::range("v", 10i64, 2i64).compile(ElementType::Uint16).unwrap();
        assert_eq!(p, TypedPredicate::Uint16(Predicate::Range(2, 10)));

        let p = FilterCondition::gt("v", 0.7f64).compile(ElementType::Float32).unwrap();
        assert_eq!(p, TypedPredicate::Float32(Predicate::Gt(0.7f32)));
    }

    #[test]
    fn compile_rejects_bad_arguments() {
        let bad = [
            FilterCondition::new("v", Operand::Range, vec![Value::Int32(1)]),
            FilterCondition::new("v", Operand::Eq, vec![]),
            FilterCondition::gt("v", 0.5f64),
            FilterCondition::lt("v", -1i32),
        ];
        for f in bad {
            assert!(matches!(f.compile(ElementType::Uint32), Err(EngineError::InvalidArgument(_))), "{f:?}");
        }
        assert!(FilterCondition::eq("v", f64::NAN).compile(ElementType::Float64).is_err());
    }

    #[test]
    fn aggregate_finish() {
        let mut a = AggregateState::default();
        assert_eq!(a.finish(AggregateKind::Avg, 0), None);
        assert_eq!(a.finish(AggregateKind::Sum, 0), Some(0.0));
        a.fold(2.0);
        let mut b = AggregateState::default();
        b.fold(6.0);
        b.fold(-1.0);
        a.merge(&b);
        assert_eq!(a.finish(AggregateKind::Avg, 3), Some(7.0 / 3.0));
        assert_eq!(a.finish(AggregateKind::Min, 3), Some(-1.0));
        assert_eq!(a.finish(AggregateKind::Max, 3), Some(6.0));
        assert_eq!(a.finish(AggregateKind::Count, 3), Some(3.0));
    }
}
