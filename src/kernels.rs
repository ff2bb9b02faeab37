//! 向量化谓词内核
//!
//! 对定宽数组做批量比较，把命中的行号写进调用方提供的缓冲区并返回命中个数。
//! 主循环每批 8 个元素、无分支写入，尾部逐个处理；结果与朴素逐元素扫描完全一致。
//!
//! 同一个谓词也能作用在块的 [`Bounds`] 上，得到 No / Partial / Full 三态分类。
//! 分类对 64 位整数列使用更保守的严格比较：这类值转成 f64 可能被舍入，
//! 非严格比较会把本该逐行计算的块误判为 Full 或 No。

use crate::bounds::{Bounds, IntersectKind};
use crate::common::{EngineError, Result};
use crate::field_type::{ColumnArray, ElementType, NativeType};

// ── Predicate ────────────────────────────────────────────────────────────────

/// 单列谓词；Range 为闭区间且保证 `from <= to`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Predicate<T> {
    Eq(T),
    Gt(T),
    Lt(T),
    Range(T, T),
}

impl<T: NativeType> Predicate<T> {
    /// 构造区间谓词，`from > to` 时自动交换
    pub fn range(from: T, to: T) -> Self {
        if from > to { Self::Range(to, from) } else { Self::Range(from, to) }
    }

    #[inline]
    pub fn matches(&self, v: T) -> bool {
        match *self {
            Self::Eq(x)          => v == x,
            Self::Gt(x)          => v > x,
            Self::Lt(x)          => v < x,
            Self::Range(lo, hi)  => v >= lo && v <= hi,
        }
    }

    /// 扫描 `values`，命中行号写入 `out`，返回命中数。`out` 至少与 `values` 一样长。
    pub fn evaluate(&self, values: &[T], out: &mut [u16]) -> usize {
        match *self {
            Self::Eq(x)         => scan(values, out, |v| v == x),
            Self::Gt(x)         => scan(values, out, |v| v > x),
            Self::Lt(x)         => scan(values, out, |v| v < x),
            Self::Range(lo, hi) => scan(values, out, |v| v >= lo && v <= hi),
        }
    }

    /// 与块边界比较
    pub fn classify(&self, b: &Bounds) -> IntersectKind {
        use IntersectKind::*;
        let exact = T::TYPE.is_f64_exact();
        let (min, max) = (b.min, b.max);
        match *self {
            Self::Eq(x) => {
                let x = x.to_f64();
                if x < min || x > max {
                    NoIntersection
                } else if exact && min == max {
                    FullIntersection
                } else {
                    PartialIntersection
                }
            }
            Self::Gt(x) => {
                let x = x.to_f64();
                if (exact && x >= max) || x > max {
                    NoIntersection
                } else if x < min {
                    FullIntersection
                } else {
                    PartialIntersection
                }
            }
            Self::Lt(x) => {
                let x = x.to_f64();
                if (exact && x <= min) || x < min {
                    NoIntersection
                } else if x > max {
                    FullIntersection
                } else {
                    PartialIntersection
                }
            }
            Self::Range(lo, hi) => {
                let q = Bounds::of(lo.to_f64(), hi.to_f64());
                match b.intersects(&q) {
                    FullIntersection if !exact && !(q.min < min && max < q.max) => PartialIntersection,
                    k => k,
                }
            }
        }
    }
}

#[inline(always)]
fn scan<T: Copy, F: Fn(T) -> bool>(values: &[T], out: &mut [u16], pred: F) -> usize {
    assert!(out.len() >= values.len(), "result buffer shorter than block");
    let mut n = 0usize;
    let batches = values.chunks_exact(8);
    let tail = batches.remainder();
    let mut base = 0usize;
    for batch in batches {
        for (j, &v) in batch.iter().enumerate() {
            out[n] = (base + j) as u16;
            n += pred(v) as usize;
        }
        base += 8;
    }
    for (j, &v) in tail.iter().enumerate() {
        if pred(v) {
            out[n] = (base + j) as u16;
            n += 1;
        }
    }
    n
}

// ── TypedPredicate ───────────────────────────────────────────────────────────

/// 已绑定列类型的谓词
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TypedPredicate {
    Int8(Predicate<i8>),
    Int16(Predicate<i16>),
    Int32(Predicate<i32>),
    Int64(Predicate<i64>),
    Uint8(Predicate<u8>),
    Uint16(Predicate<u16>),
    Uint32(Predicate<u32>),
    Uint64(Predicate<u64>),
    Float32(Predicate<f32>),
    Float64(Predicate<f64>),
}

macro_rules! with_predicate {
    ($pred:expr, $p:ident => $body:expr) => {
        match $pred {
            TypedPredicate::Int8($p)    => $body,
            TypedPredicate::Int16($p)   => $body,
            TypedPredicate::Int32($p)   => $body,
            TypedPredicate::Int64($p)   => $body,
            TypedPredicate::Uint8($p)   => $body,
            TypedPredicate::Uint16($p)  => $body,
            TypedPredicate::Uint32($p)  => $body,
            TypedPredicate::Uint64($p)  => $body,
            TypedPredicate::Float32($p) => $body,
            TypedPredicate::Float64($p) => $body,
        }
    };
}

impl TypedPredicate {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Int8(_)    => ElementType::Int8,
            Self::Int16(_)   => ElementType::Int16,
            Self::Int32(_)   => ElementType::Int32,
            Self::Int64(_)   => ElementType::Int64,
            Self::Uint8(_)   => ElementType::Uint8,
            Self::Uint16(_)  => ElementType::Uint16,
            Self::Uint32(_)  => ElementType::Uint32,
            Self::Uint64(_)  => ElementType::Uint64,
            Self::Float32(_) => ElementType::Float32,
            Self::Float64(_) => ElementType::Float64,
        }
    }

    pub fn classify(&self, b: &Bounds) -> IntersectKind {
        with_predicate!(self, p => p.classify(b))
    }

    /// 在块数组上执行；谓词类型与数组类型不一致时返回 TypeMismatch
    pub fn evaluate(&self, values: &ColumnArray, out: &mut [u16]) -> Result<usize> {
        Ok(match (self, values) {
            (Self::Int8(p),    ColumnArray::Int8(v))    => p.evaluate(v, out),
            (Self::Int16(p),   ColumnArray::Int16(v))   => p.evaluate(v, out),
            (Self::Int32(p),   ColumnArray::Int32(v))   => p.evaluate(v, out),
            (Self::Int64(p),   ColumnArray::Int64(v))   => p.evaluate(v, out),
            (Self::Uint8(p),   ColumnArray::Uint8(v))   => p.evaluate(v, out),
            (Self::Uint16(p),  ColumnArray::Uint16(v))  => p.evaluate(v, out),
            (Self::Uint32(p),  ColumnArray::Uint32(v))  => p.evaluate(v, out),
            (Self::Uint64(p),  ColumnArray::Uint64(v))  => p.evaluate(v, out),
            (Self::Float32(p), ColumnArray::Float32(v)) => p.evaluate(v, out),
            (Self::Float64(p), ColumnArray::Float64(v)) => p.evaluate(v, out),
            (p, v) => {
                return Err(EngineError::TypeMismatch {
                    expected: p.element_type(),
                    actual:   v.element_type(),
                })
            }
        })
    }
}

macro_rules! typed_from {
    ($($t:ty => $variant:ident),* $(,)?) => {$(
        impl From<Predicate<$t>> for TypedPredicate {
            fn from(p: Predicate<$t>) -> Self { Self::$variant(p) }
        }
    )*};
}

typed_from!(
    i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
    u8 => Uint8, u16 => Uint16, u32 => Uint32, u64 => Uint64,
    f32 => Float32, f64 => Float64,
);
