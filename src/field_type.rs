//! 列的物理元素类型、压缩方式与运行时值
//!
//! 一列只有一种定宽数值类型。运行时用闭合枚举 [`ColumnArray`] 表示一个块解码后的数组，
//! 所有按类型分派的地方都是穷尽 match，不存在运行期类型断言。

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::common::{EngineError, Result};

// ── ElementType ───────────────────────────────────────────────────────────────

/// 列在 slab 文件中的存储类型；判别值即磁盘上的 1 字节类型标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Int8    = 0,
    Int16   = 1,
    Int32   = 2,
    Int64   = 3,
    Float64 = 4,
    Float32 = 5,
    Uint64  = 6,
    Uint8   = 7,
    Uint32  = 8,
    Uint16  = 9,
}

impl ElementType {
    pub const ALL: [ElementType; 10] = [
        Self::Int8, Self::Int16, Self::Int32, Self::Int64,
        Self::Float64, Self::Float32,
        Self::Uint64, Self::Uint8, Self::Uint32, Self::Uint16,
    ];

    pub fn tag(self) -> u8 { self as u8 }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Self::ALL.iter()
            .copied()
            .find(|t| t.tag() == tag)
            .ok_or(EngineError::UnsupportedElementType(tag))
    }

    /// 固定字节宽度
    pub fn size(self) -> usize {
        match self {
            Self::Int8  | Self::Uint8                  => 1,
            Self::Int16 | Self::Uint16                 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// 该类型的所有值能否无损转换为 f64（64 位整数不行）
    pub fn is_f64_exact(self) -> bool {
        !matches!(self, Self::Int64 | Self::Uint64)
    }
}

// ── CompressionType ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None = 0,
    Lz4  = 1,
}

impl CompressionType {
    pub fn tag(self) -> u8 { self as u8 }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            t => Err(EngineError::UnsupportedCompression(t)),
        }
    }
}

// ── NativeType ────────────────────────────────────────────────────────────────

/// 可作为列元素的原生数值类型
pub trait NativeType: Copy + PartialOrd + Send + Sync + std::fmt::Debug + 'static {
    const TYPE: ElementType;
    fn to_f64(self) -> f64;
    /// 将查询参数转换为本类型；无法精确表示时返回 None
    fn from_value(v: &Value) -> Option<Self>;
}

macro_rules! impl_native_int {
    ($($t:ty => $variant:ident),* $(,)?) => {$(
        impl NativeType for $t {
            const TYPE: ElementType = ElementType::$variant;
            #[inline]
            fn to_f64(self) -> f64 { self as f64 }
            fn from_value(v: &Value) -> Option<Self> {
                match v.as_exact() {
                    Exact::Int(i) => <$t>::try_from(i).ok(),
                    Exact::Float(f) => {
                        if !f.is_finite() || f.fract() != 0.0 || f.abs() >= 1.0e38 {
                            return None;
                        }
                        <$t>::try_from(f as i128).ok()
                    }
                }
            }
        }
    )*};
}

macro_rules! impl_native_float {
    ($($t:ty => $variant:ident),* $(,)?) => {$(
        impl NativeType for $t {
            const TYPE: ElementType = ElementType::$variant;
            #[inline]
            fn to_f64(self) -> f64 { self as f64 }
            fn from_value(v: &Value) -> Option<Self> {
                match v.as_exact() {
                    Exact::Int(i)   => Some(i as $t),
                    Exact::Float(f) => Some(f as $t),
                }
            }
        }
    )*};
}

impl_native_int!(
    i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
    u8 => Uint8, u16 => Uint16, u32 => Uint32, u64 => Uint64,
);
impl_native_float!(f32 => Float32, f64 => Float64);

// ── ColumnArray ───────────────────────────────────────────────────────────────

/// 一个块解码后的定宽数组
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnArray {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

/// 对 ColumnArray 的每个变体展开同一段表达式
#[macro_export]
macro_rules! with_column_array {
    ($arr:expr, $v:ident => $body:expr) => {
        match $arr {
            $crate::field_type::ColumnArray::Int8($v)    => $body,
            $crate::field_type::ColumnArray::Int16($v)   => $body,
            $crate::field_type::ColumnArray::Int32($v)   => $body,
            $crate::field_type::ColumnArray::Int64($v)   => $body,
            $crate::field_type::ColumnArray::Uint8($v)   => $body,
            $crate::field_type::ColumnArray::Uint16($v)  => $body,
            $crate::field_type::ColumnArray::Uint32($v)  => $body,
            $crate::field_type::ColumnArray::Uint64($v)  => $body,
            $crate::field_type::ColumnArray::Float32($v) => $body,
            $crate::field_type::ColumnArray::Float64($v) => $body,
        }
    };
}

impl ColumnArray {
    pub fn empty(ty: ElementType) -> Self {
        match ty {
            ElementType::Int8    => Self::Int8(Vec::new()),
            ElementType::Int16   => Self::Int16(Vec::new()),
            ElementType::Int32   => Self::Int32(Vec::new()),
            ElementType::Int64   => Self::Int64(Vec::new()),
            ElementType::Uint8   => Self::Uint8(Vec::new()),
            ElementType::Uint16  => Self::Uint16(Vec::new()),
            ElementType::Uint32  => Self::Uint32(Vec::new()),
            ElementType::Uint64  => Self::Uint64(Vec::new()),
            ElementType::Float32 => Self::Float32(Vec::new()),
            ElementType::Float64 => Self::Float64(Vec::new()),
        }
    }

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

    pub fn len(&self) -> usize {
        with_column_array!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// 按小端序把 `bytes` 解码为 `items` 个元素
    pub fn decode(ty: ElementType, bytes: &[u8], items: usize) -> Result<Self> {
        let need = items * ty.size();
        if bytes.len() < need {
            return Err(EngineError::ShortRead { expected: need, actual: bytes.len() });
        }
        let b = &bytes[..need];
        Ok(match ty {
            ElementType::Int8   => Self::Int8(b.iter().map(|&x| x as i8).collect()),
            ElementType::Uint8  => Self::Uint8(b.to_vec()),
            ElementType::Int16  => { let mut v = vec![0i16; items]; LittleEndian::read_i16_into(b, &mut v); Self::Int16(v) }
            ElementType::Uint16 => { let mut v = vec![0u16; items]; LittleEndian::read_u16_into(b, &mut v); Self::Uint16(v) }
            ElementType::Int32  => { let mut v = vec![0i32; items]; LittleEndian::read_i32_into(b, &mut v); Self::Int32(v) }
            ElementType::Uint32 => { let mut v = vec![0u32; items]; LittleEndian::read_u32_into(b, &mut v); Self::Uint32(v) }
            ElementType::Int64  => { let mut v = vec![0i64; items]; LittleEndian::read_i64_into(b, &mut v); Self::Int64(v) }
            ElementType::Uint64 => { let mut v = vec![0u64; items]; LittleEndian::read_u64_into(b, &mut v); Self::Uint64(v) }
            ElementType::Float32 => { let mut v = vec![0f32; items]; LittleEndian::read_f32_into(b, &mut v); Self::Float32(v) }
            ElementType::Float64 => { let mut v = vec![0f64; items]; LittleEndian::read_f64_into(b, &mut v); Self::Float64(v) }
        })
    }

    /// 小端序编码全部元素
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len() * self.element_type().size()];
        match self {
            Self::Int8(v)    => out.iter_mut().zip(v).for_each(|(o, &x)| *o = x as u8),
            Self::Uint8(v)   => out.copy_from_slice(v),
            Self::Int16(v)   => LittleEndian::write_i16_into(v, &mut out),
            Self::Uint16(v)  => LittleEndian::write_u16_into(v, &mut out),
            Self::Int32(v)   => LittleEndian::write_i32_into(v, &mut out),
            Self::Uint32(v)  => LittleEndian::write_u32_into(v, &mut out),
            Self::Int64(v)   => LittleEndian::write_i64_into(v, &mut out),
            Self::Uint64(v)  => LittleEndian::write_u64_into(v, &mut out),
            Self::Float32(v) => LittleEndian::write_f32_into(v, &mut out),
            Self::Float64(v) => LittleEndian::write_f64_into(v, &mut out),
        }
        out
    }

    /// 复制 `[start, end)` 区间为新数组
    pub fn slice(&self, start: usize, end: usize) -> Self {
        match self {
            Self::Int8(v)    => Self::Int8(v[start..end].to_vec()),
            Self::Int16(v)   => Self::Int16(v[start..end].to_vec()),
            Self::Int32(v)   => Self::Int32(v[start..end].to_vec()),
            Self::Int64(v)   => Self::Int64(v[start..end].to_vec()),
            Self::Uint8(v)   => Self::Uint8(v[start..end].to_vec()),
            Self::Uint16(v)  => Self::Uint16(v[start..end].to_vec()),
            Self::Uint32(v)  => Self::Uint32(v[start..end].to_vec()),
            Self::Uint64(v)  => Self::Uint64(v[start..end].to_vec()),
            Self::Float32(v) => Self::Float32(v[start..end].to_vec()),
            Self::Float64(v) => Self::Float64(v[start..end].to_vec()),
        }
    }

    /// 追加 `other[start..end]`；类型不一致时报错
    pub fn extend_from(&mut self, other: &ColumnArray, start: usize, end: usize) -> Result<()> {
        match (self, other) {
            (Self::Int8(a),    Self::Int8(b))    => a.extend_from_slice(&b[start..end]),
            (Self::Int16(a),   Self::Int16(b))   => a.extend_from_slice(&b[start..end]),
            (Self::Int32(a),   Self::Int32(b))   => a.extend_from_slice(&b[start..end]),
            (Self::Int64(a),   Self::Int64(b))   => a.extend_from_slice(&b[start..end]),
            (Self::Uint8(a),   Self::Uint8(b))   => a.extend_from_slice(&b[start..end]),
            (Self::Uint16(a),  Self::Uint16(b))  => a.extend_from_slice(&b[start..end]),
            (Self::Uint32(a),  Self::Uint32(b))  => a.extend_from_slice(&b[start..end]),
            (Self::Uint64(a),  Self::Uint64(b))  => a.extend_from_slice(&b[start..end]),
            (Self::Float32(a), Self::Float32(b)) => a.extend_from_slice(&b[start..end]),
            (Self::Float64(a), Self::Float64(b)) => a.extend_from_slice(&b[start..end]),
            (a, b) => {
                return Err(EngineError::TypeMismatch {
                    expected: a.element_type(),
                    actual:   b.element_type(),
                })
            }
        }
        Ok(())
    }

    /// 第 i 个元素转换为 f64（聚合使用）
    #[inline]
    pub fn value_f64(&self, i: usize) -> f64 {
        with_column_array!(self, v => v[i].to_f64())
    }
}

// ── Value ─────────────────────────────────────────────────────────────────────

/// 查询参数值
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
}

#[derive(Debug, Clone, Copy)]
pub enum Exact {
    Int(i128),
    Float(f64),
}

impl Value {
    pub fn as_exact(&self) -> Exact {
        match *self {
            Self::Int8(v)    => Exact::Int(v as i128),
            Self::Int16(v)   => Exact::Int(v as i128),
            Self::Int32(v)   => Exact::Int(v as i128),
            Self::Int64(v)   => Exact::Int(v as i128),
            Self::Uint8(v)   => Exact::Int(v as i128),
            Self::Uint16(v)  => Exact::Int(v as i128),
            Self::Uint32(v)  => Exact::Int(v as i128),
            Self::Uint64(v)  => Exact::Int(v as i128),
            Self::Float32(v) => Exact::Float(v as f64),
            Self::Float64(v) => Exact::Float(v),
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Self { Self::$variant(v) }
        }
    )*};
}

value_from!(
    i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
    u8 => Uint8, u16 => Uint16, u32 => Uint32, u64 => Uint64,
    f32 => Float32, f64 => Float64,
);

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int8(v)    => write!(f, "{v}"),
            Self::Int16(v)   => write!(f, "{v}"),
            Self::Int32(v)   => write!(f, "{v}"),
            Self::Int64(v)   => write!(f, "{v}"),
            Self::Uint8(v)   => write!(f, "{v}"),
            Self::Uint16(v)  => write!(f, "{v}"),
            Self::Uint32(v)  => write!(f, "{v}"),
            Self::Uint64(v)  => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_disk_format() {
        assert_eq!(ElementType::Int8.tag(), 0);
        assert_eq!(ElementType::Float64.tag(), 4);
        assert_eq!(ElementType::Uint16.tag(), 9);
        for t in ElementType::ALL {
            assert_eq!(ElementType::from_tag(t.tag()).unwrap(), t);
        }
        assert!(matches!(ElementType::from_tag(42), Err(EngineError::UnsupportedElementType(42))));
        assert!(CompressionType::from_tag(7).is_err());
    }

    #[test]
    fn decode_reads_little_endian() {
        let arr = ColumnArray::Uint16(vec![1, 0x0203, 65535]);
        let bytes = arr.encode();
        assert_eq!(&bytes[..4], &[1, 0, 3, 2]);
        assert_eq!(ColumnArray::decode(ElementType::Uint16, &bytes, 3).unwrap(), arr);
        assert!(matches!(
            ColumnArray::decode(ElementType::Uint16, &bytes, 4),
            Err(EngineError::ShortRead { expected: 8, actual: 6 })
        ));
    }

    #[test]
    fn value_conversion_is_exact_for_integers() {
        assert_eq!(u8::from_value(&Value::Int64(200)), Some(200));
        assert_eq!(u8::from_value(&Value::Int64(300)), None);
        assert_eq!(u64::from_value(&Value::Int32(-1)), None);
        assert_eq!(i32::from_value(&Value::Float64(4.0)), Some(4));
        assert_eq!(i32::from_value(&Value::Float64(4.5)), None);
        assert_eq!(f32::from_value(&Value::Float64(0.7)), Some(0.7f32));
        assert_eq!(f64::from_value(&Value::Uint64(7)), Some(7.0));
    }

    #[test]
    fn extend_rejects_other_types() {
        let mut a = ColumnArray::Int32(vec![1]);
        a.extend_from(&ColumnArray::Int32(vec![2, 3, 4]), 1, 3).unwrap();
        assert_eq!(a, ColumnArray::Int32(vec![1, 3, 4]));
        assert!(a.extend_from(&ColumnArray::Float32(vec![1.0]), 0, 1).is_err());
    }
}
