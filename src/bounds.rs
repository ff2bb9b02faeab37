//! 块/slab 级 min/max 边界（zone map）
//!
//! 查询时先拿谓词与块边界比较，得到三种结果之一：
//! - `NoIntersection`：块内不可能有命中，连数据都不用读
//! - `FullIntersection`：块内每一行都命中，不需要逐行计算
//! - `PartialIntersection`：需要逐行计算

/// 三态相交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntersectKind {
    NoIntersection,
    PartialIntersection,
    FullIntersection,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min:         f64,
    pub max:         f64,
    pub initialized: bool,
}

impl Default for Bounds {
    fn default() -> Self { Self::new() }
}

impl Bounds {
    /// 未初始化的空边界（min = +MAX, max = -MAX）
    pub fn new() -> Self {
        Self { min: f64::MAX, max: -f64::MAX, initialized: false }
    }

    pub fn of(min: f64, max: f64) -> Self {
        Self { min, max, initialized: true }
    }

    /// 由磁盘上的 (min, max) 还原；空边界哨兵值还原为未初始化
    pub fn from_disk(min: f64, max: f64) -> Self {
        if min <= max { Self::of(min, max) } else { Self::new() }
    }

    /// 计算一组值的边界，NaN 不参与
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut b = Self::new();
        for v in values {
            b.include(v);
        }
        b
    }

    pub fn is_initialized(&self) -> bool { self.initialized }

    /// 把单个值并入边界
    #[inline]
    pub fn include(&mut self, v: f64) {
        if v.is_nan() {
            return;
        }
        if v < self.min { self.min = v; }
        if v > self.max { self.max = v; }
        self.initialized = true;
    }

    /// 原地放宽到覆盖 `other`，返回边界是否发生变化
    pub fn morph(&mut self, other: &Bounds) -> bool {
        if !other.initialized {
            return false;
        }
        if !self.initialized {
            *self = *other;
            return true;
        }
        let mut changed = false;
        if other.min < self.min { self.min = other.min; changed = true; }
        if other.max > self.max { self.max = other.max; changed = true; }
        changed
    }

    pub fn contains(&self, v: f64) -> bool {
        self.initialized && v >= self.min && v <= self.max
    }

    /// 与闭区间查询边界 `q` 比较。
    ///
    /// 两侧都必须已初始化；未初始化的边界不是数据状态而是调用方逻辑错误。
    pub fn intersects(&self, q: &Bounds) -> IntersectKind {
        assert!(
            self.initialized && q.initialized,
            "bounds compared before initialization"
        );
        if !(self.min <= q.max && self.max >= q.min) {
            IntersectKind::NoIntersection
        } else if self.min >= q.min && self.max <= q.max {
            IntersectKind::FullIntersection
        } else {
            IntersectKind::PartialIntersection
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn morph_adopts_then_widens() {
        let mut b = Bounds::new();
        assert!(!b.morph(&Bounds::new()));
        assert!(b.morph(&Bounds::of(2.0, 3.0)));
        assert_eq!(b, Bounds::of(2.0, 3.0));
        assert!(!b.morph(&Bounds::of(2.5, 2.6)));
        assert!(b.morph(&Bounds::of(-1.0, 2.6)));
        assert_eq!((b.min, b.max), (-1.0, 3.0));
    }

    #[test]
    fn three_way_intersection() {
        let b = Bounds::of(10.0, 20.0);
        assert_eq!(b.intersects(&Bounds::of(21.0, 30.0)), IntersectKind::NoIntersection);
        assert_eq!(b.intersects(&Bounds::of(0.0, 9.99)), IntersectKind::NoIntersection);
        assert_eq!(b.intersects(&Bounds::of(10.0, 20.0)), IntersectKind::FullIntersection);
        assert_eq!(b.intersects(&Bounds::of(15.0, 30.0)), IntersectKind::PartialIntersection);
        assert_eq!(b.intersects(&Bounds::of(20.0, 20.0)), IntersectKind::PartialIntersection);
    }

    #[test]
    fn values_skip_nan() {
        let b = Bounds::from_values([3.0, f64::NAN, -2.0, 7.5]);
        assert_eq!((b.min, b.max), (-2.0, 7.5));
        assert!(!Bounds::from_values([f64::NAN]).is_initialized());
        assert!(b.contains(7.5) && !b.contains(7.6));
    }

    #[test]
    fn disk_sentinel_decodes_uninitialized() {
        let empty = Bounds::new();
        assert!(!Bounds::from_disk(empty.min, empty.max).is_initialized());
        assert!(Bounds::from_disk(1.0, 1.0).is_initialized());
    }

    #[test]
    #[should_panic]
    fn comparing_uninitialized_bounds_panics() {
        Bounds::new().intersects(&Bounds::of(0.0, 1.0));
    }
}
