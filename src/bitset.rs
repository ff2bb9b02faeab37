//! 块级行位图（RowBitset）
//!
//! 每个块处理槽位一个，按位 AND 累积各个过滤条件的命中行。生命周期：
//! `reset` → 若干次 `with`（每个过滤条件一次）→ 读取 `count` → 下一个块再 `reset`。
//! 位图属于 worker 线程私有的 scratch，不跨线程共享。
//!
//! `merges() == 过滤条件数` 时 `count()` 才是有效的命中行数；小于这个数说明调度有 bug。

#[derive(Debug, Clone)]
pub struct RowBitset {
    words:       Vec<u64>,
    capacity:    usize,
    /// 块内实际存在的行数，超出部分永远不计入结果
    valid_rows:  usize,
    merges:      u32,
    initialized: bool,
    full_skip:   bool,
}

impl RowBitset {
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(64);
        Self {
            words: vec![0; words],
            capacity: words * 64,
            valid_rows: words * 64,
            merges: 0,
            initialized: false,
            full_skip: false,
        }
    }

    /// 清空以复用，不重新分配
    pub fn reset(&mut self) {
        self.words.fill(0);
        self.valid_rows  = self.capacity;
        self.merges      = 0;
        self.initialized = false;
        self.full_skip   = false;
    }

    /// 把有效行数收窄到 `rows`
    pub fn limit_rows(&mut self, rows: usize) {
        self.valid_rows = self.valid_rows.min(rows);
    }

    pub fn capacity(&self) -> usize { self.capacity }
    pub fn valid_rows(&self) -> usize { self.valid_rows }
    pub fn merges(&self) -> u32 { self.merges }
    pub fn is_initialized(&self) -> bool { self.initialized }

    pub fn set_full_skip(&mut self) { self.full_skip = true; }
    pub fn full_skip(&self) -> bool { self.full_skip }

    /// 并入一个过滤条件的命中集合。
    ///
    /// - `is_full`：该条件命中全部行，不收窄结果
    /// - `is_empty`：该条件无命中，结果直接归零
    /// - 否则 `indices` 为升序行号列表
    pub fn with(&mut self, indices: &[u16], is_empty: bool, is_full: bool) {
        self.merges += 1;

        if is_empty {
            self.words.fill(0);
            self.initialized = true;
            return;
        }
        if is_full {
            if !self.initialized {
                self.fill_valid();
                self.initialized = true;
            }
            return;
        }
        if !self.initialized {
            self.words.fill(0);
            for &i in indices {
                self.words[(i as usize) >> 6] |= 1u64 << (i & 63);
            }
            self.initialized = true;
            return;
        }
        self.and_sorted(indices);
    }

    fn fill_valid(&mut self) {
        let full = self.valid_rows / 64;
        self.words[..full].fill(u64::MAX);
        self.words[full..].fill(0);
        let rem = self.valid_rows % 64;
        if rem > 0 {
            self.words[full] = (1u64 << rem) - 1;
        }
    }

    /// 与升序行号集合原地求交，不物化临时位图
    fn and_sorted(&mut self, indices: &[u16]) {
        debug_assert!(indices.windows(2).all(|w| w[0] < w[1]), "indices must be strictly ascending");
        let mut next = 0usize;
        let mut i = 0usize;
        while i < indices.len() {
            let w = (indices[i] as usize) >> 6;
            let mut mask = 0u64;
            while i < indices.len() && (indices[i] as usize) >> 6 == w {
                mask |= 1u64 << (indices[i] & 63);
                i += 1;
            }
            self.words[next..w].fill(0);
            self.words[w] &= mask;
            next = w + 1;
        }
        self.words[next..].fill(0);
    }

    /// 有效行范围内置位的个数
    pub fn count(&self) -> usize {
        if !self.initialized {
            return 0;
        }
        let full = self.valid_rows / 64;
        let mut n: usize = self.words[..full].iter().map(|w| w.count_ones() as usize).sum();
        let rem = self.valid_rows % 64;
        if rem > 0 {
            n += (self.words[full] & ((1u64 << rem) - 1)).count_ones() as usize;
        }
        n
    }

    /// 按升序遍历置位的行号
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        let limit = if self.initialized { self.valid_rows } else { 0 };
        self.words.iter().enumerate().flat_map(move |(wi, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(wi * 64 + bit)
            })
        })
        .take_while(move |&i| i < limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_merges_intersect() {
        let mut b = RowBitset::new(256);
        b.with(&[1, 5, 64, 65, 200], false, false);
        b.with(&[5, 65, 130, 200, 255], false, false);
        assert_eq!(b.merges(), 2);
        assert_eq!(b.iter_ones().collect::<Vec<_>>(), vec![5, 65, 200]);
        assert_eq!(b.count(), 3);
    }

    #[test]
    fn full_contributes_no_restriction() {
        let mut b = RowBitset::new(128);
        b.with(&[], false, true);
        assert_eq!(b.count(), 128);
        b.with(&[3, 90], false, false);
        b.with(&[], false, true);
        assert_eq!(b.count(), 2);
        assert_eq!(b.merges(), 3);
    }

    #[test]
    fn empty_short_circuits() {
        let mut b = RowBitset::new(128);
        b.with(&[1, 2, 3], false, false);
        b.with(&[], true, false);
        b.with(&[], false, true);
        assert_eq!(b.count(), 0);
        assert_eq!(b.merges(), 3);
    }

    #[test]
    fn full_respects_valid_rows() {
        let mut b = RowBitset::new(1024);
        b.limit_rows(70);
        b.with(&[], false, true);
        assert_eq!(b.count(), 70);
        assert_eq!(b.iter_ones().last(), Some(69));
    }

    #[test]
    fn reset_clears_everything() {
        let mut b = RowBitset::new(64);
        b.limit_rows(10);
        b.with(&[1], false, false);
        b.set_full_skip();
        b.reset();
        assert!(!b.full_skip());
        assert!(!b.is_initialized());
        assert_eq!(b.merges(), 0);
        assert_eq!(b.count(), 0);
        assert_eq!(b.valid_rows(), 64);
    }
}
