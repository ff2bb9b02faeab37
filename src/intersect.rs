//! 行号列表求交的参考实现，用于和 [`RowBitset`] 的 AND 合并互相校验

use std::collections::HashSet;

use crate::bitset::RowBitset;

/// 哈希集合求交，结果升序
pub fn hash_intersect(a: &[u16], b: &[u16]) -> Vec<u16> {
    let set: HashSet<u16> = a.iter().copied().collect();
    let mut out: Vec<u16> = b.iter().copied().filter(|v| set.contains(v)).collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// 计数合并：每个行号在多少个列表中出现，出现次数等于列表数的即为交集。
/// 各列表内部不能有重复。
pub fn counting_merge_intersect(lists: &[&[u16]], capacity: usize) -> Vec<u16> {
    if lists.is_empty() {
        return Vec::new();
    }
    let mut counts = vec![0u16; capacity];
    for list in lists {
        for &i in *list {
            counts[i as usize] += 1;
        }
    }
    let want = lists.len() as u16;
    counts.iter()
        .enumerate()
        .filter(|(_, &c)| c == want)
        .map(|(i, _)| i as u16)
        .collect()
}

/// 用 RowBitset 依次 AND 合并
pub fn bitset_intersect(lists: &[&[u16]], capacity: usize) -> Vec<u16> {
    let mut bits = RowBitset::new(capacity);
    for list in lists {
        bits.with(list, list.is_empty(), false);
    }
    bits.iter_ones().map(|i| i as u16).collect()
}
