//! アドレス範囲

/// 半開区間 `[min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct AddrRange {
    pub min: u64,
    pub max: u64,
}

impl AddrRange {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    /// 開始アドレスと長さから
    pub fn from_len(min: u64, len: u64) -> Self {
        Self::new(min, min.saturating_add(len))
    }

    pub fn len(&self) -> u64 {
        self.max.saturating_sub(self.min)
    }

    pub fn is_empty(&self) -> bool {
        self.max <= self.min
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.min <= addr && addr < self.max
    }

    /// 重なりがあるか
    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// 共通部分
    pub fn intersect(&self, other: &AddrRange) -> AddrRange {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        AddrRange::new(min, max.max(min))
    }
}

impl std::fmt::Display for AddrRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_ops() {
        let a = AddrRange::new(0x1000, 0x2000);
        let b = AddrRange::from_len(0x1800, 0x1000);
        assert_eq!(a.len(), 0x1000);
        assert!(a.contains(0x1fff));
        assert!(!a.contains(0x2000));
        assert!(a.overlaps(&b));
        assert_eq!(a.intersect(&b), AddrRange::new(0x1800, 0x2000));
        assert!(a.intersect(&AddrRange::new(0x3000, 0x4000)).is_empty());
        assert!(AddrRange::new(5, 5).is_empty());
    }
}
