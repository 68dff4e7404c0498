//! 待ち時間の上限

use std::time::{Duration, Instant};

/// ブロックする呼び出しに渡す締め切り
///
/// `None`は無期限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// 無期限
    pub const NEVER: Deadline = Deadline(None);

    /// 今すぐ（待たない）
    pub fn now() -> Self {
        Deadline(Some(Instant::now()))
    }

    /// 今から`duration`後
    pub fn after(duration: Duration) -> Self {
        Deadline(Instant::now().checked_add(duration))
    }

    /// 今からマイクロ秒後
    pub fn from_micros(us: u64) -> Self {
        Self::after(Duration::from_micros(us))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// 締め切りを過ぎたか
    pub fn expired(&self) -> bool {
        match self.0 {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// 残り時間（無期限ならNone）
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// 早い方の締め切り
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (Some(a), None) => Deadline(Some(a)),
            (None, b) => Deadline(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline() {
        assert!(!Deadline::NEVER.expired());
        assert!(Deadline::NEVER.remaining().is_none());
        assert!(Deadline::now().expired());

        let later = Deadline::after(Duration::from_secs(60));
        assert!(!later.expired());
        assert_eq!(Deadline::NEVER.min(later), later);
        assert_eq!(later.min(Deadline::NEVER), later);
    }
}
