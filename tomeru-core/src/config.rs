//! 制御スレッドの設定

use std::path::PathBuf;
use std::time::Duration;

/// 予約されたスプーフ用の戻り先アドレス
pub const DEFAULT_SPOOF_IP: u64 = 911;

/// メモリキャッシュの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCacheConfig {
    /// 読み込みワーカー数
    pub workers: usize,
    /// 同じ範囲の再要求の最小間隔
    pub rate_limit: Duration,
    /// 書き込み後に再読み込みを待つ時間
    pub write_refresh: Duration,
    /// 書き込み後に再読み込みする範囲の上限
    pub seamless_write_limit: u64,
    /// 1エントリの最大範囲
    pub max_range: u64,
    /// ストライプ数
    pub stripes: usize,
}

impl MemoryCacheConfig {
    /// コア数からワーカー数を決める（1..=4）
    pub fn default_workers() -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.saturating_sub(1).clamp(1, 4)
    }
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            rate_limit: Duration::from_millis(100),
            write_refresh: Duration::from_millis(5),
            seamless_write_limit: 64 * 1024,
            max_range: 1024 * 1024 * 1024,
            stripes: 64,
        }
    }
}

/// 制御スレッドの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlConfig {
    /// コンシューマ→制御スレッドのリング容量
    pub msg_ring_capacity: usize,
    /// 制御スレッド→コンシューマのリング容量
    pub event_ring_capacity: usize,
    pub memory: MemoryCacheConfig,
    /// セッションログの置き場所
    pub log_dir: PathBuf,
    pub spoof_ip: u64,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            msg_ring_capacity: 1 << 20,
            event_ring_capacity: 1 << 20,
            memory: MemoryCacheConfig::default(),
            log_dir: std::env::temp_dir(),
            spoof_ip: DEFAULT_SPOOF_IP,
        }
    }
}
