//! ハンドル

/// デバッグ対象マシンのID
pub type MachineId = u64;

/// ローカルマシン
pub const MACHINE_ID_LOCAL: MachineId = 1;

/// OSデバッグAPIが払い出す不透明なハンドル（プロセス/スレッド/モジュール）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct OsHandle(pub u64);

impl OsHandle {
    /// 無効なハンドル
    pub const NONE: OsHandle = OsHandle(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for OsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}]", self.0)
    }
}

/// (マシンID, OSハンドル) の組
///
/// セッション内でプロセス/スレッド/モジュールを一意に識別する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle {
    pub machine_id: MachineId,
    pub os: OsHandle,
}

impl Handle {
    /// 全要素が0のハンドル
    pub const ZERO: Handle = Handle { machine_id: 0, os: OsHandle::NONE };

    pub fn new(machine_id: MachineId, os: OsHandle) -> Self {
        Self { machine_id, os }
    }

    /// ローカルマシン上のハンドル
    pub fn local(os: OsHandle) -> Self {
        Self::new(MACHINE_ID_LOCAL, os)
    }
}
