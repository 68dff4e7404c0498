//! コンシューマ→制御スレッドのメッセージ

use crate::exception_codes::ExceptionCodeFilter;
use tomeru_target::{Handle, MachineId, OsHandle};

/// メッセージの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MsgKind {
    #[default]
    Null,
    Launch,
    Attach,
    Kill,
    Detach,
    Run,
    SingleStep,
    SetUserEntryPoints,
    SetModuleDebugInfoPath,
}

impl MsgKind {
    pub const ALL: [MsgKind; 9] = [
        MsgKind::Null,
        MsgKind::Launch,
        MsgKind::Attach,
        MsgKind::Kill,
        MsgKind::Detach,
        MsgKind::Run,
        MsgKind::SingleStep,
        MsgKind::SetUserEntryPoints,
        MsgKind::SetModuleDebugInfoPath,
    ];

    pub fn to_u32(self) -> u32 {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(0) as u32
    }

    pub fn from_u32(v: u32) -> Self {
        Self::ALL.get(v as usize).copied().unwrap_or(MsgKind::Null)
    }

    /// 実行メッセージ（バッチを終わらせる）か
    pub fn ends_batch(self) -> bool {
        matches!(self, MsgKind::Run | MsgKind::SingleStep)
    }
}

/// 実行フラグ
pub mod run_flags {
    /// ハンドシェイク後にエントリポイントで止める
    pub const STOP_ON_ENTRY_POINT: u32 = 1 << 0;
}

/// トラップフラグ
///
/// ステップ系の操作がトラップネットとして仕掛けるトラップの振る舞い。
pub mod trap_flags {
    /// ヒット後にそのスレッドをシングルステップして止める
    pub const SINGLE_STEP_AFTER_HIT: u32 = 1 << 0;
    /// 戻りアドレスをスプーフ用アドレスに差し替えて走らせ続ける
    pub const BEGIN_SPOOF_MODE: u32 = 1 << 1;
    /// スタックポインタが一致したら記録し直す
    pub const SAVE_STACK_POINTER: u32 = 1 << 2;
    /// スタックポインタの一致を見ない
    pub const IGNORE_STACK_POINTER_CHECK: u32 = 1 << 3;
    /// ステップを終える
    pub const END_STEPPING: u32 = 1 << 4;
}

/// トラップネットのトラップ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgTrap {
    pub flags: u32,
    pub vaddr: u64,
}

impl MsgTrap {
    pub fn new(flags: u32, vaddr: u64) -> Self {
        Self { flags, vaddr }
    }
}

/// ユーザーブレークポイントの指定方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UserBreakpointKind {
    /// ファイル名:行:列
    #[default]
    FileNameAndLineColNumber,
    /// シンボル名+オフセット
    SymbolNameAndOffset,
    /// 仮想アドレス
    VirtualAddress,
}

impl UserBreakpointKind {
    pub fn to_u32(self) -> u32 {
        match self {
            UserBreakpointKind::FileNameAndLineColNumber => 0,
            UserBreakpointKind::SymbolNameAndOffset => 1,
            UserBreakpointKind::VirtualAddress => 2,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(UserBreakpointKind::FileNameAndLineColNumber),
            1 => Some(UserBreakpointKind::SymbolNameAndOffset),
            2 => Some(UserBreakpointKind::VirtualAddress),
            _ => None,
        }
    }
}

/// ユーザーブレークポイント
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserBreakpoint {
    pub kind: UserBreakpointKind,
    /// ファイル名またはシンボル名
    pub string: String,
    pub line: u64,
    pub column: u64,
    /// シンボルからのオフセット、または仮想アドレス
    pub u64: u64,
    /// 空なら無条件
    pub condition: String,
}

impl UserBreakpoint {
    pub fn file_line(file: impl Into<String>, line: u64) -> Self {
        Self {
            kind: UserBreakpointKind::FileNameAndLineColNumber,
            string: file.into(),
            line,
            ..Default::default()
        }
    }

    pub fn symbol(name: impl Into<String>, offset: u64) -> Self {
        Self {
            kind: UserBreakpointKind::SymbolNameAndOffset,
            string: name.into(),
            u64: offset,
            ..Default::default()
        }
    }

    pub fn address(vaddr: u64) -> Self {
        Self {
            kind: UserBreakpointKind::VirtualAddress,
            u64: vaddr,
            ..Default::default()
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }
}

/// メッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub kind: MsgKind,
    pub run_flags: u32,
    pub msg_id: u64,
    pub machine_id: MachineId,
    pub entity: OsHandle,
    pub parent: OsHandle,
    /// pid
    pub entity_id: u64,
    pub exit_code: u32,
    pub env_inherit: bool,
    pub exception_code_filters: ExceptionCodeFilter,
    pub path: String,
    pub entry_points: Vec<String>,
    pub cmd_line: Vec<String>,
    pub env: Vec<String>,
    pub stdout_path: String,
    pub stderr_path: String,
    pub stdin_path: String,
    pub traps: Vec<MsgTrap>,
    pub user_bps: Vec<UserBreakpoint>,
    pub freeze_state_threads: Vec<Handle>,
    /// trueなら`freeze_state_threads`を凍結、falseならそれだけを動かす
    pub freeze_state_is_frozen: bool,
    /// 評価器の設定など、制御スレッドが解釈しない追加データ
    pub meta: Vec<u8>,
}

/// 凍結リストが空で`freeze_state_is_frozen`が真、つまり何も凍結しない
impl Default for Msg {
    fn default() -> Self {
        Self {
            kind: MsgKind::default(),
            run_flags: 0,
            msg_id: 0,
            machine_id: MachineId::default(),
            entity: OsHandle::default(),
            parent: OsHandle::default(),
            entity_id: 0,
            exit_code: 0,
            env_inherit: false,
            exception_code_filters: ExceptionCodeFilter::default(),
            path: String::new(),
            entry_points: Vec::new(),
            cmd_line: Vec::new(),
            env: Vec::new(),
            stdout_path: String::new(),
            stderr_path: String::new(),
            stdin_path: String::new(),
            traps: Vec::new(),
            user_bps: Vec::new(),
            freeze_state_threads: Vec::new(),
            freeze_state_is_frozen: true,
            meta: Vec::new(),
        }
    }
}

impl Msg {
    pub fn new(kind: MsgKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn entity_handle(&self) -> Handle {
        Handle::new(self.machine_id, self.entity)
    }

    pub fn parent_handle(&self) -> Handle {
        Handle::new(self.machine_id, self.parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_freezes_nothing() {
        let from_new = Msg::new(MsgKind::Run);
        let from_default = Msg {
            kind: MsgKind::Run,
            ..Default::default()
        };
        assert_eq!(from_new, from_default);
        assert!(from_default.freeze_state_is_frozen);
        assert!(from_default.freeze_state_threads.is_empty());
        let thread = Handle::local(OsHandle(1));
        assert!(!crate::ctrl::run::is_frozen_by(&from_default, thread));
    }
}
