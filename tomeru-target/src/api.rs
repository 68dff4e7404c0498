//! OSデバッグAPIの境界
//!
//! 実行制御コアはこのトレイトだけを通してターゲットを操作する。
//! 実装は制御スレッドから`run`を呼ばれ、`halt`だけは別スレッドからも呼ばれる。

use crate::{Arch, OsHandle, RegBlock, Result};

/// OSから届くデバッグイベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugEventKind {
    Error,
    HandshakeComplete,
    CreateProcess,
    ExitProcess,
    CreateThread,
    ExitThread,
    LoadModule,
    UnloadModule,
    Breakpoint,
    Trap,
    SingleStep,
    Exception,
    Halt,
    Memory,
    DebugString,
    SetThreadName,
    SetThreadColor,
}

impl DebugEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            DebugEventKind::Error => "Error",
            DebugEventKind::HandshakeComplete => "HandshakeComplete",
            DebugEventKind::CreateProcess => "CreateProcess",
            DebugEventKind::ExitProcess => "ExitProcess",
            DebugEventKind::CreateThread => "CreateThread",
            DebugEventKind::ExitThread => "ExitThread",
            DebugEventKind::LoadModule => "LoadModule",
            DebugEventKind::UnloadModule => "UnloadModule",
            DebugEventKind::Breakpoint => "Breakpoint",
            DebugEventKind::Trap => "Trap",
            DebugEventKind::SingleStep => "SingleStep",
            DebugEventKind::Exception => "Exception",
            DebugEventKind::Halt => "Halt",
            DebugEventKind::Memory => "Memory",
            DebugEventKind::DebugString => "DebugString",
            DebugEventKind::SetThreadName => "SetThreadName",
            DebugEventKind::SetThreadColor => "SetThreadColor",
        }
    }
}

/// 例外の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExceptionKind {
    #[default]
    Null,
    MemoryRead,
    MemoryWrite,
    MemoryExecute,
    CppThrow,
}

impl ExceptionKind {
    pub fn to_u32(self) -> u32 {
        match self {
            ExceptionKind::Null => 0,
            ExceptionKind::MemoryRead => 1,
            ExceptionKind::MemoryWrite => 2,
            ExceptionKind::MemoryExecute => 3,
            ExceptionKind::CppThrow => 4,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => ExceptionKind::MemoryRead,
            2 => ExceptionKind::MemoryWrite,
            3 => ExceptionKind::MemoryExecute,
            4 => ExceptionKind::CppThrow,
            _ => ExceptionKind::Null,
        }
    }
}

/// デバッグイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent {
    pub kind: DebugEventKind,
    pub exception_kind: ExceptionKind,
    pub arch: Arch,
    pub process: OsHandle,
    pub thread: OsHandle,
    pub module: OsHandle,
    /// 例外アドレス、モジュールベース、トラップアドレスなど
    pub address: u64,
    /// モジュールサイズなど
    pub size: u64,
    /// パス、スレッド名、デバッグ文字列
    pub string: String,
    /// 例外コード、終了コード、pid/tid
    pub code: u64,
    pub flags: u64,
    pub instruction_pointer: u64,
    pub stack_base: u64,
    pub tls_root: u64,
    /// 同じ例外が2回目以降に届いたとき
    pub exception_repeated: bool,
}

impl DebugEvent {
    /// 種類だけを指定したイベント
    pub fn new(kind: DebugEventKind) -> Self {
        Self {
            kind,
            exception_kind: ExceptionKind::Null,
            arch: Arch::Null,
            process: OsHandle::NONE,
            thread: OsHandle::NONE,
            module: OsHandle::NONE,
            address: 0,
            size: 0,
            string: String::new(),
            code: 0,
            flags: 0,
            instruction_pointer: 0,
            stack_base: 0,
            tls_root: 0,
            exception_repeated: false,
        }
    }
}

/// 低レベルトラップ（アドレスで停止させるINT3など）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Trap {
    pub process: OsHandle,
    pub vaddr: u64,
    pub id: u64,
}

/// 1回の実行に与える制御
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCtrls {
    /// 0以外ならこのスレッドだけをシングルステップする
    pub single_step_thread: OsHandle,
    /// 直前の例外をターゲットに渡さず握りつぶす
    pub ignore_previous_exception: bool,
    /// trueなら`run_entities`だけを動かし、falseなら`run_entities`を凍結する
    pub run_entities_are_unfrozen: bool,
    /// `run_entities`がプロセスを指す
    pub run_entities_are_processes: bool,
    pub run_entities: Vec<OsHandle>,
    pub traps: Vec<Trap>,
}

impl RunCtrls {
    /// スレッド（とその所属プロセス）を今回の実行で凍結するか
    pub fn is_frozen(&self, thread: OsHandle, process: OsHandle) -> bool {
        let key = if self.run_entities_are_processes { process } else { thread };
        let listed = self.run_entities.contains(&key);
        if self.run_entities_are_unfrozen {
            !listed
        } else {
            listed
        }
    }
}

/// プロセス起動パラメータ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchParams {
    pub path: String,
    pub cmd_line: Vec<String>,
    pub env: Vec<String>,
    pub env_inherit: bool,
    pub stdout_path: String,
    pub stderr_path: String,
    pub stdin_path: String,
}

/// OSデバッグAPI
pub trait DebugApi: Send + Sync {
    /// プロセスを起動し、pidを返す（起動したプロセスのイベントは次の`run`で届く）
    fn launch(&self, params: &LaunchParams) -> Result<u32>;

    /// 既存のプロセスにアタッチする
    fn attach(&self, pid: u32) -> Result<()>;

    /// プロセスを終了させる
    fn kill(&self, process: OsHandle, exit_code: u32) -> Result<()>;

    /// プロセスからデタッチする
    fn detach(&self, process: OsHandle) -> Result<()>;

    /// 実行中のターゲットを止める（別スレッドから呼ばれる）
    fn halt(&self) -> Result<()>;

    /// 実行してイベントを待つ
    fn run(&self, ctrls: &RunCtrls) -> Result<Vec<DebugEvent>>;

    /// メモリを読む。読めたバイト数を返す
    fn read_memory(&self, process: OsHandle, addr: u64, buf: &mut [u8]) -> usize;

    /// メモリに書く
    fn write_memory(&self, process: OsHandle, addr: u64, data: &[u8]) -> bool;

    /// スレッドのレジスタを読む
    fn read_regs(&self, thread: OsHandle) -> Option<RegBlock>;

    /// スレッドのレジスタを書く
    fn write_regs(&self, thread: OsHandle, regs: &RegBlock) -> bool;

    /// スタックの底
    fn stack_base(&self, thread: OsHandle) -> u64;

    /// TLSのルート
    fn tls_root(&self, thread: OsHandle) -> u64;

    /// メモリ世代（ターゲットのメモリが変わりうる操作ごとに増える）
    fn mem_gen(&self) -> u64;

    /// レジスタ世代
    fn reg_gen(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freeze_state() {
        let t1 = OsHandle(1);
        let t2 = OsHandle(2);
        let p = OsHandle(100);

        // 凍結リスト
        let ctrls = RunCtrls {
            run_entities: vec![t1],
            ..Default::default()
        };
        assert!(ctrls.is_frozen(t1, p));
        assert!(!ctrls.is_frozen(t2, p));

        // 非凍結リスト
        let ctrls = RunCtrls {
            run_entities: vec![t1],
            run_entities_are_unfrozen: true,
            ..Default::default()
        };
        assert!(!ctrls.is_frozen(t1, p));
        assert!(ctrls.is_frozen(t2, p));

        // プロセス単位
        let ctrls = RunCtrls {
            run_entities: vec![p],
            run_entities_are_unfrozen: true,
            run_entities_are_processes: true,
            ..Default::default()
        };
        assert!(!ctrls.is_frozen(t2, p));
        assert!(ctrls.is_frozen(t2, OsHandle(101)));
    }
}
