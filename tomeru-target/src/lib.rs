//! tomeru ターゲットプロセス制御
//!
//! このクレートは、実行制御コアから見たOSデバッグAPIの境界を定義します。
//! ハンドル、アーキテクチャ、レジスタブロック、デバッグイベント、実行制御パラメータと、
//! それらを扱う [`DebugApi`] トレイトです。
//! Linux x86-64 では ptrace による実装 [`ptrace::PtraceDebugApi`] を提供します。

pub mod arch;
pub mod handle;
pub mod registers;
pub mod api;
pub mod errors;
pub mod mock;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;

pub use arch::Arch;
pub use handle::{Handle, MachineId, OsHandle, MACHINE_ID_LOCAL};
pub use registers::{RegBlock, RegsArm64, RegsX64};
pub use api::{
    DebugApi, DebugEvent, DebugEventKind, ExceptionKind, LaunchParams, RunCtrls, Trap,
};
pub use errors::TargetError;
pub use mock::{MockApi, ScriptedRun};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
