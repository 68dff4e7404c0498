//! tomeru 実行制御コア
//!
//! このクレートは、ネイティブデバッガの実行制御を担います。
//! エンティティストア（プロセス/スレッド/モジュールのトポロジ）、
//! 制御スレッドとコンシューマを結ぶメッセージ/イベントプロトコル、
//! プロセスメモリ・レジスタ・モジュールイメージのキャッシュ、
//! x86-64/ARM64のスタックアンワインド、制御スレッドの実行ループを統合します。

pub mod breakpoint;
pub mod cache;
pub mod command;
pub mod config;
pub mod ctrl;
pub mod deadline;
pub mod debugger;
pub mod disasm;
pub mod entity;
pub mod errors;
pub mod eval;
pub mod exception_codes;
pub mod parse;
pub mod protocol;
pub mod range;
pub mod stepping;
pub mod strings;
pub mod unwind;

pub use breakpoint::{Breakpoint, BreakpointId, BreakpointManager};
pub use command::Command;
pub use config::CtrlConfig;
pub use ctrl::Ctrl;
pub use deadline::Deadline;
pub use debugger::{Debugger, StopInfo};
pub use entity::{Entity, EntityId, EntityKind, EntityPayload, EntityStore};
pub use errors::CtrlError;
pub use protocol::{Event, EventKind, EventPayload, Msg, MsgKind, StopCause};
pub use range::AddrRange;

// 他のクレートから使用するために再エクスポート
pub use tomeru_dwarf::Symbol;
pub use tomeru_target::{Arch, Handle, OsHandle, RegBlock};

/// 実行制御コアの結果型
pub type Result<T> = anyhow::Result<T>;
