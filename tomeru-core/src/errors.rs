//! エラー型とエラーメッセージ定数

use crate::Handle;
use thiserror::Error;

/// 呼び出し側が分岐に使う実行制御のエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CtrlError {
    /// リングバッファやキャッシュの締め切り切れ
    #[error("deadline exceeded while {0}")]
    Deadline(&'static str),
    /// ターゲットのメモリ/レジスタが読めない
    #[error("failed to read target {what} at {addr:#x}")]
    TargetRead { what: &'static str, addr: u64 },
    /// アンワインド情報が壊れている/読めない
    #[error("unwind failed at {ip:#x}")]
    Unwind { ip: u64 },
    /// OSデバッグAPIの失敗
    #[error("debug api: {0}")]
    DebugApi(String),
    /// ユーザーに見せるエラー
    #[error("{0}")]
    User(String),
    #[error("unknown entity {0:?}")]
    UnknownEntity(Handle),
}

/// プロセスに接続されていない場合のエラーメッセージ
pub const ERR_NOT_ATTACHED: &str = "Not attached to a process";

/// スレッドが選択されていない場合のエラーメッセージ
pub const ERR_NO_THREAD: &str = "No thread selected";

/// シンボルが見つからない場合のエラーメッセージ
pub const ERR_SYMBOL_NOT_FOUND: &str = "Symbol not found";

/// ブレークポイントが見つからない場合のエラーメッセージ
pub const ERR_BREAKPOINT_NOT_FOUND: &str = "Breakpoint not found";

/// エントリポイントが見つからない場合のエラーメッセージ
pub const ERR_ENTRY_POINT_NOT_FOUND: &str = "Could not find an entry point for the process";

/// 制御スレッドに送れなかった場合のエラーメッセージ
pub const ERR_CTRL_BUSY: &str = "Control thread did not accept the message in time";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = CtrlError::TargetRead { what: "memory", addr: 0x1000 };
        assert_eq!(e.to_string(), "failed to read target memory at 0x1000");
        assert_eq!(CtrlError::User("boom".into()).to_string(), "boom");
    }
}
