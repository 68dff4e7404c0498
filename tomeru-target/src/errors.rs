//! ターゲット制御のエラー

use crate::OsHandle;
use thiserror::Error;

/// 呼び出し側が分岐に使うターゲット制御のエラー
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("unknown process {0}")]
    UnknownProcess(OsHandle),
    #[error("unknown thread {0}")]
    UnknownThread(OsHandle),
    #[error("no process is being debugged")]
    NoProcess,
    #[error("launch failed: {0}")]
    Launch(String),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}
