//! デバッガコマンド

use crate::breakpoint::BreakpointId;

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定（`if`以降は条件式）
    Break(String),
    /// ブレークポイントを削除
    Delete(BreakpointId),
    /// ブレークポイントの条件を付け替える
    Condition(BreakpointId, String),
    /// ブレークポイントを有効化
    Enable(BreakpointId),
    /// ブレークポイントを無効化
    Disable(BreakpointId),
    /// ブレークポイント一覧
    Breakpoints,
    /// 実行継続
    Continue,
    /// 1命令ステップイン
    StepInst,
    /// 1命令ステップオーバー
    NextInst,
    /// 現在の関数から抜けるまで実行
    Finish,
    /// バックトレース表示
    Backtrace,
    /// レジスタ表示
    Registers,
    /// メモリダンプ（アドレス, バイト数）
    Examine(String, usize),
    /// 現在位置の逆アセンブル
    Disassemble,
    /// スレッド一覧
    Threads,
    /// スレッドの選択
    Thread(u64),
    /// モジュール一覧
    Modules,
    /// プロセスを終了させる
    Kill,
    /// プロセスから切り離す
    Detach,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

/// `x`コマンドの既定のバイト数
pub const DEFAULT_EXAMINE_LEN: usize = 64;

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }

        match parts[0] {
            "break" | "b" => {
                if parts.len() > 1 {
                    Some(Command::Break(parts[1..].join(" ")))
                } else {
                    None
                }
            }
            "delete" | "d" => parts.get(1)?.parse().ok().map(Command::Delete),
            "enable" => parts.get(1)?.parse().ok().map(Command::Enable),
            "disable" => parts.get(1)?.parse().ok().map(Command::Disable),
            "condition" | "cond" => {
                let id = parts.get(1)?.parse().ok()?;
                Some(Command::Condition(id, parts[2..].join(" ")))
            }
            "info" => match *parts.get(1)? {
                "breakpoints" | "break" | "b" => Some(Command::Breakpoints),
                "registers" | "reg" | "r" => Some(Command::Registers),
                "threads" => Some(Command::Threads),
                "modules" | "sharedlibrary" => Some(Command::Modules),
                _ => None,
            },
            "continue" | "c" | "run" | "r" => Some(Command::Continue),
            "stepi" | "si" => Some(Command::StepInst),
            "nexti" | "ni" => Some(Command::NextInst),
            "finish" | "f" => Some(Command::Finish),
            "backtrace" | "bt" => Some(Command::Backtrace),
            "registers" | "regs" => Some(Command::Registers),
            "x" => {
                let addr = parts.get(1)?.to_string();
                let len = match parts.get(2) {
                    Some(n) => n.parse().ok()?,
                    None => DEFAULT_EXAMINE_LEN,
                };
                Some(Command::Examine(addr, len))
            }
            "disassemble" | "disas" => Some(Command::Disassemble),
            "threads" => Some(Command::Threads),
            "thread" | "t" => parts.get(1)?.parse().ok().map(Command::Thread),
            "modules" => Some(Command::Modules),
            "kill" | "k" => Some(Command::Kill),
            "detach" => Some(Command::Detach),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}
