//! ステップ操作のトラップネット
//!
//! コンシューマ側で、ステップの種類ごとに制御スレッドへ渡すトラップを組み立てる。

use crate::disasm::Instruction;
use crate::protocol::{trap_flags, MsgTrap};

/// 命令単位のステップのやり方
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepPlan {
    /// 1命令だけシングルステップする
    SingleStep,
    /// トラップネットを張って走らせる
    Run(Vec<MsgTrap>),
}

/// ステップオーバー
///
/// 呼び出し命令なら戻り先にトラップを置いて走らせる。スタックポインタの一致を
/// 見るので、再帰呼び出しの内側で同じ戻り先に来ても止まらない。
pub fn step_over_plan(current: Option<&Instruction>) -> StepPlan {
    match current.filter(|insn| insn.is_call()) {
        Some(call) => StepPlan::Run(vec![MsgTrap::new(trap_flags::END_STEPPING, call.next_address())]),
        None => StepPlan::SingleStep,
    }
}

/// ステップアウト（1フレーム巻き戻した戻りアドレスで止める）
pub fn step_out_traps(return_address: u64) -> Vec<MsgTrap> {
    vec![MsgTrap::new(
        trap_flags::END_STEPPING | trap_flags::IGNORE_STACK_POINTER_CHECK,
        return_address,
    )]
}
