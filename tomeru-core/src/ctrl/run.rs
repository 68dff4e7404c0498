//! 実行ループ
//!
//! Runメッセージは次の状態を順にたどる有限状態機械として処理する。
//!
//! ```text
//! ResolvingTraps → SteppingStuckThreads → Running ⇄ (条件評価/スプーフ/トラップの通過) → Stopped
//! ```
//!
//! OSイベントの分類（[`classify_event`]）と停止理由の優先順位（[`stop_cause`]）は
//! 副作用のない関数にしてある。

use super::context::CtrlContext;
use crate::entity::{EntityId, EntityKind};
use crate::errors::ERR_ENTRY_POINT_NOT_FOUND;
use crate::protocol::{run_flags, trap_flags, Event, EventKind, Msg, StopCause, UserBreakpoint, UserBreakpointKind};
use tomeru_dwarf::normalize_path;
use tomeru_target::{DebugEvent, DebugEventKind, Handle, OsHandle, RunCtrls, Trap, MACHINE_ID_LOCAL};
use tracing::{debug, info};

/// トラップネットのトラップID
pub const NET_TRAP_ID: u64 = u64::MAX;
/// エントリポイントのトラップID
pub const ENTRY_TRAP_ID: u64 = u64::MAX - 1;

const MAIN_ENTRY_POINTS: [&str; 4] = ["WinMain", "wWinMain", "main", "wmain"];
const CRT_ENTRY_POINTS: [&str; 4] = [
    "WinMainCRTStartup",
    "wWinMainCRTStartup",
    "mainCRTStartup",
    "wmainCRTStartup",
];

/// 戻りアドレスの差し替え
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spoof {
    pub process: OsHandle,
    pub thread: OsHandle,
    /// 戻りアドレスが置かれているスタック上の位置
    pub vaddr: u64,
    /// 差し替え先（実行されると例外になるアドレス）
    pub new_ip: u64,
}

/// 実行中に届いたOSイベントの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// 即座に止まる
    HardStop(StopCause),
    Exception,
    Breakpoint,
    /// トラップを増やす
    NewProcess,
    NewModule,
    /// エントリポイントを解決する
    Handshake,
    /// 実行を続ける
    Passive,
}

pub fn classify_event(kind: DebugEventKind) -> EventClass {
    match kind {
        DebugEventKind::Error => EventClass::HardStop(StopCause::Error),
        DebugEventKind::Halt => EventClass::HardStop(StopCause::InterruptedByHalt),
        DebugEventKind::Trap => EventClass::HardStop(StopCause::InterruptedByTrap),
        DebugEventKind::SingleStep => EventClass::HardStop(StopCause::Finished),
        DebugEventKind::Exception => EventClass::Exception,
        DebugEventKind::Breakpoint => EventClass::Breakpoint,
        DebugEventKind::CreateProcess => EventClass::NewProcess,
        DebugEventKind::LoadModule => EventClass::NewModule,
        DebugEventKind::HandshakeComplete => EventClass::Handshake,
        _ => EventClass::Passive,
    }
}

/// 1命令のステップの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Interrupted(StopCause),
}

/// ステップ中に届いたイベントの扱い（`None`なら待ち続ける）
pub fn classify_step_event(kind: DebugEventKind) -> Option<StepOutcome> {
    match kind {
        DebugEventKind::Error => Some(StepOutcome::Interrupted(StopCause::Error)),
        DebugEventKind::Exception => Some(StepOutcome::Interrupted(StopCause::InterruptedByException)),
        DebugEventKind::Halt => Some(StepOutcome::Interrupted(StopCause::InterruptedByHalt)),
        DebugEventKind::Trap => Some(StepOutcome::Interrupted(StopCause::InterruptedByTrap)),
        DebugEventKind::SingleStep => Some(StepOutcome::Completed),
        _ => None,
    }
}

/// SingleStepメッセージの停止理由
pub fn single_step_cause(kind: DebugEventKind) -> Option<StopCause> {
    match kind {
        DebugEventKind::SingleStep => Some(StopCause::Finished),
        DebugEventKind::Breakpoint => Some(StopCause::UserBreakpoint),
        _ => match classify_step_event(kind)? {
            StepOutcome::Interrupted(cause) => Some(cause),
            StepOutcome::Completed => Some(StopCause::Finished),
        },
    }
}

/// 1回のOSイベントで起きたこと
///
/// ステップ系の項目は、ステップが割り込まれたときの理由を持つ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageOutcome {
    pub hard_stop: Option<StopCause>,
    pub conditional_step: Option<StopCause>,
    pub single_step: Option<StopCause>,
    pub step_past: Option<StopCause>,
    pub exception: bool,
    pub user_breakpoint: bool,
    pub entry_point: bool,
    pub trap_net_end: bool,
}

/// 停止理由を優先順位どおりに選ぶ（`Null`なら走り続ける）
pub fn stop_cause(outcome: &StageOutcome) -> StopCause {
    if let Some(cause) = outcome
        .hard_stop
        .or(outcome.conditional_step)
        .or(outcome.single_step)
        .or(outcome.step_past)
    {
        return cause;
    }
    if outcome.exception {
        StopCause::InterruptedByException
    } else if outcome.user_breakpoint {
        StopCause::UserBreakpoint
    } else if outcome.entry_point {
        StopCause::EntryPoint
    } else if outcome.trap_net_end {
        StopCause::Finished
    } else {
        StopCause::Null
    }
}

/// 凍結状態のメッセージでスレッドが凍結されるか
pub fn is_frozen_by(msg: &Msg, thread: Handle) -> bool {
    let listed = msg.freeze_state_threads.contains(&thread);
    if listed {
        msg.freeze_state_is_frozen
    } else {
        !msg.freeze_state_is_frozen
    }
}

/// 条件が1つでも成り立てば（評価できなくても）ヒット
///
/// 空の条件は無条件。すべて0に評価されたときだけ見逃す。
pub fn conditions_hit(conditions: &[&str], evaluate: &mut dyn FnMut(&str) -> crate::Result<u64>) -> bool {
    if conditions.is_empty() {
        return true;
    }
    for condition in conditions {
        if condition.trim().is_empty() {
            return true;
        }
        match evaluate(condition) {
            Ok(0) => continue,
            Ok(_) => return true,
            Err(e) => {
                debug!("Condition {:?} failed to evaluate: {}", condition, e);
                return true;
            }
        }
    }
    false
}

#[derive(Debug)]
enum RunPhase {
    ResolvingTraps,
    SteppingStuckThreads,
    Running,
    Stopped(StopCause, Option<DebugEvent>),
}

/// Run 1回ぶんの状態
#[derive(Debug, Default)]
struct RunState {
    target_process: OsHandle,
    target_thread: OsHandle,
    user_traps: Vec<Trap>,
    net_traps: Vec<Trap>,
    entry_traps: Vec<Trap>,
    entry_points_resolved: bool,
    sp_check: u64,
    spoof: Option<Spoof>,
    /// 対象スレッドがユーザートラップとトラップネットの両方の上にいたときのip
    target_parked_ip: Option<u64>,
}

impl RunState {
    /// スプーフ中はトラップネットを外す
    fn active_traps(&self) -> Vec<Trap> {
        let mut traps = self.user_traps.clone();
        traps.extend_from_slice(&self.entry_traps);
        if self.spoof.is_none() {
            traps.extend_from_slice(&self.net_traps);
        }
        traps
    }
}

impl CtrlContext {
    fn emit_started(&mut self, msg: &Msg) {
        let mut event = Event::new(EventKind::Started);
        event.msg_id = msg.msg_id;
        event.machine_id = MACHINE_ID_LOCAL;
        self.emit_one(event);
    }

    /// SingleStepメッセージ
    pub(crate) fn single_step(&mut self, msg: &Msg) {
        self.emit_started(msg);
        let mut ctrls = RunCtrls {
            single_step_thread: msg.entity,
            ..Default::default()
        };
        loop {
            let event = self.next_event(&mut ctrls, None);
            if let Some(cause) = single_step_cause(event.kind) {
                self.emit_stopped(msg, cause, Some(&event));
                return;
            }
        }
    }

    /// Runメッセージ
    pub(crate) fn run(&mut self, msg: &Msg) {
        let mut state = RunState {
            target_process: msg.parent,
            target_thread: msg.entity,
            ..Default::default()
        };
        let mut phase = RunPhase::ResolvingTraps;
        loop {
            phase = match phase {
                RunPhase::ResolvingTraps => {
                    state.user_traps = self.resolve_all_user_traps(&msg.user_bps);
                    state.net_traps = msg
                        .traps
                        .iter()
                        .map(|t| Trap {
                            process: state.target_process,
                            vaddr: t.vaddr,
                            id: NET_TRAP_ID,
                        })
                        .collect();
                    state.sp_check = self.thread_sp(state.target_thread).unwrap_or(0);
                    self.log.info(format!(
                        "run: {} user traps, {} net traps, sp_check={:#x}",
                        state.user_traps.len(),
                        state.net_traps.len(),
                        state.sp_check
                    ));
                    self.emit_started(msg);
                    RunPhase::SteppingStuckThreads
                }
                RunPhase::SteppingStuckThreads => match self.step_stuck_threads(msg, &mut state) {
                    Some((cause, event)) => RunPhase::Stopped(cause, Some(event)),
                    None => RunPhase::Running,
                },
                RunPhase::Running => self.run_stage(msg, &mut state),
                RunPhase::Stopped(cause, event) => {
                    self.emit_stopped(msg, cause, event.as_ref());
                    return;
                }
            };
        }
    }

    /// ユーザートラップの上で止まっているスレッドを1命令進める
    fn step_stuck_threads(&mut self, msg: &Msg, state: &mut RunState) -> Option<(StopCause, DebugEvent)> {
        let mut stuck = Vec::new();
        for process in self.entities.list(EntityKind::Process).iter().copied() {
            let Some(process_os) = self.entities.get(process).map(|e| e.handle.os) else {
                continue;
            };
            for thread in self.entities.children_of_kind(process, EntityKind::Thread) {
                let Some(handle) = self.entities.get(thread).map(|e| e.handle) else {
                    continue;
                };
                if is_frozen_by(msg, handle) {
                    continue;
                }
                let Some(ip) = self.thread_ip(handle.os) else {
                    continue;
                };
                let on_user_trap = state
                    .user_traps
                    .iter()
                    .any(|t| t.process == process_os && t.vaddr == ip);
                if !on_user_trap {
                    continue;
                }
                if handle.os == state.target_thread && msg.traps.iter().any(|t| t.vaddr == ip) {
                    state.target_parked_ip = Some(ip);
                    continue;
                }
                stuck.push(handle.os);
            }
        }

        for thread in stuck {
            debug!("Stepping {} off a user trap", thread);
            let (outcome, event) = self.step_thread(thread);
            if let StepOutcome::Interrupted(cause) = outcome {
                return Some((cause, event));
            }
        }
        None
    }

    /// スレッドを1命令だけ進める
    pub(crate) fn step_thread(&mut self, thread: OsHandle) -> (StepOutcome, DebugEvent) {
        let mut ctrls = RunCtrls {
            single_step_thread: thread,
            ..Default::default()
        };
        loop {
            let event = self.next_event(&mut ctrls, None);
            if let Some(outcome) = classify_step_event(event.kind) {
                return (outcome, event);
            }
        }
    }

    /// OSを走らせてイベントを1つ処理する
    fn run_stage(&mut self, msg: &Msg, state: &mut RunState) -> RunPhase {
        let mut ctrls = RunCtrls {
            ignore_previous_exception: true,
            run_entities_are_unfrozen: !msg.freeze_state_is_frozen,
            run_entities: msg.freeze_state_threads.iter().map(|h| h.os).collect(),
            traps: state.active_traps(),
            ..Default::default()
        };
        let spoof = state.spoof;
        let event = self.next_event(&mut ctrls, spoof.as_ref());

        let mut outcome = StageOutcome::default();
        match classify_event(event.kind) {
            EventClass::HardStop(cause) => outcome.hard_stop = Some(cause),
            EventClass::NewProcess => {
                let traps = self.resolve_process_user_traps(event.process, &msg.user_bps);
                state.user_traps.extend(traps);
            }
            EventClass::NewModule => {
                if let Some(module) = self.entities.from_handle(Handle::local(event.module)) {
                    let traps = self.resolve_module_user_traps(event.process, module, &msg.user_bps);
                    state.user_traps.extend(traps);
                }
            }
            EventClass::Handshake => {
                if msg.run_flags & run_flags::STOP_ON_ENTRY_POINT != 0 && !state.entry_points_resolved {
                    state.entry_points_resolved = true;
                    state.entry_traps = self.entry_point_traps(msg);
                    if state.entry_traps.is_empty() {
                        self.log.user_error(ERR_ENTRY_POINT_NOT_FOUND);
                        outcome.hard_stop = Some(StopCause::Error);
                    }
                }
            }
            EventClass::Exception => {
                let spoof_hit = state.spoof.filter(|s| {
                    event.process == s.process
                        && event.thread == s.thread
                        && event.instruction_pointer == s.new_ip
                });
                match spoof_hit {
                    Some(spoof) => {
                        self.log_spoof(&spoof, "hit");
                        state.spoof = None;
                    }
                    None => outcome.exception = true,
                }
            }
            EventClass::Breakpoint => self.handle_breakpoint(msg, state, &event, &mut outcome),
            EventClass::Passive => {}
        }

        match stop_cause(&outcome) {
            StopCause::Null => RunPhase::Running,
            cause => {
                info!("Run stopped: {} at {:#x}", cause.name(), event.instruction_pointer);
                RunPhase::Stopped(cause, Some(event))
            }
        }
    }

    fn handle_breakpoint(&mut self, msg: &Msg, state: &mut RunState, event: &DebugEvent, outcome: &mut StageOutcome) {
        let ip = event.instruction_pointer;
        let hit_entry = state
            .entry_traps
            .iter()
            .any(|t| t.process == event.process && t.vaddr == ip);

        // 対象スレッドが最初から乗っていたユーザートラップは一度だけ見逃す
        let mut skip_user = false;
        if event.thread == state.target_thread {
            skip_user = state.target_parked_ip.take() == Some(ip);
        }
        let user_hits: Vec<usize> = if skip_user {
            Vec::new()
        } else {
            state
                .user_traps
                .iter()
                .filter(|t| t.process == event.process && t.vaddr == ip)
                .map(|t| t.id as usize)
                .collect()
        };

        let mut hit_user = false;
        let mut conditional_filtered = false;
        if !user_hits.is_empty() {
            let conditions: Vec<&str> = user_hits
                .iter()
                .filter_map(|i| msg.user_bps.get(*i))
                .map(|bp| bp.condition.as_str())
                .collect();
            let evaluator = self.evaluator.clone();
            let scope = self.scope_for(event.process, event.thread);
            let hit = conditions_hit(&conditions, &mut |c| evaluator.evaluate(c, &scope));
            self.log.info(format!("user breakpoint at {:#x}: hit={}", ip, hit));
            if hit {
                hit_user = true;
            } else {
                conditional_filtered = true;
            }
        }

        let mut hit_net = false;
        let mut flags = 0;
        if !hit_user && event.process == state.target_process {
            for trap in msg.traps.iter().filter(|t| t.vaddr == ip) {
                hit_net = true;
                flags |= trap.flags;
            }
        }

        let mut use_stepping = true;
        if conditional_filtered {
            if let (StepOutcome::Interrupted(cause), _) = self.step_thread(event.thread) {
                outcome.conditional_step = Some(cause);
                use_stepping = false;
            }
        }
        if msg.run_flags & run_flags::STOP_ON_ENTRY_POINT != 0 && hit_entry {
            outcome.entry_point = true;
            use_stepping = false;
        }
        if use_stepping && hit_user {
            outcome.user_breakpoint = true;
            use_stepping = false;
        }
        if use_stepping && hit_net {
            if event.thread != state.target_thread {
                if let (StepOutcome::Interrupted(cause), _) = self.step_thread(event.thread) {
                    outcome.step_past = Some(cause);
                }
            } else {
                self.apply_trap_net(state, flags, outcome);
            }
        }
    }

    /// 対象スレッドがトラップネットに掛かったときの処理
    fn apply_trap_net(&mut self, state: &mut RunState, flags: u32, outcome: &mut StageOutcome) {
        let thread = state.target_thread;
        let sp_matches = self.thread_sp(thread).unwrap_or(0) == state.sp_check;

        if flags & trap_flags::SINGLE_STEP_AFTER_HIT != 0 {
            if let (StepOutcome::Interrupted(cause), _) = self.step_thread(thread) {
                outcome.single_step = Some(cause);
                return;
            }
        }
        if flags & trap_flags::BEGIN_SPOOF_MODE != 0 {
            let spoof = Spoof {
                process: state.target_process,
                thread,
                vaddr: self.thread_sp(thread).unwrap_or(0),
                new_ip: self.config.spoof_ip,
            };
            self.log_spoof(&spoof, "begin");
            state.spoof = Some(spoof);
        }
        if flags & trap_flags::SAVE_STACK_POINTER != 0 && sp_matches {
            if let Some(sp) = self.thread_sp(thread) {
                state.sp_check = sp;
            }
        }
        if flags & trap_flags::END_STEPPING != 0
            && (flags & trap_flags::IGNORE_STACK_POINTER_CHECK != 0 || sp_matches)
        {
            outcome.trap_net_end = true;
        }
    }

    /// すべてのプロセスとモジュールのユーザートラップ
    fn resolve_all_user_traps(&self, bps: &[UserBreakpoint]) -> Vec<Trap> {
        let mut traps = Vec::new();
        for process in self.entities.list(EntityKind::Process).iter().copied() {
            let Some(process_os) = self.entities.get(process).map(|e| e.handle.os) else {
                continue;
            };
            traps.extend(self.resolve_process_user_traps(process_os, bps));
            for module in self.entities.children_of_kind(process, EntityKind::Module) {
                traps.extend(self.resolve_module_user_traps(process_os, module, bps));
            }
        }
        traps
    }

    /// 仮想アドレス指定のトラップ
    fn resolve_process_user_traps(&self, process: OsHandle, bps: &[UserBreakpoint]) -> Vec<Trap> {
        bps.iter()
            .enumerate()
            .filter(|(_, bp)| bp.kind == UserBreakpointKind::VirtualAddress)
            .map(|(i, bp)| Trap {
                process,
                vaddr: bp.u64,
                id: i as u64,
            })
            .collect()
    }

    /// デバッグ情報で解決するトラップ（ファイル:行、シンボル+オフセット）
    fn resolve_module_user_traps(&self, process: OsHandle, module: EntityId, bps: &[UserBreakpoint]) -> Vec<Trap> {
        let Some(entity) = self.entities.get(module) else {
            return Vec::new();
        };
        let Some(info) = self.debug_info_for(entity.handle) else {
            return Vec::new();
        };
        let base = entity.vaddr_range().min;
        let mut traps = Vec::new();
        for (i, bp) in bps.iter().enumerate() {
            let vaddrs: Vec<u64> = match bp.kind {
                UserBreakpointKind::FileNameAndLineColNumber => info
                    .voffs_from_file_line(&normalize_path(&bp.string), bp.line as u32)
                    .into_iter()
                    .map(|voff| base + voff)
                    .collect(),
                UserBreakpointKind::SymbolNameAndOffset => info
                    .voff_from_symbol(&bp.string)
                    .map(|voff| base + voff + bp.u64)
                    .into_iter()
                    .collect(),
                UserBreakpointKind::VirtualAddress => continue,
            };
            traps.extend(vaddrs.into_iter().map(|vaddr| Trap {
                process,
                vaddr,
                id: i as u64,
            }));
        }
        if !traps.is_empty() {
            debug!("Resolved {} user traps in {}", traps.len(), entity.string);
        }
        traps
    }

    /// エントリポイントのトラップ
    ///
    /// 指定された名前、pidに結びついた名前、ユーザーの名前、main系、
    /// イメージのエントリポイント、CRTのスタートアップの順に探し、
    /// 見つかった段で打ち切る。
    fn entry_point_traps(&self, msg: &Msg) -> Vec<Trap> {
        let mut traps = Vec::new();
        for process in self.entities.list(EntityKind::Process).iter().copied() {
            let Some((process_os, pid)) = self.entities.get(process).map(|e| (e.handle.os, e.id)) else {
                continue;
            };
            let Some(module) = self.main_module(process).and_then(|m| self.entities.get(m)) else {
                continue;
            };
            let base = module.vaddr_range().min;
            let info = self.debug_info_for(module.handle);
            let by_name = |names: &[String]| -> Vec<u64> {
                let Some(info) = info.as_ref() else {
                    return Vec::new();
                };
                names
                    .iter()
                    .filter_map(|name| info.voff_from_symbol(name))
                    .map(|voff| base + voff)
                    .collect()
            };
            let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();

            let mut found = by_name(&msg.entry_points);
            if found.is_empty() {
                found = by_name(&self.entities.entry_points_for(pid));
            }
            if found.is_empty() {
                found = by_name(&self.user_entry_points);
            }
            if found.is_empty() {
                found = by_name(&names(&MAIN_ENTRY_POINTS));
            }
            if found.is_empty() {
                found.extend(self.modules.entry_point_voff(module.handle).map(|voff| base + voff));
            }
            if found.is_empty() {
                found = by_name(&names(&CRT_ENTRY_POINTS));
            }
            info!("Entry point traps for {}: {:x?}", pid, found);
            traps.extend(found.into_iter().map(|vaddr| Trap {
                process: process_os,
                vaddr,
                id: ENTRY_TRAP_ID,
            }));
        }
        traps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MsgKind;

    #[test]
    fn test_classify_event() {
        assert_eq!(
            classify_event(DebugEventKind::Halt),
            EventClass::HardStop(StopCause::InterruptedByHalt)
        );
        assert_eq!(
            classify_event(DebugEventKind::Error),
            EventClass::HardStop(StopCause::Error)
        );
        assert_eq!(classify_event(DebugEventKind::Breakpoint), EventClass::Breakpoint);
        assert_eq!(classify_event(DebugEventKind::LoadModule), EventClass::NewModule);
        assert_eq!(classify_event(DebugEventKind::CreateThread), EventClass::Passive);
        assert_eq!(classify_event(DebugEventKind::DebugString), EventClass::Passive);
    }

    #[test]
    fn test_step_events() {
        assert_eq!(
            classify_step_event(DebugEventKind::SingleStep),
            Some(StepOutcome::Completed)
        );
        assert_eq!(
            classify_step_event(DebugEventKind::Exception),
            Some(StepOutcome::Interrupted(StopCause::InterruptedByException))
        );
        assert_eq!(classify_step_event(DebugEventKind::CreateThread), None);
        assert_eq!(classify_step_event(DebugEventKind::Breakpoint), None);

        assert_eq!(single_step_cause(DebugEventKind::SingleStep), Some(StopCause::Finished));
        assert_eq!(
            single_step_cause(DebugEventKind::Breakpoint),
            Some(StopCause::UserBreakpoint)
        );
        assert_eq!(single_step_cause(DebugEventKind::Trap), Some(StopCause::InterruptedByTrap));
        assert_eq!(single_step_cause(DebugEventKind::LoadModule), None);
    }

    #[test]
    fn test_stop_precedence() {
        let all = StageOutcome {
            hard_stop: Some(StopCause::Error),
            conditional_step: Some(StopCause::InterruptedByHalt),
            single_step: Some(StopCause::InterruptedByTrap),
            step_past: Some(StopCause::InterruptedByException),
            exception: true,
            user_breakpoint: true,
            entry_point: true,
            trap_net_end: true,
        };
        assert_eq!(stop_cause(&all), StopCause::Error);

        let mut o = StageOutcome {
            hard_stop: None,
            ..all
        };
        assert_eq!(stop_cause(&o), StopCause::InterruptedByHalt);
        o.conditional_step = None;
        assert_eq!(stop_cause(&o), StopCause::InterruptedByTrap);
        o.single_step = None;
        assert_eq!(stop_cause(&o), StopCause::InterruptedByException);
        o.step_past = None;
        o.exception = true;
        assert_eq!(stop_cause(&o), StopCause::InterruptedByException);
        o.exception = false;
        assert_eq!(stop_cause(&o), StopCause::UserBreakpoint);
        o.user_breakpoint = false;
        assert_eq!(stop_cause(&o), StopCause::EntryPoint);
        o.entry_point = false;
        assert_eq!(stop_cause(&o), StopCause::Finished);
        o.trap_net_end = false;
        assert_eq!(stop_cause(&o), StopCause::Null);
    }

    #[test]
    fn test_freeze_state() {
        let t1 = Handle::local(OsHandle(1));
        let t2 = Handle::local(OsHandle(2));

        // 既定: 何も凍結しない
        let msg = Msg::new(MsgKind::Run);
        assert!(!is_frozen_by(&msg, t1));

        let mut msg = Msg::new(MsgKind::Run);
        msg.freeze_state_threads = vec![t1];
        assert!(is_frozen_by(&msg, t1));
        assert!(!is_frozen_by(&msg, t2));

        // リストのスレッドだけを動かす
        msg.freeze_state_is_frozen = false;
        assert!(!is_frozen_by(&msg, t1));
        assert!(is_frozen_by(&msg, t2));
    }

    #[test]
    fn test_conditions_hit() {
        let mut eval = |c: &str| -> crate::Result<u64> {
            match c {
                "zero" => Ok(0),
                "one" => Ok(1),
                _ => Err(anyhow::anyhow!("bad")),
            }
        };
        assert!(conditions_hit(&[], &mut eval));
        assert!(conditions_hit(&[""], &mut eval));
        assert!(!conditions_hit(&["zero"], &mut eval));
        assert!(!conditions_hit(&["zero", "zero"], &mut eval));
        assert!(conditions_hit(&["zero", "one"], &mut eval));
        // 評価できない条件は止める
        assert!(conditions_hit(&["broken"], &mut eval));
    }

    #[test]
    fn test_active_traps_drop_net_while_spoofing() {
        let trap = |id| Trap {
            process: OsHandle(1),
            vaddr: 0x1000,
            id,
        };
        let mut state = RunState {
            user_traps: vec![trap(0)],
            net_traps: vec![trap(NET_TRAP_ID)],
            entry_traps: vec![trap(ENTRY_TRAP_ID)],
            ..Default::default()
        };
        assert_eq!(state.active_traps().len(), 3);
        state.spoof = Some(Spoof {
            process: OsHandle(1),
            thread: OsHandle(2),
            vaddr: 0x7000,
            new_ip: 911,
        });
        let ids: Vec<u64> = state.active_traps().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, ENTRY_TRAP_ID]);
    }
}
