//! デバッガのメインロジック
//!
//! コンシューマ側の窓口。制御スレッドにメッセージを送り、停止イベントが届くまで
//! イベントリングを読んで自前のエンティティストアに反映する。
//! メモリとレジスタは制御スレッドと共有するキャッシュ越しに読む。

use crate::breakpoint::{Breakpoint, BreakpointId, BreakpointManager};
use crate::config::CtrlConfig;
use crate::ctrl::Ctrl;
use crate::disasm::{self, Instruction, MAX_INSTRUCTION_LEN};
use crate::entity::{Entity, EntityKind, EntityStore};
use crate::errors::{CtrlError, ERR_CTRL_BUSY, ERR_NOT_ATTACHED, ERR_NO_THREAD};
use crate::eval::{parse_condition, BasicEvaluator, ConditionEvaluator};
use crate::exception_codes::{ExceptionCodeFilter, ExceptionCodeKind};
use crate::parse::parse_location;
use crate::protocol::{run_flags, Event, EventKind, EventPayload, Msg, MsgKind, MsgTrap, StopCause};
use crate::range::AddrRange;
use crate::stepping::{step_out_traps, step_over_plan, StepPlan};
use crate::unwind::{self, CachedMemory};
use crate::{Deadline, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tomeru_dwarf::{DebugInfo, DebugInfoProvider, DwarfProvider};
use tomeru_target::{Arch, DebugApi, Handle, OsHandle, RegBlock, MACHINE_ID_LOCAL};
use tracing::{debug, info, warn};

/// メモリ/レジスタの読み込みを待つ時間
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// メッセージをリングに積むのを待つ時間
const PUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// 停止の情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopInfo {
    pub cause: StopCause,
    pub process: OsHandle,
    pub thread: OsHandle,
    /// 停止した命令のアドレス（分からなければ0）
    pub ip: u64,
    pub exception_code: u32,
    /// Launch/Attachのpid
    pub pid: u64,
    /// Errorで止まったときの理由
    pub message: String,
}

impl StopInfo {
    fn from_event(event: &Event) -> Self {
        Self {
            cause: event.cause,
            process: event.parent,
            thread: event.entity,
            ip: event.rip,
            exception_code: event.exception_code,
            pid: event.entity_id,
            message: event.string.clone(),
        }
    }

    fn into_result(self) -> Result<Self> {
        if self.cause == StopCause::Error {
            let message = if self.message.is_empty() {
                "control thread reported an error".to_string()
            } else {
                self.message
            };
            return Err(CtrlError::User(message).into());
        }
        Ok(self)
    }
}

/// バックトレースの1フレーム
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub regs: RegBlock,
    /// `シンボル+オフセット`（分からなければNone）
    pub symbol: Option<String>,
}

/// デバッガ
pub struct Debugger {
    /// 制御スレッド
    ctrl: Ctrl,
    /// イベントから組み立てたエンティティの木
    entities: EntityStore,
    /// デバッグ情報プロバイダ（制御スレッドと共有）
    debug_info: Arc<dyn DebugInfoProvider>,
    /// モジュールごとのデバッグ情報
    module_infos: HashMap<Handle, Arc<dyn DebugInfo>>,
    /// ブレークポイント管理
    breakpoint_manager: BreakpointManager,
    exception_filter: ExceptionCodeFilter,
    next_msg_id: u64,
    /// 注目しているプロセスとスレッド
    process: Option<OsHandle>,
    thread: Option<OsHandle>,
    /// 停止を待つ上限（Noneなら待ち続ける）
    stop_timeout: Option<Duration>,
    /// デバッグ文字列やエラーなど、ユーザーに見せる通知
    notices: Vec<String>,
}

impl Debugger {
    /// 新しいデバッガを作成する（DWARFのプロバイダと既定の条件評価器を使う）
    pub fn new(api: Arc<dyn DebugApi>, config: CtrlConfig) -> Result<Self> {
        Self::with_parts(api, Arc::new(BasicEvaluator), Arc::new(DwarfProvider::new()), config)
    }

    /// 部品を指定してデバッガを作成する
    pub fn with_parts(
        api: Arc<dyn DebugApi>,
        evaluator: Arc<dyn ConditionEvaluator>,
        debug_info: Arc<dyn DebugInfoProvider>,
        config: CtrlConfig,
    ) -> Result<Self> {
        let ctrl = Ctrl::spawn(api, evaluator, debug_info.clone(), config)?;
        Ok(Self {
            ctrl,
            entities: EntityStore::new(),
            debug_info,
            module_infos: HashMap::new(),
            breakpoint_manager: BreakpointManager::new(),
            exception_filter: ExceptionCodeFilter::default_stops(),
            next_msg_id: 0,
            process: None,
            thread: None,
            stop_timeout: None,
            notices: Vec::new(),
        })
    }

    /// 停止を待つ上限を設定する
    pub fn set_stop_timeout(&mut self, timeout: Option<Duration>) {
        self.stop_timeout = timeout;
    }

    pub fn ctrl(&self) -> &Ctrl {
        &self.ctrl
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn process(&self) -> Option<OsHandle> {
        self.process
    }

    pub fn thread(&self) -> Option<OsHandle> {
        self.thread
    }

    fn require_process(&self) -> Result<OsHandle> {
        self.process.ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))
    }

    fn require_thread(&self) -> Result<(OsHandle, OsHandle)> {
        let process = self.require_process()?;
        let thread = self.thread.ok_or_else(|| anyhow::anyhow!(ERR_NO_THREAD))?;
        Ok((process, thread))
    }

    fn arch_of(&self, entity: OsHandle) -> Arch {
        self.entities
            .from_handle(Handle::local(entity))
            .and_then(|id| self.entities.get(id))
            .map(|e| e.arch)
            .filter(|arch| *arch != Arch::Null)
            .unwrap_or_else(Arch::host)
    }

    /// 実行可能ファイルを起動する
    ///
    /// プロセスのイベントは次の実行で届くので、戻った時点ではまだ
    /// エンティティストアにプロセスはない。
    pub fn launch(&mut self, program: &str, args: &[String]) -> Result<u32> {
        let mut msg = Msg::new(MsgKind::Launch);
        msg.path = program.to_string();
        msg.cmd_line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect();
        msg.env_inherit = true;
        let stop = self.send(msg)?.into_result()?;
        info!("Launched {} (pid {})", program, stop.pid);
        Ok(stop.pid as u32)
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(&mut self, pid: u32) -> Result<()> {
        let mut msg = Msg::new(MsgKind::Attach);
        msg.entity_id = pid as u64;
        let stop = self.send(msg)?;
        if stop.cause != StopCause::Finished {
            return Err(CtrlError::User(format!(
                "Attach to {} stopped by {}: {}",
                pid,
                stop.cause.name(),
                stop.message
            ))
            .into());
        }
        Ok(())
    }

    /// 実行する（`stop_on_entry`ならエントリポイントでも止める）
    pub fn run(&mut self, stop_on_entry: bool) -> Result<StopInfo> {
        let mut msg = self.targeted(MsgKind::Run);
        if stop_on_entry {
            msg.run_flags |= run_flags::STOP_ON_ENTRY_POINT;
        }
        msg.user_bps = self.breakpoint_manager.enabled_specs();
        self.send(msg)?.into_result()
    }

    /// 実行を継続する
    pub fn continue_execution(&mut self) -> Result<StopInfo> {
        self.run(false)
    }

    /// トラップネットを張って実行する
    pub fn run_with_traps(&mut self, traps: Vec<MsgTrap>) -> Result<StopInfo> {
        let mut msg = self.targeted(MsgKind::Run);
        msg.traps = traps;
        msg.user_bps = self.breakpoint_manager.enabled_specs();
        self.send(msg)?.into_result()
    }

    /// 1命令ステップイン
    pub fn step_into_inst(&mut self) -> Result<StopInfo> {
        self.require_thread()?;
        let msg = self.targeted(MsgKind::SingleStep);
        self.send(msg)?.into_result()
    }

    /// 1命令ステップオーバー（呼び出しは戻るまで走らせる）
    pub fn step_over_inst(&mut self) -> Result<StopInfo> {
        let (process, thread) = self.require_thread()?;
        let regs = self.registers()?;
        let ip = regs.ip();
        let code = self.read_memory_prefix(process, ip, MAX_INSTRUCTION_LEN);
        let call = match disasm::call_at(&code, ip, self.arch_of(thread)) {
            Ok(call) => call,
            Err(e) => {
                debug!("Could not decode instruction at {:#x}: {}", ip, e);
                None
            }
        };
        match step_over_plan(call.as_ref()) {
            StepPlan::SingleStep => self.step_into_inst(),
            StepPlan::Run(traps) => self.run_with_traps(traps),
        }
    }

    /// 現在の関数から抜けるまで実行する
    pub fn step_out(&mut self) -> Result<StopInfo> {
        let (process, _) = self.require_thread()?;
        let regs = self.registers()?;
        let ip = regs.ip();
        let memory = CachedMemory {
            cache: self.ctrl.memory(),
            process: Handle::local(process),
            deadline: Deadline::after(READ_TIMEOUT),
        };
        let module = self.module_image_for(process, ip);
        let mut caller = regs;
        let step = unwind::step(&memory, module.as_deref(), &mut caller);
        if step.flags.is_error() || caller.ip() == 0 {
            return Err(CtrlError::Unwind { ip }.into());
        }
        self.run_with_traps(step_out_traps(caller.ip()))
    }

    /// 実行中のターゲットを止める
    pub fn halt(&self) -> Result<()> {
        self.ctrl.halt()
    }

    /// プロセスを終了させる
    pub fn kill(&mut self) -> Result<StopInfo> {
        let process = self.require_process()?;
        let mut msg = Msg::new(MsgKind::Kill);
        msg.machine_id = MACHINE_ID_LOCAL;
        msg.entity = process;
        self.send(msg)?.into_result()
    }

    /// プロセスから切り離す
    pub fn detach(&mut self) -> Result<StopInfo> {
        let process = self.require_process()?;
        let mut msg = Msg::new(MsgKind::Detach);
        msg.machine_id = MACHINE_ID_LOCAL;
        msg.entity = process;
        self.send(msg)?.into_result()
    }

    /// 既定のエントリポイント名を差し替える
    pub fn set_user_entry_points(&mut self, names: Vec<String>) -> Result<()> {
        let mut msg = Msg::new(MsgKind::SetUserEntryPoints);
        msg.entry_points = names;
        self.send(msg)?.into_result()?;
        Ok(())
    }

    /// モジュールのデバッグ情報のパスを差し替える
    pub fn set_module_debug_info_path(&mut self, module: OsHandle, path: &str) -> Result<()> {
        let mut msg = Msg::new(MsgKind::SetModuleDebugInfoPath);
        msg.machine_id = MACHINE_ID_LOCAL;
        msg.entity = module;
        msg.parent = self.process.unwrap_or_default();
        msg.path = path.to_string();
        self.send(msg)?.into_result()?;
        Ok(())
    }

    /// 例外コードごとに止めるかを切り替える
    pub fn set_exception_stop(&mut self, kind: ExceptionCodeKind, stop: bool) {
        self.exception_filter.set(kind, stop);
    }

    /// ブレークポイントを設定する
    ///
    /// `main`, `main+0x10`, `src/main.rs:42`, `0x401000` と、後ろに `if <条件式>` を受け付ける。
    pub fn add_breakpoint(&mut self, location: &str) -> Result<BreakpointId> {
        let spec = parse_location(location)?;
        if !spec.condition.is_empty() {
            parse_condition(&spec.condition)?;
        }
        Ok(self.breakpoint_manager.add(spec))
    }

    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<Breakpoint> {
        self.breakpoint_manager.remove(id)
    }

    pub fn set_breakpoint_enabled(&mut self, id: BreakpointId, enabled: bool) -> Result<()> {
        self.breakpoint_manager.set_enabled(id, enabled)
    }

    pub fn set_breakpoint_condition(&mut self, id: BreakpointId, condition: &str) -> Result<()> {
        if !condition.trim().is_empty() {
            parse_condition(condition)?;
        }
        self.breakpoint_manager.set_condition(id, condition)
    }

    /// すべてのブレークポイントを取得する
    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoint_manager.all()
    }

    /// 注目するスレッドを切り替える
    pub fn select_thread(&mut self, thread: OsHandle) -> Result<()> {
        let id = self
            .entities
            .from_handle(Handle::local(thread))
            .filter(|id| self.entities.get(*id).map(|e| e.kind == EntityKind::Thread).unwrap_or(false))
            .ok_or(CtrlError::UnknownEntity(Handle::local(thread)))?;
        let process = self
            .entities
            .ancestor_from_kind(id, EntityKind::Process)
            .and_then(|p| self.entities.get(p))
            .map(|p| p.handle.os);
        self.thread = Some(thread);
        self.process = process.or(self.process);
        Ok(())
    }

    /// 注目しているプロセスのスレッド
    pub fn threads(&self) -> Vec<&Entity> {
        self.children_of_process(EntityKind::Thread)
    }

    /// 注目しているプロセスのモジュール
    pub fn modules(&self) -> Vec<&Entity> {
        self.children_of_process(EntityKind::Module)
    }

    fn children_of_process(&self, kind: EntityKind) -> Vec<&Entity> {
        let Some(process) = self.process.and_then(|p| self.entities.from_handle(Handle::local(p))) else {
            return Vec::new();
        };
        self.entities
            .children_of_kind(process, kind)
            .into_iter()
            .filter_map(|id| self.entities.get(id))
            .collect()
    }

    /// 注目しているスレッドのレジスタ
    pub fn registers(&self) -> Result<RegBlock> {
        let (_, thread) = self.require_thread()?;
        self.ctrl
            .regs()
            .read(Handle::local(thread), self.arch_of(thread))
            .ok_or_else(|| CtrlError::TargetRead { what: "registers", addr: 0 }.into())
    }

    /// メモリを読む（すべて読めなければエラー）
    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let process = self.require_process()?;
        let range = AddrRange::from_len(addr, len as u64);
        self.ctrl
            .memory()
            .read_exact(Handle::local(process), range, Deadline::after(READ_TIMEOUT))
            .map(|(data, _)| data)
            .ok_or_else(|| CtrlError::TargetRead { what: "memory", addr }.into())
    }

    /// メモリに書く（キャッシュにも反映される）
    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        let process = self.require_process()?;
        if !self.ctrl.memory().write(Handle::local(process), addr, data) {
            return Err(CtrlError::DebugApi(format!("Failed to write {} bytes at {:#x}", data.len(), addr)).into());
        }
        Ok(())
    }

    /// 先頭から読めたところまで
    fn read_memory_prefix(&self, process: OsHandle, addr: u64, len: usize) -> Vec<u8> {
        let range = AddrRange::from_len(addr, len as u64);
        let mut slice = self
            .ctrl
            .memory()
            .read(Handle::local(process), range, Deadline::after(READ_TIMEOUT));
        let good = slice.good_prefix_len();
        slice.data.truncate(good);
        slice.data
    }

    /// 現在位置から逆アセンブルする
    pub fn disassemble_at_ip(&self, count: usize) -> Result<Vec<Instruction>> {
        let (process, thread) = self.require_thread()?;
        let ip = self.registers()?.ip();
        let code = self.read_memory_prefix(process, ip, count * MAX_INSTRUCTION_LEN);
        if code.is_empty() {
            return Err(CtrlError::TargetRead { what: "memory", addr: ip }.into());
        }
        disasm::disassemble(&code, ip, self.arch_of(thread), count)
    }

    /// 注目しているスレッドのバックトレース
    pub fn backtrace(&self) -> Result<Vec<Frame>> {
        let (process, _) = self.require_thread()?;
        let regs = self.registers()?;
        let memory = CachedMemory {
            cache: self.ctrl.memory(),
            process: Handle::local(process),
            deadline: Deadline::after(READ_TIMEOUT),
        };
        let module_for = |ip: u64| self.module_image_for(process, ip);
        let result = unwind::unwind(&memory, &module_for, regs);
        if result.flags.is_error() {
            debug!("Unwind stopped early after {} frames", result.frames.len());
        }
        Ok(result
            .frames
            .into_iter()
            .enumerate()
            .map(|(index, regs)| Frame {
                index,
                symbol: self.symbolize(regs.ip()),
                regs,
            })
            .collect())
    }

    fn module_image_for(&self, process: OsHandle, ip: u64) -> Option<Arc<crate::cache::ModuleImageInfo>> {
        let process = self.entities.from_handle(Handle::local(process))?;
        let module = self.entities.module_from_process_vaddr(process, ip)?;
        let handle = self.entities.get(module)?.handle;
        self.ctrl.modules().info(handle)
    }

    /// アドレスを`シンボル+オフセット`にする
    pub fn symbolize(&self, addr: u64) -> Option<String> {
        let process = self.entities.from_handle(Handle::local(self.process?))?;
        let module = self.entities.get(self.entities.module_from_process_vaddr(process, addr)?)?;
        let info = self.module_infos.get(&module.handle)?;
        let voff = addr - module.vaddr_range().min;
        let symbol = info.symbol_from_voff(voff)?;
        let name = if symbol.demangled_name.is_empty() {
            symbol.name.clone()
        } else {
            symbol.demangled_name.clone()
        };
        let offset = voff - symbol.voff;
        let mut out = if offset == 0 {
            name
        } else {
            format!("{}+{:#x}", name, offset)
        };
        if let Some(line) = info.line_from_voff(voff) {
            out.push_str(&format!(" at {}:{}", line.file, line.line));
        }
        Some(out)
    }

    /// シンボル名からアドレスを解決する（読み込まれたモジュールすべてから探す）
    pub fn resolve_symbol(&self, name: &str) -> Option<u64> {
        self.modules().into_iter().find_map(|module| {
            let info = self.module_infos.get(&module.handle)?;
            let voff = info
                .voff_from_symbol(name)
                .or_else(|| info.global_variable_voff(name))?;
            Some(module.vaddr_range().min + voff)
        })
    }

    /// 届いているイベントを待たずに取り込む
    pub fn pump_events(&mut self) {
        let events = self.ctrl.channels().pop_events();
        for event in &events {
            self.absorb(event);
        }
    }

    /// 溜まった通知を取り出す
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    /// 注目しているプロセスとスレッドを宛先にしたメッセージ
    fn targeted(&self, kind: MsgKind) -> Msg {
        let mut msg = Msg::new(kind);
        msg.machine_id = MACHINE_ID_LOCAL;
        msg.entity = self.thread.unwrap_or_default();
        msg.parent = self.process.unwrap_or_default();
        msg
    }

    fn deadline(&self) -> Deadline {
        match self.stop_timeout {
            Some(timeout) => Deadline::after(timeout),
            None => Deadline::NEVER,
        }
    }

    /// メッセージを送り、対応する停止イベントまで待つ
    fn send(&mut self, mut msg: Msg) -> Result<StopInfo> {
        self.next_msg_id += 1;
        msg.msg_id = self.next_msg_id;
        msg.exception_code_filters = self.exception_filter;
        debug!("Sending {:?} (msg {})", msg.kind, msg.msg_id);

        let channels = self.ctrl.channels().clone();
        if !channels.push_msgs(std::slice::from_ref(&msg), Deadline::after(PUSH_TIMEOUT)) {
            return Err(anyhow::anyhow!(ERR_CTRL_BUSY));
        }

        let deadline = self.deadline();
        loop {
            let events = channels.wait_events(deadline);
            if events.is_empty() && (deadline.expired() || channels.is_closed()) {
                return Err(CtrlError::Deadline("waiting for the target to stop").into());
            }
            let mut stop = None;
            for event in &events {
                self.absorb(event);
                if event.kind == EventKind::Stopped && event.msg_id == msg.msg_id {
                    stop = Some(StopInfo::from_event(event));
                }
            }
            if let Some(stop) = stop {
                debug!("msg {} stopped: {}", msg.msg_id, stop.cause.name());
                return Ok(stop);
            }
        }
    }

    /// イベントをエンティティストアと注目先に反映する
    fn absorb(&mut self, event: &Event) {
        self.entities.apply_events(std::slice::from_ref(event));
        match event.payload() {
            EventPayload::NewProc { process, .. } => {
                if self.process.is_none() {
                    self.process = Some(process.os);
                }
            }
            EventPayload::NewThread { thread, process, .. } => {
                if self.thread.is_none() && self.process == Some(process.os) {
                    self.thread = Some(thread.os);
                }
            }
            EventPayload::EndProc { process, .. } => {
                if self.process == Some(process.os) {
                    self.process = None;
                    self.thread = None;
                }
                let entities = &self.entities;
                self.module_infos
                    .retain(|module, _| entities.from_handle(*module).is_some());
            }
            EventPayload::EndThread { thread } => {
                if self.thread == Some(thread.os) {
                    self.thread = self.threads().first().map(|t| t.handle.os);
                }
            }
            EventPayload::EndModule { module } => {
                self.module_infos.remove(&module);
            }
            EventPayload::ModuleDebugInfoPathChange { module, path, .. } => {
                match self.debug_info.open(Path::new(path)) {
                    Some(info) => {
                        self.module_infos.insert(module, info);
                    }
                    None => {
                        self.module_infos.remove(&module);
                    }
                }
            }
            EventPayload::DebugString { thread, text, .. } => {
                self.notices.push(format!("[{}] {}", thread.os, text));
            }
            EventPayload::Error { message } => {
                warn!("Control thread error: {}", message);
                self.notices.push(format!("error: {}", message));
            }
            EventPayload::Stopped { thread, process, .. } => {
                let is_thread = self
                    .entities
                    .from_handle(thread)
                    .and_then(|id| self.entities.get(id))
                    .map(|e| e.kind == EntityKind::Thread)
                    .unwrap_or(false);
                if is_thread {
                    self.thread = Some(thread.os);
                    if !process.os.is_none() {
                        self.process = Some(process.os);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_stop_becomes_err() {
        let mut event = Event::stopped(StopCause::Error);
        event.string = "Could not find an entry point for the process".to_string();
        let err = StopInfo::from_event(&event).into_result().unwrap_err();
        assert_eq!(err.to_string(), "Could not find an entry point for the process");

        let event = Event::stopped(StopCause::Error);
        assert!(StopInfo::from_event(&event).into_result().is_err());
    }

    #[test]
    fn test_stop_info_from_event() {
        let mut event = Event::stopped(StopCause::UserBreakpoint);
        event.entity = OsHandle(2);
        event.parent = OsHandle(1);
        event.rip = 0x401000;
        let stop = StopInfo::from_event(&event).into_result().unwrap();
        assert_eq!((stop.process, stop.thread, stop.ip), (OsHandle(1), OsHandle(2), 0x401000));
    }
}
