//! 制御スレッドの文脈とメッセージの振り分け

use super::log::SessionLog;
use super::run::Spoof;
use crate::cache::{ModuleImageCache, ProcessMemoryCache, RegisterCache};
use crate::config::CtrlConfig;
use crate::entity::{EntityId, EntityKind, EntityStore};
use crate::errors::CtrlError;
use crate::eval::{ConditionEvaluator, EvalScope};
use crate::exception_codes::ExceptionCodeFilter;
use crate::protocol::{Channels, Event, EventKind, Msg, MsgKind, StopCause};
use crate::range::AddrRange;
use crate::Deadline;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tomeru_dwarf::{DebugInfo, DebugInfoProvider};
use tomeru_target::{
    Arch, DebugApi, DebugEvent, DebugEventKind, Handle, LaunchParams, OsHandle, RunCtrls,
    MACHINE_ID_LOCAL,
};
use tracing::{debug, info, warn};

/// 条件式の評価などでメモリを待つ時間
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// 制御スレッドが持つすべての状態
pub struct CtrlContext {
    pub(crate) api: Arc<dyn DebugApi>,
    pub(crate) channels: Arc<Channels>,
    pub(crate) entities: EntityStore,
    pub(crate) memory: Arc<ProcessMemoryCache>,
    pub(crate) regs: Arc<RegisterCache>,
    pub(crate) modules: Arc<ModuleImageCache>,
    pub(crate) evaluator: Arc<dyn ConditionEvaluator>,
    pub(crate) debug_info: Arc<dyn DebugInfoProvider>,
    pub(crate) config: CtrlConfig,
    pub(crate) log: SessionLog,
    /// 最後に受け取ったメッセージの例外フィルタ
    pub(crate) exception_filter: ExceptionCodeFilter,
    /// OSから受け取ってまだ処理していないイベント
    pub(crate) pending: VecDeque<DebugEvent>,
    pub(crate) process_counter: u64,
    pub(crate) user_entry_points: Vec<String>,
    /// モジュールごとに開いているデバッグ情報
    pub(crate) module_debug_infos: HashMap<Handle, (String, Arc<dyn DebugInfo>)>,
}

impl CtrlContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn DebugApi>,
        channels: Arc<Channels>,
        memory: Arc<ProcessMemoryCache>,
        regs: Arc<RegisterCache>,
        modules: Arc<ModuleImageCache>,
        evaluator: Arc<dyn ConditionEvaluator>,
        debug_info: Arc<dyn DebugInfoProvider>,
        config: CtrlConfig,
    ) -> Self {
        let log = SessionLog::create(&config.log_dir);
        if let Some(path) = log.path() {
            info!("Session log: {}", path.display());
        }
        Self {
            api,
            channels,
            entities: EntityStore::new(),
            memory,
            regs,
            modules,
            evaluator,
            debug_info,
            config,
            log,
            exception_filter: ExceptionCodeFilter::default(),
            pending: VecDeque::new(),
            process_counter: 0,
            user_entry_points: Vec::new(),
            module_debug_infos: HashMap::new(),
        }
    }

    /// 制御スレッド側のエンティティストア
    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn session_log_path(&self) -> Option<&Path> {
        self.log.path()
    }

    /// イベントを自分のストアに適用してからコンシューマへ送る
    pub(crate) fn emit(&mut self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.entities.apply_events(&events);
        self.channels.push_events(&events);
    }

    pub(crate) fn emit_one(&mut self, event: Event) {
        self.emit(vec![event]);
    }

    /// 停止イベントを送る
    pub(crate) fn emit_stopped(&mut self, msg: &Msg, cause: StopCause, stop: Option<&DebugEvent>) {
        let mut event = Event::stopped(cause);
        event.msg_id = msg.msg_id;
        event.machine_id = MACHINE_ID_LOCAL;
        if let Some(stop) = stop {
            event.entity = stop.thread;
            event.parent = stop.process;
            event.exception_code = stop.code as u32;
            event.vaddr_range = AddrRange::new(stop.address, stop.address);
            event.rip = stop.instruction_pointer;
        }
        if cause == StopCause::Error {
            if let Some(message) = self.log.last_user_error() {
                event.string = message.to_string();
            }
        }
        self.log.info(format!(
            "stopped: msg={} cause={} thread={} ip={:#x}",
            msg.msg_id,
            cause.name(),
            event.entity,
            event.rip
        ));
        self.emit_one(event);
    }

    /// メッセージのバッチを処理する
    ///
    /// Run/SingleStepでバッチを打ち切る。最後にセッションログを書き出し、
    /// ユーザーエラーをErrorイベントにする。
    pub fn handle_batch(&mut self, msgs: Vec<Msg>) {
        let count = msgs.len();
        for (i, msg) in msgs.into_iter().enumerate() {
            self.exception_filter = msg.exception_code_filters;
            let ends_batch = msg.kind.ends_batch();
            self.handle_msg(&msg);
            if ends_batch {
                if i + 1 < count {
                    debug!("Dropping {} messages after {:?}", count - i - 1, msg.kind);
                }
                break;
            }
        }
        let errors = self.log.flush();
        let events: Vec<Event> = errors.into_iter().map(Event::error).collect();
        self.emit(events);
    }

    fn handle_msg(&mut self, msg: &Msg) {
        self.log.info(format!("msg {} {:?}", msg.msg_id, msg.kind));
        match msg.kind {
            MsgKind::Null => {}
            MsgKind::Launch => self.launch(msg),
            MsgKind::Attach => self.attach(msg),
            MsgKind::Kill => self.kill(msg),
            MsgKind::Detach => self.detach(msg),
            MsgKind::Run => self.run(msg),
            MsgKind::SingleStep => self.single_step(msg),
            MsgKind::SetUserEntryPoints => {
                self.user_entry_points = msg.entry_points.clone();
                self.emit_stopped(msg, StopCause::Finished, None);
            }
            MsgKind::SetModuleDebugInfoPath => self.set_module_debug_info_path(msg),
        }
    }

    fn launch(&mut self, msg: &Msg) {
        let params = LaunchParams {
            path: msg.path.clone(),
            cmd_line: msg.cmd_line.clone(),
            env: msg.env.clone(),
            env_inherit: msg.env_inherit,
            stdout_path: msg.stdout_path.clone(),
            stderr_path: msg.stderr_path.clone(),
            stdin_path: msg.stdin_path.clone(),
        };
        match self.api.launch(&params) {
            Ok(pid) => {
                info!("Launched {} as {}", msg.path, pid);
                self.log.info(format!("launched {} pid={}", msg.path, pid));
                for name in &msg.entry_points {
                    self.entities.add_entry_point(name, pid as u64);
                }
                let mut event = Event::stopped(StopCause::Finished);
                event.msg_id = msg.msg_id;
                event.entity_id = pid as u64;
                self.emit_one(event);
            }
            Err(e) => {
                let err = CtrlError::DebugApi(format!("Failed to launch {}: {}", msg.path, e));
                self.log.user_error(err.to_string());
                self.emit_stopped(msg, StopCause::Error, None);
            }
        }
    }

    fn attach(&mut self, msg: &Msg) {
        let pid = msg.entity_id as u32;
        if let Err(e) = self.api.attach(pid) {
            let err = CtrlError::DebugApi(format!("Failed to attach to {}: {}", pid, e));
            self.log.user_error(err.to_string());
            self.emit_stopped(msg, StopCause::Error, None);
            return;
        }

        let mut ctrls = RunCtrls {
            run_entities_are_unfrozen: true,
            run_entities_are_processes: true,
            ..Default::default()
        };
        loop {
            let event = self.next_event(&mut ctrls, None);
            match event.kind {
                DebugEventKind::CreateProcess => ctrls.run_entities = vec![event.process],
                DebugEventKind::HandshakeComplete => {
                    let mut stopped = Event::stopped(StopCause::Finished);
                    stopped.msg_id = msg.msg_id;
                    stopped.entity_id = pid as u64;
                    self.emit_one(stopped);
                    return;
                }
                DebugEventKind::Halt => {
                    return self.emit_stopped(msg, StopCause::InterruptedByHalt, Some(&event))
                }
                DebugEventKind::Exception => {
                    return self.emit_stopped(msg, StopCause::InterruptedByException, Some(&event))
                }
                DebugEventKind::Error => {
                    self.log.user_error(format!("Failed to attach to {}: {}", pid, event.string));
                    return self.emit_stopped(msg, StopCause::Error, Some(&event));
                }
                _ => {}
            }
        }
    }

    fn kill(&mut self, msg: &Msg) {
        let process = msg.entity;
        if let Err(e) = self.api.kill(process, msg.exit_code) {
            self.log.user_error(format!("Failed to kill {}: {}", process, e));
            self.emit_stopped(msg, StopCause::Error, None);
            return;
        }
        self.wait_for_exit(msg, process);
    }

    fn detach(&mut self, msg: &Msg) {
        let process = msg.entity;
        if let Err(e) = self.api.detach(process) {
            self.log.user_error(format!("Failed to detach from {}: {}", process, e));
            self.emit_stopped(msg, StopCause::Error, None);
            return;
        }
        self.wait_for_exit(msg, process);
    }

    /// プロセスの終了イベントまで回す
    fn wait_for_exit(&mut self, msg: &Msg, process: OsHandle) {
        let mut ctrls = RunCtrls {
            run_entities_are_unfrozen: true,
            run_entities_are_processes: true,
            run_entities: vec![process],
            ..Default::default()
        };
        loop {
            let event = self.next_event(&mut ctrls, None);
            match event.kind {
                DebugEventKind::ExitProcess if event.process == process => {
                    let mut stopped = Event::stopped(StopCause::Finished);
                    stopped.msg_id = msg.msg_id;
                    stopped.machine_id = MACHINE_ID_LOCAL;
                    stopped.entity = process;
                    self.emit_one(stopped);
                    return;
                }
                DebugEventKind::Halt => {
                    return self.emit_stopped(msg, StopCause::InterruptedByHalt, Some(&event))
                }
                DebugEventKind::Error => {
                    self.log.user_error(format!("Lost {} while waiting for exit: {}", process, event.string));
                    return self.emit_stopped(msg, StopCause::Error, Some(&event));
                }
                _ => {}
            }
        }
    }

    fn set_module_debug_info_path(&mut self, msg: &Msg) {
        let module = msg.entity_handle();
        if self.entities.from_handle(module).is_none() {
            self.log.user_error(CtrlError::UnknownEntity(module).to_string());
            self.emit_stopped(msg, StopCause::Error, None);
            return;
        }
        self.close_debug_info(module);

        let mut event = Event::new(EventKind::ModuleDebugInfoPathChange);
        event.msg_id = msg.msg_id;
        event.machine_id = module.machine_id;
        event.entity = module.os;
        event.parent = msg.parent;
        event.timestamp = file_timestamp(&msg.path);
        event.string = msg.path.clone();
        self.emit_one(event);

        self.open_debug_info(module, &msg.path);
        self.emit_stopped(msg, StopCause::Finished, None);
    }

    /// モジュールのデバッグ情報を開く
    pub(crate) fn open_debug_info(&mut self, module: Handle, path: &str) {
        if path.is_empty() {
            return;
        }
        match self.debug_info.open(Path::new(path)) {
            Some(info) => {
                debug!("Opened debug info {} for {}", path, module.os);
                self.module_debug_infos.insert(module, (path.to_string(), info));
            }
            None => {
                warn!("No debug info in {}", path);
                self.log.info(format!("no debug info in {}", path));
            }
        }
    }

    pub(crate) fn close_debug_info(&mut self, module: Handle) {
        if let Some((path, _)) = self.module_debug_infos.remove(&module) {
            self.debug_info.close(Path::new(&path));
        }
    }

    pub(crate) fn debug_info_for(&self, module: Handle) -> Option<Arc<dyn DebugInfo>> {
        self.module_debug_infos.get(&module).map(|(_, info)| info.clone())
    }

    /// プロセスのメインモジュール（最初に読み込まれたモジュール）
    pub(crate) fn main_module(&self, process: EntityId) -> Option<EntityId> {
        self.entities.child_from_kind(process, EntityKind::Module)
    }

    pub(crate) fn process_arch(&self, process: OsHandle) -> Arch {
        self.entities
            .from_handle(Handle::local(process))
            .and_then(|id| self.entities.get(id))
            .map(|e| e.arch)
            .unwrap_or_else(Arch::host)
    }

    pub(crate) fn thread_ip(&self, thread: OsHandle) -> Option<u64> {
        self.regs.ip(Handle::local(thread), Arch::Null)
    }

    pub(crate) fn thread_sp(&self, thread: OsHandle) -> Option<u64> {
        self.regs.sp(Handle::local(thread), Arch::Null)
    }

    /// 現在スプーフ中のスレッドを、OSに触れずに読むためのスコープ
    pub(crate) fn scope_for(&self, process: OsHandle, thread: OsHandle) -> ThreadScope<'_> {
        ThreadScope {
            ctx: self,
            process: Handle::local(process),
            thread: Handle::local(thread),
        }
    }

    pub(crate) fn log_spoof(&mut self, spoof: &Spoof, what: &str) {
        self.log.info(format!(
            "spoof {}: thread={} slot={:#x} ip={:#x}",
            what, spoof.thread, spoof.vaddr, spoof.new_ip
        ));
    }
}

/// 条件式の評価に使うスレッドの見え方
pub(crate) struct ThreadScope<'a> {
    ctx: &'a CtrlContext,
    process: Handle,
    thread: Handle,
}

impl EvalScope for ThreadScope<'_> {
    fn register(&self, name: &str) -> Option<u64> {
        self.ctx.regs.read(self.thread, Arch::Null)?.value_by_name(name)
    }

    fn memory(&self, vaddr: u64, size: usize) -> Option<u64> {
        let size = size.clamp(1, 8);
        let range = AddrRange::from_len(vaddr, size as u64);
        let (bytes, _) = self
            .ctx
            .memory
            .read_exact(self.process, range, Deadline::after(READ_TIMEOUT))?;
        let mut word = [0u8; 8];
        word[..size].copy_from_slice(&bytes);
        Some(u64::from_le_bytes(word))
    }

    fn symbol(&self, name: &str) -> Option<u64> {
        let entities = &self.ctx.entities;
        let process = entities.from_handle(self.process)?;
        entities
            .children_of_kind(process, EntityKind::Module)
            .into_iter()
            .find_map(|module| {
                let entity = entities.get(module)?;
                let info = self.ctx.debug_info_for(entity.handle)?;
                let voff = info
                    .global_variable_voff(name)
                    .or_else(|| info.voff_from_symbol(name))?;
                Some(entity.vaddr_range().min + voff)
            })
    }
}

/// ファイルの更新時刻（UNIX秒）。読めなければ0
pub(crate) fn file_timestamp(path: &str) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_timestamp() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().into_owned();
        assert!(file_timestamp(&path) > 0);
        assert_eq!(file_timestamp("/nonexistent/tomeru/file"), 0);
        assert_eq!(file_timestamp(""), 0);
    }
}
