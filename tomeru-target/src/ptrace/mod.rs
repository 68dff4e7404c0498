//! Linux ptrace による [`DebugApi`] 実装
//!
//! すべてのptrace操作はトレーサスレッドから行う必要があるため、
//! `launch`/`attach`/`run`/`read_regs` などは制御スレッドから呼ぶこと。
//! `halt`だけは別スレッドから呼べる（SIGSTOPを送るだけ）。
//!
//! ハンドルは上位8ビットに種別、下位にpid/tid/連番を持つ。

mod breakpoint;
mod memory;
mod process;
mod registers;

pub use breakpoint::{TrapPatches, INT3_OPCODE};
pub use memory::{modules_from_mappings, parse_maps_line, MappedModule, Memory, MemoryMapping};
pub use registers::Registers;

use crate::{
    Arch, DebugApi, DebugEvent, DebugEventKind, ExceptionKind, LaunchParams, OsHandle, RegBlock,
    Result, RunCtrls, TargetError,
};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const KIND_SHIFT: u64 = 56;
const KIND_PROCESS: u64 = 1;
const KIND_THREAD: u64 = 2;
const KIND_MODULE: u64 = 3;
const ID_MASK: u64 = (1 << KIND_SHIFT) - 1;

/// pid → プロセスハンドル
pub fn process_handle(pid: i32) -> OsHandle {
    OsHandle((KIND_PROCESS << KIND_SHIFT) | pid as u32 as u64)
}

/// tid → スレッドハンドル
pub fn thread_handle(tid: i32) -> OsHandle {
    OsHandle((KIND_THREAD << KIND_SHIFT) | tid as u32 as u64)
}

fn module_handle(id: u64) -> OsHandle {
    OsHandle((KIND_MODULE << KIND_SHIFT) | (id & ID_MASK))
}

/// プロセスハンドル → pid
pub fn pid_of(handle: OsHandle) -> Option<i32> {
    decode(handle, KIND_PROCESS)
}

/// スレッドハンドル → tid
pub fn tid_of(handle: OsHandle) -> Option<i32> {
    decode(handle, KIND_THREAD)
}

fn decode(handle: OsHandle, kind: u64) -> Option<i32> {
    if handle.0 >> KIND_SHIFT != kind {
        return None;
    }
    i32::try_from(handle.0 & ID_MASK).ok()
}

/// フォールト系シグナルを例外コードに対応づける
pub fn exception_code_for_signal(sig: Signal) -> Option<u64> {
    match sig {
        Signal::SIGSEGV => Some(0xC000_0005),
        Signal::SIGILL => Some(0xC000_001D),
        Signal::SIGFPE => Some(0xC000_0094),
        Signal::SIGBUS => Some(0xC000_0006),
        _ => None,
    }
}

struct ThreadState {
    pid: i32,
    /// ptrace-stop中か
    stopped: bool,
    /// 送ったSIGSTOPがまだ届いていない
    sigstop_pending: bool,
    /// 次に再開するときに渡すシグナル
    pending_signal: Option<Signal>,
    /// 直前の例外（rip, シグナル）
    last_fault: Option<(u64, Signal)>,
}

struct ProcessState {
    main_tid: i32,
    modules: Vec<(OsHandle, MappedModule)>,
    /// killで指定された終了コード
    kill_code: Option<u32>,
}

#[derive(Default)]
struct PtraceState {
    processes: HashMap<i32, ProcessState>,
    threads: HashMap<i32, ThreadState>,
    /// 次の`run`で返すイベント
    pending: VecDeque<DebugEvent>,
    /// クローンイベントより先に停止が届いた新スレッド
    early_stops: HashSet<i32>,
    next_module: u64,
}

/// ptraceベースのデバッグAPI
pub struct PtraceDebugApi {
    state: Mutex<PtraceState>,
    /// halt用のpid一覧（runがstateを握っていても触れるよう分けておく）
    halt_pids: Mutex<Vec<i32>>,
    halt_requested: AtomicBool,
    mem_gen: AtomicU64,
    reg_gen: AtomicU64,
}

impl PtraceDebugApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PtraceState {
                next_module: 1,
                ..Default::default()
            }),
            halt_pids: Mutex::new(Vec::new()),
            halt_requested: AtomicBool::new(false),
            mem_gen: AtomicU64::new(1),
            reg_gen: AtomicU64::new(1),
        }
    }

    /// 起動/アタッチ直後のイベントを積む
    fn register_process(&self, state: &mut PtraceState, pid: i32, tids: &[i32]) {
        let main_tid = tids.first().copied().unwrap_or(pid);
        state.processes.insert(
            pid,
            ProcessState {
                main_tid,
                modules: Vec::new(),
                kill_code: None,
            },
        );
        for &tid in tids {
            state.threads.insert(
                tid,
                ThreadState {
                    pid,
                    stopped: true,
                    sigstop_pending: false,
                    pending_signal: None,
                    last_fault: None,
                },
            );
        }
        self.halt_pids.lock().push(pid);

        let mut ev = DebugEvent::new(DebugEventKind::CreateProcess);
        ev.arch = Arch::X64;
        ev.process = process_handle(pid);
        ev.thread = thread_handle(main_tid);
        ev.code = pid as u64;
        ev.string = process::exe_path(pid);
        state.pending.push_back(ev);

        for &tid in tids {
            let ev = self.create_thread_event(pid, tid, false);
            state.pending.push_back(ev);
        }

        let module_events = state.rescan_modules(pid);
        state.pending.extend(module_events);
        tracing::debug!("registered process {} with {} threads", pid, tids.len());
    }

    fn create_thread_event(&self, pid: i32, tid: i32, is_clone: bool) -> DebugEvent {
        let mut ev = DebugEvent::new(DebugEventKind::CreateThread);
        ev.arch = Arch::X64;
        ev.process = process_handle(pid);
        ev.thread = thread_handle(tid);
        ev.code = tid as u64;
        ev.string = process::thread_name(pid, tid);
        if let Ok(raw) = Registers::new(tid).read_raw() {
            ev.instruction_pointer = raw.rip;
            ev.tls_root = raw.fs_base;
            let memory = Memory::new(pid);
            ev.stack_base = if tid == pid && !is_clone {
                memory.main_stack_top().unwrap_or(0)
            } else {
                memory.mapping_end_containing(raw.rsp).unwrap_or(0)
            };
        }
        ev
    }
}

impl Default for PtraceDebugApi {
    fn default() -> Self {
        Self::new()
    }
}

impl PtraceState {
    fn process_of(&self, tid: i32) -> i32 {
        self.threads.get(&tid).map(|t| t.pid).unwrap_or(tid)
    }

    /// /proc/pid/maps を読み直してモジュールの増減をイベントにする
    fn rescan_modules(&mut self, pid: i32) -> Vec<DebugEvent> {
        let mappings = match Memory::new(pid).get_mappings() {
            Ok(mappings) => mappings,
            Err(_) => return Vec::new(),
        };
        let current = modules_from_mappings(&mappings);
        let mut next_module = self.next_module;
        let process = match self.processes.get_mut(&pid) {
            Some(process) => process,
            None => return Vec::new(),
        };

        let mut events = Vec::new();
        process.modules.retain(|(handle, module)| {
            let alive = current.iter().any(|m| m.path == module.path && m.base == module.base);
            if !alive {
                let mut ev = DebugEvent::new(DebugEventKind::UnloadModule);
                ev.process = process_handle(pid);
                ev.module = *handle;
                ev.address = module.base;
                ev.string = module.path.clone();
                events.push(ev);
            }
            alive
        });
        for module in current {
            if process
                .modules
                .iter()
                .any(|(_, m)| m.path == module.path && m.base == module.base)
            {
                continue;
            }
            let handle = module_handle(next_module);
            next_module += 1;
            let mut ev = DebugEvent::new(DebugEventKind::LoadModule);
            ev.arch = Arch::X64;
            ev.process = process_handle(pid);
            ev.module = handle;
            ev.address = module.base;
            ev.size = module.end - module.base;
            ev.string = module.path.clone();
            events.push(ev);
            process.modules.push((handle, module));
        }
        self.next_module = next_module;
        events
    }

    /// スレッドを再開する。再開したスレッド数を返す
    fn resume(&mut self, ctrls: &RunCtrls) -> Result<usize> {
        let take_signal = |thread: &mut ThreadState| {
            let sig = thread.pending_signal.take();
            if ctrls.ignore_previous_exception {
                None
            } else {
                sig
            }
        };

        if let Some(tid) = tid_of(ctrls.single_step_thread) {
            let thread = self
                .threads
                .get_mut(&tid)
                .ok_or(TargetError::UnknownThread(ctrls.single_step_thread))?;
            let sig = take_signal(thread);
            ptrace::step(Pid::from_raw(tid), sig)?;
            thread.stopped = false;
            return Ok(1);
        }

        let mut resumed = 0;
        for (&tid, thread) in self.threads.iter_mut() {
            if !thread.stopped {
                continue;
            }
            if ctrls.is_frozen(thread_handle(tid), process_handle(thread.pid)) {
                continue;
            }
            let sig = take_signal(thread);
            match ptrace::cont(Pid::from_raw(tid), sig) {
                Ok(()) => {
                    thread.stopped = false;
                    resumed += 1;
                }
                Err(e) => tracing::warn!("failed to resume thread {}: {}", tid, e),
            }
        }
        Ok(resumed)
    }

    /// 止まっていないスレッドをすべて止める
    fn stop_all(&mut self, traps: &TrapPatches) {
        let running: Vec<i32> = self
            .threads
            .iter()
            .filter(|(_, t)| !t.stopped)
            .map(|(&tid, _)| tid)
            .collect();

        for tid in running {
            let pid = self.process_of(tid);
            let already_sent = self.threads.get(&tid).map(|t| t.sigstop_pending).unwrap_or(false);
            if !already_sent {
                unsafe {
                    nix::libc::syscall(nix::libc::SYS_tgkill, pid, tid, nix::libc::SIGSTOP);
                }
            }

            loop {
                let status = match waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL)) {
                    Ok(status) => status,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        tracing::warn!("waitpid({}) while stopping: {}", tid, e);
                        break;
                    }
                };
                match status {
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                        if let Some(thread) = self.threads.get_mut(&tid) {
                            thread.stopped = true;
                            thread.sigstop_pending = false;
                        }
                        break;
                    }
                    WaitStatus::Stopped(_, sig) => {
                        // 別の理由で先に止まった。SIGSTOPはまだ届いていない
                        if sig == Signal::SIGTRAP {
                            rewind_if_trap(tid, pid, traps);
                        } else if let Some(thread) = self.threads.get_mut(&tid) {
                            thread.pending_signal = Some(sig);
                        }
                        if let Some(thread) = self.threads.get_mut(&tid) {
                            thread.stopped = true;
                            thread.sigstop_pending = true;
                        }
                        break;
                    }
                    WaitStatus::PtraceEvent(..) => {
                        if let Some(thread) = self.threads.get_mut(&tid) {
                            thread.stopped = true;
                            thread.sigstop_pending = true;
                        }
                        break;
                    }
                    WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                        self.threads.remove(&tid);
                        let mut ev = DebugEvent::new(DebugEventKind::ExitThread);
                        ev.process = process_handle(pid);
                        ev.thread = thread_handle(tid);
                        self.pending.push_back(ev);
                        break;
                    }
                    _ => continue,
                }
            }
        }
    }

    /// スレッド終了/プロセス終了のイベント
    fn on_exit(&mut self, tid: i32, code: u64, events: &mut Vec<DebugEvent>) -> bool {
        let pid = self.process_of(tid);
        self.threads.remove(&tid);

        let mut ev = DebugEvent::new(DebugEventKind::ExitThread);
        ev.process = process_handle(pid);
        ev.thread = thread_handle(tid);
        ev.code = code;
        events.push(ev);

        let leader = self.processes.get(&pid).map(|p| p.main_tid == tid).unwrap_or(false);
        if !leader {
            return false;
        }

        // 残りのスレッドも終わったものとする
        let rest: Vec<i32> = self
            .threads
            .iter()
            .filter(|(_, t)| t.pid == pid)
            .map(|(&tid, _)| tid)
            .collect();
        for tid in rest {
            self.threads.remove(&tid);
            let mut ev = DebugEvent::new(DebugEventKind::ExitThread);
            ev.process = process_handle(pid);
            ev.thread = thread_handle(tid);
            events.push(ev);
        }

        let (kill_code, modules) = match self.processes.remove(&pid) {
            Some(process) => (process.kill_code, process.modules),
            None => (None, Vec::new()),
        };
        let mut ev = DebugEvent::new(DebugEventKind::ExitProcess);
        ev.process = process_handle(pid);
        ev.code = kill_code.map(u64::from).unwrap_or(code);
        for (handle, module) in modules {
            let mut unload = DebugEvent::new(DebugEventKind::UnloadModule);
            unload.process = process_handle(pid);
            unload.module = handle;
            unload.address = module.base;
            events.push(unload);
        }
        events.push(ev);
        true
    }
}

/// トラップを踏んだ直後ならripを1つ戻す
fn rewind_if_trap(tid: i32, pid: i32, traps: &TrapPatches) -> Option<(u64, u64)> {
    let regs = Registers::new(tid);
    let rip = regs.get_pc().ok()?;
    let hit = rip.wrapping_sub(1);
    let id = traps.id_at(pid, hit)?;
    regs.set_pc(hit).ok()?;
    Some((hit, id))
}

impl DebugApi for PtraceDebugApi {
    fn launch(&self, params: &LaunchParams) -> Result<u32> {
        let child = process::spawn(params)?;
        let pid = child.as_raw();
        tracing::info!("launched {} as pid {}", params.path, pid);

        let mut state = self.state.lock();
        self.register_process(&mut state, pid, &[pid]);
        state
            .pending
            .push_back(DebugEvent::new(DebugEventKind::HandshakeComplete));
        Ok(pid as u32)
    }

    fn attach(&self, pid: u32) -> Result<()> {
        let pid = pid as i32;
        let tids = process::attach_all(pid)?;
        tracing::info!("attached to pid {} ({} threads)", pid, tids.len());

        let mut state = self.state.lock();
        self.register_process(&mut state, pid, &tids);
        state
            .pending
            .push_back(DebugEvent::new(DebugEventKind::HandshakeComplete));
        Ok(())
    }

    fn kill(&self, process: OsHandle, exit_code: u32) -> Result<()> {
        let pid = pid_of(process).ok_or(TargetError::UnknownProcess(process))?;
        let mut state = self.state.lock();
        let entry = state
            .processes
            .get_mut(&pid)
            .ok_or(TargetError::UnknownProcess(process))?;
        entry.kill_code = Some(exit_code);
        signal::kill(Pid::from_raw(pid), Signal::SIGKILL)?;
        tracing::debug!("sent SIGKILL to {}", pid);
        Ok(())
    }

    fn detach(&self, process: OsHandle) -> Result<()> {
        let pid = pid_of(process).ok_or(TargetError::UnknownProcess(process))?;
        let mut state = self.state.lock();
        let entry = state
            .processes
            .remove(&pid)
            .ok_or(TargetError::UnknownProcess(process))?;

        let tids: Vec<i32> = state
            .threads
            .iter()
            .filter(|(_, t)| t.pid == pid)
            .map(|(&tid, _)| tid)
            .collect();
        for tid in tids {
            if let Some(thread) = state.threads.remove(&tid) {
                let sig = thread.pending_signal;
                if let Err(e) = ptrace::detach(Pid::from_raw(tid), sig) {
                    tracing::warn!("failed to detach thread {}: {}", tid, e);
                }
            }
            let mut ev = DebugEvent::new(DebugEventKind::ExitThread);
            ev.process = process;
            ev.thread = thread_handle(tid);
            state.pending.push_back(ev);
        }
        for (handle, module) in entry.modules {
            let mut ev = DebugEvent::new(DebugEventKind::UnloadModule);
            ev.process = process;
            ev.module = handle;
            ev.address = module.base;
            state.pending.push_back(ev);
        }
        let mut ev = DebugEvent::new(DebugEventKind::ExitProcess);
        ev.process = process;
        state.pending.push_back(ev);

        self.halt_pids.lock().retain(|p| *p != pid);
        tracing::info!("detached from {}", pid);
        Ok(())
    }

    fn halt(&self) -> Result<()> {
        self.halt_requested.store(true, Ordering::SeqCst);
        for &pid in self.halt_pids.lock().iter() {
            if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGSTOP) {
                tracing::warn!("failed to stop {}: {}", pid, e);
            }
        }
        Ok(())
    }

    fn run(&self, ctrls: &RunCtrls) -> Result<Vec<DebugEvent>> {
        let mut state = self.state.lock();
        if !state.pending.is_empty() {
            return Ok(state.pending.drain(..).collect());
        }
        if state.processes.is_empty() {
            return Err(TargetError::NoProcess.into());
        }

        let step_tid = tid_of(ctrls.single_step_thread);
        let step_pc = step_tid.and_then(|tid| Registers::new(tid).get_pc().ok());

        // トラップ設置（シングルステップするスレッドのpcは除く）
        let mut traps = TrapPatches::new();
        for trap in &ctrls.traps {
            let pid = match pid_of(trap.process) {
                Some(pid) if state.processes.contains_key(&pid) => pid,
                _ => continue,
            };
            if step_pc == Some(trap.vaddr) {
                continue;
            }
            if let Err(e) = traps.place(pid, trap.vaddr, trap.id) {
                tracing::debug!("cannot place trap at {:#x}: {}", trap.vaddr, e);
            }
        }

        let mut events = Vec::new();
        let resumed = state.resume(ctrls)?;
        if resumed == 0 {
            let mut ev = DebugEvent::new(DebugEventKind::Error);
            ev.string = "no thread is allowed to run".to_string();
            events.push(ev);
        } else {
            self.wait_for_stop(&mut state, step_tid, &traps, &mut events)?;
        }

        state.stop_all(&traps);

        traps.restore(|pid| state.processes.contains_key(&pid));

        // モジュールの増減は停止イベントより先に報告する
        let pids: Vec<i32> = state.processes.keys().copied().collect();
        self.halt_pids.lock().retain(|p| pids.contains(p));
        let mut out = Vec::new();
        for pid in pids {
            out.extend(state.rescan_modules(pid));
        }
        out.extend(events);
        out.extend(state.pending.drain(..));

        self.mem_gen.fetch_add(1, Ordering::SeqCst);
        self.reg_gen.fetch_add(1, Ordering::SeqCst);
        Ok(out)
    }

    fn read_memory(&self, process: OsHandle, addr: u64, buf: &mut [u8]) -> usize {
        match pid_of(process) {
            Some(pid) => Memory::new(pid).read_into(addr, buf),
            None => 0,
        }
    }

    fn write_memory(&self, process: OsHandle, addr: u64, data: &[u8]) -> bool {
        let pid = match pid_of(process) {
            Some(pid) => pid,
            None => return false,
        };
        let ok = Memory::new(pid).write(addr, data).is_ok();
        self.mem_gen.fetch_add(1, Ordering::SeqCst);
        ok
    }

    fn read_regs(&self, thread: OsHandle) -> Option<RegBlock> {
        let tid = tid_of(thread)?;
        Registers::new(tid).read().ok()
    }

    fn write_regs(&self, thread: OsHandle, regs: &RegBlock) -> bool {
        let tid = match tid_of(thread) {
            Some(tid) => tid,
            None => return false,
        };
        let ok = Registers::new(tid).write(regs).is_ok();
        self.reg_gen.fetch_add(1, Ordering::SeqCst);
        ok
    }

    fn stack_base(&self, thread: OsHandle) -> u64 {
        let tid = match tid_of(thread) {
            Some(tid) => tid,
            None => return 0,
        };
        let pid = self.state.lock().process_of(tid);
        let memory = Memory::new(pid);
        if tid == pid {
            return memory.main_stack_top().unwrap_or(0);
        }
        Registers::new(tid)
            .read_raw()
            .ok()
            .and_then(|raw| memory.mapping_end_containing(raw.rsp).ok())
            .unwrap_or(0)
    }

    fn tls_root(&self, thread: OsHandle) -> u64 {
        tid_of(thread)
            .and_then(|tid| Registers::new(tid).read_raw().ok())
            .map(|raw| raw.fs_base)
            .unwrap_or(0)
    }

    fn mem_gen(&self) -> u64 {
        self.mem_gen.load(Ordering::SeqCst)
    }

    fn reg_gen(&self) -> u64 {
        self.reg_gen.load(Ordering::SeqCst)
    }
}

impl PtraceDebugApi {
    /// 停止イベントが1つ出るまでwaitpidする
    fn wait_for_stop(
        &self,
        state: &mut PtraceState,
        step_tid: Option<i32>,
        traps: &TrapPatches,
        events: &mut Vec<DebugEvent>,
    ) -> Result<()> {
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    // 子がもういない
                    let pids: Vec<i32> = state.processes.keys().copied().collect();
                    for pid in pids {
                        let main_tid = state.processes.get(&pid).map(|p| p.main_tid).unwrap_or(pid);
                        state.on_exit(main_tid, 0, events);
                    }
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            match status {
                WaitStatus::Stopped(pid, sig) => {
                    let tid = pid.as_raw();
                    if !state.threads.contains_key(&tid) {
                        // クローンイベントより先に新スレッドの停止が届いた
                        state.early_stops.insert(tid);
                        continue;
                    }
                    let owner = state.process_of(tid);
                    if let Some(thread) = state.threads.get_mut(&tid) {
                        thread.stopped = true;
                    }

                    match sig {
                        Signal::SIGTRAP => {
                            if let Some(thread) = state.threads.get_mut(&tid) {
                                thread.last_fault = None;
                            }
                            let mut ev = if step_tid == Some(tid) {
                                DebugEvent::new(DebugEventKind::SingleStep)
                            } else if let Some((addr, id)) = rewind_if_trap(tid, owner, traps) {
                                let mut ev = DebugEvent::new(DebugEventKind::Breakpoint);
                                ev.address = addr;
                                ev.code = id;
                                ev
                            } else {
                                DebugEvent::new(DebugEventKind::Trap)
                            };
                            ev.arch = Arch::X64;
                            ev.process = process_handle(owner);
                            ev.thread = thread_handle(tid);
                            ev.instruction_pointer = Registers::new(tid).get_pc().unwrap_or(0);
                            if ev.address == 0 {
                                ev.address = ev.instruction_pointer;
                            }
                            events.push(ev);
                            return Ok(());
                        }
                        Signal::SIGSTOP => {
                            let swallowed = match state.threads.get_mut(&tid) {
                                Some(thread) if thread.sigstop_pending => {
                                    thread.sigstop_pending = false;
                                    true
                                }
                                _ => false,
                            };
                            if swallowed {
                                // 前回止めたときの残り。動かし直す
                                ptrace::cont(pid, None)?;
                                if let Some(thread) = state.threads.get_mut(&tid) {
                                    thread.stopped = false;
                                }
                                continue;
                            }
                            if self.halt_requested.swap(false, Ordering::SeqCst) {
                                let mut ev = DebugEvent::new(DebugEventKind::Halt);
                                ev.process = process_handle(owner);
                                ev.thread = thread_handle(tid);
                                events.push(ev);
                                return Ok(());
                            }
                            // 外部からのSIGSTOPはそのまま渡す
                            ptrace::cont(pid, Some(Signal::SIGSTOP))?;
                            if let Some(thread) = state.threads.get_mut(&tid) {
                                thread.stopped = false;
                            }
                        }
                        sig => match exception_code_for_signal(sig) {
                            Some(code) => {
                                let rip = Registers::new(tid).get_pc().unwrap_or(0);
                                let fault_addr = ptrace::getsiginfo(pid)
                                    .map(|info| unsafe { info.si_addr() } as u64)
                                    .unwrap_or(0);

                                let mut ev = DebugEvent::new(DebugEventKind::Exception);
                                ev.arch = Arch::X64;
                                ev.process = process_handle(owner);
                                ev.thread = thread_handle(tid);
                                ev.code = code;
                                ev.address = fault_addr;
                                ev.instruction_pointer = rip;
                                if sig == Signal::SIGSEGV {
                                    ev.exception_kind = if fault_addr == rip {
                                        ExceptionKind::MemoryExecute
                                    } else {
                                        ExceptionKind::MemoryRead
                                    };
                                }
                                if let Some(thread) = state.threads.get_mut(&tid) {
                                    ev.exception_repeated = thread.last_fault == Some((rip, sig));
                                    thread.last_fault = Some((rip, sig));
                                    thread.pending_signal = Some(sig);
                                }
                                events.push(ev);
                                return Ok(());
                            }
                            None => {
                                // フォールト以外のシグナルはプログラムに渡す
                                ptrace::cont(pid, Some(sig))?;
                                if let Some(thread) = state.threads.get_mut(&tid) {
                                    thread.stopped = false;
                                }
                            }
                        },
                    }
                }
                WaitStatus::PtraceEvent(pid, _, event)
                    if event == ptrace::Event::PTRACE_EVENT_CLONE as i32 =>
                {
                    let tid = pid.as_raw();
                    let owner = state.process_of(tid);
                    let new_tid = ptrace::getevent(pid)? as i32;

                    // 新スレッドは最初にSIGSTOPで止まる
                    if !state.early_stops.remove(&new_tid) {
                        loop {
                            match waitpid(Pid::from_raw(new_tid), Some(WaitPidFlag::__WALL)) {
                                Err(Errno::EINTR) => continue,
                                _ => break,
                            }
                        }
                    }
                    state.threads.insert(
                        new_tid,
                        ThreadState {
                            pid: owner,
                            stopped: true,
                            sigstop_pending: false,
                            pending_signal: None,
                            last_fault: None,
                        },
                    );
                    if let Some(thread) = state.threads.get_mut(&tid) {
                        thread.stopped = true;
                    }
                    events.push(self.create_thread_event(owner, new_tid, true));
                    return Ok(());
                }
                WaitStatus::PtraceEvent(pid, _, _) => {
                    ptrace::cont(pid, None)?;
                }
                WaitStatus::Exited(pid, code) => {
                    state.on_exit(pid.as_raw(), code as u32 as u64, events);
                    return Ok(());
                }
                WaitStatus::Signaled(pid, sig, _) => {
                    state.on_exit(pid.as_raw(), 128 + sig as u64, events);
                    return Ok(());
                }
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_encoding() {
        let p = process_handle(1234);
        let t = thread_handle(1234);
        assert_ne!(p, t);
        assert_eq!(pid_of(p), Some(1234));
        assert_eq!(tid_of(t), Some(1234));
        assert_eq!(pid_of(t), None);
        assert_eq!(tid_of(p), None);
        assert_eq!(pid_of(OsHandle::NONE), None);
        assert_eq!(pid_of(module_handle(7)), None);
    }

    #[test]
    fn test_signal_codes() {
        assert_eq!(exception_code_for_signal(Signal::SIGSEGV), Some(0xC000_0005));
        assert_eq!(exception_code_for_signal(Signal::SIGFPE), Some(0xC000_0094));
        assert_eq!(exception_code_for_signal(Signal::SIGCHLD), None);
    }

    #[test]
    fn test_run_without_process() {
        let api = PtraceDebugApi::new();
        assert!(api.run(&RunCtrls::default()).is_err());
        assert_eq!(api.read_memory(OsHandle(5), 0, &mut [0u8; 4]), 0);
        assert!(api.read_regs(OsHandle::NONE).is_none());
    }
}
