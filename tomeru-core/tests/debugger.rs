//! スクリプト駆動のデバッグAPIで、コンシューマから制御スレッドまでを通して動かす

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tomeru_core::config::{CtrlConfig, MemoryCacheConfig};
use tomeru_core::ctrl::run::{ENTRY_TRAP_ID, NET_TRAP_ID};
use tomeru_core::disasm::call_at;
use tomeru_core::errors::ERR_ENTRY_POINT_NOT_FOUND;
use tomeru_core::exception_codes::ExceptionCodeKind;
use tomeru_core::protocol::{trap_flags, MsgTrap};
use tomeru_core::stepping::{step_over_plan, StepPlan};
use tomeru_core::{Debugger, StopCause};
use tomeru_target::registers::x64;
use tomeru_target::{
    Arch, DebugApi, DebugEvent, DebugEventKind, MockApi, OsHandle, RegBlock, RegsX64, ScriptedRun,
};

const PID: u64 = 1000;
const PROCESS: OsHandle = OsHandle(1000);
const THREAD: OsHandle = OsHandle(1001);
const OTHER_THREAD: OsHandle = OsHandle(1002);
const MODULE: OsHandle = OsHandle(0x40_0000);

fn config(dir: &TempDir) -> CtrlConfig {
    CtrlConfig {
        log_dir: dir.path().to_path_buf(),
        memory: MemoryCacheConfig {
            workers: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn create_process() -> DebugEvent {
    let mut e = DebugEvent::new(DebugEventKind::CreateProcess);
    e.process = PROCESS;
    e.arch = Arch::X64;
    e.code = PID;
    e.string = "/bin/app".to_string();
    e
}

fn create_thread() -> DebugEvent {
    let mut e = DebugEvent::new(DebugEventKind::CreateThread);
    e.process = PROCESS;
    e.thread = THREAD;
    e.arch = Arch::X64;
    e.code = THREAD.0;
    e
}

fn on_thread(kind: DebugEventKind, ip: u64) -> DebugEvent {
    let mut e = DebugEvent::new(kind);
    e.process = PROCESS;
    e.thread = THREAD;
    e.address = ip;
    e.instruction_pointer = ip;
    e
}

fn scripted(thread_regs: RegBlock, events: Vec<DebugEvent>) -> ScriptedRun {
    ScriptedRun {
        set_regs: vec![(THREAD, thread_regs)],
        events,
        ..Default::default()
    }
}

fn regs(rip: u64, rsp: u64, rax: u64) -> RegBlock {
    let mut r = RegsX64::default();
    r.rip = rip;
    r.set_rsp(rsp);
    r.gpr[x64::RAX] = rax;
    RegBlock::X64(r)
}

/// 起動して、プロセスとスレッドが見えるところまで走らせる
fn started() -> (Arc<MockApi>, Debugger, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockApi::new());
    let mut debugger = Debugger::new(api.clone(), config(&dir)).unwrap();
    debugger.set_stop_timeout(Some(Duration::from_secs(10)));

    let pid = debugger.launch("/bin/app", &["-v".to_string()]).unwrap();
    assert_eq!(pid as u64, PID);
    assert_eq!(api.recorded_launches()[0].cmd_line, vec!["/bin/app", "-v"]);

    api.push_run(ScriptedRun::events(vec![
        create_process(),
        create_thread(),
        DebugEvent::new(DebugEventKind::HandshakeComplete),
    ]));
    api.push_run(ScriptedRun::events(vec![DebugEvent::new(DebugEventKind::Halt)]));
    let stop = debugger.continue_execution().unwrap();
    assert_eq!(stop.cause, StopCause::InterruptedByHalt);
    assert_eq!(debugger.process(), Some(PROCESS));
    assert_eq!(debugger.thread(), Some(THREAD));
    (api, debugger, dir)
}

#[test]
fn test_launch_run_and_kill() {
    let (api, mut debugger, _dir) = started();
    assert_eq!(debugger.threads().len(), 1);
    assert_eq!(debugger.threads()[0].handle.os, THREAD);

    api.push_run(ScriptedRun::events(vec![
        on_thread(DebugEventKind::ExitThread, 0),
        on_thread(DebugEventKind::ExitProcess, 0),
    ]));
    let stop = debugger.kill().unwrap();
    assert_eq!(stop.cause, StopCause::Finished);
    assert_eq!(api.recorded_kills(), vec![(PROCESS, 0)]);
    assert_eq!(debugger.process(), None);
    assert!(debugger.kill().is_err());
}

#[test]
fn test_detach() {
    let (api, mut debugger, _dir) = started();
    api.push_run(ScriptedRun::events(vec![on_thread(DebugEventKind::ExitProcess, 0)]));
    let stop = debugger.detach().unwrap();
    assert_eq!(stop.cause, StopCause::Finished);
    assert_eq!(api.recorded_detaches(), vec![PROCESS]);
}

#[test]
fn test_attach() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockApi::new());
    let mut debugger = Debugger::new(api.clone(), config(&dir)).unwrap();
    debugger.set_stop_timeout(Some(Duration::from_secs(10)));

    api.push_run(ScriptedRun::events(vec![
        create_process(),
        create_thread(),
        DebugEvent::new(DebugEventKind::HandshakeComplete),
    ]));
    debugger.attach(1000).unwrap();
    assert_eq!(api.recorded_attaches(), vec![1000]);
    assert_eq!(debugger.process(), Some(PROCESS));
    assert_eq!(debugger.thread(), Some(THREAD));

    debugger.halt().unwrap();
    assert_eq!(api.halt_count(), 1);
}

#[test]
fn test_exception_filter() {
    let (api, mut debugger, _dir) = started();
    let kind = ExceptionCodeKind::IntegerDivisionByZero;
    let mut fault = on_thread(DebugEventKind::Exception, 0x401010);
    fault.code = kind.code() as u64;

    // 既定では止まる
    api.push_run(ScriptedRun::events(vec![fault.clone()]));
    let stop = debugger.continue_execution().unwrap();
    assert_eq!(stop.cause, StopCause::InterruptedByException);
    assert_eq!(stop.exception_code, kind.code());

    // 無効にすると初回例外はターゲットに任せて走り続ける
    debugger.set_exception_stop(kind, false);
    api.push_run(ScriptedRun::events(vec![fault]));
    api.push_run(ScriptedRun::events(vec![DebugEvent::new(DebugEventKind::Halt)]));
    let stop = debugger.continue_execution().unwrap();
    assert_eq!(stop.cause, StopCause::InterruptedByHalt);
    assert_eq!(api.remaining_runs(), 0);
}

#[test]
fn test_launch_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockApi::new());
    api.fail_launches(true);
    let mut debugger = Debugger::new(api.clone(), config(&dir)).unwrap();
    debugger.set_stop_timeout(Some(Duration::from_secs(10)));

    let err = debugger.launch("/bin/missing", &[]).unwrap_err();
    assert!(err.to_string().contains("Failed to launch"));
    assert!(debugger.process().is_none());
}

#[test]
fn test_missing_entry_point_stops_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockApi::new());
    let mut debugger = Debugger::new(api.clone(), config(&dir)).unwrap();
    debugger.set_stop_timeout(Some(Duration::from_secs(10)));
    debugger.launch("/bin/app", &[]).unwrap();
    debugger.set_user_entry_points(vec!["app_main".to_string()]).unwrap();

    // モジュールがないのでエントリポイントは見つからない
    api.push_run(ScriptedRun::events(vec![
        create_process(),
        create_thread(),
        DebugEvent::new(DebugEventKind::HandshakeComplete),
    ]));
    let err = debugger.run(true).unwrap_err();
    assert!(err.to_string().contains(ERR_ENTRY_POINT_NOT_FOUND));
}

#[test]
fn test_conditional_breakpoint() {
    let (api, mut debugger, _dir) = started();
    debugger.add_breakpoint("0x401000 if $rax == 1").unwrap();

    // 1回目: rax == 0 なので見逃してステップで抜ける
    api.push_run(ScriptedRun {
        set_regs: vec![(THREAD, regs(0x401000, 0x7000, 0))],
        events: vec![on_thread(DebugEventKind::Breakpoint, 0x401000)],
        ..Default::default()
    });
    api.push_run(ScriptedRun::events(vec![on_thread(DebugEventKind::SingleStep, 0x401001)]));
    // 2回目: rax == 1 で止まる
    api.push_run(ScriptedRun {
        set_regs: vec![(THREAD, regs(0x401000, 0x7000, 1))],
        events: vec![on_thread(DebugEventKind::Breakpoint, 0x401000)],
        ..Default::default()
    });

    let stop = debugger.continue_execution().unwrap();
    assert_eq!(stop.cause, StopCause::UserBreakpoint);
    assert_eq!(stop.thread, THREAD);
    assert_eq!(stop.ip, 0x401000);
    assert_eq!(api.remaining_runs(), 0);

    let runs = api.recorded_runs();
    let run = &runs[runs.len() - 3];
    assert!(run.traps.iter().any(|t| t.process == PROCESS && t.vaddr == 0x401000));
    assert_eq!(runs[runs.len() - 2].single_step_thread, THREAD);
}

#[test]
fn test_invalid_condition_is_rejected() {
    let (_api, mut debugger, _dir) = started();
    assert!(debugger.add_breakpoint("main if (rax").is_err());
    let id = debugger.add_breakpoint("main").unwrap();
    assert!(debugger.set_breakpoint_condition(id, "rax = 1").is_err());
    debugger.set_breakpoint_condition(id, "rax == 1").unwrap();
    assert_eq!(debugger.breakpoints().count(), 1);
}

#[test]
fn test_step_over_survives_recursion() {
    let (api, mut debugger, _dir) = started();
    api.set_regs(THREAD, regs(0x401000, 0x7000, 0));

    // call rel32
    let call = call_at(&[0xe8, 0, 0, 0, 0], 0x401000, Arch::X64).unwrap();
    let StepPlan::Run(traps) = step_over_plan(call.as_ref()) else {
        panic!("call should be stepped over with a trap");
    };

    // 再帰の内側で戻り先に来ても、スタックポインタが違うので走り続ける
    api.push_run(ScriptedRun {
        set_regs: vec![(THREAD, regs(0x401005, 0x6000, 0))],
        events: vec![on_thread(DebugEventKind::Breakpoint, 0x401005)],
        ..Default::default()
    });
    api.push_run(ScriptedRun {
        set_regs: vec![(THREAD, regs(0x401005, 0x7000, 0))],
        events: vec![on_thread(DebugEventKind::Breakpoint, 0x401005)],
        ..Default::default()
    });

    let stop = debugger.run_with_traps(traps).unwrap();
    assert_eq!(stop.cause, StopCause::Finished);
    assert_eq!(stop.ip, 0x401005);
    assert_eq!(api.remaining_runs(), 0);
}

#[test]
fn test_single_step() {
    let (api, mut debugger, _dir) = started();
    api.push_run(ScriptedRun::events(vec![on_thread(DebugEventKind::SingleStep, 0x401003)]));
    let stop = debugger.step_into_inst().unwrap();
    assert_eq!(stop.cause, StopCause::Finished);
    assert_eq!(stop.ip, 0x401003);
    let runs = api.recorded_runs();
    assert_eq!(runs[runs.len() - 1].single_step_thread, THREAD);
}

#[test]
fn test_read_your_write() {
    let (api, debugger, _dir) = started();
    api.map_memory(PROCESS, 0x5000, &[0u8; 64]);

    assert_eq!(debugger.read_memory(0x5000, 8).unwrap(), vec![0u8; 8]);
    debugger.write_memory(0x5004, &[1, 2, 3, 4]).unwrap();
    assert_eq!(debugger.read_memory(0x5000, 8).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);

    // 配置されていないページは読めない
    assert!(debugger.read_memory(0x9000, 4).is_err());
}

#[test]
fn test_registers_follow_the_target() {
    let (api, debugger, _dir) = started();
    api.set_regs(THREAD, regs(0x401000, 0x7000, 42));
    let r = debugger.registers().unwrap();
    assert_eq!(r.ip(), 0x401000);
    assert_eq!(r.value_by_name("rax"), Some(42));
}

#[test]
fn test_spoofed_return_resumes_silently() {
    let (api, mut debugger, _dir) = started();
    api.set_regs(THREAD, regs(0x401000, 0x7000, 0));
    // callの直後: 戻りアドレスがスタックの先頭にある
    let slot = 0x6ff8;
    api.map_memory(PROCESS, slot, &0x401005u64.to_le_bytes());

    let traps = vec![
        MsgTrap::new(trap_flags::BEGIN_SPOOF_MODE, 0x402000),
        MsgTrap::new(trap_flags::END_STEPPING, 0x401005),
    ];
    // 呼び出し先の入口
    api.push_run(scripted(
        regs(0x402000, slot, 0),
        vec![on_thread(DebugEventKind::Breakpoint, 0x402000)],
    ));
    // retで差し替え先に飛んで例外になる
    let mut fault = on_thread(DebugEventKind::Exception, 911);
    fault.code = ExceptionCodeKind::AccessViolation.code() as u64;
    api.push_run(scripted(regs(911, 0x7000, 0), vec![fault]));
    // 本来の戻り先でトラップネットに掛かる
    api.push_run(ScriptedRun::events(vec![on_thread(DebugEventKind::Breakpoint, 0x401005)]));

    let stop = debugger.run_with_traps(traps).unwrap();
    assert_eq!(stop.cause, StopCause::Finished);
    assert_eq!(stop.ip, 0x401005);
    assert_eq!(api.remaining_runs(), 0);

    let runs = api.recorded_runs();
    let spoofed = &runs[runs.len() - 2];
    assert!(spoofed.traps.iter().all(|t| t.id != NET_TRAP_ID));
    let last = &runs[runs.len() - 1];
    assert!(last.traps.iter().any(|t| t.id == NET_TRAP_ID && t.vaddr == 0x401005));

    // 戻りアドレスは差し替えてから元に戻す
    let writes: Vec<Vec<u8>> = api
        .recorded_writes()
        .into_iter()
        .filter(|(p, a, _)| *p == PROCESS && *a == slot)
        .map(|(_, _, data)| data)
        .collect();
    assert_eq!(writes, vec![911u64.to_le_bytes().to_vec(), 0x401005u64.to_le_bytes().to_vec()]);
    let mut word = [0u8; 8];
    assert_eq!(api.read_memory(PROCESS, slot, &mut word), 8);
    assert_eq!(u64::from_le_bytes(word), 0x401005);

    // 差し替え先に着地したスレッドは本来の戻り先へ移される
    assert_eq!(api.read_regs(THREAD).map(|r| r.ip()), Some(0x401005));
}

#[test]
fn test_saved_stack_pointer_gates_end_stepping() {
    let (api, mut debugger, _dir) = started();
    api.set_regs(THREAD, regs(0x401000, 0x7000, 0));

    // push rbpのような命令: 1命令進めてからスタックポインタを覚える
    let traps = vec![
        MsgTrap::new(
            trap_flags::SINGLE_STEP_AFTER_HIT | trap_flags::SAVE_STACK_POINTER,
            0x401002,
        ),
        MsgTrap::new(trap_flags::END_STEPPING, 0x401010),
    ];
    // 再帰の内側: スタックポインタが違うので保存しない
    api.push_run(scripted(
        regs(0x401002, 0x6000, 0),
        vec![on_thread(DebugEventKind::Breakpoint, 0x401002)],
    ));
    api.push_run(scripted(
        regs(0x401003, 0x5ff8, 0),
        vec![on_thread(DebugEventKind::SingleStep, 0x401003)],
    ));
    api.push_run(scripted(
        regs(0x401010, 0x5ff8, 0),
        vec![on_thread(DebugEventKind::Breakpoint, 0x401010)],
    ));
    // 外側: 保存してから終わりに着く
    api.push_run(scripted(
        regs(0x401002, 0x7000, 0),
        vec![on_thread(DebugEventKind::Breakpoint, 0x401002)],
    ));
    api.push_run(scripted(
        regs(0x401003, 0x6ff8, 0),
        vec![on_thread(DebugEventKind::SingleStep, 0x401003)],
    ));
    api.push_run(scripted(
        regs(0x401010, 0x6ff8, 0),
        vec![on_thread(DebugEventKind::Breakpoint, 0x401010)],
    ));

    let stop = debugger.run_with_traps(traps).unwrap();
    assert_eq!(stop.cause, StopCause::Finished);
    assert_eq!(stop.ip, 0x401010);
    assert_eq!(api.remaining_runs(), 0);

    let runs = api.recorded_runs();
    let steps: Vec<OsHandle> = runs[runs.len() - 6..]
        .iter()
        .map(|r| r.single_step_thread)
        .filter(|t| !t.is_none())
        .collect();
    assert_eq!(steps, vec![THREAD, THREAD]);
}

#[test]
fn test_thread_on_breakpoint_steps_off_first() {
    let (api, mut debugger, _dir) = started();
    debugger.add_breakpoint("0x401000").unwrap();
    api.set_regs(THREAD, regs(0x401000, 0x7000, 0));

    // 実行の前に、ブレークポイントの上のスレッドを1命令だけ進める
    api.push_run(scripted(
        regs(0x401001, 0x7000, 0),
        vec![on_thread(DebugEventKind::SingleStep, 0x401001)],
    ));
    // 次に同じ場所へ来たときは止まる
    api.push_run(scripted(
        regs(0x401000, 0x7000, 0),
        vec![on_thread(DebugEventKind::Breakpoint, 0x401000)],
    ));

    let stop = debugger.continue_execution().unwrap();
    assert_eq!(stop.cause, StopCause::UserBreakpoint);
    assert_eq!(stop.ip, 0x401000);
    assert_eq!(api.remaining_runs(), 0);

    let runs = api.recorded_runs();
    let step = &runs[runs.len() - 2];
    assert_eq!(step.single_step_thread, THREAD);
    assert!(step.traps.is_empty());
    let run = &runs[runs.len() - 1];
    assert!(run.single_step_thread.is_none());
    assert!(run.traps.iter().any(|t| t.vaddr == 0x401000));
}

#[test]
fn test_stop_at_image_entry_point() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockApi::new());
    let mut debugger = Debugger::new(api.clone(), config(&dir)).unwrap();
    debugger.set_stop_timeout(Some(Duration::from_secs(10)));
    debugger.launch("/bin/app", &[]).unwrap();

    // ET_DYN, x86-64, エントリはベースから0x1040
    let base = MODULE.0;
    let mut header = vec![0u8; 0x2000];
    header[..4].copy_from_slice(b"\x7fELF");
    header[4] = 2;
    header[16..18].copy_from_slice(&3u16.to_le_bytes());
    header[18..20].copy_from_slice(&62u16.to_le_bytes());
    header[24..32].copy_from_slice(&0x1040u64.to_le_bytes());
    api.map_memory(PROCESS, base, &header);

    let mut load = DebugEvent::new(DebugEventKind::LoadModule);
    load.process = PROCESS;
    load.module = MODULE;
    load.arch = Arch::X64;
    load.address = base;
    load.size = header.len() as u64;
    load.string = "/nonexistent/app".to_string();

    api.push_run(ScriptedRun::events(vec![
        create_process(),
        create_thread(),
        load,
        DebugEvent::new(DebugEventKind::HandshakeComplete),
    ]));
    api.push_run(scripted(
        regs(base + 0x1040, 0x7000, 0),
        vec![on_thread(DebugEventKind::Breakpoint, base + 0x1040)],
    ));

    let stop = debugger.run(true).unwrap();
    assert_eq!(stop.cause, StopCause::EntryPoint);
    assert_eq!(stop.ip, base + 0x1040);
    assert_eq!(stop.thread, THREAD);
    assert_eq!(debugger.modules().len(), 1);

    let runs = api.recorded_runs();
    let last = &runs[runs.len() - 1];
    assert!(last
        .traps
        .iter()
        .any(|t| t.id == ENTRY_TRAP_ID && t.process == PROCESS && t.vaddr == base + 0x1040));
}

#[test]
fn test_other_thread_steps_past_trap_net() {
    let (api, mut debugger, _dir) = started();
    api.set_regs(THREAD, regs(0x401000, 0x7000, 0));

    let mut other = create_thread();
    other.thread = OTHER_THREAD;
    other.code = OTHER_THREAD.0;
    let mut other_hit = on_thread(DebugEventKind::Breakpoint, 0x401005);
    other_hit.thread = OTHER_THREAD;
    let mut other_step = on_thread(DebugEventKind::SingleStep, 0x401006);
    other_step.thread = OTHER_THREAD;

    // 別スレッドが先に戻り先を踏む: 1命令進めて走り続ける
    api.push_run(ScriptedRun::events(vec![other, other_hit]));
    api.push_run(ScriptedRun::events(vec![other_step]));
    api.push_run(scripted(
        regs(0x401005, 0x7000, 0),
        vec![on_thread(DebugEventKind::Breakpoint, 0x401005)],
    ));

    let stop = debugger
        .run_with_traps(vec![MsgTrap::new(trap_flags::END_STEPPING, 0x401005)])
        .unwrap();
    assert_eq!(stop.cause, StopCause::Finished);
    assert_eq!(stop.thread, THREAD);
    assert_eq!(api.remaining_runs(), 0);
    assert_eq!(debugger.threads().len(), 2);

    let runs = api.recorded_runs();
    assert_eq!(runs[runs.len() - 2].single_step_thread, OTHER_THREAD);
    assert!(runs[runs.len() - 1].single_step_thread.is_none());
}
