//! スクリプト駆動の [`DebugApi`] 実装
//!
//! 実プロセスなしでキャッシュや実行ループを動かすために使う。
//! `run`が呼ばれるたびに、登録済みの [`ScriptedRun`] を1つ取り出して
//! レジスタを更新し、イベントを返す。

use crate::{
    DebugApi, DebugEvent, DebugEventKind, LaunchParams, OsHandle, RegBlock, Result, RunCtrls,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

const PAGE_SIZE: u64 = 0x1000;

/// 1回の`run`で起きること
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    /// イベントを返す前に書き換えるレジスタ
    pub set_regs: Vec<(OsHandle, RegBlock)>,
    /// イベントを返す前に書き換えるメモリ
    pub set_memory: Vec<(OsHandle, u64, Vec<u8>)>,
    pub events: Vec<DebugEvent>,
}

impl ScriptedRun {
    pub fn events(events: Vec<DebugEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct MockState {
    pages: HashMap<OsHandle, BTreeMap<u64, Box<[u8; PAGE_SIZE as usize]>>>,
    regs: HashMap<OsHandle, RegBlock>,
    stack_bases: HashMap<OsHandle, u64>,
    script: VecDeque<ScriptedRun>,
    runs: Vec<RunCtrls>,
    launches: Vec<LaunchParams>,
    killed: Vec<(OsHandle, u32)>,
    detached: Vec<OsHandle>,
    attached: Vec<u32>,
    writes: Vec<(OsHandle, u64, Vec<u8>)>,
    next_pid: u32,
    fail_launch: bool,
    memory_reads: u64,
}

/// スクリプト駆動のデバッグAPI
pub struct MockApi {
    state: Mutex<MockState>,
    mem_gen: AtomicU64,
    reg_gen: AtomicU64,
    halted: AtomicU64,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_pid: 1000,
                ..Default::default()
            }),
            mem_gen: AtomicU64::new(1),
            reg_gen: AtomicU64::new(1),
            halted: AtomicU64::new(0),
        }
    }

    /// 次の`run`の結果を積む
    pub fn push_run(&self, run: ScriptedRun) {
        self.state.lock().script.push_back(run);
    }

    /// 起動を失敗させる
    pub fn fail_launches(&self, fail: bool) {
        self.state.lock().fail_launch = fail;
    }

    /// メモリを配置する（ページは必要に応じて作る）
    pub fn map_memory(&self, process: OsHandle, addr: u64, data: &[u8]) {
        let mut state = self.state.lock();
        Self::store(&mut state, process, addr, data, true);
        self.mem_gen.fetch_add(1, Ordering::SeqCst);
    }

    /// スレッドのレジスタを設定する
    pub fn set_regs(&self, thread: OsHandle, regs: RegBlock) {
        self.state.lock().regs.insert(thread, regs);
        self.reg_gen.fetch_add(1, Ordering::SeqCst);
    }

    /// スレッドのレジスタを消す（以後の`read_regs`は失敗する）
    pub fn forget_regs(&self, thread: OsHandle) {
        self.state.lock().regs.remove(&thread);
        self.reg_gen.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_stack_base(&self, thread: OsHandle, base: u64) {
        self.state.lock().stack_bases.insert(thread, base);
    }

    /// 記録された実行制御
    pub fn recorded_runs(&self) -> Vec<RunCtrls> {
        self.state.lock().runs.clone()
    }

    pub fn recorded_launches(&self) -> Vec<LaunchParams> {
        self.state.lock().launches.clone()
    }

    pub fn recorded_kills(&self) -> Vec<(OsHandle, u32)> {
        self.state.lock().killed.clone()
    }

    pub fn recorded_detaches(&self) -> Vec<OsHandle> {
        self.state.lock().detached.clone()
    }

    pub fn recorded_attaches(&self) -> Vec<u32> {
        self.state.lock().attached.clone()
    }

    /// 成功した`write_memory`（順番どおり）
    pub fn recorded_writes(&self) -> Vec<(OsHandle, u64, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    /// これまでの`read_memory`の呼び出し回数
    pub fn memory_read_count(&self) -> u64 {
        self.state.lock().memory_reads
    }

    /// 未消費のスクリプト数
    pub fn remaining_runs(&self) -> usize {
        self.state.lock().script.len()
    }

    pub fn halt_count(&self) -> u64 {
        self.halted.load(Ordering::SeqCst)
    }

    fn store(state: &mut MockState, process: OsHandle, addr: u64, data: &[u8], create: bool) -> usize {
        let pages = state.pages.entry(process).or_default();
        let mut written = 0;
        for (i, byte) in data.iter().enumerate() {
            let a = addr + i as u64;
            let base = a & !(PAGE_SIZE - 1);
            let page = match pages.get_mut(&base) {
                Some(page) => page,
                None if create => pages
                    .entry(base)
                    .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize])),
                None => break,
            };
            page[(a - base) as usize] = *byte;
            written += 1;
        }
        written
    }
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugApi for MockApi {
    fn launch(&self, params: &LaunchParams) -> Result<u32> {
        let mut state = self.state.lock();
        if state.fail_launch {
            return Err(anyhow::anyhow!("Failed to launch {}", params.path));
        }
        state.launches.push(params.clone());
        let pid = state.next_pid;
        state.next_pid += 1;
        Ok(pid)
    }

    fn attach(&self, pid: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_launch {
            return Err(anyhow::anyhow!("Failed to attach to {}", pid));
        }
        state.attached.push(pid);
        Ok(())
    }

    fn kill(&self, process: OsHandle, exit_code: u32) -> Result<()> {
        self.state.lock().killed.push((process, exit_code));
        Ok(())
    }

    fn detach(&self, process: OsHandle) -> Result<()> {
        self.state.lock().detached.push(process);
        Ok(())
    }

    fn halt(&self) -> Result<()> {
        self.halted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn run(&self, ctrls: &RunCtrls) -> Result<Vec<DebugEvent>> {
        let mut state = self.state.lock();
        state.runs.push(ctrls.clone());
        let step = match state.script.pop_front() {
            Some(step) => step,
            None => {
                let mut ev = DebugEvent::new(DebugEventKind::Error);
                ev.string = "mock script exhausted".to_string();
                return Ok(vec![ev]);
            }
        };
        for (thread, regs) in step.set_regs {
            state.regs.insert(thread, regs);
        }
        for (process, addr, data) in &step.set_memory {
            Self::store(&mut state, *process, *addr, data, true);
        }
        // 実行したのでメモリもレジスタも変わりうる
        self.mem_gen.fetch_add(1, Ordering::SeqCst);
        self.reg_gen.fetch_add(1, Ordering::SeqCst);
        Ok(step.events)
    }

    fn read_memory(&self, process: OsHandle, addr: u64, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        state.memory_reads += 1;
        let pages = match state.pages.get(&process) {
            Some(pages) => pages,
            None => return 0,
        };
        let mut read = 0;
        for (i, out) in buf.iter_mut().enumerate() {
            let a = match addr.checked_add(i as u64) {
                Some(a) => a,
                None => break,
            };
            let base = a & !(PAGE_SIZE - 1);
            match pages.get(&base) {
                Some(page) => *out = page[(a - base) as usize],
                None => break,
            }
            read += 1;
        }
        read
    }

    fn write_memory(&self, process: OsHandle, addr: u64, data: &[u8]) -> bool {
        let mut state = self.state.lock();
        let written = Self::store(&mut state, process, addr, data, false);
        self.mem_gen.fetch_add(1, Ordering::SeqCst);
        if written != data.len() {
            return false;
        }
        state.writes.push((process, addr, data.to_vec()));
        true
    }

    fn read_regs(&self, thread: OsHandle) -> Option<RegBlock> {
        self.state.lock().regs.get(&thread).copied()
    }

    fn write_regs(&self, thread: OsHandle, regs: &RegBlock) -> bool {
        let mut state = self.state.lock();
        if !state.regs.contains_key(&thread) {
            return false;
        }
        state.regs.insert(thread, *regs);
        self.reg_gen.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn stack_base(&self, thread: OsHandle) -> u64 {
        self.state.lock().stack_bases.get(&thread).copied().unwrap_or(0)
    }

    fn tls_root(&self, _thread: OsHandle) -> u64 {
        0
    }

    fn mem_gen(&self) -> u64 {
        self.mem_gen.load(Ordering::SeqCst)
    }

    fn reg_gen(&self) -> u64 {
        self.reg_gen.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arch, RegsX64};

    #[test]
    fn test_memory_pages() {
        let api = MockApi::new();
        let p = OsHandle(1);
        api.map_memory(p, 0x1ffe, &[1, 2, 3, 4]);

        let mut buf = [0u8; 4];
        assert_eq!(api.read_memory(p, 0x1ffe, &mut buf), 4);
        assert_eq!(buf, [1, 2, 3, 4]);

        // 未配置ページで止まる
        let mut buf = [0u8; 8];
        assert_eq!(api.read_memory(p, 0x2ffc, &mut buf), 4);

        assert!(api.write_memory(p, 0x2000, &[9]));
        assert!(!api.write_memory(p, 0x5000, &[9]));
        assert_eq!(api.recorded_writes(), vec![(p, 0x2000, vec![9])]);
    }

    #[test]
    fn test_scripted_run_updates_regs() {
        let api = MockApi::new();
        let t = OsHandle(2);
        let mut regs = RegsX64::default();
        regs.rip = 0x1234;
        api.push_run(ScriptedRun {
            set_regs: vec![(t, RegBlock::X64(regs))],
            events: vec![DebugEvent::new(DebugEventKind::Halt)],
            ..Default::default()
        });

        let gen = api.reg_gen();
        let events = api.run(&RunCtrls::default()).unwrap();
        assert_eq!(events[0].kind, DebugEventKind::Halt);
        assert!(api.reg_gen() > gen);
        assert_eq!(api.read_regs(t).map(|r| r.ip()), Some(0x1234));
        assert_eq!(api.read_regs(t).map(|r| r.arch()), Some(Arch::X64));

        // スクリプトが尽きたらエラーイベント
        let events = api.run(&RunCtrls::default()).unwrap();
        assert_eq!(events[0].kind, DebugEventKind::Error);
        assert_eq!(api.recorded_runs().len(), 2);
    }

    #[test]
    fn test_attach_halt_and_stack_base() {
        let api = MockApi::new();
        api.attach(42).unwrap();
        assert_eq!(api.recorded_attaches(), vec![42]);

        api.halt().unwrap();
        api.halt().unwrap();
        assert_eq!(api.halt_count(), 2);

        let t = OsHandle(3);
        assert_eq!(api.stack_base(t), 0);
        api.set_stack_base(t, 0x7fff_0000);
        assert_eq!(api.stack_base(t), 0x7fff_0000);

        api.fail_launches(true);
        assert!(api.attach(43).is_err());
    }
}
