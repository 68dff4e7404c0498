//! OSイベントの取得と翻訳
//!
//! OSから届いたイベントはキューに貯めて1つずつ取り出す。取り出すときに
//! 最初の機会の例外を例外フィルタとASanの判定で落とし、キューが空なら
//! （必要ならスプーフを仕掛けて）OSを走らせる。届いたイベントはすぐに
//! エンティティイベントへ翻訳して送る。

use super::context::{file_timestamp, CtrlContext};
use super::run::Spoof;
use crate::entity::EntityKind;
use crate::exception_codes::ExceptionCodeKind;
use crate::protocol::{Event, EventKind};
use crate::range::AddrRange;
use tomeru_target::{DebugEvent, DebugEventKind, Handle, OsHandle, RunCtrls, MACHINE_ID_LOCAL};
use tracing::{debug, warn};

/// ASanのシャドウメモリの場所を持つグローバル変数
pub(crate) const ASAN_SHADOW_SYMBOL: &str = "__asan_shadow_memory_dynamic_address";

/// シャドウメモリの大きさ（128TiBのアドレス空間の1/8）
pub(crate) const ASAN_SHADOW_SIZE: u64 = (128u64 << 40) / 8;

/// 最初の機会の例外をターゲットに任せるか（ユーザーに見せないか）
///
/// 繰り返し届いた例外とスプーフ先での例外は常に見せる。
pub(crate) fn is_filtered_by_code(
    event: &DebugEvent,
    filter: crate::exception_codes::ExceptionCodeFilter,
    spoof_ip: Option<u64>,
) -> bool {
    if event.kind != DebugEventKind::Exception {
        return false;
    }
    let at_spoof = spoof_ip == Some(event.instruction_pointer);
    !event.exception_repeated && !at_spoof && !filter.stops_on_code(event.code as u32)
}

/// アクセス違反がASanのシャドウメモリへのものか
///
/// `shadow_base`が0なら、シャドウがまだ割り当てられていない途中とみなす。
pub(crate) fn is_asan_shadow_fault(fault_address: u64, shadow_base: u64) -> bool {
    shadow_base == 0 || AddrRange::from_len(shadow_base, ASAN_SHADOW_SIZE).contains(fault_address)
}

fn le_value(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    let n = bytes.len().min(8);
    word[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(word)
}

impl CtrlContext {
    /// 次のOSイベントを取り出す
    pub(crate) fn next_event(&mut self, ctrls: &mut RunCtrls, spoof: Option<&Spoof>) -> DebugEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                let filtered = self.should_filter(&event, spoof);
                ctrls.ignore_previous_exception = !filtered;
                if filtered {
                    debug!("Filtered first-chance exception {:#x} at {:#x}", event.code, event.instruction_pointer);
                    self.log.info(format!(
                        "filtered exception code={:#x} ip={:#x}",
                        event.code, event.instruction_pointer
                    ));
                    continue;
                }
                return event;
            }
            self.run_os(ctrls, spoof);
        }
    }

    fn should_filter(&self, event: &DebugEvent, spoof: Option<&Spoof>) -> bool {
        if event.kind != DebugEventKind::Exception {
            return false;
        }
        let spoof_ip = spoof.map(|s| s.new_ip);
        if is_filtered_by_code(event, self.exception_filter, spoof_ip) {
            return true;
        }
        let at_spoof = spoof_ip == Some(event.instruction_pointer);
        if at_spoof || ExceptionCodeKind::from_code(event.code as u32) != Some(ExceptionCodeKind::AccessViolation) {
            return false;
        }
        match self.asan_shadow_base(event.process) {
            Some(shadow) => is_asan_shadow_fault(event.address, shadow),
            None => false,
        }
    }

    /// メインモジュールのデバッグ情報からASanのシャドウの位置を読む
    fn asan_shadow_base(&self, process: OsHandle) -> Option<u64> {
        let process_id = self.entities.from_handle(Handle::local(process))?;
        let module = self.entities.get(self.main_module(process_id)?)?;
        let info = self.debug_info_for(module.handle)?;
        let voff = info.global_variable_voff(ASAN_SHADOW_SYMBOL)?;
        let size = self.process_arch(process).addr_size().max(1) as usize;
        let mut buf = vec![0u8; size];
        let read = self.api.read_memory(process, module.vaddr_range().min + voff, &mut buf);
        if read != size {
            return None;
        }
        Some(le_value(&buf))
    }

    /// OSを1回走らせ、届いたイベントを翻訳してキューに積む
    fn run_os(&mut self, ctrls: &RunCtrls, spoof: Option<&Spoof>) {
        let spoof = spoof.filter(|_| ctrls.single_step_thread.is_none());

        // 戻りアドレスの差し替え
        let mut restore: Option<(Spoof, Vec<u8>)> = None;
        if let Some(spoof) = spoof {
            let size = self.process_arch(spoof.process).addr_size().max(1) as usize;
            let mut old = vec![0u8; size];
            let read = self.api.read_memory(spoof.process, spoof.vaddr, &mut old);
            let new = spoof.new_ip.to_le_bytes();
            if read == size && self.memory.write(Handle::local(spoof.process), spoof.vaddr, &new[..size]) {
                self.log_spoof(spoof, "set");
                restore = Some((*spoof, old));
            } else {
                warn!("Failed to spoof return slot at {:#x}", spoof.vaddr);
            }
        }

        let events = match self.api.run(ctrls) {
            Ok(events) => events,
            Err(e) => {
                let mut event = DebugEvent::new(DebugEventKind::Error);
                event.string = e.to_string();
                vec![event]
            }
        };

        if let Some((spoof, old)) = &restore {
            if !self.memory.write(Handle::local(spoof.process), spoof.vaddr, old) {
                warn!("Failed to restore spoofed slot at {:#x}", spoof.vaddr);
            }
            self.log_spoof(spoof, "restored");
        }

        for event in events {
            self.log_os_event(&event);
            if let Some((spoof, old)) = &restore {
                self.unspoof_thread(spoof, le_value(old));
            }
            let translated = self.translate(&event);
            self.emit(translated);
            self.pending.push_back(event);
        }
    }

    /// スプーフ先に着地したスレッドのipを本来の戻りアドレスに戻す
    fn unspoof_thread(&mut self, spoof: &Spoof, return_address: u64) {
        let thread = Handle::local(spoof.thread);
        let Some(mut regs) = self.regs.read(thread, tomeru_target::Arch::Null) else {
            return;
        };
        if regs.ip() != spoof.new_ip {
            return;
        }
        regs.set_ip(return_address);
        if !self.regs.write(thread, &regs) {
            warn!("Failed to move {} off the spoof address", spoof.thread);
        }
    }

    fn log_os_event(&mut self, event: &DebugEvent) {
        self.log.info(format!(
            "os event {}: process={} thread={} module={} arch={} address={:#x} size={:#x} code={:#x} flags={:#x} ip={:#x} repeated={} string={:?}",
            event.kind.name(),
            event.process,
            event.thread,
            event.module,
            event.arch.name(),
            event.address,
            event.size,
            event.code,
            event.flags,
            event.instruction_pointer,
            event.exception_repeated,
            event.string
        ));
    }

    /// OSイベントをエンティティイベントにする（キャッシュの開閉もここで行う）
    pub(crate) fn translate(&mut self, event: &DebugEvent) -> Vec<Event> {
        let mut out = Vec::new();
        let local = |kind: EventKind| {
            let mut e = Event::new(kind);
            e.machine_id = MACHINE_ID_LOCAL;
            e
        };
        match event.kind {
            DebugEventKind::CreateProcess => {
                self.process_counter += 1;
                if self.process_counter == 1 {
                    self.memory.clear();
                }
                let mut e = local(EventKind::NewProc);
                e.entity = event.process;
                e.arch = event.arch;
                e.entity_id = event.code;
                e.string = event.string.clone();
                out.push(e);
            }
            DebugEventKind::CreateThread => {
                let mut e = local(EventKind::NewThread);
                e.entity = event.thread;
                e.parent = event.process;
                e.arch = event.arch;
                e.entity_id = event.code;
                e.stack_base = event.stack_base;
                e.tls_root = event.tls_root;
                e.rip = event.instruction_pointer;
                e.string = event.string.clone();
                out.push(e);
            }
            DebugEventKind::LoadModule => {
                let timestamp = file_timestamp(&event.string);
                let range = AddrRange::from_len(event.address, event.size);
                let module = Handle::local(event.module);
                let image = self
                    .modules
                    .open(Handle::local(event.process), module, range, &event.string);

                let mut e = local(EventKind::NewModule);
                e.entity = event.module;
                e.parent = event.process;
                e.arch = event.arch;
                e.entity_id = event.code;
                e.vaddr_range = range;
                e.rip = event.address;
                e.timestamp = timestamp;
                e.string = event.string.clone();
                out.push(e);

                let path = image.initial_debug_info_path.clone();
                let mut e = local(EventKind::ModuleDebugInfoPathChange);
                e.entity = event.module;
                e.parent = event.process;
                e.timestamp = file_timestamp(&path);
                e.string = path.clone();
                out.push(e);

                self.open_debug_info(module, &path);
            }
            DebugEventKind::ExitProcess => {
                self.process_counter = self.process_counter.saturating_sub(1);
                if let Some(process) = self.entities.from_handle(Handle::local(event.process)) {
                    for module in self.entities.children_of_kind(process, EntityKind::Module) {
                        if let Some(handle) = self.entities.get(module).map(|m| m.handle) {
                            self.modules.close(handle);
                            self.close_debug_info(handle);
                        }
                    }
                }
                let mut e = local(EventKind::EndProc);
                e.entity = event.process;
                e.code = event.code;
                out.push(e);
            }
            DebugEventKind::ExitThread => {
                self.regs.forget(Handle::local(event.thread));
                let mut e = local(EventKind::EndThread);
                e.entity = event.thread;
                e.entity_id = event.code;
                out.push(e);
            }
            DebugEventKind::UnloadModule => {
                let module = Handle::local(event.module);
                self.modules.close(module);
                self.close_debug_info(module);
                let mut e = local(EventKind::EndModule);
                e.entity = event.module;
                e.string = event.string.clone();
                out.push(e);
            }
            DebugEventKind::DebugString => {
                let mut e = local(EventKind::DebugString);
                e.entity = event.thread;
                e.parent = event.process;
                e.string = event.string.clone();
                out.push(e);
            }
            DebugEventKind::SetThreadName => {
                let mut e = local(EventKind::ThreadName);
                e.entity = event.thread;
                e.parent = event.process;
                e.entity_id = event.code;
                e.string = event.string.clone();
                out.push(e);
            }
            DebugEventKind::SetThreadColor => {
                let mut e = local(EventKind::ThreadColor);
                e.entity = event.thread;
                e.parent = event.process;
                e.rgba = event.code as u32;
                out.push(e);
            }
            _ => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception_codes::ExceptionCodeFilter;

    fn exception(code: u64, ip: u64) -> DebugEvent {
        let mut event = DebugEvent::new(DebugEventKind::Exception);
        event.code = code;
        event.instruction_pointer = ip;
        event
    }

    #[test]
    fn test_first_chance_exceptions_follow_filter() {
        let av = exception(0xC000_0005, 0x1000);
        assert!(is_filtered_by_code(&av, ExceptionCodeFilter::default(), None));

        let mut filter = ExceptionCodeFilter::default();
        filter.set(ExceptionCodeKind::AccessViolation, true);
        assert!(!is_filtered_by_code(&av, filter, None));
    }

    #[test]
    fn test_repeated_and_spoof_exceptions_are_shown() {
        let mut av = exception(0xC000_0005, 911);
        assert!(!is_filtered_by_code(&av, ExceptionCodeFilter::default(), Some(911)));
        av.instruction_pointer = 0x1000;
        av.exception_repeated = true;
        assert!(!is_filtered_by_code(&av, ExceptionCodeFilter::default(), Some(911)));
    }

    #[test]
    fn test_non_exceptions_are_never_filtered() {
        let bp = DebugEvent::new(DebugEventKind::Breakpoint);
        assert!(!is_filtered_by_code(&bp, ExceptionCodeFilter::default(), None));
    }

    #[test]
    fn test_asan_shadow_range() {
        let shadow = 0x7fff_8000;
        assert!(is_asan_shadow_fault(shadow, shadow));
        assert!(is_asan_shadow_fault(shadow + ASAN_SHADOW_SIZE - 1, shadow));
        assert!(!is_asan_shadow_fault(shadow + ASAN_SHADOW_SIZE, shadow));
        assert!(!is_asan_shadow_fault(0x1000, shadow));
        // シャドウ未割り当て
        assert!(is_asan_shadow_fault(0x1000, 0));
    }

    #[test]
    fn test_le_value_truncates() {
        assert_eq!(le_value(&[0x11, 0x22, 0x33, 0x44]), 0x4433_2211);
        assert_eq!(le_value(&[]), 0);
    }
}
