//! x86-64のアンワインド
//!
//! 関数テーブル（pdata）とアンワインド情報（xdata）を使う。
//! ipがエピローグの中にあるときは、アンワインドコードではなく
//! 残りのエピローグ命令をそのまま模擬する。

use super::{MemoryView, Reader, UnwindFlags, UnwindStep};
use crate::cache::module_image::{pdata_x64_search, ModuleImageInfo, PdataX64};
use tomeru_target::RegsX64;
use tracing::trace;

/// エピローグ検出で読む命令列の大きさ
const EPILOG_WINDOW: usize = 256;
/// エピローグ内のjmpを辿る回数の上限
const MAX_EPILOG_JUMPS: usize = 8;

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const UWOP_SAVE_NONVOL: u8 = 4;
const UWOP_SAVE_NONVOL_FAR: u8 = 5;
const UWOP_EPILOG: u8 = 6;
const UWOP_SPARE_CODE: u8 = 7;
const UWOP_SAVE_XMM128: u8 = 8;
const UWOP_SAVE_XMM128_FAR: u8 = 9;
const UWOP_PUSH_MACHFRAME: u8 = 10;

const UNW_FLAG_CHAININFO: u8 = 4;

/// 1フレーム巻き戻す
pub fn step(memory: &dyn MemoryView, module: Option<&ModuleImageInfo>, regs: &mut RegsX64) -> UnwindStep {
    let mut reader = Reader::new(memory);
    if step_inner(&mut reader, module, regs).is_none() {
        reader.flags.insert(UnwindFlags::ERROR);
    }
    UnwindStep { flags: reader.flags }
}

fn step_inner(reader: &mut Reader<'_>, module: Option<&ModuleImageInfo>, regs: &mut RegsX64) -> Option<()> {
    let pdata = module.and_then(|m| {
        let voff = regs.rip.checked_sub(m.base())?;
        pdata_x64_search(&m.pdatas_x64, voff).map(|p| (m, *p))
    });

    let Some((module, pdata)) = pdata else {
        // リーフ関数: 戻りアドレスはスタックの先頭
        return pop_return(reader, regs);
    };

    if is_in_epilog(reader, module.base(), &pdata, regs.rip) {
        trace!("rip {:#x} is in an epilog", regs.rip);
        return simulate_epilog(reader, regs);
    }
    apply_unwind_codes(reader, module.base(), pdata, regs)
}

fn pop_return(reader: &mut Reader<'_>, regs: &mut RegsX64) -> Option<()> {
    let rsp = regs.rsp();
    regs.rip = reader.u64(rsp)?;
    regs.set_rsp(rsp.wrapping_add(8));
    Some(())
}

fn imm32(w: &[u8], i: usize) -> Option<i32> {
    let b = w.get(i..i + 4)?;
    Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// 最初の命令（`add rsp, imm` / `lea rsp, [reg+disp]`）の長さ
fn epilog_first_len(w: &[u8]) -> Option<usize> {
    match w.get(0..3)? {
        [0x48, 0x81, 0xC4] => return Some(7),
        [0x48, 0x83, 0xC4] => return Some(4),
        _ => {}
    }
    let (rex, opcode, modrm) = (w[0], w[1], w[2]);
    if rex & 0xF8 == 0x48 && opcode == 0x8D {
        let md = modrm >> 6;
        let reg = (modrm >> 3) & 7;
        let rm = modrm & 7;
        if rex & 0x06 == 0 && reg == 4 && rm != 4 {
            return match md {
                1 => Some(4),
                2 => Some(7),
                _ => None,
            };
        }
        return None;
    }
    Some(0)
}

/// ipがエピローグの中か
fn is_in_epilog(reader: &mut Reader<'_>, base: u64, pdata: &PdataX64, rip: u64) -> bool {
    let mut addr = rip;
    let mut w = reader.window(addr, &[EPILOG_WINDOW, 64, 16]);
    let Some(mut i) = epilog_first_len(&w) else {
        return false;
    };
    let mut jumps = 0;
    loop {
        let Some(&b) = w.get(i) else {
            return false;
        };
        if b & 0xF8 == 0x58 {
            i += 1;
        } else if b & 0xF0 == 0x40 {
            // REXつきのpop
            match w.get(i + 1) {
                Some(next) if next & 0xF8 == 0x58 => i += 2,
                _ => return false,
            }
        } else if b == 0xC3 || b == 0xC2 {
            return true;
        } else if b == 0xF3 && w.get(i + 1) == Some(&0xC3) {
            return true;
        } else if b == 0xE9 {
            let Some(disp) = imm32(&w, i + 1) else {
                return false;
            };
            let target = (addr + i as u64 + 5).wrapping_add(disp as i64 as u64);
            let Some(target_voff) = target.checked_sub(base) else {
                return false;
            };
            let inside = (pdata.voff_first as u64) <= target_voff
                && target_voff < pdata.voff_one_past_last as u64;
            jumps += 1;
            if !inside || jumps > MAX_EPILOG_JUMPS {
                return false;
            }
            addr = target;
            w = reader.window(addr, &[EPILOG_WINDOW, 64, 16]);
            i = 0;
        } else {
            return false;
        }
    }
}

/// エピローグの残りを模擬する
fn simulate_epilog(reader: &mut Reader<'_>, regs: &mut RegsX64) -> Option<()> {
    let mut addr = regs.rip;
    let mut w = reader.window(addr, &[EPILOG_WINDOW, 64, 16]);
    let mut i = 0;

    match w.get(0..3) {
        Some([0x48, 0x81, 0xC4]) => {
            let imm = imm32(&w, 3)?;
            regs.set_rsp(regs.rsp().wrapping_add(imm as i64 as u64));
            i = 7;
        }
        Some([0x48, 0x83, 0xC4]) => {
            let imm = *w.get(3)? as i8;
            regs.set_rsp(regs.rsp().wrapping_add(imm as i64 as u64));
            i = 4;
        }
        Some([rex, 0x8D, modrm]) if rex & 0xF8 == 0x48 => {
            let base_reg = ((rex & 1) * 8 + (modrm & 7)) as usize;
            let (disp, len) = match modrm >> 6 {
                1 => (*w.get(3)? as i8 as i64, 4),
                _ => (imm32(&w, 3)? as i64, 7),
            };
            regs.set_rsp(regs.gpr[base_reg].wrapping_add(disp as u64));
            i = len;
        }
        _ => {}
    }

    for _ in 0..=MAX_EPILOG_JUMPS {
        loop {
            let b = *w.get(i)?;
            if b & 0xF8 == 0x58 || b & 0xF0 == 0x40 {
                let (rex, op, len) = if b & 0xF0 == 0x40 {
                    (b, *w.get(i + 1)?, 2)
                } else {
                    (0, b, 1)
                };
                if op & 0xF8 != 0x58 {
                    return None;
                }
                let reg = (op - 0x58 + (rex & 1) * 8) as usize;
                let rsp = regs.rsp();
                let value = reader.u64(rsp)?;
                regs.set_rsp(rsp.wrapping_add(8));
                regs.gpr[reg] = value;
                i += len;
            } else if b == 0xC3 || (b == 0xF3 && w.get(i + 1) == Some(&0xC3)) {
                return pop_return(reader, regs);
            } else if b == 0xC2 {
                let imm = u16::from_le_bytes([*w.get(i + 1)?, *w.get(i + 2)?]) as u64;
                pop_return(reader, regs)?;
                regs.set_rsp(regs.rsp().wrapping_add(imm));
                return Some(());
            } else if b == 0xE9 {
                let disp = imm32(&w, i + 1)?;
                addr = (addr + i as u64 + 5).wrapping_add(disp as i64 as u64);
                w = reader.window(addr, &[EPILOG_WINDOW, 64, 16]);
                i = 0;
                break;
            } else {
                return None;
            }
        }
    }
    None
}

/// アンワインド情報のヘッダ
#[derive(Debug, Clone, Copy)]
struct UnwindInfoHeader {
    flags: u8,
    code_count: u8,
    frame_register: u8,
    frame_offset: u8,
}

fn read_header(reader: &mut Reader<'_>, vaddr: u64) -> Option<UnwindInfoHeader> {
    let mut b = [0u8; 4];
    reader.bytes(vaddr, &mut b)?;
    Some(UnwindInfoHeader {
        flags: b[0] >> 3,
        code_count: b[2],
        frame_register: b[3] & 0xF,
        frame_offset: b[3] >> 4,
    })
}

/// 1コードが占めるスロット数
fn slot_count(op: u8, info: u8) -> Option<usize> {
    Some(match op {
        UWOP_PUSH_NONVOL | UWOP_ALLOC_SMALL | UWOP_SET_FPREG | UWOP_PUSH_MACHFRAME => 1,
        UWOP_ALLOC_LARGE => {
            if info == 0 {
                2
            } else {
                3
            }
        }
        UWOP_SAVE_NONVOL | UWOP_SAVE_XMM128 | UWOP_EPILOG => 2,
        UWOP_SAVE_NONVOL_FAR | UWOP_SAVE_XMM128_FAR | UWOP_SPARE_CODE => 3,
        _ => return None,
    })
}

fn apply_unwind_codes(reader: &mut Reader<'_>, base: u64, first: PdataX64, regs: &mut RegsX64) -> Option<()> {
    let rip_voff = regs.rip.wrapping_sub(base);
    let first_header = read_header(reader, base + first.voff_unwind_info as u64)?;
    let frame_reg = first_header.frame_register as usize;
    let frame_off = first_header.frame_offset as u64 * 16;

    let mut pdata = first;
    let mut has_machframe = false;
    // 連鎖は関数テーブルの大きさで抑える
    for _ in 0..64 {
        let info_vaddr = base + pdata.voff_unwind_info as u64;
        let header = read_header(reader, info_vaddr)?;
        let count = header.code_count as usize;
        let mut codes = vec![0u8; count * 2];
        reader.bytes(info_vaddr + 4, &mut codes)?;
        let slot = |idx: usize| -> Option<u16> {
            let b = codes.get(idx * 2..idx * 2 + 2)?;
            Some(u16::from_le_bytes([b[0], b[1]]))
        };

        let frame_base = if frame_reg == 0 {
            regs.rsp()
        } else {
            regs.gpr[frame_reg].checked_sub(frame_off).unwrap_or(0)
        };

        let mut idx = 0;
        while idx < count {
            let code_offset = codes[idx * 2] as u64;
            let op = codes[idx * 2 + 1] & 0xF;
            let info = codes[idx * 2 + 1] >> 4;
            let slots = slot_count(op, info)?;
            if idx + slots > count {
                return None;
            }
            let applies = pdata.voff_first as u64 + code_offset <= rip_voff;

            if applies {
                match op {
                    UWOP_PUSH_NONVOL => {
                        let rsp = regs.rsp();
                        let value = reader.u64(rsp)?;
                        regs.set_rsp(rsp.wrapping_add(8));
                        regs.gpr[info as usize] = value;
                    }
                    UWOP_ALLOC_LARGE => {
                        let size = if info == 0 {
                            slot(idx + 1)? as u64 * 8
                        } else {
                            slot(idx + 1)? as u64 | (slot(idx + 2)? as u64) << 16
                        };
                        regs.set_rsp(regs.rsp().wrapping_add(size));
                    }
                    UWOP_ALLOC_SMALL => {
                        regs.set_rsp(regs.rsp().wrapping_add(info as u64 * 8 + 8));
                    }
                    UWOP_SET_FPREG => {
                        regs.set_rsp(frame_base);
                    }
                    UWOP_SAVE_NONVOL => {
                        let off = slot(idx + 1)? as u64 * 8;
                        regs.gpr[info as usize] = reader.u64(frame_base.wrapping_add(off))?;
                    }
                    UWOP_SAVE_NONVOL_FAR => {
                        let off = slot(idx + 1)? as u64 | (slot(idx + 2)? as u64) << 16;
                        regs.gpr[info as usize] = reader.u64(frame_base.wrapping_add(off))?;
                    }
                    UWOP_SAVE_XMM128 => {
                        let off = slot(idx + 1)? as u64 * 16;
                        regs.xmm[info as usize] = reader.u128(frame_base.wrapping_add(off))?;
                    }
                    UWOP_SAVE_XMM128_FAR => {
                        let off = slot(idx + 1)? as u64 | (slot(idx + 2)? as u64) << 16;
                        regs.xmm[info as usize] = reader.u128(frame_base.wrapping_add(off))?;
                    }
                    UWOP_PUSH_MACHFRAME => {
                        if info > 1 {
                            return None;
                        }
                        let sp = regs.rsp().wrapping_add(info as u64 * 8);
                        let ip = reader.u64(sp)?;
                        let rflags = reader.u64(sp + 16)?;
                        let rsp = reader.u64(sp + 24)?;
                        regs.rip = ip;
                        regs.rflags = rflags;
                        regs.set_rsp(rsp);
                        has_machframe = true;
                    }
                    _ => return None,
                }
            } else if op == UWOP_EPILOG || op == UWOP_SPARE_CODE {
                return None;
            }
            idx += slots;
        }

        if header.flags & UNW_FLAG_CHAININFO == 0 {
            break;
        }
        // 連鎖したpdataはコード配列（偶数個に揃える）の後ろ
        let aligned = (count + 1) & !1;
        let chained = info_vaddr + 4 + aligned as u64 * 2;
        pdata = PdataX64 {
            voff_first: reader.u32(chained)?,
            voff_one_past_last: reader.u32(chained + 4)?,
            voff_unwind_info: reader.u32(chained + 8)?,
        };
    }

    if !has_machframe {
        pop_return(reader, regs)?;
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::FlatMemory;
    use super::*;
    use crate::range::AddrRange;
    use tomeru_target::registers::x64::{RBP, RBX};

    const BASE: u64 = 0x10000;
    const FUNC: u64 = BASE + 0x1000;
    const STACK: u64 = 0x7f00_0000;

    /// push rbx; push rbp; sub rsp, 0x20; nop; nop; add rsp, 0x20; pop rbp; pop rbx; ret
    const CODE: [u8; 15] = [
        0x53, 0x55, 0x48, 0x83, 0xEC, 0x20, 0x90, 0x90, 0x48, 0x83, 0xC4, 0x20, 0x5D, 0x5B, 0xC3,
    ];

    fn module() -> ModuleImageInfo {
        ModuleImageInfo {
            vaddr_range: AddrRange::from_len(BASE, 0x10000),
            pdatas_x64: vec![PdataX64 {
                voff_first: 0x1000,
                voff_one_past_last: 0x1000 + CODE.len() as u32,
                voff_unwind_info: 0x2000,
            }],
            ..Default::default()
        }
    }

    fn memory() -> FlatMemory {
        let mut memory = FlatMemory::default();
        memory.put(FUNC, &CODE);
        // version 1, prolog 6, 3 codes, フレームレジスタなし
        memory.put(
            BASE + 0x2000,
            &[0x01, 0x06, 0x03, 0x00, 0x06, 0x32, 0x02, 0x50, 0x01, 0x30, 0x00, 0x00],
        );
        memory.put_u64(STACK + 0x20, 0xBBBB);
        memory.put_u64(STACK + 0x28, 0xAAAA);
        memory.put_u64(STACK + 0x30, 0x40_1234);
        memory
    }

    fn regs_at(offset: u64, rsp: u64) -> RegsX64 {
        let mut regs = RegsX64::default();
        regs.rip = FUNC + offset;
        regs.set_rsp(rsp);
        regs
    }

    fn assert_caller(regs: &RegsX64) {
        assert_eq!(regs.rip, 0x40_1234);
        assert_eq!(regs.rsp(), STACK + 0x38);
        assert_eq!(regs.gpr[RBP], 0xBBBB);
        assert_eq!(regs.gpr[RBX], 0xAAAA);
    }

    #[test]
    fn test_unwind_codes_in_body() {
        let memory = memory();
        let module = module();
        let mut regs = regs_at(6, STACK);
        let step = step(&memory, Some(&module), &mut regs);
        assert_eq!(step.flags, UnwindFlags::default());
        assert_caller(&regs);
    }

    #[test]
    fn test_epilog_add_then_pops() {
        let memory = memory();
        let module = module();
        let mut regs = regs_at(8, STACK);
        assert!(!step(&memory, Some(&module), &mut regs).flags.is_error());
        assert_caller(&regs);
    }

    #[test]
    fn test_epilog_at_pop() {
        let memory = memory();
        let module = module();
        let mut regs = regs_at(12, STACK + 0x20);
        assert!(!step(&memory, Some(&module), &mut regs).flags.is_error());
        assert_caller(&regs);
    }

    #[test]
    fn test_partial_prolog() {
        let memory = memory();
        let module = module();
        // push rbxの直後: rbxだけが積まれている
        let mut regs = regs_at(1, STACK + 0x28);
        assert!(!step(&memory, Some(&module), &mut regs).flags.is_error());
        assert_eq!(regs.gpr[RBX], 0xAAAA);
        assert_eq!(regs.rip, 0x40_1234);
        assert_eq!(regs.rsp(), STACK + 0x38);
    }

    #[test]
    fn test_no_pdata() {
        let memory = memory();
        let mut regs = RegsX64::default();
        regs.rip = 0x5555;
        regs.set_rsp(STACK + 0x30);
        assert!(!step(&memory, None, &mut regs).flags.is_error());
        assert_eq!(regs.rip, 0x40_1234);
        assert_eq!(regs.rsp(), STACK + 0x38);
    }

    #[test]
    fn test_epilog_code_is_error() {
        let mut memory = memory();
        // 未実行のEPILOGコード
        memory.put(BASE + 0x2000, &[0x01, 0x06, 0x02, 0x00, 0x10, 0x06, 0x00, 0x00]);
        let module = module();
        let mut regs = regs_at(6, STACK);
        assert!(step(&memory, Some(&module), &mut regs).flags.is_error());
    }

    #[test]
    fn test_unknown_opcode_is_error() {
        let mut memory = memory();
        // 1コードだけで、オペコード11は定義されていない
        memory.put(BASE + 0x2000, &[0x01, 0x06, 0x01, 0x00, 0x00, 0x0B, 0x00, 0x00]);
        let module = module();
        let mut regs = regs_at(6, STACK);
        let step = step(&memory, Some(&module), &mut regs);
        assert!(step.flags.contains(UnwindFlags::ERROR));
        assert_eq!(regs.rip, FUNC + 6);
    }

    #[test]
    fn test_truncated_epilog_is_error() {
        // pop rbx; pop rbp; ret imm16 の即値がページの外
        let mut memory = FlatMemory::default();
        memory.put(FUNC, &[0x5B, 0x5D, 0xC2]);
        memory.put_u64(STACK, 0xAAAA);
        memory.put_u64(STACK + 8, 0xBBBB);
        memory.put_u64(STACK + 16, 0x40_1234);
        let module = module();
        let mut regs = regs_at(0, STACK);
        let step = step(&memory, Some(&module), &mut regs);
        assert!(step.flags.is_error());
        assert_ne!(regs.rip, 0x40_1234);
    }

    #[test]
    fn test_epilog_detection_patterns() {
        // lea rsp, [rbp+0x10]; pop rbp; rep ret
        let lea = [0x48, 0x8D, 0x65, 0x10, 0x5D, 0xF3, 0xC3];
        assert_eq!(epilog_first_len(&lea), Some(4));
        // lea rsp, [r13+disp32]はREX.Bだけなら受け付ける
        let lea_r13 = [0x49, 0x8D, 0xA5, 0, 1, 0, 0];
        assert_eq!(epilog_first_len(&lea_r13), Some(7));
        // SIBつきは対象外
        let lea_sib = [0x48, 0x8D, 0x64, 0x24, 0x10];
        assert_eq!(epilog_first_len(&lea_sib), None);

        let mut memory = FlatMemory::default();
        memory.put(FUNC, &[0x41, 0x5F, 0xC2, 0x10, 0x00]);
        memory.put_u64(STACK, 0x77);
        memory.put_u64(STACK + 8, 0x40_0000);
        let module = module();
        let mut regs = regs_at(0, STACK);
        assert!(!step(&memory, Some(&module), &mut regs).flags.is_error());
        assert_eq!(regs.gpr[15], 0x77);
        assert_eq!(regs.rip, 0x40_0000);
        assert_eq!(regs.rsp(), STACK + 16 + 0x10);
    }
}
