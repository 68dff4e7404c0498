//! ARM64のアンワインド（Microsoft ARM64形式のpdata/xdata）
//!
//! パック形式はフラグから標準のプロローグ列を組み立て、
//! 非パック形式はアンワインドコードを読む。どちらも一度 [`Op`] の列にしてから実行する。

use super::{MemoryView, Reader, UnwindFlags, UnwindStep};
use crate::cache::module_image::{pdata_arm64_search, ModuleImageInfo};
use tomeru_target::RegsArm64;
use tracing::trace;

/// PACを取り除いたアドレスのマスク
const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
/// パック形式のエピローグ模擬で見る命令数の上限
const MAX_EPILOG_INSTRUCTIONS: usize = 32;
const SP: u32 = 31;

/// アンワインド操作（1つがプロローグの1命令に対応する）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// sp += n（alloc_s / alloc_m / alloc_l）
    Alloc(u64),
    SaveR19R20X(u64),
    SaveFpLr(u64),
    SaveFpLrX(u64),
    SaveRegp { reg: usize, off: u64 },
    SaveRegpX { reg: usize, off: u64 },
    SaveReg { reg: usize, off: u64 },
    SaveRegX { reg: usize, off: u64 },
    SaveLrPair { reg: usize, off: u64 },
    SaveFregp { reg: usize, off: u64 },
    SaveFregpX { reg: usize, off: u64 },
    SaveFreg { reg: usize, off: u64 },
    SaveFregX { reg: usize, off: u64 },
    SetFp,
    AddFp(u64),
    Nop,
    End,
    EndC,
    SaveNext,
    PacSignLr,
}

impl Op {
    fn is_end(&self) -> bool {
        matches!(self, Op::End | Op::EndC)
    }
}

/// パック形式のアンワインドデータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedUnwind {
    pub flag: u32,
    pub function_length: u64,
    pub reg_f: u32,
    pub reg_i: u32,
    pub h: bool,
    pub cr: u32,
    pub frame_size: u64,
}

impl PackedUnwind {
    pub fn decode(word: u32) -> Self {
        Self {
            flag: word & 0x3,
            function_length: ((word >> 2) & 0x7FF) as u64 * 4,
            reg_f: (word >> 13) & 0x7,
            reg_i: (word >> 16) & 0xF,
            h: (word >> 20) & 1 != 0,
            cr: (word >> 21) & 0x3,
            frame_size: ((word >> 23) & 0x1FF) as u64 * 16,
        }
    }

    /// 標準のプロローグをプロローグ順の操作列にする
    pub fn prolog_ops(&self) -> Vec<Op> {
        let reg_i = self.reg_i as u64;
        let int_size = reg_i * 8 + if self.cr == 1 { 8 } else { 0 };
        let fp_size = if self.reg_f > 0 { (self.reg_f as u64 + 1) * 8 } else { 0 };
        let save_size = (int_size + fp_size + if self.h { 64 } else { 0 } + 0xF) & !0xF;
        let local_size = self.frame_size.saturating_sub(save_size);

        let mut ops = Vec::new();
        if self.cr == 2 {
            ops.push(Op::PacSignLr);
        }

        let mut predecremented = false;
        let lr_merged = self.cr == 1 && reg_i % 2 == 1;
        let mut i = 0;
        while i < reg_i {
            let reg = 19 + i as usize;
            let off = i * 8;
            if reg_i - i >= 2 {
                ops.push(if i == 0 {
                    Op::SaveRegpX { reg, off: save_size }
                } else {
                    Op::SaveRegp { reg, off }
                });
                i += 2;
            } else {
                if lr_merged && i > 0 {
                    ops.push(Op::SaveLrPair { reg, off });
                } else if i == 0 {
                    ops.push(Op::SaveRegX { reg, off: save_size });
                    if lr_merged {
                        ops.push(Op::SaveReg { reg: RegsArm64::LR, off: 8 });
                    }
                } else {
                    ops.push(Op::SaveReg { reg, off });
                }
                i += 1;
            }
            predecremented = true;
        }
        if self.cr == 1 && !lr_merged {
            if reg_i == 0 {
                ops.push(Op::SaveRegX {
                    reg: RegsArm64::LR,
                    off: save_size,
                });
                predecremented = true;
            } else {
                ops.push(Op::SaveReg {
                    reg: RegsArm64::LR,
                    off: int_size - 8,
                });
            }
        }

        if self.reg_f > 0 {
            let count = self.reg_f as u64 + 1;
            let mut j = 0;
            while j < count {
                let reg = 8 + j as usize;
                let off = int_size + j * 8;
                let first = !predecremented && j == 0;
                if count - j >= 2 {
                    ops.push(if first {
                        Op::SaveFregpX { reg, off: save_size }
                    } else {
                        Op::SaveFregp { reg, off }
                    });
                    j += 2;
                } else {
                    ops.push(if first {
                        Op::SaveFregX { reg, off: save_size }
                    } else {
                        Op::SaveFreg { reg, off }
                    });
                    j += 1;
                }
            }
            predecremented = true;
        }

        if self.h {
            // 引数レジスタの退避はアンワインドでは戻さない
            if predecremented {
                ops.extend([Op::Nop; 4]);
            } else {
                ops.push(Op::Alloc(save_size));
                ops.extend([Op::Nop; 3]);
            }
        }

        if self.cr == 2 || self.cr == 3 {
            if local_size <= 512 {
                ops.push(Op::SaveFpLrX(local_size));
                ops.push(Op::SetFp);
            } else if local_size <= 4080 {
                ops.push(Op::Alloc(local_size));
                ops.push(Op::SaveFpLr(0));
                ops.push(Op::SetFp);
            } else {
                ops.push(Op::Alloc(4080));
                ops.push(Op::Alloc(local_size - 4080));
                ops.push(Op::SaveFpLr(0));
                ops.push(Op::SetFp);
            }
        } else if local_size > 4080 {
            ops.push(Op::Alloc(4080));
            ops.push(Op::Alloc(local_size - 4080));
        } else if local_size > 0 {
            ops.push(Op::Alloc(local_size));
        }
        ops
    }
}

/// 非パック形式のヘッダ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdataHeader {
    pub function_length: u64,
    pub version: u32,
    pub has_exception_data: bool,
    pub single_epilog: bool,
    pub epilog_count: u32,
    pub code_words: u32,
    /// ヘッダ（拡張ワードを含む）のバイト数
    pub header_size: u64,
}

fn read_xdata_header(reader: &mut Reader<'_>, vaddr: u64) -> Option<XdataHeader> {
    let word = reader.u32(vaddr)?;
    let mut header = XdataHeader {
        function_length: (word & 0x3FFFF) as u64 * 4,
        version: (word >> 18) & 0x3,
        has_exception_data: (word >> 20) & 1 != 0,
        single_epilog: (word >> 21) & 1 != 0,
        epilog_count: (word >> 22) & 0x1F,
        code_words: (word >> 27) & 0x1F,
        header_size: 4,
    };
    if header.epilog_count == 0 && header.code_words == 0 {
        let ext = reader.u32(vaddr + 4)?;
        header.epilog_count = ext & 0xFFFF;
        header.code_words = (ext >> 16) & 0xFF;
        header.header_size = 8;
    }
    Some(header)
}

/// アンワインドコードのバイト列を操作列にする（アンワインド順のまま）
pub fn decode_codes(codes: &[u8]) -> Option<Vec<Op>> {
    let mut ops = Vec::new();
    let mut i = 0;
    let byte = |idx: usize| codes.get(idx).copied();
    while i < codes.len() {
        let b0 = codes[i];
        let (op, len) = match b0 {
            0x00..=0x1F => (Op::Alloc((b0 & 0x1F) as u64 * 16), 1),
            0x20..=0x3F => (Op::SaveR19R20X((b0 & 0x1F) as u64 * 8), 1),
            0x40..=0x7F => (Op::SaveFpLr((b0 & 0x3F) as u64 * 8), 1),
            0x80..=0xBF => (Op::SaveFpLrX(((b0 & 0x3F) as u64 + 1) * 8), 1),
            0xC0..=0xC7 => {
                let b1 = byte(i + 1)?;
                (Op::Alloc(((((b0 & 0x7) as u64) << 8) | b1 as u64) * 16), 2)
            }
            0xC8..=0xDD => {
                let b1 = byte(i + 1)?;
                let x4 = (((b0 & 0x3) as usize) << 2) | (b1 >> 6) as usize;
                let x3 = (((b0 & 0x1) as usize) << 2) | (b1 >> 6) as usize;
                let z6 = (b1 & 0x3F) as u64;
                let op = match b0 {
                    0xC8..=0xCB => Op::SaveRegp { reg: 19 + x4, off: z6 * 8 },
                    0xCC..=0xCF => Op::SaveRegpX { reg: 19 + x4, off: (z6 + 1) * 8 },
                    0xD0..=0xD3 => Op::SaveReg { reg: 19 + x4, off: z6 * 8 },
                    0xD4..=0xD5 => {
                        let x = (((b0 & 0x1) as usize) << 3) | (b1 >> 5) as usize;
                        Op::SaveRegX {
                            reg: 19 + x,
                            off: ((b1 & 0x1F) as u64 + 1) * 8,
                        }
                    }
                    0xD6..=0xD7 => Op::SaveLrPair { reg: 19 + 2 * x3, off: z6 * 8 },
                    0xD8..=0xD9 => Op::SaveFregp { reg: 8 + x3, off: z6 * 8 },
                    0xDA..=0xDB => Op::SaveFregpX { reg: 8 + x3, off: (z6 + 1) * 8 },
                    _ => Op::SaveFreg { reg: 8 + x3, off: z6 * 8 },
                };
                (op, 2)
            }
            0xDE => {
                let b1 = byte(i + 1)?;
                (
                    Op::SaveFregX {
                        reg: 8 + (b1 >> 5) as usize,
                        off: ((b1 & 0x1F) as u64 + 1) * 8,
                    },
                    2,
                )
            }
            0xE0 => {
                let size = ((byte(i + 1)? as u64) << 16) | ((byte(i + 2)? as u64) << 8) | byte(i + 3)? as u64;
                (Op::Alloc(size * 16), 4)
            }
            0xE1 => (Op::SetFp, 1),
            0xE2 => (Op::AddFp(byte(i + 1)? as u64 * 8), 2),
            0xE3 => (Op::Nop, 1),
            0xE4 => (Op::End, 1),
            0xE5 => (Op::EndC, 1),
            0xE6 => (Op::SaveNext, 1),
            0xFC => (Op::PacSignLr, 1),
            _ => return None,
        };
        ops.push(op);
        i += len;
        if op.is_end() {
            break;
        }
    }
    Some(ops)
}

/// save_nextをプロローグ順に解決する（アンワインド順で受け取り、アンワインド順で返す）
pub fn resolve_save_next(unwind_order: &[Op]) -> Vec<Op> {
    let mut prolog: Vec<Op> = unwind_order.iter().rev().copied().collect();
    let mut prev: Option<Op> = None;
    for op in prolog.iter_mut() {
        if *op == Op::SaveNext {
            let next = match prev {
                Some(Op::SaveRegp { reg, off }) => Some(Op::SaveRegp { reg: reg + 2, off: off + 16 }),
                Some(Op::SaveRegpX { reg, .. }) => Some(Op::SaveRegp { reg: reg + 2, off: 16 }),
                Some(Op::SaveR19R20X(..)) => Some(Op::SaveRegp { reg: 21, off: 16 }),
                Some(Op::SaveFregp { reg, off }) => Some(Op::SaveFregp { reg: reg + 2, off: off + 16 }),
                Some(Op::SaveFregpX { reg, .. }) => Some(Op::SaveFregp { reg: reg + 2, off: 16 }),
                _ => None,
            };
            if let Some(next) = next {
                *op = next;
            }
        }
        if !matches!(op, Op::Nop) {
            prev = Some(*op);
        }
    }
    prolog.reverse();
    prolog
}

/// 操作列を実行する（アンワインド順）
fn execute(reader: &mut Reader<'_>, ops: &[Op], regs: &mut RegsArm64) -> Option<bool> {
    let mut pac = false;
    for op in ops {
        let sp = regs.sp;
        match *op {
            Op::Alloc(n) => regs.sp = sp.wrapping_add(n),
            Op::SaveR19R20X(off) => {
                regs.x[19] = reader.u64(sp)?;
                regs.x[20] = reader.u64(sp + 8)?;
                regs.sp = sp.wrapping_add(off);
            }
            Op::SaveFpLr(off) => {
                regs.x[RegsArm64::FP] = reader.u64(sp + off)?;
                regs.x[RegsArm64::LR] = reader.u64(sp + off + 8)?;
            }
            Op::SaveFpLrX(off) => {
                regs.x[RegsArm64::FP] = reader.u64(sp)?;
                regs.x[RegsArm64::LR] = reader.u64(sp + 8)?;
                regs.sp = sp.wrapping_add(off);
            }
            Op::SaveRegp { reg, off } => {
                *regs.x.get_mut(reg)? = reader.u64(sp + off)?;
                *regs.x.get_mut(reg + 1)? = reader.u64(sp + off + 8)?;
            }
            Op::SaveRegpX { reg, off } => {
                *regs.x.get_mut(reg)? = reader.u64(sp)?;
                *regs.x.get_mut(reg + 1)? = reader.u64(sp + 8)?;
                regs.sp = sp.wrapping_add(off);
            }
            Op::SaveReg { reg, off } => {
                *regs.x.get_mut(reg)? = reader.u64(sp + off)?;
            }
            Op::SaveRegX { reg, off } => {
                *regs.x.get_mut(reg)? = reader.u64(sp)?;
                regs.sp = sp.wrapping_add(off);
            }
            Op::SaveLrPair { reg, off } => {
                *regs.x.get_mut(reg)? = reader.u64(sp + off)?;
                regs.x[RegsArm64::LR] = reader.u64(sp + off + 8)?;
            }
            Op::SaveFregp { reg, off } => {
                *regs.v.get_mut(reg)? = reader.u64(sp + off)? as u128;
                *regs.v.get_mut(reg + 1)? = reader.u64(sp + off + 8)? as u128;
            }
            Op::SaveFregpX { reg, off } => {
                *regs.v.get_mut(reg)? = reader.u64(sp)? as u128;
                *regs.v.get_mut(reg + 1)? = reader.u64(sp + 8)? as u128;
                regs.sp = sp.wrapping_add(off);
            }
            Op::SaveFreg { reg, off } => {
                *regs.v.get_mut(reg)? = reader.u64(sp + off)? as u128;
            }
            Op::SaveFregX { reg, off } => {
                *regs.v.get_mut(reg)? = reader.u64(sp)? as u128;
                regs.sp = sp.wrapping_add(off);
            }
            Op::SetFp => regs.sp = regs.x[RegsArm64::FP],
            Op::AddFp(off) => regs.sp = regs.x[RegsArm64::FP].wrapping_sub(off),
            Op::PacSignLr => pac = true,
            Op::Nop | Op::End | Op::EndC | Op::SaveNext => {}
        }
    }
    Some(pac)
}

fn finish(regs: &mut RegsArm64, pac: bool) {
    let lr = regs.lr();
    regs.pc = if pac { lr & ADDRESS_MASK } else { lr };
}

/// 1フレーム巻き戻す
pub fn step(memory: &dyn MemoryView, module: Option<&ModuleImageInfo>, regs: &mut RegsArm64) -> UnwindStep {
    let mut reader = Reader::new(memory);
    if step_inner(&mut reader, module, regs).is_none() {
        reader.flags.insert(UnwindFlags::ERROR);
    }
    UnwindStep { flags: reader.flags }
}

fn step_inner(reader: &mut Reader<'_>, module: Option<&ModuleImageInfo>, regs: &mut RegsArm64) -> Option<()> {
    let found = module.and_then(|m| {
        let voff = regs.pc.checked_sub(m.base())?;
        pdata_arm64_search(&m.pdatas_arm64, voff).map(|p| (m.base(), voff, *p))
    });
    let Some((base, voff, pdata)) = found else {
        // リーフ関数
        finish(regs, false);
        return Some(());
    };

    let offset = voff - pdata.voff_first as u64;
    let flag = pdata.combined & 0x3;
    match flag {
        1 | 2 => {
            let packed = PackedUnwind::decode(pdata.combined);
            let pc = regs.pc;
            if simulate_epilog(reader, regs).is_some() {
                trace!("pc {:#x} is in a packed epilog", pc);
                return Some(());
            }
            let prolog = packed.prolog_ops();
            let executed = if flag == 2 {
                prolog.len()
            } else {
                ((offset / 4) as usize).min(prolog.len())
            };
            let unwind_order: Vec<Op> = prolog[..executed].iter().rev().copied().collect();
            let pac = execute(reader, &unwind_order, regs)?;
            finish(regs, pac);
            Some(())
        }
        0 => {
            let xdata = base + (pdata.combined & !0x3) as u64;
            unwind_unpacked(reader, xdata, offset, regs)
        }
        _ => None,
    }
}

fn unwind_unpacked(reader: &mut Reader<'_>, xdata: u64, offset: u64, regs: &mut RegsArm64) -> Option<()> {
    let header = read_xdata_header(reader, xdata)?;
    let scopes_at = xdata + header.header_size;
    let scope_count = if header.single_epilog { 0 } else { header.epilog_count as u64 };
    let codes_at = scopes_at + scope_count * 4;
    let mut code_bytes = vec![0u8; header.code_words as usize * 4];
    reader.bytes(codes_at, &mut code_bytes)?;

    let prolog_ops = resolve_save_next(&decode_codes(&code_bytes)?);
    let prolog_body: Vec<Op> = prolog_ops.iter().copied().filter(|op| !op.is_end()).collect();

    // エピローグの中か
    let ops_from = |index: usize| -> Option<Vec<Op>> {
        let ops = decode_codes(code_bytes.get(index..)?)?;
        Some(resolve_save_next(&ops).into_iter().filter(|op| !op.is_end()).collect())
    };
    let mut epilog: Option<Vec<Op>> = None;
    if header.single_epilog {
        let ops = ops_from(header.epilog_count as usize)?;
        let start = header.function_length.saturating_sub((ops.len() as u64 + 1) * 4);
        if offset >= start && offset <= start + ops.len() as u64 * 4 {
            let done = ((offset - start) / 4) as usize;
            epilog = Some(ops[done.min(ops.len())..].to_vec());
        }
    } else {
        for i in 0..scope_count {
            let scope = reader.u32(scopes_at + i * 4)?;
            let start = (scope & 0x3FFFF) as u64 * 4;
            let index = (scope >> 22) as usize;
            let ops = ops_from(index)?;
            if offset >= start && offset <= start + ops.len() as u64 * 4 {
                let done = ((offset - start) / 4) as usize;
                epilog = Some(ops[done.min(ops.len())..].to_vec());
                break;
            }
        }
    }

    let ops = match epilog {
        Some(ops) => ops,
        None => {
            // プロローグの途中なら実行済みの命令だけ戻す
            let executed = (offset / 4) as usize;
            let skip = prolog_body.len().saturating_sub(executed);
            prolog_body[skip..].to_vec()
        }
    };
    let pac = execute(reader, &ops, regs)?;
    finish(regs, pac);
    Some(())
}

/// パック形式のエピローグを命令単位で模擬する
///
/// retまで辿れたらレジスタを更新して`Some(pac)`、パターンが外れたら`None`。
fn simulate_epilog(reader: &mut Reader<'_>, regs: &mut RegsArm64) -> Option<bool> {
    let mut sim = *regs;
    let mut pac = false;
    let mut pc = regs.pc;
    for _ in 0..MAX_EPILOG_INSTRUCTIONS {
        let mut b = [0u8; 4];
        reader.bytes_quiet(pc, &mut b)?;
        let insn = u32::from_le_bytes(b);
        let rt = (insn & 0x1F) as usize;
        let rn = (insn >> 5) & 0x1F;
        let rt2 = ((insn >> 10) & 0x1F) as usize;

        if insn & 0xFFFF_FC1F == 0xD65F_0000 {
            // ret
            let target = if rn == 31 { 0 } else { sim.x[rn as usize] };
            sim.pc = if pac { target & ADDRESS_MASK } else { target };
            *regs = sim;
            return Some(pac);
        } else if insn == 0xD503_23FF {
            pac = true;
        } else if insn == 0x9100_03BF {
            sim.sp = sim.x[RegsArm64::FP];
        } else if matches!(insn & 0xFFC0_0000, 0xA8C0_0000 | 0xA9C0_0000 | 0xA940_0000 | 0x6CC0_0000 | 0x6DC0_0000 | 0x6D40_0000) {
            if rn != SP {
                return None;
            }
            let imm7 = (((insn >> 15) & 0x7F) as i32) << 25 >> 25;
            let imm = (imm7 as i64 * 8) as u64;
            let kind = insn & 0xFFC0_0000;
            let is_fp = kind & 0x0400_0000 != 0;
            let post = kind == 0xA8C0_0000 || kind == 0x6CC0_0000;
            let pre = kind == 0xA9C0_0000 || kind == 0x6DC0_0000;
            let addr = if post { sim.sp } else { sim.sp.wrapping_add(imm) };
            let v1 = reader.u64(addr)?;
            let v2 = reader.u64(addr + 8)?;
            if is_fp {
                sim.v[rt] = v1 as u128;
                sim.v[rt2] = v2 as u128;
            } else {
                set_x(&mut sim, rt, v1);
                set_x(&mut sim, rt2, v2);
            }
            if post || pre {
                sim.sp = sim.sp.wrapping_add(imm);
            }
        } else if insn & 0xFFC0_0000 == 0xF940_0000 {
            if rn != SP {
                return None;
            }
            let imm = ((insn >> 10) & 0xFFF) as u64 * 8;
            let v = reader.u64(sim.sp.wrapping_add(imm))?;
            set_x(&mut sim, rt, v);
        } else if matches!(insn & 0xFFE0_0C00, 0xF840_0400 | 0xF840_0C00) {
            if rn != SP {
                return None;
            }
            let imm9 = ((((insn >> 12) & 0x1FF) as i32) << 23 >> 23) as i64 as u64;
            let post = insn & 0xFFE0_0C00 == 0xF840_0400;
            let addr = if post { sim.sp } else { sim.sp.wrapping_add(imm9) };
            let v = reader.u64(addr)?;
            set_x(&mut sim, rt, v);
            sim.sp = sim.sp.wrapping_add(imm9);
        } else if insn & 0xFF80_0000 == 0x9100_0000 && rn == SP && rt as u32 == SP {
            let mut imm = ((insn >> 10) & 0xFFF) as u64;
            if (insn >> 22) & 1 != 0 {
                imm <<= 12;
            }
            sim.sp = sim.sp.wrapping_add(imm);
        } else {
            return None;
        }
        pc += 4;
    }
    None
}

fn set_x(regs: &mut RegsArm64, reg: usize, value: u64) {
    if reg < 31 {
        regs.x[reg] = value;
    }
}

impl Reader<'_> {
    /// 失敗してもエラーフラグを立てない読み込み
    fn bytes_quiet(&mut self, vaddr: u64, buf: &mut [u8]) -> Option<()> {
        let before = self.flags;
        let result = self.bytes(vaddr, buf);
        if result.is_none() {
            self.flags = before;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::FlatMemory;
    use super::*;
    use crate::cache::PdataArm64;
    use crate::range::AddrRange;

    const BASE: u64 = 0x20000;
    const FUNC_VOFF: u32 = 0x1000;
    const FUNC: u64 = BASE + FUNC_VOFF as u64;
    const STACK: u64 = 0x7000_0000;
    const NOP: u32 = 0xD503_201F;

    fn packed_word(flag: u32, len_insns: u32, reg_f: u32, reg_i: u32, h: u32, cr: u32, frame: u32) -> u32 {
        flag | len_insns << 2 | reg_f << 13 | reg_i << 16 | h << 20 | cr << 21 | frame << 23
    }

    fn module(combined: u32) -> ModuleImageInfo {
        ModuleImageInfo {
            vaddr_range: AddrRange::from_len(BASE, 0x10000),
            pdatas_arm64: vec![PdataArm64 {
                voff_first: FUNC_VOFF,
                combined,
            }],
            ..Default::default()
        }
    }

    fn put_insns(memory: &mut FlatMemory, at: u64, insns: &[u32]) {
        for (i, insn) in insns.iter().enumerate() {
            memory.put_u32(at + i as u64 * 4, *insn);
        }
    }

    #[test]
    fn test_packed_prolog_ops() {
        let packed = PackedUnwind::decode(packed_word(1, 32, 0, 2, 0, 1, 2));
        assert_eq!(packed.frame_size, 32);
        let ops = packed.prolog_ops();
        assert_eq!(
            ops,
            vec![
                Op::SaveRegpX { reg: 19, off: 32 },
                Op::SaveReg { reg: RegsArm64::LR, off: 16 },
            ]
        );
        let effect: u64 = ops
            .iter()
            .map(|op| match op {
                Op::SaveRegpX { off, .. } | Op::SaveRegX { off, .. } => *off,
                Op::Alloc(n) => *n,
                _ => 0,
            })
            .sum();
        assert_eq!(effect, 32);
    }

    #[test]
    fn test_packed_frame_chain() {
        // RegI=0, CR=3, FrameSize=64: stp fp,lr,[sp,#-64]!; mov fp,sp
        let packed = PackedUnwind::decode(packed_word(1, 16, 0, 0, 0, 3, 4));
        assert_eq!(packed.prolog_ops(), vec![Op::SaveFpLrX(64), Op::SetFp]);
        let big = PackedUnwind::decode(packed_word(1, 16, 0, 0, 0, 2, 100));
        assert_eq!(
            big.prolog_ops(),
            vec![Op::PacSignLr, Op::Alloc(1600), Op::SaveFpLr(0), Op::SetFp]
        );
    }

    fn packed_memory() -> FlatMemory {
        let mut memory = FlatMemory::default();
        put_insns(&mut memory, FUNC, &[NOP; 32]);
        memory.put_u64(STACK, 0x1919);
        memory.put_u64(STACK + 8, 0x2020);
        memory.put_u64(STACK + 16, 0x40_5000);
        memory
    }

    #[test]
    fn test_packed_body_unwind() {
        let memory = packed_memory();
        let module = module(packed_word(1, 32, 0, 2, 0, 1, 2));
        let mut regs = RegsArm64::default();
        regs.pc = FUNC + 0x40;
        regs.sp = STACK;
        let step = step(&memory, Some(&module), &mut regs);
        assert!(!step.flags.is_error());
        assert_eq!(regs.x[19], 0x1919);
        assert_eq!(regs.x[20], 0x2020);
        assert_eq!(regs.lr(), 0x40_5000);
        assert_eq!(regs.pc, 0x40_5000);
        assert_eq!(regs.sp, STACK + 32);
    }

    #[test]
    fn test_packed_partial_prolog() {
        let memory = packed_memory();
        let module = module(packed_word(1, 32, 0, 2, 0, 1, 2));
        let mut regs = RegsArm64::default();
        regs.pc = FUNC + 4;
        regs.sp = STACK;
        regs.x[RegsArm64::LR] = 0x40_9000;
        assert!(!step(&memory, Some(&module), &mut regs).flags.is_error());
        assert_eq!(regs.x[19], 0x1919);
        assert_eq!(regs.sp, STACK + 32);
        // lrはまだ積まれていない
        assert_eq!(regs.pc, 0x40_9000);
    }

    #[test]
    fn test_packed_epilog_simulation() {
        let mut memory = packed_memory();
        // ldr lr,[sp,#16]; ldp x19,x20,[sp],#32; ret
        put_insns(&mut memory, FUNC + 0x70, &[0xF940_0BFE, 0xA8C2_53F3, 0xD65F_03C0]);
        let module = module(packed_word(1, 32, 0, 2, 0, 1, 2));
        let mut regs = RegsArm64::default();
        regs.pc = FUNC + 0x70;
        regs.sp = STACK;
        assert!(!step(&memory, Some(&module), &mut regs).flags.is_error());
        assert_eq!(regs.pc, 0x40_5000);
        assert_eq!(regs.sp, STACK + 32);
        assert_eq!(regs.x[20], 0x2020);
    }

    #[test]
    fn test_unpacked_frame_pointer() {
        let mut memory = FlatMemory::default();
        let xdata_voff = 0x3000u32;
        // 16命令、エピローグスコープなし、コード1ワード
        memory.put_u32(BASE + xdata_voff as u64, 16 | 1 << 27);
        // alloc_s 32; set_fp; save_fplr_x 16; end
        memory.put(BASE + xdata_voff as u64 + 4, &[0x02, 0xE1, 0x81, 0xE4]);
        put_insns(&mut memory, FUNC, &[NOP; 16]);
        let frame = STACK + 0x100;
        memory.put_u64(frame, 0xAAAA);
        memory.put_u64(frame + 8, 0x40_7000);

        let module = module(xdata_voff);
        let mut regs = RegsArm64::default();
        regs.pc = FUNC + 0x20;
        regs.sp = frame - 32;
        regs.x[RegsArm64::FP] = frame;
        assert!(!step(&memory, Some(&module), &mut regs).flags.is_error());
        assert_eq!(regs.fp(), 0xAAAA);
        assert_eq!(regs.pc, 0x40_7000);
        assert_eq!(regs.sp, frame + 16);
    }

    #[test]
    fn test_save_next_resolution() {
        let ops = decode_codes(&[0xE6, 0xCC, 0x03, 0xE4]).unwrap();
        assert_eq!(ops, vec![Op::SaveNext, Op::SaveRegpX { reg: 19, off: 32 }, Op::End]);
        let resolved = resolve_save_next(&ops);
        assert_eq!(
            resolved,
            vec![
                Op::SaveRegp { reg: 21, off: 16 },
                Op::SaveRegpX { reg: 19, off: 32 },
                Op::End
            ]
        );
    }

    #[test]
    fn test_unsupported_code_is_error() {
        assert!(decode_codes(&[0xE7]).is_none());

        let mut memory = FlatMemory::default();
        memory.put_u32(BASE + 0x3000, 16 | 1 << 27);
        memory.put(BASE + 0x3004, &[0xE7, 0xE4, 0xE4, 0xE4]);
        let module = module(0x3000);
        let mut regs = RegsArm64::default();
        regs.pc = FUNC + 0x20;
        assert!(step(&memory, Some(&module), &mut regs).flags.is_error());
    }

    #[test]
    fn test_no_pdata_returns_to_lr() {
        let memory = FlatMemory::default();
        let mut regs = RegsArm64::default();
        regs.pc = 0x1234;
        regs.x[RegsArm64::LR] = 0x5678;
        assert!(!step(&memory, None, &mut regs).flags.is_error());
        assert_eq!(regs.pc, 0x5678);
    }
}
