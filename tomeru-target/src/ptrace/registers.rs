//! レジスタアクセス機能

use crate::registers::x64;
use crate::{RegBlock, RegsX64, Result};
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

/// スレッドのレジスタ
pub struct Registers {
    tid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(tid: i32) -> Self {
        Self {
            tid: Pid::from_raw(tid),
        }
    }

    /// 生のレジスタを読み取る
    pub fn read_raw(&self) -> Result<user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.tid)?;
        Ok(regs)
    }

    /// 生のレジスタに書き込む
    pub fn write_raw(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.tid, regs)?;
        Ok(())
    }

    /// レジスタブロックとして読み取る
    pub fn read(&self) -> Result<RegBlock> {
        Ok(RegBlock::X64(regs_from_user(&self.read_raw()?)))
    }

    /// レジスタブロックを書き込む（セグメント以外の汎用レジスタのみ）
    pub fn write(&self, block: &RegBlock) -> Result<()> {
        let regs = match block {
            RegBlock::X64(regs) => regs,
            RegBlock::Arm64(_) => {
                return Err(anyhow::anyhow!("Cannot write arm64 registers to an x64 thread"))
            }
        };
        let mut raw = self.read_raw()?;
        user_from_regs(regs, &mut raw);
        self.write_raw(raw)
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        Ok(self.read_raw()?.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read_raw()?;
        regs.rip = pc;
        self.write_raw(regs)
    }
}

/// user_regs_struct → RegsX64
pub fn regs_from_user(u: &user_regs_struct) -> RegsX64 {
    let mut r = RegsX64::default();
    r.gpr[x64::RAX] = u.rax;
    r.gpr[x64::RCX] = u.rcx;
    r.gpr[x64::RDX] = u.rdx;
    r.gpr[x64::RBX] = u.rbx;
    r.gpr[x64::RSP] = u.rsp;
    r.gpr[x64::RBP] = u.rbp;
    r.gpr[x64::RSI] = u.rsi;
    r.gpr[x64::RDI] = u.rdi;
    r.gpr[x64::R8] = u.r8;
    r.gpr[9] = u.r9;
    r.gpr[10] = u.r10;
    r.gpr[11] = u.r11;
    r.gpr[12] = u.r12;
    r.gpr[13] = u.r13;
    r.gpr[14] = u.r14;
    r.gpr[x64::R15] = u.r15;
    r.rip = u.rip;
    r.rflags = u.eflags;
    r.cs = u.cs as u16;
    r.ss = u.ss as u16;
    r.ds = u.ds as u16;
    r.es = u.es as u16;
    r.fs = u.fs as u16;
    r.gs = u.gs as u16;
    r.fs_base = u.fs_base;
    r.gs_base = u.gs_base;
    r
}

/// RegsX64 → user_regs_struct（セグメントセレクタは触らない）
pub fn user_from_regs(r: &RegsX64, u: &mut user_regs_struct) {
    u.rax = r.gpr[x64::RAX];
    u.rcx = r.gpr[x64::RCX];
    u.rdx = r.gpr[x64::RDX];
    u.rbx = r.gpr[x64::RBX];
    u.rsp = r.gpr[x64::RSP];
    u.rbp = r.gpr[x64::RBP];
    u.rsi = r.gpr[x64::RSI];
    u.rdi = r.gpr[x64::RDI];
    u.r8 = r.gpr[x64::R8];
    u.r9 = r.gpr[9];
    u.r10 = r.gpr[10];
    u.r11 = r.gpr[11];
    u.r12 = r.gpr[12];
    u.r13 = r.gpr[13];
    u.r14 = r.gpr[14];
    u.r15 = r.gpr[x64::R15];
    u.rip = r.rip;
    u.eflags = r.rflags;
    u.fs_base = r.fs_base;
    u.gs_base = r.gs_base;
}
