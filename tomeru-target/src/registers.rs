//! レジスタブロック
//!
//! アーキテクチャごとの生のレジスタ集合。
//! x64の汎用レジスタは命令エンコーディング順（rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15）で並べる。
//! アンワインドコードのレジスタ番号をそのまま添字に使えるようにするため。

use crate::Arch;

/// x64 汎用レジスタの添字
pub mod x64 {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
    pub const R8: usize = 8;
    pub const R15: usize = 15;

    /// 表示用のレジスタ名
    pub const GPR_NAMES: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
}

/// x64 のレジスタ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegsX64 {
    pub gpr: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub fs_base: u64,
    pub gs_base: u64,
    pub xmm: [u128; 16],
}

impl RegsX64 {
    pub fn rsp(&self) -> u64 {
        self.gpr[x64::RSP]
    }

    pub fn set_rsp(&mut self, v: u64) {
        self.gpr[x64::RSP] = v;
    }
}

/// ARM64 のレジスタ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegsArm64 {
    /// x0..x30（x29 = fp, x30 = lr）
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    /// v0..v31（d8..d15 は下位64ビット）
    pub v: [u128; 32],
}

impl Default for RegsArm64 {
    fn default() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
            v: [0; 32],
        }
    }
}

impl RegsArm64 {
    pub const FP: usize = 29;
    pub const LR: usize = 30;

    pub fn fp(&self) -> u64 {
        self.x[Self::FP]
    }

    pub fn lr(&self) -> u64 {
        self.x[Self::LR]
    }
}

/// アーキテクチャ別のレジスタブロック
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBlock {
    X64(RegsX64),
    Arm64(RegsArm64),
}

impl RegBlock {
    /// アーキテクチャに応じたゼロ初期化ブロック
    pub fn zeroed(arch: Arch) -> Option<Self> {
        match arch {
            Arch::X64 => Some(RegBlock::X64(RegsX64::default())),
            Arch::Arm64 => Some(RegBlock::Arm64(RegsArm64::default())),
            _ => None,
        }
    }

    pub fn arch(&self) -> Arch {
        match self {
            RegBlock::X64(_) => Arch::X64,
            RegBlock::Arm64(_) => Arch::Arm64,
        }
    }

    /// 命令ポインタ
    pub fn ip(&self) -> u64 {
        match self {
            RegBlock::X64(r) => r.rip,
            RegBlock::Arm64(r) => r.pc,
        }
    }

    pub fn set_ip(&mut self, v: u64) {
        match self {
            RegBlock::X64(r) => r.rip = v,
            RegBlock::Arm64(r) => r.pc = v,
        }
    }

    /// スタックポインタ
    pub fn sp(&self) -> u64 {
        match self {
            RegBlock::X64(r) => r.rsp(),
            RegBlock::Arm64(r) => r.sp,
        }
    }

    pub fn set_sp(&mut self, v: u64) {
        match self {
            RegBlock::X64(r) => r.set_rsp(v),
            RegBlock::Arm64(r) => r.sp = v,
        }
    }

    /// 名前でレジスタ値を引く（式評価器用）
    pub fn value_by_name(&self, name: &str) -> Option<u64> {
        let name = name.to_ascii_lowercase();
        match self {
            RegBlock::X64(r) => match name.as_str() {
                "rip" | "pc" => Some(r.rip),
                "rflags" | "eflags" => Some(r.rflags),
                "sp" => Some(r.rsp()),
                "fp" => Some(r.gpr[x64::RBP]),
                "fs_base" => Some(r.fs_base),
                "gs_base" => Some(r.gs_base),
                other => x64::GPR_NAMES
                    .iter()
                    .position(|n| *n == other)
                    .map(|idx| r.gpr[idx]),
            },
            RegBlock::Arm64(r) => match name.as_str() {
                "pc" => Some(r.pc),
                "sp" => Some(r.sp),
                "fp" => Some(r.fp()),
                "lr" => Some(r.lr()),
                "pstate" => Some(r.pstate),
                other => {
                    let idx: usize = other.strip_prefix('x')?.parse().ok()?;
                    r.x.get(idx).copied()
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_sp_accessors() {
        let mut block = RegBlock::zeroed(Arch::X64).unwrap();
        block.set_ip(0x401000);
        block.set_sp(0x7ffe0000);
        assert_eq!(block.ip(), 0x401000);
        assert_eq!(block.sp(), 0x7ffe0000);
        match block {
            RegBlock::X64(r) => assert_eq!(r.gpr[x64::RSP], 0x7ffe0000),
            _ => panic!("Expected x64 block"),
        }
    }

    #[test]
    fn test_value_by_name() {
        let mut regs = RegsX64::default();
        regs.gpr[x64::RBX] = 7;
        regs.rip = 0x10;
        let block = RegBlock::X64(regs);
        assert_eq!(block.value_by_name("rbx"), Some(7));
        assert_eq!(block.value_by_name("RIP"), Some(0x10));
        assert_eq!(block.value_by_name("x3"), None);

        let mut arm = RegsArm64::default();
        arm.x[3] = 42;
        arm.x[RegsArm64::LR] = 0x1234;
        let block = RegBlock::Arm64(arm);
        assert_eq!(block.value_by_name("x3"), Some(42));
        assert_eq!(block.value_by_name("lr"), Some(0x1234));
        assert_eq!(block.value_by_name("x31"), None);
    }
}
