//! 逆アセンブル機能
//!
//! ステップオーバーで、現在の命令が呼び出し命令かどうかを判定します。
//! CLIの`disas`コマンドの表示にも使います。

use crate::Result;
use capstone::prelude::*;
use tomeru_target::Arch;

/// 1命令ぶんのコード読み込みに十分な長さ
pub const MAX_INSTRUCTION_LEN: usize = 16;

/// 逆アセンブルした命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub size: usize,
    pub mnemonic: String,
    pub operands: String,
}

impl Instruction {
    /// 直後の命令のアドレス（呼び出しからの戻り先）
    pub fn next_address(&self) -> u64 {
        self.address + self.size as u64
    }

    /// 呼び出し命令か
    pub fn is_call(&self) -> bool {
        matches!(self.mnemonic.as_str(), "call" | "callq" | "bl" | "blr" | "blraa" | "blrab")
    }
}

fn capstone_for(arch: Arch) -> Result<Capstone> {
    let cs = match arch {
        Arch::X64 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Intel)
            .build(),
        Arch::X86 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode32)
            .syntax(arch::x86::ArchSyntax::Intel)
            .build(),
        Arch::Arm64 => Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .build(),
        other => return Err(anyhow::anyhow!("Disassembly is not supported for {}", other.name())),
    };
    cs.map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))
}

/// バイト列を先頭から最大`max`命令まで逆アセンブルする
///
/// # Arguments
/// * `code` - 命令のバイト列
/// * `base_addr` - 先頭の命令のアドレス
/// * `arch` - アーキテクチャ
/// * `max` - 最大命令数
pub fn disassemble(code: &[u8], base_addr: u64, arch: Arch, max: usize) -> Result<Vec<Instruction>> {
    let cs = capstone_for(arch)?;
    let insns = cs
        .disasm_count(code, base_addr, max)
        .map_err(|e| anyhow::anyhow!("Failed to disassemble: {}", e))?;

    Ok(insns
        .as_ref()
        .iter()
        .map(|insn| Instruction {
            address: insn.address(),
            size: insn.bytes().len(),
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            operands: insn.op_str().unwrap_or("").to_string(),
        })
        .collect())
}

/// 先頭の命令が呼び出し命令ならそれを返す
pub fn call_at(code: &[u8], addr: u64, arch: Arch) -> Result<Option<Instruction>> {
    let first = disassemble(code, addr, arch, 1)?.into_iter().next();
    Ok(first.filter(|insn| insn.is_call()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_detection_x64() {
        // call rel32; mov rax, 1
        let code = [0xe8, 0x00, 0x00, 0x00, 0x00, 0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00];
        let call = call_at(&code, 0x1000, Arch::X64).unwrap().unwrap();
        assert_eq!(call.next_address(), 0x1005);

        assert!(call_at(&code[5..], 0x1005, Arch::X64).unwrap().is_none());
    }

    #[test]
    fn test_indirect_call_x64() {
        // call rax
        let code = [0xff, 0xd0];
        let call = call_at(&code, 0x2000, Arch::X64).unwrap().unwrap();
        assert_eq!(call.size, 2);
    }

    #[test]
    fn test_call_detection_arm64() {
        // bl #0; ret
        let code = [0x00, 0x00, 0x00, 0x94, 0xc0, 0x03, 0x5f, 0xd6];
        let call = call_at(&code, 0x4000, Arch::Arm64).unwrap().unwrap();
        assert_eq!(call.mnemonic, "bl");
        assert_eq!(call.next_address(), 0x4004);
        assert!(call_at(&code[4..], 0x4004, Arch::Arm64).unwrap().is_none());
    }

    #[test]
    fn test_disassemble_listing() {
        // push rbp; mov rbp, rsp; ret
        let code = [0x55, 0x48, 0x89, 0xe5, 0xc3];
        let insns = disassemble(&code, 0x1000, Arch::X64, 8).unwrap();
        let mnemonics: Vec<&str> = insns.iter().map(|i| i.mnemonic.as_str()).collect();
        assert_eq!(mnemonics, vec!["push", "mov", "ret"]);
        assert_eq!(insns[2].address, 0x1004);
    }
}
