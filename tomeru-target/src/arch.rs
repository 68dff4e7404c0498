//! アーキテクチャ

/// ターゲットのアーキテクチャ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Arch {
    #[default]
    Null,
    X86,
    X64,
    Arm32,
    Arm64,
}

impl Arch {
    /// アドレスのバイト数
    pub fn addr_size(&self) -> u64 {
        match self {
            Arch::Null => 0,
            Arch::X86 | Arch::Arm32 => 4,
            Arch::X64 | Arch::Arm64 => 8,
        }
    }

    /// ワイヤ形式の値
    pub fn to_u32(self) -> u32 {
        match self {
            Arch::Null => 0,
            Arch::X86 => 1,
            Arch::X64 => 2,
            Arch::Arm32 => 3,
            Arch::Arm64 => 4,
        }
    }

    /// ワイヤ形式の値から復元する（未知の値はNull）
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Arch::X86,
            2 => Arch::X64,
            3 => Arch::Arm32,
            4 => Arch::Arm64,
            _ => Arch::Null,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Arch::Null => "null",
            Arch::X86 => "x86",
            Arch::X64 => "x64",
            Arch::Arm32 => "arm32",
            Arch::Arm64 => "arm64",
        }
    }

    /// このビルドのホストアーキテクチャ
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Arch::X64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else if cfg!(target_arch = "x86") {
            Arch::X86
        } else {
            Arch::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_wire_values() {
        for arch in [Arch::Null, Arch::X86, Arch::X64, Arch::Arm32, Arch::Arm64] {
            assert_eq!(Arch::from_u32(arch.to_u32()), arch);
        }
        assert_eq!(Arch::from_u32(99), Arch::Null);
        assert_eq!(Arch::X64.addr_size(), 8);
        assert_eq!(Arch::X86.addr_size(), 4);
    }
}
