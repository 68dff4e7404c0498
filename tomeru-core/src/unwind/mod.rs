//! スタックアンワインド
//!
//! 1フレームぶんの巻き戻し（[`step`]）と、それを繰り返す全体の巻き戻し（[`unwind`]）。
//! メモリはすべて [`MemoryView`] 経由で読む。

pub mod arm64;
pub mod x64;

use crate::cache::{ModuleImageInfo, ProcessMemoryCache};
use crate::range::AddrRange;
use crate::Deadline;
use std::sync::Arc;
use tomeru_target::{Arch, Handle, RegBlock};

/// 全体の巻き戻しで辿るフレーム数の上限
pub const MAX_FRAMES: usize = 1024;

/// アンワインドが読むメモリ
pub trait MemoryView {
    /// `buf`をすべて埋められたら`Some(古いか)`
    fn read_bytes(&self, vaddr: u64, buf: &mut [u8]) -> Option<bool>;
}

/// メモリキャッシュ越しのビュー
pub struct CachedMemory<'a> {
    pub cache: &'a ProcessMemoryCache,
    pub process: Handle,
    pub deadline: Deadline,
}

impl MemoryView for CachedMemory<'_> {
    fn read_bytes(&self, vaddr: u64, buf: &mut [u8]) -> Option<bool> {
        let range = AddrRange::from_len(vaddr, buf.len() as u64);
        let (data, stale) = self.cache.read_exact(self.process, range, self.deadline)?;
        buf.copy_from_slice(&data);
        Some(stale)
    }
}

/// アンワインドの結果フラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwindFlags(pub u32);

impl UnwindFlags {
    pub const ERROR: UnwindFlags = UnwindFlags(1 << 0);
    pub const STALE: UnwindFlags = UnwindFlags(1 << 1);

    pub fn contains(&self, other: UnwindFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: UnwindFlags) {
        self.0 |= other.0;
    }

    pub fn is_error(&self) -> bool {
        self.contains(Self::ERROR)
    }
}

/// 1ステップの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwindStep {
    pub flags: UnwindFlags,
}

/// メモリ読み込みの途中経過（古さを貯める）
pub(crate) struct Reader<'a> {
    memory: &'a dyn MemoryView,
    pub flags: UnwindFlags,
}

impl<'a> Reader<'a> {
    pub fn new(memory: &'a dyn MemoryView) -> Self {
        Self {
            memory,
            flags: UnwindFlags::default(),
        }
    }

    pub fn bytes(&mut self, vaddr: u64, buf: &mut [u8]) -> Option<()> {
        match self.memory.read_bytes(vaddr, buf) {
            Some(stale) => {
                if stale {
                    self.flags.insert(UnwindFlags::STALE);
                }
                Some(())
            }
            None => {
                self.flags.insert(UnwindFlags::ERROR);
                None
            }
        }
    }

    pub fn u8(&mut self, vaddr: u64) -> Option<u8> {
        let mut b = [0u8; 1];
        self.bytes(vaddr, &mut b)?;
        Some(b[0])
    }

    pub fn u16(&mut self, vaddr: u64) -> Option<u16> {
        let mut b = [0u8; 2];
        self.bytes(vaddr, &mut b)?;
        Some(u16::from_le_bytes(b))
    }

    pub fn u32(&mut self, vaddr: u64) -> Option<u32> {
        let mut b = [0u8; 4];
        self.bytes(vaddr, &mut b)?;
        Some(u32::from_le_bytes(b))
    }

    pub fn u64(&mut self, vaddr: u64) -> Option<u64> {
        let mut b = [0u8; 8];
        self.bytes(vaddr, &mut b)?;
        Some(u64::from_le_bytes(b))
    }

    pub fn u128(&mut self, vaddr: u64) -> Option<u128> {
        let mut b = [0u8; 16];
        self.bytes(vaddr, &mut b)?;
        Some(u128::from_le_bytes(b))
    }

    /// 読めるだけ読む（大きい窓から順に試し、最後は1バイトずつ）
    pub fn window(&mut self, vaddr: u64, sizes: &[usize]) -> Vec<u8> {
        for size in sizes {
            let mut buf = vec![0u8; *size];
            if let Some(stale) = self.memory.read_bytes(vaddr, &mut buf) {
                if stale {
                    self.flags.insert(UnwindFlags::STALE);
                }
                return buf;
            }
        }
        let smallest = sizes.iter().copied().min().unwrap_or(0);
        let mut out = Vec::new();
        let mut b = [0u8; 1];
        while out.len() < smallest {
            match self.memory.read_bytes(vaddr + out.len() as u64, &mut b) {
                Some(stale) => {
                    if stale {
                        self.flags.insert(UnwindFlags::STALE);
                    }
                    out.push(b[0]);
                }
                None => break,
            }
        }
        out
    }
}

/// 1フレーム巻き戻す（`regs`をその場で更新する）
pub fn step(memory: &dyn MemoryView, module: Option<&ModuleImageInfo>, regs: &mut RegBlock) -> UnwindStep {
    match regs {
        RegBlock::X64(r) => x64::step(memory, module, r),
        RegBlock::Arm64(r) => arm64::step(memory, module, r),
    }
}

/// 全体の巻き戻し結果
#[derive(Debug, Clone, Default)]
pub struct Unwind {
    pub frames: Vec<RegBlock>,
    pub flags: UnwindFlags,
}

/// ipが0になる、ipが繰り返す、またはステップが失敗するまで巻き戻す
///
/// `module_for`はアドレスを含むモジュールの情報を返す。
pub fn unwind(
    memory: &dyn MemoryView,
    module_for: &dyn Fn(u64) -> Option<Arc<ModuleImageInfo>>,
    regs: RegBlock,
) -> Unwind {
    let mut result = Unwind::default();
    let mut cur = regs;
    while result.frames.len() < MAX_FRAMES {
        let ip = cur.ip();
        if ip == 0 {
            break;
        }
        result.frames.push(cur);

        let module = module_for(ip);
        let mut next = cur;
        let step = step(memory, module.as_deref(), &mut next);
        result.flags.insert(UnwindFlags(step.flags.0 & UnwindFlags::STALE.0));
        if step.flags.is_error() {
            result.flags.insert(UnwindFlags::ERROR);
            break;
        }
        if next.ip() == ip && next.sp() == cur.sp() {
            break;
        }
        cur = next;
    }
    result
}

/// アーキテクチャの名前付きのフレーム表示用
pub fn describe_frame(index: usize, regs: &RegBlock) -> String {
    let width = match regs.arch() {
        Arch::X86 | Arch::Arm32 => 8,
        _ => 16,
    };
    format!("#{:<3} ip={:#0w$x} sp={:#0w$x}", index, regs.ip(), regs.sp(), w = width + 2)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::MemoryView;
    use std::collections::BTreeMap;

    /// テスト用の平らなメモリ
    #[derive(Default)]
    pub struct FlatMemory {
        pub bytes: BTreeMap<u64, u8>,
        pub stale: bool,
    }

    impl FlatMemory {
        pub fn put(&mut self, vaddr: u64, data: &[u8]) {
            for (i, b) in data.iter().enumerate() {
                self.bytes.insert(vaddr + i as u64, *b);
            }
        }

        pub fn put_u64(&mut self, vaddr: u64, v: u64) {
            self.put(vaddr, &v.to_le_bytes());
        }

        pub fn put_u32(&mut self, vaddr: u64, v: u32) {
            self.put(vaddr, &v.to_le_bytes());
        }
    }

    impl MemoryView for FlatMemory {
        fn read_bytes(&self, vaddr: u64, buf: &mut [u8]) -> Option<bool> {
            for (i, out) in buf.iter_mut().enumerate() {
                *out = *self.bytes.get(&(vaddr + i as u64))?;
            }
            Some(self.stale)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FlatMemory;
    use super::*;
    use tomeru_target::RegsX64;

    #[test]
    fn test_unwind_without_pdata_follows_return_addresses() {
        let mut memory = FlatMemory::default();
        let sp = 0x7000;
        // 2つの戻りアドレスのあとに0
        memory.put_u64(sp, 0x40_1000);
        memory.put_u64(sp + 8, 0x40_2000);
        memory.put_u64(sp + 16, 0);

        let mut regs = RegsX64::default();
        regs.rip = 0x40_0010;
        regs.set_rsp(sp);
        let result = unwind(&memory, &|_| None, RegBlock::X64(regs));
        let ips: Vec<u64> = result.frames.iter().map(|f| f.ip()).collect();
        assert_eq!(ips, vec![0x40_0010, 0x40_1000, 0x40_2000]);
        assert!(!result.flags.is_error());
    }

    #[test]
    fn test_unwind_stops_on_unreadable_stack() {
        let memory = FlatMemory::default();
        let mut regs = RegsX64::default();
        regs.rip = 0x40_0010;
        regs.set_rsp(0x9000);
        let result = unwind(&memory, &|_| None, RegBlock::X64(regs));
        assert_eq!(result.frames.len(), 1);
        assert!(result.flags.is_error());
    }

    #[test]
    fn test_stale_flag_propagates() {
        let mut memory = FlatMemory::default();
        memory.put_u64(0x7000, 0);
        memory.stale = true;
        let mut regs = RegsX64::default();
        regs.rip = 0x1;
        regs.set_rsp(0x7000);
        let result = unwind(&memory, &|_| None, RegBlock::X64(regs));
        assert!(result.flags.contains(UnwindFlags::STALE));
        assert_eq!(result.frames.len(), 1);
    }
}
