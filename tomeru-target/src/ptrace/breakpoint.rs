//! 1回の実行の間だけ置くINT3パッチ

use super::memory::Memory;
use crate::Result;

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// 書き換えた1バイト
struct Patch {
    pid: i32,
    address: u64,
    saved: u8,
    /// 呼び出し側のトラップid（Breakpointイベントのcodeに載せる）
    id: u64,
}

/// `run`の間だけ設置するトラップの集合
///
/// 同じ(pid, アドレス)は一度しか書き換えない。外すときは設置と逆順に戻すので、
/// 重なった書き換えがあっても元のバイトが残る。
#[derive(Default)]
pub struct TrapPatches {
    patches: Vec<Patch>,
}

impl TrapPatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// 置かれていればそのトラップid
    pub fn id_at(&self, pid: i32, address: u64) -> Option<u64> {
        self.patches
            .iter()
            .find(|p| p.pid == pid && p.address == address)
            .map(|p| p.id)
    }

    /// トラップを置く（既に置いてあれば何もしない）
    pub fn place(&mut self, pid: i32, address: u64, id: u64) -> Result<()> {
        if self.id_at(pid, address).is_some() {
            return Ok(());
        }
        let memory = Memory::new(pid);
        let saved = memory.read_u8(address)?;
        memory.write_u8(address, INT3_OPCODE)?;
        self.patches.push(Patch { pid, address, saved, id });
        Ok(())
    }

    /// すべてのトラップを外す。`alive`がfalseのプロセスは触らない
    pub fn restore(&mut self, alive: impl Fn(i32) -> bool) {
        for patch in self.patches.drain(..).rev() {
            if !alive(patch.pid) {
                continue;
            }
            if let Err(e) = Memory::new(patch.pid).write_u8(patch.address, patch.saved) {
                tracing::warn!("failed to restore byte at {:#x} in {}: {}", patch.address, patch.pid, e);
            }
        }
    }
}
