//! レジスタキャッシュ

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tomeru_target::{Arch, DebugApi, Handle, RegBlock};
use tracing::debug;

const STRIPES: usize = 16;

/// スレッドごとのレジスタのスナップショット
///
/// デバッグAPIのレジスタ世代が動いたときだけOSから取り直す。
pub struct RegisterCache {
    api: Arc<dyn DebugApi>,
    stripes: Vec<RwLock<HashMap<Handle, (RegBlock, u64)>>>,
}

impl RegisterCache {
    pub fn new(api: Arc<dyn DebugApi>) -> Self {
        Self {
            api,
            stripes: (0..STRIPES).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, thread: Handle) -> &RwLock<HashMap<Handle, (RegBlock, u64)>> {
        let h = thread.os.0 ^ thread.os.0 >> 17 ^ thread.machine_id;
        &self.stripes[(h as usize) % STRIPES]
    }

    /// レジスタを読む
    ///
    /// 取り直しに失敗したら最後のスナップショットを返す。
    pub fn read(&self, thread: Handle, arch: Arch) -> Option<RegBlock> {
        let gen = self.api.reg_gen();
        let stripe = self.stripe(thread);
        if let Some((block, at)) = stripe.read().get(&thread) {
            if *at == gen && (arch == Arch::Null || block.arch() == arch) {
                return Some(*block);
            }
        }

        match self.api.read_regs(thread.os) {
            Some(block) => {
                stripe.write().insert(thread, (block, gen));
                Some(block)
            }
            None => {
                debug!("Failed to refresh registers of {}", thread.os);
                stripe.read().get(&thread).map(|(block, _)| *block)
            }
        }
    }

    /// レジスタを書く
    pub fn write(&self, thread: Handle, block: &RegBlock) -> bool {
        if !self.api.write_regs(thread.os, block) {
            return false;
        }
        let gen = self.api.reg_gen();
        self.stripe(thread).write().insert(thread, (*block, gen));
        true
    }

    pub fn ip(&self, thread: Handle, arch: Arch) -> Option<u64> {
        self.read(thread, arch).map(|r| r.ip())
    }

    pub fn sp(&self, thread: Handle, arch: Arch) -> Option<u64> {
        self.read(thread, arch).map(|r| r.sp())
    }

    /// 終了したスレッドのスナップショットを捨てる
    pub fn forget(&self, thread: Handle) {
        self.stripe(thread).write().remove(&thread);
    }
}
