//! プロセスメモリキャッシュ
//!
//! ターゲットのメモリを4KiBページ単位でブロブストアに置き、
//! デバッグAPIのメモリ世代と比べて古くなったページをワーカーに読み直させる。
//! 読み手はストライプごとのCondvarで、締め切りまで新しい内容を待つ。

use super::hash_store::{BlobHash, BlobStore, StoreKey};
use crate::config::MemoryCacheConfig;
use crate::range::AddrRange;
use crate::Deadline;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tomeru_target::{DebugApi, Handle};
use tracing::{debug, trace, warn};

/// ページの大きさ
pub const PAGE_SIZE: u64 = 0x1000;
/// 1回の読み込みで受け付ける範囲の上限
pub const MAX_READ_SIZE: u64 = 256 * 1024 * 1024;
/// ユーザー空間アドレスの上限
pub const MAX_VADDR: u64 = 0x000F_FFFF_FFFF_FFFF;
/// 読めなかったときに範囲を半分にする回数の上限
const MAX_READ_RETRIES: usize = 64;

/// 読み込み範囲として受け付けるか
pub fn is_valid_range(range: AddrRange) -> bool {
    range.max > range.min && range.len() <= MAX_READ_SIZE && range.max <= MAX_VADDR
}

/// キャッシュのノードキー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeKey {
    process: Handle,
    range: AddrRange,
    /// 0以外ならこの大きさのゼロ要素で終わる読み込み
    zero_terminated: u32,
}

impl NodeKey {
    fn store_key(&self) -> StoreKey {
        StoreKey::derive(&[
            b"process-memory",
            &self.process.machine_id.to_le_bytes(),
            &self.process.os.0.to_le_bytes(),
            &self.range.min.to_le_bytes(),
            &self.range.max.to_le_bytes(),
            &self.zero_terminated.to_le_bytes(),
        ])
    }
}

#[derive(Debug, Clone)]
struct NodeState {
    hash: Option<BlobHash>,
    /// 最後に読み込んだときのメモリ世代
    mem_gen: u64,
    last_requested: Option<Instant>,
    /// 最後に要求したときのメモリ世代
    requested_gen: u64,
    /// ワーカーが読み込み中
    is_taken: bool,
    clamped: AddrRange,
}

#[derive(Debug, Default)]
struct Stripe {
    nodes: RwLock<HashMap<NodeKey, NodeState>>,
    wait_lock: Mutex<()>,
    cv: Condvar,
}

struct Shared {
    stripes: Vec<Stripe>,
    api: Arc<dyn DebugApi>,
    store: Arc<dyn BlobStore>,
    config: MemoryCacheConfig,
}

impl Shared {
    fn stripe(&self, key: &NodeKey) -> &Stripe {
        let idx = (key.store_key().0 % self.stripes.len() as u128) as usize;
        &self.stripes[idx]
    }

    /// ワーカー: ノードを1つ読み直す
    fn service(&self, key: NodeKey) {
        let stripe = self.stripe(&key);
        let clamped = {
            let mut nodes = stripe.nodes.write();
            let Some(node) = nodes.get_mut(&key) else {
                return;
            };
            if node.is_taken {
                return;
            }
            if node.hash.is_some() && node.mem_gen >= self.api.mem_gen() {
                // 既に最新
                drop(nodes);
                self.notify(stripe);
                return;
            }
            node.is_taken = true;
            node.clamped
        };

        let gen = self.api.mem_gen();
        let mut data = vec![0u8; clamped.len() as usize];
        let mut size = data.len();
        let mut read = 0;
        for _ in 0..MAX_READ_RETRIES {
            if size == 0 {
                break;
            }
            read = self.api.read_memory(key.process.os, clamped.min, &mut data[..size]);
            if read > 0 {
                break;
            }
            size /= 2;
        }
        data.truncate(read);
        if key.zero_terminated != 0 {
            let elem = key.zero_terminated as usize;
            if let Some(pos) = data
                .chunks(elem)
                .position(|c| c.len() == elem && c.iter().all(|b| *b == 0))
            {
                data.truncate(pos * elem);
            }
        }
        trace!(
            "Read {} of {} bytes at {:#x} (gen {})",
            read,
            clamped.len(),
            clamped.min,
            gen
        );
        let hash = self.store.submit(key.store_key(), data);

        {
            let mut nodes = stripe.nodes.write();
            if let Some(node) = nodes.get_mut(&key) {
                node.hash = Some(hash);
                node.mem_gen = gen;
                node.is_taken = false;
            }
        }
        self.notify(stripe);
    }

    fn notify(&self, stripe: &Stripe) {
        let _guard = stripe.wait_lock.lock();
        stripe.cv.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>, receiver: Receiver<NodeKey>) {
    while let Ok(key) = receiver.recv() {
        shared.service(key);
    }
    debug!("Memory worker exiting");
}

/// 1ノードを読んだ結果
struct NodeRead {
    data: Option<Arc<[u8]>>,
    previous: Option<Arc<[u8]>>,
    stale: bool,
}

/// 読み込み結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySlice {
    pub data: Vec<u8>,
    /// 読めなかったバイト（1ビット/バイト）
    pub byte_bad_flags: Vec<u64>,
    /// 前回の内容から変わったバイト
    pub byte_changed_flags: Vec<u64>,
    /// 締め切りまでに最新にならなかった
    pub stale: bool,
    pub any_byte_bad: bool,
    pub any_byte_changed: bool,
}

impl MemorySlice {
    fn with_len(len: usize) -> Self {
        let words = len.div_ceil(64);
        Self {
            data: vec![0u8; len],
            byte_bad_flags: vec![0u64; words],
            byte_changed_flags: vec![0u64; words],
            ..Default::default()
        }
    }

    fn mark_bad(&mut self, idx: usize) {
        self.byte_bad_flags[idx / 64] |= 1 << (idx % 64);
        self.any_byte_bad = true;
    }

    fn mark_changed(&mut self, idx: usize) {
        self.byte_changed_flags[idx / 64] |= 1 << (idx % 64);
        self.any_byte_changed = true;
    }

    pub fn is_bad(&self, idx: usize) -> bool {
        self.byte_bad_flags
            .get(idx / 64)
            .map(|w| w & (1 << (idx % 64)) != 0)
            .unwrap_or(true)
    }

    pub fn is_changed(&self, idx: usize) -> bool {
        self.byte_changed_flags
            .get(idx / 64)
            .map(|w| w & (1 << (idx % 64)) != 0)
            .unwrap_or(false)
    }

    /// 先頭から連続して読めたバイト数
    pub fn good_prefix_len(&self) -> usize {
        (0..self.data.len())
            .find(|i| self.is_bad(*i))
            .unwrap_or(self.data.len())
    }
}

/// プロセスメモリキャッシュ
pub struct ProcessMemoryCache {
    shared: Arc<Shared>,
    sender: Option<Sender<NodeKey>>,
    workers: Vec<JoinHandle<()>>,
}

impl ProcessMemoryCache {
    pub fn new(api: Arc<dyn DebugApi>, store: Arc<dyn BlobStore>, config: MemoryCacheConfig) -> Self {
        let stripes = (0..config.stripes.max(1)).map(|_| Stripe::default()).collect();
        let shared = Arc::new(Shared {
            stripes,
            api,
            store,
            config,
        });
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut workers = Vec::new();
        for i in 0..shared.config.workers.max(1) {
            let shared = shared.clone();
            let receiver = receiver.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("tomeru-mem-{}", i))
                .spawn(move || worker_loop(shared, receiver));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!("Failed to spawn memory worker: {}", e),
            }
        }
        Self {
            shared,
            sender: Some(sender),
            workers,
        }
    }

    fn request(&self, key: NodeKey) {
        match &self.sender {
            Some(sender) if !self.workers.is_empty() => {
                if sender.send(key).is_err() {
                    warn!("Memory workers are gone");
                }
            }
            // ワーカーがいなければ呼び出し側で読む
            _ => self.shared.service(key),
        }
    }

    /// ノードを作り、必要なら読み込みを要求する
    fn ensure_requested(&self, key: NodeKey, cur_gen: u64) {
        let stripe = self.shared.stripe(&key);
        let max_range = self.shared.config.max_range;
        let send = {
            let mut nodes = stripe.nodes.write();
            let node = nodes.entry(key).or_insert_with(|| NodeState {
                hash: None,
                mem_gen: 0,
                last_requested: None,
                requested_gen: 0,
                is_taken: false,
                clamped: AddrRange::new(key.range.min, key.range.min + key.range.len().min(max_range)),
            });
            let fresh = node.hash.is_some() && node.mem_gen >= cur_gen;
            let due = node.requested_gen != cur_gen
                || node
                    .last_requested
                    .map(|at| at.elapsed() >= self.shared.config.rate_limit)
                    .unwrap_or(true);
            if !fresh && !node.is_taken && due {
                node.requested_gen = cur_gen;
                node.last_requested = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if send {
            self.request(key);
        }
    }

    /// (ハッシュ, 最新か)
    fn status(&self, key: &NodeKey, cur_gen: u64) -> (Option<BlobHash>, bool) {
        let nodes = self.shared.stripe(key).nodes.read();
        match nodes.get(key) {
            Some(node) => (node.hash, node.hash.is_some() && node.mem_gen >= cur_gen),
            None => (None, false),
        }
    }

    fn read_node(&self, key: NodeKey, deadline: Deadline) -> NodeRead {
        let cur_gen = self.shared.api.mem_gen();
        let stripe = self.shared.stripe(&key);
        let (hash, stale) = loop {
            let (hash, fresh) = self.status(&key, cur_gen);
            if fresh {
                break (hash, false);
            }
            self.ensure_requested(key, cur_gen);

            let mut guard = stripe.wait_lock.lock();
            let (hash, fresh) = self.status(&key, cur_gen);
            if fresh {
                break (hash, false);
            }
            if deadline.expired() {
                break (hash, true);
            }
            // 無期限でも再要求できるようにレート制限ごとに起きる
            let wake = Deadline::after(self.shared.config.rate_limit).min(deadline);
            if let Some(at) = wake.instant() {
                stripe.cv.wait_until(&mut guard, at);
            }
        };

        let store = &self.shared.store;
        let skey = key.store_key();
        let data = hash.and_then(|h| store.data_from_hash(&h));
        let previous = store
            .hash_from_key(skey, 1)
            .and_then(|h| store.data_from_hash(&h));
        NodeRead {
            data,
            previous,
            stale,
        }
    }

    /// 範囲を読む
    pub fn read(&self, process: Handle, range: AddrRange, deadline: Deadline) -> MemorySlice {
        if !is_valid_range(range) {
            return MemorySlice {
                any_byte_bad: true,
                ..Default::default()
            };
        }

        let mut slice = MemorySlice::with_len(range.len() as usize);
        let mut page = range.min & !(PAGE_SIZE - 1);
        while page < range.max {
            let page_range = AddrRange::new(page, page + PAGE_SIZE);
            let key = NodeKey {
                process,
                range: page_range,
                zero_terminated: 0,
            };
            let node = self.read_node(key, deadline);
            slice.stale |= node.stale;

            let part = page_range.intersect(&range);
            for addr in part.min..part.max {
                let in_page = (addr - page) as usize;
                let out = (addr - range.min) as usize;
                match node.data.as_ref().and_then(|d| d.get(in_page)) {
                    Some(b) => {
                        slice.data[out] = *b;
                        if let Some(prev) = node.previous.as_ref().and_then(|p| p.get(in_page)) {
                            if prev != b {
                                slice.mark_changed(out);
                            }
                        }
                    }
                    None => slice.mark_bad(out),
                }
            }
            page += PAGE_SIZE;
        }
        slice
    }

    /// ゼロ要素で終わる範囲を読む（終端の要素は含まない）
    pub fn read_zero_terminated(
        &self,
        process: Handle,
        range: AddrRange,
        element_size: usize,
        deadline: Deadline,
    ) -> MemorySlice {
        if !is_valid_range(range) || element_size == 0 {
            return MemorySlice {
                any_byte_bad: true,
                ..Default::default()
            };
        }
        let key = NodeKey {
            process,
            range,
            zero_terminated: element_size as u32,
        };
        let node = self.read_node(key, deadline);
        let data = node.data.as_deref().unwrap_or(&[]);
        let mut slice = MemorySlice::with_len(data.len());
        slice.data.copy_from_slice(data);
        slice.stale = node.stale;
        if node.data.is_none() {
            slice.any_byte_bad = true;
        }
        if let Some(prev) = node.previous.as_deref() {
            for (i, b) in data.iter().enumerate() {
                if prev.get(i) != Some(b) {
                    slice.mark_changed(i);
                }
            }
        }
        slice
    }

    /// 範囲がすべて読めたときだけ返す（バイト列, 古いか）
    pub fn read_exact(&self, process: Handle, range: AddrRange, deadline: Deadline) -> Option<(Vec<u8>, bool)> {
        let slice = self.read(process, range, deadline);
        if slice.any_byte_bad || slice.data.len() as u64 != range.len() {
            return None;
        }
        Some((slice.data, slice.stale))
    }

    pub fn read_u64(&self, process: Handle, vaddr: u64, deadline: Deadline) -> Option<u64> {
        let (bytes, _) = self.read_exact(process, AddrRange::from_len(vaddr, 8), deadline)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes);
        Some(u64::from_le_bytes(b))
    }

    pub fn read_u32(&self, process: Handle, vaddr: u64, deadline: Deadline) -> Option<u32> {
        let (bytes, _) = self.read_exact(process, AddrRange::from_len(vaddr, 4), deadline)?;
        let mut b = [0u8; 4];
        b.copy_from_slice(&bytes);
        Some(u32::from_le_bytes(b))
    }

    /// 書き込み、重なるキャッシュ済みの範囲を短い締め切りで読み直す
    pub fn write(&self, process: Handle, vaddr: u64, data: &[u8]) -> bool {
        if !self.shared.api.write_memory(process.os, vaddr, data) {
            return false;
        }
        let written = AddrRange::from_len(vaddr, data.len() as u64);
        let limit = self.shared.config.seamless_write_limit;
        let mut overlapping = Vec::new();
        for stripe in &self.shared.stripes {
            let nodes = stripe.nodes.read();
            overlapping.extend(
                nodes
                    .keys()
                    .filter(|k| k.process == process && k.range.len() <= limit && k.range.overlaps(&written))
                    .copied(),
            );
        }
        let deadline = Deadline::after(self.shared.config.write_refresh);
        for key in overlapping {
            self.read_node(key, deadline);
        }
        true
    }

    /// すべてのノードを捨てる
    pub fn clear(&self) {
        for stripe in &self.shared.stripes {
            stripe.nodes.write().retain(|_, node| node.is_taken);
        }
    }

    /// キャッシュ済みのノード数
    pub fn node_count(&self) -> usize {
        self.shared.stripes.iter().map(|s| s.nodes.read().len()).sum()
    }

    pub fn rate_limit(&self) -> Duration {
        self.shared.config.rate_limit
    }
}

impl Drop for ProcessMemoryCache {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HashStore;
    use std::time::Duration;
    use tomeru_target::{MockApi, OsHandle};

    const PROCESS: OsHandle = OsHandle(0x100);

    fn cache_with(api: Arc<MockApi>) -> ProcessMemoryCache {
        let config = MemoryCacheConfig {
            workers: 2,
            ..Default::default()
        };
        ProcessMemoryCache::new(api, Arc::new(HashStore::new()), config)
    }

    fn wait() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[test]
    fn test_read_and_bad_bytes() {
        let api = Arc::new(MockApi::new());
        api.map_memory(PROCESS, 0x1000, &[0xAB; 0x1000]);
        let cache = cache_with(api.clone());
        let process = Handle::local(PROCESS);

        let slice = cache.read(process, AddrRange::new(0x1FF0, 0x2010), wait());
        assert_eq!(slice.data.len(), 0x20);
        assert!(!slice.stale);
        assert!(slice.any_byte_bad);
        assert_eq!(slice.good_prefix_len(), 0x10);
        assert!(slice.is_bad(0x10));
        assert_eq!(&slice.data[..0x10], &[0xAB; 0x10]);

        assert_eq!(cache.read_u32(process, 0x1000, wait()), Some(0xABAB_ABAB));
        assert!(cache.read_exact(process, AddrRange::new(0x1FFC, 0x2004), wait()).is_none());
    }

    #[test]
    fn test_invalid_ranges() {
        let api = Arc::new(MockApi::new());
        let cache = cache_with(api);
        let process = Handle::local(PROCESS);
        assert!(cache.read(process, AddrRange::new(0x2000, 0x1000), wait()).any_byte_bad);
        assert!(cache.read(process, AddrRange::new(0, MAX_READ_SIZE + 1), wait()).any_byte_bad);
        assert!(cache.read(process, AddrRange::new(MAX_VADDR, MAX_VADDR + 8), wait()).any_byte_bad);
    }

    #[test]
    fn test_read_your_write() {
        let api = Arc::new(MockApi::new());
        api.map_memory(PROCESS, 0x4000, &[0u8; 0x1000]);
        let cache = cache_with(api.clone());
        let process = Handle::local(PROCESS);

        assert_eq!(cache.read_u64(process, 0x4010, wait()), Some(0));
        assert!(cache.write(process, 0x4010, &0xDEAD_BEEFu64.to_le_bytes()));

        let slice = cache.read(process, AddrRange::from_len(0x4010, 8), wait());
        assert!(!slice.stale);
        assert_eq!(slice.data, 0xDEAD_BEEFu64.to_le_bytes());
        assert!(slice.any_byte_changed);
        assert!(slice.is_changed(0));
        assert!(!slice.is_changed(4));
    }

    #[test]
    fn test_fresh_page_is_not_reread() {
        let api = Arc::new(MockApi::new());
        api.map_memory(PROCESS, 0x1000, &[1u8; 0x100]);
        let cache = cache_with(api.clone());
        let process = Handle::local(PROCESS);

        cache.read(process, AddrRange::from_len(0x1000, 16), wait());
        let reads = api.memory_read_count();
        cache.read(process, AddrRange::from_len(0x1008, 16), wait());
        assert_eq!(api.memory_read_count(), reads);
        assert_eq!(cache.node_count(), 1);

        cache.clear();
        assert_eq!(cache.node_count(), 0);
    }

    #[test]
    fn test_zero_terminated() {
        let api = Arc::new(MockApi::new());
        api.map_memory(PROCESS, 0x3000, b"hello\0world");
        api.map_memory(PROCESS, 0x3100, &[b'a', 0, b'b', 0, 0, 0, b'c', 0]);
        let cache = cache_with(api);
        let process = Handle::local(PROCESS);

        let s = cache.read_zero_terminated(process, AddrRange::from_len(0x3000, 64), 1, wait());
        assert_eq!(s.data, b"hello");
        let w = cache.read_zero_terminated(process, AddrRange::from_len(0x3100, 8), 2, wait());
        assert_eq!(w.data, vec![b'a', 0, b'b', 0]);
    }
}
