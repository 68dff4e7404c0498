//! 内容アドレスのブロブストア
//!
//! キーごとに直近2つのハッシュを覚えておき、メモリキャッシュが
//! 「前回から変わったバイト」を出せるようにする。

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// ブロブのハッシュ
pub type BlobHash = [u8; 32];

/// キャッシュの論理キー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey(pub u128);

impl StoreKey {
    /// 任意のバイト列からキーを作る
    pub fn derive(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        let hash = hasher.finalize();
        let mut b = [0u8; 16];
        b.copy_from_slice(&hash.as_bytes()[..16]);
        StoreKey(u128::from_le_bytes(b))
    }
}

/// 内容アドレスのブロブストア
pub trait BlobStore: Send + Sync {
    /// データを登録し、キーの最新ハッシュにする
    fn submit(&self, key: StoreKey, data: Vec<u8>) -> BlobHash;

    /// キーのハッシュ（`rewind`=0が最新、1がひとつ前）
    fn hash_from_key(&self, key: StoreKey, rewind: usize) -> Option<BlobHash>;

    /// ハッシュからデータ
    fn data_from_hash(&self, hash: &BlobHash) -> Option<Arc<[u8]>>;
}

/// キーの履歴の深さ
const KEY_HISTORY: usize = 2;

#[derive(Debug, Default)]
struct HashStoreInner {
    blobs: HashMap<BlobHash, (Arc<[u8]>, usize)>,
    keys: HashMap<StoreKey, Vec<BlobHash>>,
}

impl HashStoreInner {
    fn unref(&mut self, hash: &BlobHash) {
        let remove = match self.blobs.get_mut(hash) {
            Some((_, refs)) => {
                *refs -= 1;
                *refs == 0
            }
            None => false,
        };
        if remove {
            self.blobs.remove(hash);
        }
    }
}

/// blake3で内容をアドレスするストア
///
/// ブロブはキーの履歴から参照されている間だけ残る。
#[derive(Debug, Default)]
pub struct HashStore {
    inner: RwLock<HashStoreInner>,
}

impl HashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保持しているブロブの数
    pub fn blob_count(&self) -> usize {
        self.inner.read().blobs.len()
    }
}

impl BlobStore for HashStore {
    fn submit(&self, key: StoreKey, data: Vec<u8>) -> BlobHash {
        let hash: BlobHash = *blake3::hash(&data).as_bytes();
        let mut inner = self.inner.write();

        let history = inner.keys.entry(key).or_default();
        if history.first() == Some(&hash) {
            return hash;
        }
        history.insert(0, hash);
        let evicted = if history.len() > KEY_HISTORY {
            history.pop()
        } else {
            None
        };

        inner
            .blobs
            .entry(hash)
            .and_modify(|(_, refs)| *refs += 1)
            .or_insert_with(|| (Arc::from(data), 1));
        if let Some(old) = evicted {
            inner.unref(&old);
        }
        hash
    }

    fn hash_from_key(&self, key: StoreKey, rewind: usize) -> Option<BlobHash> {
        self.inner.read().keys.get(&key)?.get(rewind).copied()
    }

    fn data_from_hash(&self, hash: &BlobHash) -> Option<Arc<[u8]>> {
        self.inner.read().blobs.get(hash).map(|(data, _)| data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_and_refcount() {
        let store = HashStore::new();
        let key = StoreKey::derive(&[b"page", &0x1000u64.to_le_bytes()]);

        let h1 = store.submit(key, vec![1, 2, 3]);
        assert_eq!(store.submit(key, vec![1, 2, 3]), h1);
        assert_eq!(store.hash_from_key(key, 1), None);

        let h2 = store.submit(key, vec![4, 5, 6]);
        assert_eq!(store.hash_from_key(key, 0), Some(h2));
        assert_eq!(store.hash_from_key(key, 1), Some(h1));
        assert_eq!(&*store.data_from_hash(&h1).unwrap(), &[1, 2, 3]);

        // 3つ目で最古が押し出される
        store.submit(key, vec![7]);
        assert!(store.data_from_hash(&h1).is_none());
        assert_eq!(store.blob_count(), 2);
    }

    #[test]
    fn test_shared_content() {
        let store = HashStore::new();
        let a = StoreKey::derive(&[b"a"]);
        let b = StoreKey::derive(&[b"b"]);
        assert_ne!(a, b);
        let ha = store.submit(a, vec![9; 16]);
        let hb = store.submit(b, vec![9; 16]);
        assert_eq!(ha, hb);
        assert_eq!(store.blob_count(), 1);
    }
}
