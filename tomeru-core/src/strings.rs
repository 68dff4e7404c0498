//! エンティティ名の文字列プール
//!
//! スレッド名の変更などで何度も確保/解放される文字列のバッファを使い回す。
//! 容量16..1024の2の冪ごとのバケットと、それより大きいもの用の
//! ベストフィットのバケットを持つ。

const SMALL_BUCKETS: usize = 7;
const MIN_CHUNK: usize = 16;
const MAX_SMALL_CHUNK: usize = 1024;

/// 長さ`len`の文字列が入るバケット（Noneはオーバーフロー用）
pub fn bucket_index(len: usize) -> Option<usize> {
    let size = (len + 1).next_power_of_two().max(MIN_CHUNK);
    if size > MAX_SMALL_CHUNK {
        return None;
    }
    Some(size.trailing_zeros() as usize - MIN_CHUNK.trailing_zeros() as usize)
}

/// バケットのチャンクサイズ
pub fn bucket_size(index: usize) -> usize {
    MIN_CHUNK << index
}

/// 文字列バッファのプール
#[derive(Debug, Default)]
pub struct StringPool {
    buckets: [Vec<String>; SMALL_BUCKETS],
    overflow: Vec<String>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 文字列を確保する
    ///
    /// 空文字列は確保しない。
    pub fn alloc(&mut self, s: &str) -> String {
        if s.is_empty() {
            return String::new();
        }
        let mut buf = match bucket_index(s.len()) {
            Some(idx) => self.buckets[idx]
                .pop()
                .unwrap_or_else(|| String::with_capacity(bucket_size(idx))),
            None => {
                // 入る中で一番小さいもの
                let needed = s.len() + 1;
                let best = self
                    .overflow
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| b.capacity() >= needed)
                    .min_by_key(|(_, b)| b.capacity())
                    .map(|(i, _)| i);
                match best {
                    Some(i) => self.overflow.swap_remove(i),
                    None => String::with_capacity(needed.next_power_of_two()),
                }
            }
        };
        buf.clear();
        buf.push_str(s);
        buf
    }

    /// 文字列をプールに返す
    pub fn release(&mut self, mut s: String) {
        let cap = s.capacity();
        if cap < MIN_CHUNK {
            return;
        }
        s.clear();
        if cap > MAX_SMALL_CHUNK {
            self.overflow.push(s);
            return;
        }
        // 容量以下で最大のバケット
        let floor = 1usize << (usize::BITS - 1 - cap.leading_zeros());
        let idx = floor.trailing_zeros() as usize - MIN_CHUNK.trailing_zeros() as usize;
        self.buckets[idx].push(s);
    }

    /// プールにある空きバッファの数
    pub fn free_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum::<usize>() + self.overflow.len()
    }
}
