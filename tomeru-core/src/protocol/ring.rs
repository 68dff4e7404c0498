//! Mutex + Condvarで守られたバイトリング
//!
//! 1ユニット = `u64`の長さ前置 + ペイロード + 8バイト境界までのパディング。

use crate::Deadline;
use parking_lot::{Condvar, Mutex};

const PREFIX: usize = 8;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[derive(Debug)]
struct RingState {
    buf: Vec<u8>,
    /// 読み込み位置（単調増加）
    read_pos: u64,
    /// 書き込み位置（単調増加）
    write_pos: u64,
}

impl RingState {
    fn used(&self) -> usize {
        (self.write_pos - self.read_pos) as usize
    }

    fn copy_in(&mut self, data: &[u8]) {
        let cap = self.buf.len();
        let start = (self.write_pos % cap as u64) as usize;
        let first = data.len().min(cap - start);
        self.buf[start..start + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        self.write_pos += data.len() as u64;
    }

    fn copy_out(&self, offset: usize, out: &mut [u8]) {
        let cap = self.buf.len();
        let start = ((self.read_pos + offset as u64) % cap as u64) as usize;
        let first = out.len().min(cap - start);
        let n = out.len();
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        out[first..].copy_from_slice(&self.buf[..n - first]);
    }
}

/// バイトリング
#[derive(Debug)]
pub struct Ring {
    state: Mutex<RingState>,
    cv: Condvar,
    capacity: usize,
}

impl Ring {
    /// 容量は8の倍数に切り上げる
    pub fn new(capacity: usize) -> Self {
        let capacity = align8(capacity.max(PREFIX * 2));
        Self {
            state: Mutex::new(RingState {
                buf: vec![0u8; capacity],
                read_pos: 0,
                write_pos: 0,
            }),
            cv: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 1ユニットを書き込む
    ///
    /// 空きができるまで締め切りまで待つ。容量を超えるユニットは書けない。
    pub fn write(&self, payload: &[u8], deadline: Deadline) -> bool {
        let unit = PREFIX + align8(payload.len());
        if unit > self.capacity {
            tracing::warn!("Ring unit of {} bytes exceeds capacity {}", unit, self.capacity);
            return false;
        }

        let mut state = self.state.lock();
        while self.capacity - state.used() < unit {
            match deadline.instant() {
                Some(at) => {
                    if self.cv.wait_until(&mut state, at).timed_out()
                        && self.capacity - state.used() < unit
                    {
                        return false;
                    }
                }
                None => self.cv.wait(&mut state),
            }
        }

        state.copy_in(&(payload.len() as u64).to_le_bytes());
        state.copy_in(payload);
        let pad = unit - PREFIX - payload.len();
        if pad > 0 {
            state.copy_in(&[0u8; 8][..pad]);
        }
        drop(state);
        self.cv.notify_all();
        true
    }

    /// 1ユニットを読む
    ///
    /// ユニットが届くまで締め切りまで待つ。
    pub fn read(&self, deadline: Deadline) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        while state.used() < PREFIX {
            match deadline.instant() {
                Some(at) => {
                    if self.cv.wait_until(&mut state, at).timed_out() && state.used() < PREFIX {
                        return None;
                    }
                }
                None => self.cv.wait(&mut state),
            }
        }

        let mut prefix = [0u8; PREFIX];
        state.copy_out(0, &mut prefix);
        let len = u64::from_le_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        state.copy_out(PREFIX, &mut payload);
        state.read_pos += (PREFIX + align8(len)) as u64;
        drop(state);
        self.cv.notify_all();
        Some(payload)
    }

    /// 待たずに読めるだけ読む
    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(unit) = self.read(Deadline::now()) {
            out.push(unit);
        }
        out
    }

    /// 書き込み済みで未読のバイト数
    pub fn used(&self) -> usize {
        self.state.lock().used()
    }
}
