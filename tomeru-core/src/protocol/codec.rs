//! メッセージ/イベントのバイナリ表現
//!
//! すべてリトルエンディアンで、フィールド順は固定。
//! 文字列とリストは`u64`の長さを前置する。

use super::event::{Event, EventKind, StopCause};
use super::msg::{Msg, MsgKind, MsgTrap, UserBreakpoint, UserBreakpointKind};
use crate::exception_codes::ExceptionCodeFilter;
use crate::range::AddrRange;
use crate::Result;
use tomeru_target::{Arch, ExceptionKind, Handle, OsHandle};

/// イベントの固定部分の大きさ（文字列の長さ前置を含む）
pub const EVENT_FIXED_SIZE: usize = 4 * 3 + 8 * 4 + 4 + 8 * 2 + 8 * 2 + 8 * 4 + 4 * 2 + 8;

/// 書き込み側
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.u64(v.len() as u64);
        self.buf.extend_from_slice(v);
    }

    pub fn str(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }

    pub fn strs(&mut self, v: &[String]) {
        self.u64(v.len() as u64);
        for s in v {
            self.str(s);
        }
    }
}

/// 読み込み側
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Failed to decode: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.data.len()
                )
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn len(&mut self) -> Result<usize> {
        let len = self.u64()?;
        usize::try_from(len).map_err(|_| anyhow::anyhow!("Failed to decode: length {} too large", len))
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.len()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn str(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|e| anyhow::anyhow!("Failed to decode string: {}", e))
    }

    pub fn strs(&mut self) -> Result<Vec<String>> {
        let count = self.len()?;
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(self.str()?);
        }
        Ok(out)
    }
}

fn encode_msg(enc: &mut Encoder, msg: &Msg) {
    enc.u32(msg.kind.to_u32());
    enc.u32(msg.run_flags);
    enc.u64(msg.msg_id);
    enc.u64(msg.machine_id);
    enc.u64(msg.entity.0);
    enc.u64(msg.parent.0);
    enc.u64(msg.entity_id);
    enc.u32(msg.exit_code);
    enc.u8(msg.env_inherit as u8);
    enc.u64(msg.exception_code_filters.0);
    enc.u8(msg.freeze_state_is_frozen as u8);

    enc.str(&msg.path);
    enc.strs(&msg.entry_points);
    enc.strs(&msg.cmd_line);
    enc.strs(&msg.env);
    enc.str(&msg.stdout_path);
    enc.str(&msg.stderr_path);
    enc.str(&msg.stdin_path);

    enc.u64(msg.traps.len() as u64);
    for trap in &msg.traps {
        enc.u32(trap.flags);
        enc.u64(trap.vaddr);
    }

    enc.u64(msg.user_bps.len() as u64);
    for bp in &msg.user_bps {
        enc.u32(bp.kind.to_u32());
        enc.str(&bp.string);
        enc.u64(bp.line);
        enc.u64(bp.column);
        enc.u64(bp.u64);
        enc.str(&bp.condition);
    }

    enc.u64(msg.freeze_state_threads.len() as u64);
    for handle in &msg.freeze_state_threads {
        enc.u64(handle.machine_id);
        enc.u64(handle.os.0);
    }

    enc.bytes(&msg.meta);
}

fn decode_msg(dec: &mut Decoder<'_>) -> Result<Msg> {
    let mut msg = Msg {
        kind: MsgKind::from_u32(dec.u32()?),
        run_flags: dec.u32()?,
        msg_id: dec.u64()?,
        machine_id: dec.u64()?,
        entity: OsHandle(dec.u64()?),
        parent: OsHandle(dec.u64()?),
        entity_id: dec.u64()?,
        exit_code: dec.u32()?,
        env_inherit: dec.u8()? != 0,
        exception_code_filters: ExceptionCodeFilter(dec.u64()?),
        freeze_state_is_frozen: dec.u8()? != 0,
        ..Default::default()
    };

    msg.path = dec.str()?;
    msg.entry_points = dec.strs()?;
    msg.cmd_line = dec.strs()?;
    msg.env = dec.strs()?;
    msg.stdout_path = dec.str()?;
    msg.stderr_path = dec.str()?;
    msg.stdin_path = dec.str()?;

    let trap_count = dec.len()?;
    for _ in 0..trap_count {
        let flags = dec.u32()?;
        let vaddr = dec.u64()?;
        msg.traps.push(MsgTrap { flags, vaddr });
    }

    let bp_count = dec.len()?;
    for _ in 0..bp_count {
        let raw_kind = dec.u32()?;
        let kind = UserBreakpointKind::from_u32(raw_kind)
            .ok_or_else(|| anyhow::anyhow!("Failed to decode breakpoint kind {}", raw_kind))?;
        msg.user_bps.push(UserBreakpoint {
            kind,
            string: dec.str()?,
            line: dec.u64()?,
            column: dec.u64()?,
            u64: dec.u64()?,
            condition: dec.str()?,
        });
    }

    let freeze_count = dec.len()?;
    for _ in 0..freeze_count {
        let machine_id = dec.u64()?;
        let os = OsHandle(dec.u64()?);
        msg.freeze_state_threads.push(Handle::new(machine_id, os));
    }

    msg.meta = dec.bytes()?;
    Ok(msg)
}

/// メッセージのリストを1ユニットにする
pub fn encode_msgs(msgs: &[Msg]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u64(msgs.len() as u64);
    for msg in msgs {
        encode_msg(&mut enc, msg);
    }
    enc.into_bytes()
}

pub fn decode_msgs(data: &[u8]) -> Result<Vec<Msg>> {
    let mut dec = Decoder::new(data);
    let count = dec.len()?;
    let mut msgs = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        msgs.push(decode_msg(&mut dec)?);
    }
    Ok(msgs)
}

pub fn encode_event(event: &Event) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u32(event.kind.to_u32());
    enc.u32(event.cause.to_u32());
    enc.u32(event.exception_kind.to_u32());
    enc.u64(event.msg_id);
    enc.u64(event.machine_id);
    enc.u64(event.entity.0);
    enc.u64(event.parent.0);
    enc.u32(event.arch.to_u32());
    enc.u64(event.code);
    enc.u64(event.entity_id);
    enc.u64(event.vaddr_range.min);
    enc.u64(event.vaddr_range.max);
    enc.u64(event.rip);
    enc.u64(event.stack_base);
    enc.u64(event.tls_root);
    enc.u64(event.timestamp);
    enc.u32(event.rgba);
    enc.u32(event.exception_code);
    enc.str(&event.string);
    enc.into_bytes()
}

pub fn decode_event(data: &[u8]) -> Result<Event> {
    let mut dec = Decoder::new(data);
    let event = Event {
        kind: EventKind::from_u32(dec.u32()?),
        cause: StopCause::from_u32(dec.u32()?),
        exception_kind: ExceptionKind::from_u32(dec.u32()?),
        msg_id: dec.u64()?,
        machine_id: dec.u64()?,
        entity: OsHandle(dec.u64()?),
        parent: OsHandle(dec.u64()?),
        arch: Arch::from_u32(dec.u32()?),
        code: dec.u64()?,
        entity_id: dec.u64()?,
        vaddr_range: AddrRange::new(dec.u64()?, dec.u64()?),
        rip: dec.u64()?,
        stack_base: dec.u64()?,
        tls_root: dec.u64()?,
        timestamp: dec.u64()?,
        rgba: dec.u32()?,
        exception_code: dec.u32()?,
        string: dec.str()?,
    };
    Ok(event)
}

/// 文字数の境界を保ったまま`max_bytes`以下に切り詰める
pub fn truncate_at_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// 1イベントに載せられる文字列の最大バイト数
pub fn max_event_string(ring_capacity: usize) -> usize {
    // 長さ前置と8バイト境界までのパディング分を引く
    (ring_capacity / 2).saturating_sub(EVENT_FIXED_SIZE + 16)
}

/// リングに載る大きさにイベントを整える
///
/// DebugStringは複数のイベントに分け、それ以外は文字列を切り詰める。
pub fn fit_event(mut event: Event, ring_capacity: usize) -> Vec<Event> {
    let cap = max_event_string(ring_capacity).max(4);
    if event.string.len() <= cap {
        return vec![event];
    }
    if event.kind != EventKind::DebugString {
        truncate_at_char_boundary(&mut event.string, cap);
        return vec![event];
    }

    let full = std::mem::take(&mut event.string);
    let mut out = Vec::new();
    let mut rest = full.as_str();
    while !rest.is_empty() {
        let mut end = cap.min(rest.len());
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        let mut part = event.clone();
        part.string = head.to_string();
        out.push(part);
        rest = tail;
    }
    out
}
