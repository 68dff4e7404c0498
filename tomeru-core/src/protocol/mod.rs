//! 制御スレッドとコンシューマをつなぐメッセージ/イベントプロトコル
//!
//! コンシューマ→制御スレッドのメッセージリングと、
//! 制御スレッド→コンシューマのイベントリングの2本を持つ。

pub mod codec;
pub mod event;
pub mod msg;
pub mod ring;

pub use event::{Event, EventKind, EventPayload, StopCause};
pub use msg::{run_flags, trap_flags, Msg, MsgKind, MsgTrap, UserBreakpoint, UserBreakpointKind};
pub use ring::Ring;

use crate::Deadline;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// イベントリングが一杯のときに待つ単位（マイクロ秒）
const EVENT_PUSH_SLICE_US: u64 = 100;

/// 2本のリング
#[derive(Debug)]
pub struct Channels {
    msgs: Ring,
    events: Ring,
    closed: AtomicBool,
}

impl Channels {
    pub fn new(msg_capacity: usize, event_capacity: usize) -> Self {
        Self {
            msgs: Ring::new(msg_capacity),
            events: Ring::new(event_capacity),
            closed: AtomicBool::new(false),
        }
    }

    /// コンシューマ側: メッセージのリストを送る
    pub fn push_msgs(&self, msgs: &[Msg], deadline: Deadline) -> bool {
        if self.is_closed() {
            return false;
        }
        let unit = codec::encode_msgs(msgs);
        self.msgs.write(&unit, deadline)
    }

    /// 制御スレッド側: メッセージのリストを待つ
    ///
    /// 締め切りまでに届かなければ空を返す。
    pub fn pop_msgs(&self, deadline: Deadline) -> Vec<Msg> {
        let Some(unit) = self.msgs.read(deadline) else {
            return Vec::new();
        };
        match codec::decode_msgs(&unit) {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!("Dropping malformed message unit: {}", e);
                Vec::new()
            }
        }
    }

    /// 制御スレッド側: イベントを送る
    ///
    /// リングが一杯の間は短い間隔で待ち続ける（閉じられたら諦める）。
    pub fn push_events(&self, events: &[Event]) {
        for event in events {
            for part in codec::fit_event(event.clone(), self.events.capacity()) {
                let unit = codec::encode_event(&part);
                loop {
                    if self.events.write(&unit, Deadline::from_micros(EVENT_PUSH_SLICE_US)) {
                        break;
                    }
                    if self.is_closed() {
                        debug!("Event ring closed, dropping {}", part.kind.name());
                        return;
                    }
                }
            }
        }
    }

    /// コンシューマ側: 届いているイベントを待たずに取り出す
    pub fn pop_events(&self) -> Vec<Event> {
        self.events
            .drain()
            .into_iter()
            .filter_map(|unit| match codec::decode_event(&unit) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Dropping malformed event unit: {}", e);
                    None
                }
            })
            .collect()
    }

    /// コンシューマ側: イベントが1つ届くまで待ってから取り出せるだけ取り出す
    pub fn wait_events(&self, deadline: Deadline) -> Vec<Event> {
        let Some(first) = self.events.read(deadline) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        match codec::decode_event(&first) {
            Ok(event) => out.push(event),
            Err(e) => warn!("Dropping malformed event unit: {}", e),
        }
        out.extend(self.pop_events());
        out
    }

    /// 以後の送信を止める
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msgs_roundtrip_through_ring() {
        let channels = Channels::new(4096, 4096);
        let mut run = Msg::new(MsgKind::Run);
        run.msg_id = 9;
        run.user_bps.push(UserBreakpoint::symbol("main", 0).with_condition("1"));
        assert!(channels.push_msgs(&[Msg::new(MsgKind::Kill), run.clone()], Deadline::now()));

        let msgs = channels.pop_msgs(Deadline::now());
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1], run);
        assert!(channels.pop_msgs(Deadline::now()).is_empty());
    }

    #[test]
    fn test_events_drain() {
        let channels = Channels::new(4096, 4096);
        channels.push_events(&[Event::new(EventKind::Started), Event::stopped(StopCause::Finished)]);
        let events = channels.pop_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].cause, StopCause::Finished);
        assert!(channels.pop_events().is_empty());
    }

    #[test]
    fn test_long_debug_string_is_split() {
        let channels = Channels::new(4096, 1024);
        let mut event = Event::new(EventKind::DebugString);
        event.string = "y".repeat(3000);
        let consumer = std::thread::spawn({
            let channels = std::sync::Arc::new(channels);
            let producer = channels.clone();
            let handle = std::thread::spawn(move || producer.push_events(&[event]));
            move || {
                let mut total = String::new();
                while total.len() < 3000 {
                    for e in channels.wait_events(Deadline::after(std::time::Duration::from_secs(5))) {
                        assert_eq!(e.kind, EventKind::DebugString);
                        total.push_str(&e.string);
                    }
                }
                handle.join().unwrap();
                total
            }
        });
        assert_eq!(consumer.join().unwrap(), "y".repeat(3000));
    }
}
