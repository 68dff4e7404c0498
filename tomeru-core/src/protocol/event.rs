//! 制御スレッド→コンシューマのイベント

use crate::range::AddrRange;
use tomeru_target::{Arch, ExceptionKind, Handle, MachineId, OsHandle};

/// イベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventKind {
    #[default]
    Null,
    Error,
    // 実行の開始/停止
    Started,
    Stopped,
    // エンティティの作成/削除
    NewProc,
    NewThread,
    NewModule,
    EndProc,
    EndThread,
    EndModule,
    ModuleDebugInfoPathChange,
    // 文字列
    DebugString,
    ThreadName,
    ThreadColor,
    ThreadFrozen,
    // メモリ
    MemReserve,
    MemCommit,
    MemDecommit,
    MemRelease,
}

impl EventKind {
    pub const ALL: [EventKind; 19] = [
        EventKind::Null,
        EventKind::Error,
        EventKind::Started,
        EventKind::Stopped,
        EventKind::NewProc,
        EventKind::NewThread,
        EventKind::NewModule,
        EventKind::EndProc,
        EventKind::EndThread,
        EventKind::EndModule,
        EventKind::ModuleDebugInfoPathChange,
        EventKind::DebugString,
        EventKind::ThreadName,
        EventKind::ThreadColor,
        EventKind::ThreadFrozen,
        EventKind::MemReserve,
        EventKind::MemCommit,
        EventKind::MemDecommit,
        EventKind::MemRelease,
    ];

    pub fn to_u32(self) -> u32 {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(0) as u32
    }

    pub fn from_u32(v: u32) -> Self {
        Self::ALL.get(v as usize).copied().unwrap_or(EventKind::Null)
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Null => "Null",
            EventKind::Error => "Error",
            EventKind::Started => "Started",
            EventKind::Stopped => "Stopped",
            EventKind::NewProc => "NewProc",
            EventKind::NewThread => "NewThread",
            EventKind::NewModule => "NewModule",
            EventKind::EndProc => "EndProc",
            EventKind::EndThread => "EndThread",
            EventKind::EndModule => "EndModule",
            EventKind::ModuleDebugInfoPathChange => "ModuleDebugInfoPathChange",
            EventKind::DebugString => "DebugString",
            EventKind::ThreadName => "ThreadName",
            EventKind::ThreadColor => "ThreadColor",
            EventKind::ThreadFrozen => "ThreadFrozen",
            EventKind::MemReserve => "MemReserve",
            EventKind::MemCommit => "MemCommit",
            EventKind::MemDecommit => "MemDecommit",
            EventKind::MemRelease => "MemRelease",
        }
    }
}

/// 停止の原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StopCause {
    #[default]
    Null,
    Error,
    Finished,
    EntryPoint,
    UserBreakpoint,
    InterruptedByTrap,
    InterruptedByException,
    InterruptedByHalt,
}

impl StopCause {
    pub const ALL: [StopCause; 8] = [
        StopCause::Null,
        StopCause::Error,
        StopCause::Finished,
        StopCause::EntryPoint,
        StopCause::UserBreakpoint,
        StopCause::InterruptedByTrap,
        StopCause::InterruptedByException,
        StopCause::InterruptedByHalt,
    ];

    pub fn to_u32(self) -> u32 {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(0) as u32
    }

    pub fn from_u32(v: u32) -> Self {
        Self::ALL.get(v as usize).copied().unwrap_or(StopCause::Null)
    }

    pub fn name(self) -> &'static str {
        match self {
            StopCause::Null => "Null",
            StopCause::Error => "Error",
            StopCause::Finished => "Finished",
            StopCause::EntryPoint => "EntryPoint",
            StopCause::UserBreakpoint => "UserBreakpoint",
            StopCause::InterruptedByTrap => "InterruptedByTrap",
            StopCause::InterruptedByException => "InterruptedByException",
            StopCause::InterruptedByHalt => "InterruptedByHalt",
        }
    }
}

/// イベント
///
/// エンティティストアの更新と、コンシューマへの通知の両方に使う。
/// リングを通るので平らな構造のまま持ち、種類ごとに意味のあるフィールドは
/// [`Event::payload`] で取り出す。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    pub kind: EventKind,
    pub cause: StopCause,
    pub exception_kind: ExceptionKind,
    pub msg_id: u64,
    pub machine_id: MachineId,
    pub entity: OsHandle,
    pub parent: OsHandle,
    pub arch: Arch,
    pub code: u64,
    pub entity_id: u64,
    pub vaddr_range: AddrRange,
    pub rip: u64,
    pub stack_base: u64,
    pub tls_root: u64,
    pub timestamp: u64,
    pub rgba: u32,
    pub exception_code: u32,
    pub string: String,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// 停止イベント
    pub fn stopped(cause: StopCause) -> Self {
        Self {
            kind: EventKind::Stopped,
            cause,
            ..Default::default()
        }
    }

    /// エラーイベント
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            string: message.into(),
            ..Default::default()
        }
    }

    pub fn entity_handle(&self) -> Handle {
        Handle::new(self.machine_id, self.entity)
    }

    pub fn parent_handle(&self) -> Handle {
        Handle::new(self.machine_id, self.parent)
    }

    /// 種類ごとの中身
    pub fn payload(&self) -> EventPayload<'_> {
        let entity = self.entity_handle();
        let parent = self.parent_handle();
        match self.kind {
            EventKind::Null => EventPayload::Null,
            EventKind::Error => EventPayload::Error { message: &self.string },
            EventKind::Started => EventPayload::Started,
            EventKind::Stopped => EventPayload::Stopped {
                cause: self.cause,
                thread: entity,
                process: parent,
                exception_code: self.exception_code,
                rip: self.rip,
                message: &self.string,
            },
            EventKind::NewProc => EventPayload::NewProc {
                process: entity,
                pid: self.entity_id,
                arch: self.arch,
                name: &self.string,
            },
            EventKind::NewThread => EventPayload::NewThread {
                thread: entity,
                process: parent,
                tid: self.entity_id,
                arch: self.arch,
                stack_base: self.stack_base,
                tls_root: self.tls_root,
                rip: self.rip,
                rgba: self.rgba,
                name: &self.string,
            },
            EventKind::NewModule => EventPayload::NewModule {
                module: entity,
                process: parent,
                vaddr_range: self.vaddr_range,
                timestamp: self.timestamp,
                path: &self.string,
            },
            EventKind::EndProc => EventPayload::EndProc {
                process: entity,
                exit_code: self.code,
            },
            EventKind::EndThread => EventPayload::EndThread { thread: entity },
            EventKind::EndModule => EventPayload::EndModule { module: entity },
            EventKind::ModuleDebugInfoPathChange => EventPayload::ModuleDebugInfoPathChange {
                module: entity,
                path: &self.string,
                timestamp: self.timestamp,
            },
            EventKind::DebugString => EventPayload::DebugString {
                thread: entity,
                process: parent,
                text: &self.string,
            },
            EventKind::ThreadName => EventPayload::ThreadName {
                thread: entity,
                process: parent,
                tid: self.entity_id,
                name: &self.string,
            },
            EventKind::ThreadColor => EventPayload::ThreadColor {
                thread: entity,
                rgba: self.rgba,
            },
            EventKind::ThreadFrozen => EventPayload::ThreadFrozen {
                thread: entity,
                frozen: self.code != 0,
            },
            EventKind::MemReserve | EventKind::MemCommit | EventKind::MemDecommit | EventKind::MemRelease => {
                EventPayload::Memory {
                    kind: self.kind,
                    process: parent,
                    vaddr_range: self.vaddr_range,
                }
            }
        }
    }
}

/// [`Event`]の種類ごとの中身（借用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPayload<'a> {
    Null,
    Error {
        message: &'a str,
    },
    Started,
    /// `thread`はプロセス全体の停止ならプロセスのハンドル、理由がなければゼロ
    Stopped {
        cause: StopCause,
        thread: Handle,
        process: Handle,
        exception_code: u32,
        rip: u64,
        /// `cause`がErrorのときの最後のエラーメッセージ
        message: &'a str,
    },
    NewProc {
        process: Handle,
        pid: u64,
        arch: Arch,
        name: &'a str,
    },
    NewThread {
        thread: Handle,
        process: Handle,
        tid: u64,
        arch: Arch,
        stack_base: u64,
        tls_root: u64,
        rip: u64,
        rgba: u32,
        name: &'a str,
    },
    NewModule {
        module: Handle,
        process: Handle,
        vaddr_range: AddrRange,
        timestamp: u64,
        path: &'a str,
    },
    EndProc {
        process: Handle,
        exit_code: u64,
    },
    EndThread {
        thread: Handle,
    },
    EndModule {
        module: Handle,
    },
    ModuleDebugInfoPathChange {
        module: Handle,
        path: &'a str,
        timestamp: u64,
    },
    DebugString {
        thread: Handle,
        process: Handle,
        text: &'a str,
    },
    /// スレッドより先に届くことがある（`tid`で後から結びつける）
    ThreadName {
        thread: Handle,
        process: Handle,
        tid: u64,
        name: &'a str,
    },
    ThreadColor {
        thread: Handle,
        rgba: u32,
    },
    ThreadFrozen {
        thread: Handle,
        frozen: bool,
    },
    Memory {
        kind: EventKind,
        process: Handle,
        vaddr_range: AddrRange,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_follows_kind() {
        let mut event = Event::new(EventKind::NewThread);
        event.machine_id = 1;
        event.entity = OsHandle(11);
        event.parent = OsHandle(10);
        event.entity_id = 4242;
        event.stack_base = 0x7ff0_0000;
        event.string = "worker".to_string();
        match event.payload() {
            EventPayload::NewThread {
                thread,
                process,
                tid,
                stack_base,
                name,
                ..
            } => {
                assert_eq!(thread, Handle::new(1, OsHandle(11)));
                assert_eq!(process, Handle::new(1, OsHandle(10)));
                assert_eq!(tid, 4242);
                assert_eq!(stack_base, 0x7ff0_0000);
                assert_eq!(name, "worker");
            }
            other => panic!("unexpected payload {:?}", other),
        }

        event.kind = EventKind::ThreadFrozen;
        event.code = 1;
        assert_eq!(
            event.payload(),
            EventPayload::ThreadFrozen {
                thread: Handle::new(1, OsHandle(11)),
                frozen: true,
            }
        );

        let mut stopped = Event::stopped(StopCause::Error);
        stopped.string = "no entry point".to_string();
        match stopped.payload() {
            EventPayload::Stopped { cause, message, thread, .. } => {
                assert_eq!(cause, StopCause::Error);
                assert_eq!(message, "no entry point");
                assert!(thread.os.is_none());
            }
            other => panic!("unexpected payload {:?}", other),
        }

        assert_eq!(Event::error("boom").payload(), EventPayload::Error { message: "boom" });
        assert_eq!(Event::new(EventKind::Started).payload(), EventPayload::Started);
    }
}
