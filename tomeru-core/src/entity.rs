//! プロセス/スレッド/モジュールの木
//!
//! ルート → マシン → プロセス → スレッド/モジュール という木を、
//! 世代付きのスロットマップで持つ。ハンドルからの逆引きはハッシュマップで引く。
//! 変更はイベントの適用（[`EntityStore::apply_events`]）を通して行う。

use crate::protocol::{Event, EventKind};
use crate::range::AddrRange;
use crate::strings::StringPool;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tomeru_target::{Arch, Handle, MachineId, OsHandle};
use tracing::{debug, warn};

/// エンティティの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Root,
    Machine,
    Process,
    Thread,
    Module,
    DebugInfoPath,
    EntryPoint,
    PendingThreadName,
}

/// 世代付きのエンティティID
///
/// 解放されたスロットが再利用されても古いIDは解決されない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    index: u32,
    generation: u32,
}

/// 種類ごとの属性
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EntityPayload {
    #[default]
    None,
    Thread { frozen: bool, color: u32 },
    Module { vaddr_range: AddrRange, timestamp: u64 },
    DebugInfoPath { timestamp: u64 },
}

/// エンティティ
#[derive(Debug, Clone)]
pub struct Entity {
    pub kind: EntityKind,
    pub arch: Arch,
    pub handle: Handle,
    pub id: u64,
    pub string: String,
    pub parent: Option<EntityId>,
    pub children: Vec<EntityId>,
    pub payload: EntityPayload,
}

impl Entity {
    pub fn vaddr_range(&self) -> AddrRange {
        match self.payload {
            EntityPayload::Module { vaddr_range, .. } => vaddr_range,
            _ => AddrRange::default(),
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.payload, EntityPayload::Thread { frozen: true, .. })
    }

    pub fn timestamp(&self) -> u64 {
        match self.payload {
            EntityPayload::Module { timestamp, .. } | EntityPayload::DebugInfoPath { timestamp } => {
                timestamp
            }
            _ => 0,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

/// エンティティストア
#[derive(Debug)]
pub struct EntityStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    handle_index: HashMap<Handle, EntityId>,
    strings: StringPool,
    root: EntityId,
    alloc_gen: u64,
    batch_depth: u32,
    batch_dirty: bool,
    list_cache: Mutex<HashMap<EntityKind, (u64, Arc<[EntityId]>)>>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let root_entity = Entity {
            kind: EntityKind::Root,
            arch: Arch::Null,
            handle: Handle::ZERO,
            id: 0,
            string: String::new(),
            parent: None,
            children: Vec::new(),
            payload: EntityPayload::None,
        };
        Self {
            slots: vec![Slot {
                generation: 0,
                entity: Some(root_entity),
            }],
            free: Vec::new(),
            handle_index: HashMap::new(),
            strings: StringPool::new(),
            root: EntityId {
                index: 0,
                generation: 0,
            },
            alloc_gen: 1,
            batch_depth: 0,
            batch_dirty: false,
            list_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> EntityId {
        self.root
    }

    /// 確保/解放の世代
    pub fn alloc_gen(&self) -> u64 {
        self.alloc_gen
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entity.as_ref())
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entity.as_mut())
    }

    /// ルート以外の生きているエンティティの数
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entity.is_some()).count() - 1
    }

    /// 複数の確保/解放を1世代にまとめる
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    pub fn end_batch(&mut self) {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth == 0 && self.batch_dirty {
            self.batch_dirty = false;
            self.alloc_gen += 1;
        }
    }

    fn touch(&mut self) {
        if self.batch_depth > 0 {
            self.batch_dirty = true;
        } else {
            self.alloc_gen += 1;
        }
    }

    /// マシンノード（なければ作る）
    pub fn machine(&mut self, machine_id: MachineId) -> EntityId {
        let existing = self
            .children_of_kind(self.root, EntityKind::Machine)
            .into_iter()
            .find(|m| self.get(*m).map(|e| e.id == machine_id).unwrap_or(false));
        if let Some(id) = existing {
            return id;
        }
        let handle = Handle::new(machine_id, OsHandle::NONE);
        self.alloc(self.root, EntityKind::Machine, Arch::Null, handle, machine_id)
    }

    /// エンティティを確保する
    ///
    /// 0以外のハンドルは索引に入る（既に同じハンドルがあれば先のものが残る）。
    pub fn alloc(
        &mut self,
        parent: EntityId,
        kind: EntityKind,
        arch: Arch,
        handle: Handle,
        id: u64,
    ) -> EntityId {
        let entity = Entity {
            kind,
            arch,
            handle,
            id,
            string: String::new(),
            parent: Some(parent),
            children: Vec::new(),
            payload: match kind {
                EntityKind::Thread => EntityPayload::Thread {
                    frozen: false,
                    color: 0,
                },
                EntityKind::Module => EntityPayload::Module {
                    vaddr_range: AddrRange::default(),
                    timestamp: 0,
                },
                EntityKind::DebugInfoPath => EntityPayload::DebugInfoPath { timestamp: 0 },
                _ => EntityPayload::None,
            },
        };

        let entity_id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entity = Some(entity);
                EntityId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entity: Some(entity),
                });
                EntityId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };

        match self.get_mut(parent) {
            Some(p) => p.children.push(entity_id),
            None => {
                warn!("Allocating {:?} under a released parent", kind);
                if let Some(e) = self.get_mut(entity_id) {
                    e.parent = None;
                }
            }
        }

        if !is_zero_os(handle) {
            self.handle_index.entry(handle).or_insert(entity_id);
        }
        self.touch();
        entity_id
    }

    /// 部分木ごと解放する（幅優先）
    pub fn release(&mut self, id: EntityId) {
        if id == self.root || self.get(id).is_none() {
            return;
        }

        // 親の子リストから外す
        if let Some(parent) = self.get(id).and_then(|e| e.parent) {
            if let Some(p) = self.get_mut(parent) {
                p.children.retain(|c| *c != id);
            }
        }

        let mut queue = VecDeque::from([id]);
        while let Some(cur) = queue.pop_front() {
            let slot = &mut self.slots[cur.index as usize];
            let Some(entity) = slot.entity.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(cur.index);

            if self.handle_index.get(&entity.handle) == Some(&cur) {
                self.handle_index.remove(&entity.handle);
            }
            queue.extend(entity.children.iter().copied());
            self.strings.release(entity.string);
        }
        self.touch();
    }

    /// ハンドルから引く
    pub fn from_handle(&self, handle: Handle) -> Option<EntityId> {
        self.handle_index
            .get(&handle)
            .copied()
            .filter(|id| self.get(*id).is_some())
    }

    /// 種類ごとの一覧（確保世代が変わったときだけ作り直す）
    pub fn list(&self, kind: EntityKind) -> Arc<[EntityId]> {
        let mut cache = self.list_cache.lock();
        if let Some((gen, list)) = cache.get(&kind) {
            if *gen == self.alloc_gen {
                return list.clone();
            }
        }
        let list: Arc<[EntityId]> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.entity.as_ref().filter(|e| e.kind == kind).map(|_| EntityId {
                    index: index as u32,
                    generation: slot.generation,
                })
            })
            .collect();
        cache.insert(kind, (self.alloc_gen, list.clone()));
        list
    }

    /// 文字列を付け替える（古い文字列はプールに戻す）
    pub fn equip_string(&mut self, id: EntityId, s: &str) {
        let new = self.strings.alloc(s);
        let old = match self.get_mut(id) {
            Some(e) => std::mem::replace(&mut e.string, new),
            None => new,
        };
        self.strings.release(old);
    }

    pub fn child_from_kind(&self, id: EntityId, kind: EntityKind) -> Option<EntityId> {
        self.get(id)?
            .children
            .iter()
            .copied()
            .find(|c| self.get(*c).map(|e| e.kind == kind).unwrap_or(false))
    }

    /// 自身を含めて祖先をたどる
    pub fn ancestor_from_kind(&self, id: EntityId, kind: EntityKind) -> Option<EntityId> {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let e = self.get(c)?;
            if e.kind == kind {
                return Some(c);
            }
            cur = e.parent;
        }
        None
    }

    /// プロセス内で`vaddr`を含むモジュール
    pub fn module_from_process_vaddr(&self, process: EntityId, vaddr: u64) -> Option<EntityId> {
        self.get(process)?.children.iter().copied().find(|c| {
            self.get(*c)
                .map(|e| e.kind == EntityKind::Module && e.vaddr_range().contains(vaddr))
                .unwrap_or(false)
        })
    }

    /// 種類`kind`の子
    pub fn children_of_kind(&self, id: EntityId, kind: EntityKind) -> Vec<EntityId> {
        self.get(id)
            .map(|e| {
                e.children
                    .iter()
                    .copied()
                    .filter(|c| self.get(*c).map(|e| e.kind == kind).unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// イベントを適用する（1バッチ = 最大1世代）
    pub fn apply_events(&mut self, events: &[Event]) {
        self.begin_batch();
        for event in events {
            self.apply_event(event);
        }
        self.end_batch();
    }

    fn apply_event(&mut self, event: &Event) {
        match event.kind {
            EventKind::NewProc => {
                let machine = self.machine(event.machine_id);
                let process = self.alloc(
                    machine,
                    EntityKind::Process,
                    event.arch,
                    event.entity_handle(),
                    event.entity_id,
                );
                self.equip_string(process, &event.string);
            }
            EventKind::NewThread => {
                let Some(process) = self.from_handle(event.parent_handle()) else {
                    warn!("NewThread for unknown process {}", event.parent);
                    return;
                };
                let thread = self.alloc(
                    process,
                    EntityKind::Thread,
                    event.arch,
                    event.entity_handle(),
                    event.entity_id,
                );
                if let Some(EntityPayload::Thread { color, .. }) =
                    self.get_mut(thread).map(|e| &mut e.payload)
                {
                    *color = event.rgba;
                }

                // 先に届いていたスレッド名
                let pending = self
                    .children_of_kind(process, EntityKind::PendingThreadName)
                    .into_iter()
                    .find(|p| self.get(*p).map(|e| e.id == event.entity_id).unwrap_or(false));
                match pending {
                    Some(p) => {
                        let name = self.get(p).map(|e| e.string.clone()).unwrap_or_default();
                        self.equip_string(thread, &name);
                        self.release(p);
                    }
                    None => self.equip_string(thread, &event.string),
                }
            }
            EventKind::NewModule => {
                let Some(process) = self.from_handle(event.parent_handle()) else {
                    warn!("NewModule for unknown process {}", event.parent);
                    return;
                };
                let module = self.alloc(
                    process,
                    EntityKind::Module,
                    event.arch,
                    event.entity_handle(),
                    event.vaddr_range.min,
                );
                self.equip_string(module, &event.string);
                if let Some(e) = self.get_mut(module) {
                    e.payload = EntityPayload::Module {
                        vaddr_range: event.vaddr_range,
                        timestamp: event.timestamp,
                    };
                }
                let path = self.alloc(module, EntityKind::DebugInfoPath, Arch::Null, Handle::ZERO, 0);
                if let Some(e) = self.get_mut(path) {
                    e.payload = EntityPayload::DebugInfoPath {
                        timestamp: event.timestamp,
                    };
                }
            }
            EventKind::EndProc => {
                if let Some(process) = self.from_handle(event.entity_handle()) {
                    let pid = self.get(process).map(|e| e.id).unwrap_or(0);
                    self.release(process);
                    for entry in self.children_of_kind(self.root, EntityKind::EntryPoint) {
                        if self.get(entry).map(|e| e.id == pid).unwrap_or(false) {
                            self.release(entry);
                        }
                    }
                }
            }
            EventKind::EndThread | EventKind::EndModule => {
                if let Some(id) = self.from_handle(event.entity_handle()) {
                    self.release(id);
                }
            }
            EventKind::ThreadName => match self.from_handle(event.entity_handle()) {
                Some(thread) => self.equip_string(thread, &event.string),
                None => {
                    let Some(process) = self.from_handle(event.parent_handle()) else {
                        debug!("ThreadName for unknown thread {}", event.entity);
                        return;
                    };
                    let pending = self.alloc(
                        process,
                        EntityKind::PendingThreadName,
                        Arch::Null,
                        Handle::ZERO,
                        event.entity_id,
                    );
                    self.equip_string(pending, &event.string);
                }
            },
            EventKind::ThreadColor => {
                if let Some(thread) = self.from_handle(event.entity_handle()) {
                    if let Some(EntityPayload::Thread { color, .. }) =
                        self.get_mut(thread).map(|e| &mut e.payload)
                    {
                        *color = event.rgba;
                    }
                }
            }
            EventKind::ThreadFrozen => {
                if let Some(thread) = self.from_handle(event.entity_handle()) {
                    if let Some(EntityPayload::Thread { frozen, .. }) =
                        self.get_mut(thread).map(|e| &mut e.payload)
                    {
                        *frozen = event.code != 0;
                    }
                }
            }
            EventKind::ModuleDebugInfoPathChange => {
                let Some(module) = self.from_handle(event.entity_handle()) else {
                    return;
                };
                let path = match self.child_from_kind(module, EntityKind::DebugInfoPath) {
                    Some(path) => path,
                    None => self.alloc(module, EntityKind::DebugInfoPath, Arch::Null, Handle::ZERO, 0),
                };
                self.equip_string(path, &event.string);
                if let Some(e) = self.get_mut(path) {
                    e.payload = EntityPayload::DebugInfoPath {
                        timestamp: event.timestamp,
                    };
                }
            }
            _ => {}
        }
    }

    /// ユーザー指定のエントリポイントを`id`付きで登録する
    pub fn add_entry_point(&mut self, name: &str, id: u64) -> EntityId {
        let entry = self.alloc(self.root, EntityKind::EntryPoint, Arch::Null, Handle::ZERO, id);
        self.equip_string(entry, name);
        entry
    }

    /// `id`に対応づけられたエントリポイント名
    pub fn entry_points_for(&self, id: u64) -> Vec<String> {
        self.children_of_kind(self.root, EntityKind::EntryPoint)
            .into_iter()
            .filter_map(|e| self.get(e))
            .filter(|e| e.id == id)
            .map(|e| e.string.clone())
            .collect()
    }

    /// 統計用: プールにある空き文字列
    pub fn pooled_strings(&self) -> usize {
        self.strings.free_count()
    }
}

fn is_zero_os(handle: Handle) -> bool {
    handle.os.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tomeru_target::MACHINE_ID_LOCAL;

    fn event(kind: EventKind, entity: u64, parent: u64) -> Event {
        Event {
            kind,
            machine_id: MACHINE_ID_LOCAL,
            entity: OsHandle(entity),
            parent: OsHandle(parent),
            arch: Arch::X64,
            ..Default::default()
        }
    }

    fn creation_batch() -> Vec<Event> {
        let mut proc_ = event(EventKind::NewProc, 10, 0);
        proc_.entity_id = 100;
        let mut thread = event(EventKind::NewThread, 11, 10);
        thread.entity_id = 101;
        thread.string = "main".into();
        let mut module = event(EventKind::NewModule, 12, 10);
        module.vaddr_range = AddrRange::new(0x40_0000, 0x41_0000);
        module.string = "/bin/app".into();
        module.timestamp = 7;
        vec![proc_, thread, module]
    }

    #[test]
    fn test_replay_and_teardown() {
        let mut store = EntityStore::new();
        let gen0 = store.alloc_gen();
        store.apply_events(&creation_batch());
        assert_eq!(store.alloc_gen(), gen0 + 1);

        let process = store.from_handle(Handle::local(OsHandle(10))).unwrap();
        let module = store.from_handle(Handle::local(OsHandle(12))).unwrap();
        assert_eq!(store.get(process).unwrap().id, 100);
        assert_eq!(store.get(module).unwrap().id, 0x40_0000);
        assert_eq!(store.module_from_process_vaddr(process, 0x40_0800), Some(module));
        assert_eq!(store.module_from_process_vaddr(process, 0x41_0000), None);
        let path = store.child_from_kind(module, EntityKind::DebugInfoPath).unwrap();
        assert_eq!(store.get(path).unwrap().timestamp(), 7);
        assert_eq!(store.ancestor_from_kind(path, EntityKind::Process), Some(process));

        store.apply_events(&[
            event(EventKind::EndModule, 12, 10),
            event(EventKind::EndThread, 11, 10),
            event(EventKind::EndProc, 10, 0),
        ]);
        assert_eq!(store.alloc_gen(), gen0 + 2);
        // マシンノードだけが残る
        assert_eq!(store.live_count(), 1);
        assert!(store.list(EntityKind::Process).is_empty());
        assert!(store.get(process).is_none());
        assert!(store.from_handle(Handle::local(OsHandle(10))).is_none());
        // スレッド名とモジュールのパスはプールに戻る
        assert!(store.pooled_strings() >= 2);
    }

    #[test]
    fn test_list_is_never_stale() {
        let mut store = EntityStore::new();
        assert!(store.list(EntityKind::Thread).is_empty());
        store.apply_events(&creation_batch());
        assert_eq!(store.list(EntityKind::Thread).len(), 1);

        let mut second = event(EventKind::NewThread, 13, 10);
        second.entity_id = 102;
        store.apply_events(&[second]);
        assert_eq!(store.list(EntityKind::Thread).len(), 2);

        store.apply_events(&[event(EventKind::EndThread, 11, 10)]);
        let threads = store.list(EntityKind::Thread);
        assert_eq!(threads.len(), 1);
        assert_eq!(store.get(threads[0]).unwrap().id, 102);
    }

    #[test]
    fn test_released_id_never_resolves() {
        let mut store = EntityStore::new();
        let machine = store.machine(MACHINE_ID_LOCAL);
        let a = store.alloc(machine, EntityKind::Process, Arch::X64, Handle::local(OsHandle(1)), 1);
        store.release(a);
        let b = store.alloc(machine, EntityKind::Process, Arch::X64, Handle::local(OsHandle(2)), 2);
        assert!(store.get(a).is_none());
        assert_eq!(store.get(b).unwrap().id, 2);
        assert_eq!(store.get(machine).unwrap().children, vec![b]);
    }

    #[test]
    fn test_pending_thread_name() {
        let mut store = EntityStore::new();
        store.apply_events(&creation_batch()[..1]);

        let mut name = event(EventKind::ThreadName, 20, 10);
        name.entity_id = 200;
        name.string = "worker".into();
        store.apply_events(&[name]);
        let process = store.from_handle(Handle::local(OsHandle(10))).unwrap();
        assert!(store.child_from_kind(process, EntityKind::PendingThreadName).is_some());

        let mut thread = event(EventKind::NewThread, 20, 10);
        thread.entity_id = 200;
        store.apply_events(&[thread]);
        let t = store.from_handle(Handle::local(OsHandle(20))).unwrap();
        assert_eq!(store.get(t).unwrap().string, "worker");
        assert!(store.child_from_kind(process, EntityKind::PendingThreadName).is_none());
    }

    #[test]
    fn test_thread_attributes_and_debug_info_path() {
        let mut store = EntityStore::new();
        store.apply_events(&creation_batch());

        let mut frozen = event(EventKind::ThreadFrozen, 11, 10);
        frozen.code = 1;
        let mut color = event(EventKind::ThreadColor, 11, 10);
        color.rgba = 0xff00_00ff;
        let mut path = event(EventKind::ModuleDebugInfoPathChange, 12, 10);
        path.string = "/usr/lib/debug/app.debug".into();
        path.timestamp = 9;
        store.apply_events(&[frozen, color, path]);

        let thread = store.from_handle(Handle::local(OsHandle(11))).unwrap();
        assert_eq!(
            store.get(thread).unwrap().payload,
            EntityPayload::Thread {
                frozen: true,
                color: 0xff00_00ff
            }
        );
        let module = store.from_handle(Handle::local(OsHandle(12))).unwrap();
        let info = store.child_from_kind(module, EntityKind::DebugInfoPath).unwrap();
        assert_eq!(store.get(info).unwrap().string, "/usr/lib/debug/app.debug");
        assert_eq!(store.get(info).unwrap().timestamp(), 9);
        assert_eq!(store.children_of_kind(module, EntityKind::DebugInfoPath).len(), 1);
    }

    #[test]
    fn test_end_proc_releases_correlated_entry_points() {
        let mut store = EntityStore::new();
        store.add_entry_point("my_main", 100);
        store.add_entry_point("other", 5);
        store.apply_events(&creation_batch());
        assert_eq!(store.entry_points_for(100), vec!["my_main".to_string()]);

        store.apply_events(&[event(EventKind::EndProc, 10, 0)]);
        assert!(store.entry_points_for(100).is_empty());
        assert_eq!(store.entry_points_for(5), vec!["other".to_string()]);
    }
}
