//! ブレークポイント管理
//!
//! コンシューマ側の論理的なブレークポイント。トラップへの解決は制御スレッドが
//! Runのたびに行うので、ここでは指定方法と条件、有効/無効だけを持つ。

use crate::errors::ERR_BREAKPOINT_NOT_FOUND;
use crate::protocol::{UserBreakpoint, UserBreakpointKind};
use crate::Result;
use std::collections::BTreeMap;
use std::fmt;

/// ブレークポイントID
pub type BreakpointId = usize;

/// ブレークポイント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub spec: UserBreakpoint,
    pub enabled: bool,
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.spec.kind {
            UserBreakpointKind::FileNameAndLineColNumber => {
                write!(f, "{}:{}", self.spec.string, self.spec.line)?
            }
            UserBreakpointKind::SymbolNameAndOffset if self.spec.u64 != 0 => {
                write!(f, "{}+{:#x}", self.spec.string, self.spec.u64)?
            }
            UserBreakpointKind::SymbolNameAndOffset => write!(f, "{}", self.spec.string)?,
            UserBreakpointKind::VirtualAddress => write!(f, "{:#x}", self.spec.u64)?,
        }
        if !self.spec.condition.is_empty() {
            write!(f, " if {}", self.spec.condition)?;
        }
        if !self.enabled {
            write!(f, " (disabled)")?;
        }
        Ok(())
    }
}

/// ブレークポイントマネージャ
#[derive(Debug)]
pub struct BreakpointManager {
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    next_id: BreakpointId,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self {
            breakpoints: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// ブレークポイントを追加する（有効な状態で）
    pub fn add(&mut self, spec: UserBreakpoint) -> BreakpointId {
        let id = self.next_id;
        self.next_id += 1;
        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                spec,
                enabled: true,
            },
        );
        id
    }

    pub fn remove(&mut self, id: BreakpointId) -> Result<Breakpoint> {
        self.breakpoints
            .remove(&id)
            .ok_or_else(|| anyhow::anyhow!("{}: {}", ERR_BREAKPOINT_NOT_FOUND, id))
    }

    pub fn set_enabled(&mut self, id: BreakpointId, enabled: bool) -> Result<()> {
        let bp = self
            .breakpoints
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("{}: {}", ERR_BREAKPOINT_NOT_FOUND, id))?;
        bp.enabled = enabled;
        Ok(())
    }

    /// 条件を付け替える（空文字列で無条件）
    pub fn set_condition(&mut self, id: BreakpointId, condition: &str) -> Result<()> {
        let bp = self
            .breakpoints
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("{}: {}", ERR_BREAKPOINT_NOT_FOUND, id))?;
        bp.spec.condition = condition.trim().to_string();
        Ok(())
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// ID順のすべてのブレークポイント
    pub fn all(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }

    /// Runメッセージに載せる有効なブレークポイント
    pub fn enabled_specs(&self) -> Vec<UserBreakpoint> {
        self.breakpoints
            .values()
            .filter(|bp| bp.enabled)
            .map(|bp| bp.spec.clone())
            .collect()
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let mut manager = BreakpointManager::new();
        let a = manager.add(UserBreakpoint::symbol("main", 0));
        let b = manager.add(UserBreakpoint::address(0x401000));
        assert_eq!((a, b), (1, 2));
        assert_eq!(manager.count(), 2);

        manager.remove(a).unwrap();
        assert!(manager.get(a).is_none());
        assert!(manager.remove(a).is_err());
        assert_eq!(manager.add(UserBreakpoint::symbol("foo", 0)), 3);
    }

    #[test]
    fn test_enabled_specs_skip_disabled() {
        let mut manager = BreakpointManager::new();
        let a = manager.add(UserBreakpoint::symbol("main", 0));
        manager.add(UserBreakpoint::file_line("src/main.rs", 10).with_condition("$rax == 1"));
        manager.set_enabled(a, false).unwrap();

        let specs = manager.enabled_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].condition, "$rax == 1");
    }

    #[test]
    fn test_display() {
        let mut manager = BreakpointManager::new();
        let id = manager.add(UserBreakpoint::symbol("main", 4));
        manager.set_condition(id, " x > 1 ").unwrap();
        assert_eq!(manager.get(id).unwrap().to_string(), "main+0x4 if x > 1");

        let id = manager.add(UserBreakpoint::file_line("a.c", 3));
        manager.set_enabled(id, false).unwrap();
        assert_eq!(manager.get(id).unwrap().to_string(), "a.c:3 (disabled)");
    }
}
