//! シンボル解決機能

use crate::DwarfLoader;
use object::{Object, ObjectSymbol};
use std::collections::HashMap;

/// シンボルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// 関数
    Text,
    /// データ（グローバル変数など）
    Data,
    /// その他
    Other,
}

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    /// モジュールベースからのオフセット
    pub voff: u64,
    pub size: u64,
    pub kind: SymbolKind,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, voff: u64, size: u64, kind: SymbolKind) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            voff,
            size,
            kind,
        }
    }

    /// 表示用の名前を取得（デマングル可能ならデマングル後、できなければマングル名）
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }

    /// voffがこのシンボルの範囲内か
    pub fn contains(&self, voff: u64) -> bool {
        voff >= self.voff && (self.size == 0 || voff < self.voff + self.size)
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    name.to_string()
}

/// シンボル解決
pub struct SymbolResolver {
    /// シンボル名 -> シンボル情報のマップ（マングル名とデマングル名の両方で引ける）
    symbols_by_name: HashMap<String, Symbol>,
    /// voffでソートした関数シンボル
    text_by_voff: Vec<Symbol>,
}

impl SymbolResolver {
    /// DWARFローダーからシンボル解決を作成する
    pub fn new(loader: &DwarfLoader) -> Self {
        let mut symbols = Vec::new();
        for symbol in loader.object_file().symbols() {
            let name = match symbol.name() {
                Ok(name) if !name.is_empty() => name,
                _ => continue,
            };
            if symbol.address() == 0 {
                continue;
            }
            let kind = match symbol.kind() {
                object::SymbolKind::Text => SymbolKind::Text,
                object::SymbolKind::Data | object::SymbolKind::Tls => SymbolKind::Data,
                _ => SymbolKind::Other,
            };
            let voff = loader.voff_from_file_address(symbol.address());
            symbols.push(Symbol::new(name.to_string(), voff, symbol.size(), kind));
        }
        Self::from_symbols(symbols)
    }

    /// シンボル一覧から作成する
    pub fn from_symbols(symbols: Vec<Symbol>) -> Self {
        let mut symbols_by_name = HashMap::new();
        let mut text_by_voff = Vec::new();

        for sym in symbols {
            if sym.kind == SymbolKind::Text {
                text_by_voff.push(sym.clone());
            }
            // 同名がある場合は最初のものを優先する
            if sym.demangled_name != sym.name {
                symbols_by_name
                    .entry(sym.demangled_name.clone())
                    .or_insert_with(|| sym.clone());
            }
            symbols_by_name.entry(sym.name.clone()).or_insert(sym);
        }

        text_by_voff.sort_by_key(|s| s.voff);

        Self {
            symbols_by_name,
            text_by_voff,
        }
    }

    /// シンボル名を引く
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols_by_name.get(name)
    }

    /// 関数名からvoffを解決する
    pub fn resolve_function(&self, name: &str) -> Option<u64> {
        self.lookup(name)
            .filter(|s| s.kind == SymbolKind::Text)
            .map(|s| s.voff)
    }

    /// データシンボル名からvoffを解決する
    pub fn resolve_data(&self, name: &str) -> Option<u64> {
        self.lookup(name)
            .filter(|s| s.kind == SymbolKind::Data)
            .map(|s| s.voff)
    }

    /// voffから関数シンボルを解決する（最も近いシンボルを返す）
    pub fn reverse_resolve(&self, voff: u64) -> Option<&Symbol> {
        let idx = match self.text_by_voff.binary_search_by_key(&voff, |s| s.voff) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let sym = &self.text_by_voff[idx];
        // サイズ情報がない場合は単純に最も近いシンボルを返す
        sym.contains(voff).then_some(sym)
    }

    /// パターンにマッチするシンボルを検索する
    /// マングル名とデマングル名の両方で検索する
    pub fn find_symbols(&self, pattern: &str) -> Vec<Symbol> {
        let mut found: Vec<Symbol> = self
            .text_by_voff
            .iter()
            .filter(|s| s.name.contains(pattern) || s.demangled_name.contains(pattern))
            .cloned()
            .collect();
        found.dedup_by_key(|s| s.voff);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SymbolResolver {
        SymbolResolver::from_symbols(vec![
            Symbol::new("main".into(), 0x1100, 0x40, SymbolKind::Text),
            Symbol::new("helper".into(), 0x1000, 0x20, SymbolKind::Text),
            Symbol::new("counter".into(), 0x4000, 8, SymbolKind::Data),
        ])
    }

    #[test]
    fn test_resolve_by_kind() {
        let resolver = sample();
        assert_eq!(resolver.resolve_function("main"), Some(0x1100));
        assert_eq!(resolver.resolve_function("counter"), None);
        assert_eq!(resolver.resolve_data("counter"), Some(0x4000));
    }

    #[test]
    fn test_reverse_resolve() {
        let resolver = sample();
        assert_eq!(resolver.reverse_resolve(0x1010).map(|s| s.name.as_str()), Some("helper"));
        assert_eq!(resolver.reverse_resolve(0x1100).map(|s| s.name.as_str()), Some("main"));
        // helperの末尾とmainの間
        assert!(resolver.reverse_resolve(0x1030).is_none());
        assert!(resolver.reverse_resolve(0x10).is_none());
    }
}
