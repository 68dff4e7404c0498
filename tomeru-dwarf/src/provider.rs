//! デバッグ情報プロバイダ
//!
//! 実行制御コアはデバッグ情報の形式を知らない。
//! ここで定義するトレイト越しに、ブレークポイント解決やエントリポイント検出に必要な
//! 問い合わせだけを行う。

use crate::lines::{LineInfo, LineTable};
use crate::loader::{DwarfLoader, StaticReader};
use crate::symbols::{Symbol, SymbolResolver};
use crate::utils::VariableFinder;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// 1モジュール分のデバッグ情報
pub trait DebugInfo: Send + Sync {
    /// 関数シンボル名からvoffを引く
    fn voff_from_symbol(&self, name: &str) -> Option<u64>;

    /// ファイル:行からvoff一覧を引く
    fn voffs_from_file_line(&self, file: &str, line: u32) -> Vec<u64>;

    /// グローバル変数のvoffを引く
    fn global_variable_voff(&self, name: &str) -> Option<u64>;

    /// voffを含む関数シンボル
    fn symbol_from_voff(&self, voff: u64) -> Option<Symbol>;

    /// voffに対応するソース行
    fn line_from_voff(&self, voff: u64) -> Option<LineInfo>;
}

/// パスからデバッグ情報を開くプロバイダ
pub trait DebugInfoProvider: Send + Sync {
    /// デバッグ情報を開く（開けない場合はNone）
    fn open(&self, path: &Path) -> Option<Arc<dyn DebugInfo>>;

    /// キャッシュから外す
    fn close(&self, path: &Path);
}

/// ELF/DWARFのデバッグ情報
pub struct DwarfDebugInfo {
    loader: DwarfLoader,
    symbols: SymbolResolver,
    lines: LineTable,
    /// addr2lineのコンテキストはSyncではないのでロックで包む
    addr2line: Mutex<Option<addr2line::Context<StaticReader>>>,
}

impl DwarfDebugInfo {
    /// ファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let loader = DwarfLoader::load(path)?;
        let symbols = SymbolResolver::new(&loader);
        let lines = LineTable::build(loader.dwarf())?;
        let addr2line = match addr2line::Context::from_dwarf(loader.fresh_dwarf()?) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                warn!("addr2line context unavailable for {:?}: {}", loader.path(), e);
                None
            }
        };
        debug!(
            "loaded debug info {:?}: {} line files, pie={}",
            loader.path(),
            lines.file_count(),
            loader.is_pie()
        );
        Ok(Self {
            loader,
            symbols,
            lines,
            addr2line: Mutex::new(addr2line),
        })
    }

    /// シンボル解決器
    pub fn symbols(&self) -> &SymbolResolver {
        &self.symbols
    }
}

impl DebugInfo for DwarfDebugInfo {
    fn voff_from_symbol(&self, name: &str) -> Option<u64> {
        self.symbols.resolve_function(name)
    }

    fn voffs_from_file_line(&self, file: &str, line: u32) -> Vec<u64> {
        self.lines
            .addresses_from_file_line(file, line)
            .into_iter()
            .map(|addr| self.loader.voff_from_file_address(addr))
            .collect()
    }

    fn global_variable_voff(&self, name: &str) -> Option<u64> {
        if let Some(voff) = self.symbols.resolve_data(name) {
            return Some(voff);
        }
        match VariableFinder::find_global(self.loader.dwarf(), name) {
            Ok(found) => found.map(|addr| self.loader.voff_from_file_address(addr)),
            Err(e) => {
                debug!("global variable lookup for {} failed: {}", name, e);
                None
            }
        }
    }

    fn symbol_from_voff(&self, voff: u64) -> Option<Symbol> {
        self.symbols.reverse_resolve(voff).cloned()
    }

    fn line_from_voff(&self, voff: u64) -> Option<LineInfo> {
        let guard = self.addr2line.lock();
        let ctx = guard.as_ref()?;
        let probe = voff.wrapping_add(self.loader.relative_address_base());
        let location = ctx.find_location(probe).ok()??;
        Some(LineInfo {
            file: location.file?.to_string(),
            line: location.line?,
            column: location.column,
        })
    }
}

/// ELF/DWARF用のプロバイダ（パスごとにキャッシュ）
#[derive(Default)]
pub struct DwarfProvider {
    cache: Mutex<HashMap<PathBuf, Arc<DwarfDebugInfo>>>,
}

impl DwarfProvider {
    /// 新しいプロバイダを作成する
    pub fn new() -> Self {
        Self::default()
    }
}

impl DebugInfoProvider for DwarfProvider {
    fn open(&self, path: &Path) -> Option<Arc<dyn DebugInfo>> {
        if path.as_os_str().is_empty() {
            return None;
        }
        let mut cache = self.cache.lock();
        if let Some(info) = cache.get(path) {
            return Some(info.clone() as Arc<dyn DebugInfo>);
        }
        match DwarfDebugInfo::load(path) {
            Ok(info) => {
                let info = Arc::new(info);
                cache.insert(path.to_path_buf(), info.clone());
                Some(info as Arc<dyn DebugInfo>)
            }
            Err(e) => {
                debug!("no debug info at {:?}: {}", path, e);
                None
            }
        }
    }

    fn close(&self, path: &Path) {
        self.cache.lock().remove(path);
    }
}
