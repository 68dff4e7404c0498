//! tomeru デバッグ情報
//!
//! ELF/DWARFを読み込み、実行制御コアが必要とする問い合わせだけに答えます。
//! シンボル名からのオフセット、ファイル:行からのオフセット、グローバル変数の位置、
//! オフセットからのシンボル/行の逆引きです。
//! アドレスはすべてモジュールベースからの相対オフセット（voff）で扱います。

pub mod loader;
pub mod symbols;
pub mod lines;
pub mod utils;
pub mod provider;

pub use loader::DwarfLoader;
pub use symbols::{Symbol, SymbolKind, SymbolResolver};
pub use lines::{LineInfo, LineTable};
pub use utils::{normalize_path, VariableFinder};
pub use provider::{DebugInfo, DebugInfoProvider, DwarfDebugInfo, DwarfProvider};

/// デバッグ情報解析の結果型
pub type Result<T> = anyhow::Result<T>;
