//! DWARFローダーとデバッグ情報プロバイダのテスト
//!
//! テストバイナリ自身を読み込んで問い合わせる。

use std::path::Path;
use tomeru_dwarf::{DebugInfoProvider, DwarfLoader, DwarfProvider, SymbolResolver};

#[no_mangle]
#[inline(never)]
pub extern "C" fn tomeru_dwarf_probe_fn(x: u64) -> u64 {
    let y = x.wrapping_mul(3);
    y.wrapping_add(1)
}

#[no_mangle]
pub static TOMERU_DWARF_PROBE_VAR: u64 = 0x5eed;

fn current_exe() -> std::path::PathBuf {
    std::env::current_exe().expect("current_exe")
}

#[test]
fn test_load_self() {
    let loader = DwarfLoader::load(current_exe()).expect("Failed to load test binary");
    let resolver = SymbolResolver::new(&loader);

    let voff = resolver
        .resolve_function("tomeru_dwarf_probe_fn")
        .expect("probe function should be in the symbol table");
    assert_eq!(tomeru_dwarf_probe_fn(1), 4);

    let sym = resolver.reverse_resolve(voff).expect("reverse resolve");
    assert_eq!(sym.name, "tomeru_dwarf_probe_fn");
    assert!(std::hint::black_box(TOMERU_DWARF_PROBE_VAR) == 0x5eed);

    let found = resolver.find_symbols("dwarf_probe_f");
    assert!(found.iter().any(|s| s.name == "tomeru_dwarf_probe_fn"));
}

#[test]
fn test_provider_queries() {
    let provider = DwarfProvider::new();
    let info = provider.open(&current_exe()).expect("debug info for test binary");

    let voff = info
        .voff_from_symbol("tomeru_dwarf_probe_fn")
        .expect("probe function voff");
    let sym = info.symbol_from_voff(voff + 1).expect("symbol containing voff");
    assert_eq!(sym.name, "tomeru_dwarf_probe_fn");

    // 同じパスは同じインスタンスを返す
    let again = provider.open(&current_exe()).expect("cached");
    assert_eq!(again.voff_from_symbol("tomeru_dwarf_probe_fn"), Some(voff));

    assert!(info.global_variable_voff("TOMERU_DWARF_PROBE_VAR").is_some());
    assert!(info.voff_from_symbol("no_such_function_anywhere").is_none());
}

#[test]
fn test_provider_missing_file() {
    let provider = DwarfProvider::new();
    assert!(provider.open(Path::new("/nonexistent/tomeru/binary")).is_none());
    assert!(provider.open(Path::new("")).is_none());
}
