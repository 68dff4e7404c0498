//! パース関連のユーティリティ関数

use crate::protocol::UserBreakpoint;
use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use tomeru_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e))
    } else {
        // 10進数でもダメなら16進数として解釈を試みる
        s.parse::<u64>()
            .or_else(|_| u64::from_str_radix(s, 16))
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
    }
}

/// ブレークポイントの場所をパースする
///
/// - `0x401000` → 仮想アドレス
/// - `src/main.rs:42` → ファイル名:行
/// - `main` / `main+0x10` → シンボル名+オフセット
///
/// 後ろに `if <条件式>` を付けると条件付きになる。
///
/// # Examples
/// ```
/// use tomeru_core::parse::parse_location;
/// use tomeru_core::protocol::UserBreakpointKind;
///
/// let bp = parse_location("main.c:10 if $rax == 0").unwrap();
/// assert_eq!(bp.kind, UserBreakpointKind::FileNameAndLineColNumber);
/// assert_eq!(bp.condition, "$rax == 0");
/// ```
pub fn parse_location(s: &str) -> Result<UserBreakpoint> {
    let s = s.trim();
    let (location, condition) = match s.split_once(" if ") {
        Some((loc, cond)) => (loc.trim(), cond.trim()),
        None => (s, ""),
    };
    if location.is_empty() {
        return Err(anyhow::anyhow!("Empty breakpoint location"));
    }

    let bp = if location.starts_with("0x") || location.starts_with("0X") {
        UserBreakpoint::address(parse_address(location)?)
    } else if let Some((file, line)) = location.rsplit_once(':').filter(|(_, l)| !l.is_empty()) {
        if let Ok(line) = line.parse::<u64>() {
            UserBreakpoint::file_line(file, line)
        } else {
            // `a::b` のようなパス付きシンボル
            parse_symbol(location)?
        }
    } else {
        parse_symbol(location)?
    };
    Ok(bp.with_condition(condition))
}

fn parse_symbol(s: &str) -> Result<UserBreakpoint> {
    match s.rsplit_once('+') {
        Some((name, offset)) if !name.is_empty() => {
            Ok(UserBreakpoint::symbol(name.trim(), parse_address(offset)?))
        }
        _ => Ok(UserBreakpoint::symbol(s, 0)),
    }
}
