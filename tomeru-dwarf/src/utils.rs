//! DWARF解析のユーティリティ関数

use crate::Result;
use gimli::Reader;

/// パスを比較用に正規化する（小文字化、区切り文字を'/'に統一）
pub fn normalize_path(path: &str) -> String {
    path.chars()
        .map(|c| if c == '\\' { '/' } else { c.to_ascii_lowercase() })
        .collect()
}

/// 正規化済みのパスが問い合わせパスに一致するか（後方一致、ディレクトリ境界で区切る）
pub fn path_matches(candidate: &str, query: &str) -> bool {
    if candidate == query {
        return true;
    }
    match candidate.strip_suffix(query) {
        Some(prefix) => prefix.ends_with('/') || query.starts_with('/'),
        None => false,
    }
}

/// グローバル変数DIE検索ユーティリティ
pub struct VariableFinder;

impl VariableFinder {
    /// 名前が一致し、固定アドレス（DW_OP_addr）に置かれた変数のファイル上アドレスを返す
    pub fn find_global<R: Reader>(dwarf: &gimli::Dwarf<R>, name: &str) -> Result<Option<u64>> {
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() != gimli::DW_TAG_variable {
                    continue;
                }
                if let Some(address) = Self::check_variable(dwarf, &unit, entry, name)? {
                    return Ok(Some(address));
                }
            }
        }
        Ok(None)
    }

    /// 変数DIEの名前と位置式をチェック
    fn check_variable<R: Reader>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
        name: &str,
    ) -> Result<Option<u64>> {
        let entry_name = match entry.attr_value(gimli::DW_AT_name)? {
            Some(value) => dwarf.attr_string(unit, value)?,
            None => return Ok(None),
        };
        if entry_name.to_string_lossy()? != name {
            return Ok(None);
        }

        let expr = match entry.attr_value(gimli::DW_AT_location)? {
            Some(gimli::AttributeValue::Exprloc(expr)) => expr,
            _ => return Ok(None),
        };

        // 単一の DW_OP_addr だけを扱う
        let mut ops = expr.operations(unit.encoding());
        match ops.next()? {
            Some(gimli::Operation::Address { address }) => Ok(Some(address)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("C:\\Src\\Main.C"), "c:/src/main.c");
        assert_eq!(normalize_path("/home/u/a.rs"), "/home/u/a.rs");
    }

    #[test]
    fn test_path_matches_suffix_on_boundary() {
        assert!(path_matches("/home/u/src/main.rs", "src/main.rs"));
        assert!(path_matches("/home/u/src/main.rs", "main.rs"));
        assert!(!path_matches("/home/u/src/domain.rs", "main.rs"));
        assert!(path_matches("/a/b.c", "/a/b.c"));
    }
}
