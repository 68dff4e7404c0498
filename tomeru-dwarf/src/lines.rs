//! ソース行情報

use crate::loader::StaticReader;
use crate::utils::{normalize_path, path_matches};
use crate::Result;
use std::collections::HashMap;
use std::path::PathBuf;

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

/// ファイルごとの (行, ファイル上アドレス) の一覧
///
/// ブレークポイント解決のためにファイル:行 → アドレスを引く。
/// 逆方向（アドレス → 行）は addr2line に任せる。
#[derive(Debug, Default)]
pub struct LineTable {
    /// 正規化したファイルパス -> 行でソートした (行, アドレス)
    files: HashMap<String, Vec<(u32, u64)>>,
}

impl LineTable {
    /// DWARFの行番号プログラムをすべて走査してテーブルを作る
    pub fn build(dwarf: &gimli::Dwarf<StaticReader>) -> Result<Self> {
        let mut files: HashMap<String, Vec<(u32, u64)>> = HashMap::new();

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let program = match unit.line_program.clone() {
                Some(program) => program,
                None => continue,
            };
            let comp_dir = unit
                .comp_dir
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut rows = program.rows();
            while let Some((header, row)) = rows.next_row()? {
                if row.end_sequence() || !row.is_stmt() {
                    continue;
                }
                let line = match row.line() {
                    Some(line) => line.get() as u32,
                    None => continue,
                };
                let file = match row.file(header) {
                    Some(file) => file,
                    None => continue,
                };

                let mut path = PathBuf::from(&comp_dir);
                if let Some(dir) = file.directory(header) {
                    let dir = dwarf.attr_string(&unit, dir)?;
                    path.push(dir.to_string_lossy().as_ref());
                }
                let name = dwarf.attr_string(&unit, file.path_name())?;
                path.push(name.to_string_lossy().as_ref());

                files
                    .entry(normalize_path(&path.to_string_lossy()))
                    .or_default()
                    .push((line, row.address()));
            }
        }

        for rows in files.values_mut() {
            rows.sort_unstable();
            rows.dedup();
        }

        Ok(Self { files })
    }

    /// テスト用などに行データを直接追加する
    pub fn insert(&mut self, file: &str, line: u32, address: u64) {
        let rows = self.files.entry(normalize_path(file)).or_default();
        rows.push((line, address));
        rows.sort_unstable();
        rows.dedup();
    }

    /// ファイル:行に対応するアドレスを返す
    ///
    /// 指定行に命令が無い場合は、同じファイルで次に命令がある行を使う。
    pub fn addresses_from_file_line(&self, file: &str, line: u32) -> Vec<u64> {
        let query = normalize_path(file);
        let mut best: Option<(u32, Vec<u64>)> = None;

        for (path, rows) in &self.files {
            if !path_matches(path, &query) {
                continue;
            }
            let start = rows.partition_point(|(l, _)| *l < line);
            let found_line = match rows.get(start) {
                Some((l, _)) => *l,
                None => continue,
            };
            let addrs: Vec<u64> = rows[start..]
                .iter()
                .take_while(|(l, _)| *l == found_line)
                .map(|(_, a)| *a)
                .collect();

            match &mut best {
                Some((best_line, best_addrs)) if *best_line == found_line => {
                    best_addrs.extend(addrs)
                }
                Some((best_line, _)) if *best_line < found_line => {}
                _ => best = Some((found_line, addrs)),
            }
        }

        let mut addrs = best.map(|(_, a)| a).unwrap_or_default();
        addrs.sort_unstable();
        addrs.dedup();
        addrs
    }

    /// 登録されているファイル数
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_line() {
        let mut table = LineTable::default();
        table.insert("/src/app/main.c", 10, 0x1000);
        table.insert("/src/app/main.c", 10, 0x1008);
        table.insert("/src/app/main.c", 11, 0x1010);
        assert_eq!(table.addresses_from_file_line("main.c", 10), vec![0x1000, 0x1008]);
    }

    #[test]
    fn test_next_line_with_code() {
        let mut table = LineTable::default();
        table.insert("/src/app/main.c", 10, 0x1000);
        table.insert("/src/app/main.c", 14, 0x1040);
        assert_eq!(table.addresses_from_file_line("APP\\main.c", 12), vec![0x1040]);
        assert!(table.addresses_from_file_line("main.c", 20).is_empty());
        assert!(table.addresses_from_file_line("other.c", 10).is_empty());
    }
}
