//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write as _};

/// メモリマッピング情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub offset: u64,
    pub path: String,
}

/// /proc/pid/maps の1行をパースする
///
/// フォーマット: "address perms offset dev inode pathname"
/// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
pub fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }
    let (start, end) = parts[0].split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let perms = parts[1].as_bytes();
    let offset = u64::from_str_radix(parts[2], 16).ok()?;
    let path = if parts.len() >= 6 { parts[5..].join(" ") } else { String::new() };

    Some(MemoryMapping {
        start,
        end,
        readable: perms.first() == Some(&b'r'),
        writable: perms.get(1) == Some(&b'w'),
        executable: perms.get(2) == Some(&b'x'),
        offset,
        path,
    })
}

/// ファイルに裏付けられたモジュール（同じパスのマッピングをまとめたもの）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedModule {
    pub base: u64,
    pub end: u64,
    pub path: String,
}

/// マッピング一覧からモジュールを組み立てる
///
/// オフセット0のマッピングを持つファイルだけをモジュールとみなす。
pub fn modules_from_mappings(mappings: &[MemoryMapping]) -> Vec<MappedModule> {
    let mut modules: Vec<MappedModule> = Vec::new();
    for m in mappings {
        if !m.path.starts_with('/') {
            continue;
        }
        match modules.iter_mut().find(|module| module.path == m.path) {
            Some(module) => {
                module.base = module.base.min(m.start);
                module.end = module.end.max(m.end);
            }
            None if m.offset == 0 => modules.push(MappedModule {
                base: m.start,
                end: m.end,
                path: m.path.clone(),
            }),
            None => {}
        }
    }
    modules
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// 読めるだけ読み、読めたバイト数を返す
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// 1バイトも読めなかった場合はPTRACE_PEEKDATAにフォールバックします。
    pub fn read_into(&self, addr: u64, buf: &mut [u8]) -> usize {
        let read = self.read_via_proc_mem(addr, buf).unwrap_or(0);
        if read > 0 {
            return read;
        }
        self.read_via_ptrace(addr, buf)
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))?;

        // 途中でマップされていない領域に当たると短く返る
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
        Ok(total)
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    fn read_via_ptrace(&self, addr: u64, buf: &mut [u8]) -> usize {
        use nix::sys::ptrace;

        let word_size = std::mem::size_of::<usize>();
        let mut total = 0;

        // word単位で読み取り
        while total < buf.len() {
            let word_addr = (addr + total as u64) as *mut std::ffi::c_void;
            let word = match ptrace::read(self.pid, word_addr) {
                Ok(word) => word,
                Err(_) => break,
            };
            let bytes = word.to_ne_bytes();
            let copy_size = (buf.len() - total).min(word_size);
            buf[total..total + copy_size].copy_from_slice(&bytes[..copy_size]);
            total += copy_size;
        }
        total
    }

    /// メモリにデータを書き込む
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリに書き込みます。
    /// テキストセグメントのような書き込み禁止領域にも書ける。
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;

        file.write_all(data)
            .map_err(|e| anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e))?;

        Ok(())
    }

    /// u8値を読み取る
    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        if self.read_into(addr, &mut buf) != 1 {
            return Err(anyhow::anyhow!("Failed to read byte at 0x{:x}", addr));
        }
        Ok(buf[0])
    }

    /// u8値を書き込む
    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();
        for line in reader.lines() {
            if let Some(mapping) = parse_maps_line(&line?) {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    /// スタック（[stack]）の上端
    pub fn main_stack_top(&self) -> Result<u64> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.ends_with("[stack]") {
                if let Some(mapping) = parse_maps_line(&line) {
                    return Ok(mapping.end);
                }
            }
        }
        Err(anyhow::anyhow!("Could not find [stack] mapping for {}", self.pid))
    }

    /// アドレスを含むマッピングの上端
    pub fn mapping_end_containing(&self, addr: u64) -> Result<u64> {
        self.get_mappings()?
            .into_iter()
            .find(|m| addr >= m.start && addr < m.end)
            .map(|m| m.end)
            .ok_or_else(|| anyhow::anyhow!("Address 0x{:x} is not mapped", addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maps_line() {
        let m = parse_maps_line("7f1234567000-7f1234568000 r-xp 00001000 08:01 123456 /lib/libc.so.6")
            .unwrap();
        assert_eq!(m.start, 0x7f1234567000);
        assert_eq!(m.end, 0x7f1234568000);
        assert!(m.readable && !m.writable && m.executable);
        assert_eq!(m.offset, 0x1000);
        assert_eq!(m.path, "/lib/libc.so.6");

        let anon = parse_maps_line("7ffc00000000-7ffc00021000 rw-p 00000000 00:00 0").unwrap();
        assert!(anon.path.is_empty());
        assert!(parse_maps_line("garbage").is_none());
    }

    #[test]
    fn test_modules_from_mappings() {
        let lines = [
            "555555554000-555555555000 r--p 00000000 08:01 1 /usr/bin/app",
            "555555555000-555555556000 r-xp 00001000 08:01 1 /usr/bin/app",
            "7ffff7fc3000-7ffff7fc5000 r--p 00000000 08:01 2 /usr/lib/ld-linux-x86-64.so.2",
            "7ffff7ff0000-7ffff7ff2000 r-xp 00000000 00:00 0 [vdso]",
            "7ffff7e00000-7ffff7e01000 r--p 00004000 08:01 3 /tmp/partial.so",
        ];
        let mappings: Vec<_> = lines.iter().filter_map(|l| parse_maps_line(l)).collect();
        let modules = modules_from_mappings(&mappings);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].base, 0x555555554000);
        assert_eq!(modules[0].end, 0x555555556000);
        assert_eq!(modules[1].path, "/usr/lib/ld-linux-x86-64.so.2");
    }
}
