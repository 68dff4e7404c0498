//! モジュールイメージキャッシュ
//!
//! ロードされたモジュールのヘッダをターゲットのメモリから読み、
//! アンワインドに必要な関数テーブル（pdata）、エントリポイント、TLS範囲、
//! 埋め込みのデバッグ情報パスを覚えておく。
//! PEヘッダがないモジュール（LinuxのELF）はモジュールファイル自体をデバッグ情報とする。

use super::memory::ProcessMemoryCache;
use crate::range::AddrRange;
use crate::Deadline;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tomeru_target::{Arch, Handle};
use tracing::{debug, warn};

const STRIPES: usize = 16;

const IMAGE_DIRECTORY_ENTRY_EXCEPTION: usize = 3;
const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;
const IMAGE_DIRECTORY_ENTRY_TLS: usize = 9;
const IMAGE_DEBUG_TYPE_CODEVIEW: u32 = 2;
const DEBUG_DIRECTORY_SIZE: u64 = 28;
const PATH_CHUNK: u64 = 256;
const MAX_PATH_LEN: usize = 4096;

/// ヘッダ読み込みの締め切り
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// x64の関数テーブルエントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PdataX64 {
    pub voff_first: u32,
    pub voff_one_past_last: u32,
    pub voff_unwind_info: u32,
}

/// ARM64の関数テーブルエントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PdataArm64 {
    pub voff_first: u32,
    /// フラグ2ビット + パックされたアンワインドデータ、またはxdataのオフセット
    pub combined: u32,
}

/// モジュール1つぶんの情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleImageInfo {
    pub arch: Arch,
    pub vaddr_range: AddrRange,
    pub image_base: u64,
    pub entry_point_voff: u64,
    /// TLSインデックスの置き場所（4バイト）
    pub tls_vaddr_range: AddrRange,
    pub pdatas_x64: Vec<PdataX64>,
    pub pdatas_arm64: Vec<PdataArm64>,
    pub builtin_debug_info_path: String,
    pub initial_debug_info_path: String,
}

impl ModuleImageInfo {
    pub fn base(&self) -> u64 {
        self.vaddr_range.min
    }
}

/// `voff`を含むx64 pdata（開始オフセットで二分探索）
pub fn pdata_x64_search(pdatas: &[PdataX64], voff: u64) -> Option<&PdataX64> {
    let idx = pdatas.partition_point(|p| p.voff_first as u64 <= voff);
    let p = pdatas.get(idx.checked_sub(1)?)?;
    (voff < p.voff_one_past_last as u64).then_some(p)
}

/// `voff`を含むARM64 pdata
///
/// ARM64のエントリは終わりを持たないので、パック形式なら関数長で確かめる。
pub fn pdata_arm64_search(pdatas: &[PdataArm64], voff: u64) -> Option<&PdataArm64> {
    let idx = pdatas.partition_point(|p| p.voff_first as u64 <= voff);
    let p = pdatas.get(idx.checked_sub(1)?)?;
    let flag = p.combined & 0x3;
    if flag != 0 {
        let len = ((p.combined >> 2) & 0x7FF) as u64 * 4;
        if voff >= p.voff_first as u64 + len {
            return None;
        }
    }
    Some(p)
}

/// ヘッダ読み込み用のカーソル
struct ImageReader<'a> {
    memory: &'a ProcessMemoryCache,
    process: Handle,
    base: u64,
    deadline: Deadline,
}

impl ImageReader<'_> {
    fn bytes(&self, off: u64, len: u64) -> Option<Vec<u8>> {
        let min = self.base.checked_add(off)?;
        self.memory
            .read_exact(self.process, AddrRange::from_len(min, len), self.deadline)
            .map(|(data, _)| data)
    }

    fn u16(&self, off: u64) -> Option<u16> {
        let b = self.bytes(off, 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, off: u64) -> Option<u32> {
        let b = self.bytes(off, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&self, off: u64) -> Option<u64> {
        let b = self.bytes(off, 8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(&b);
        Some(u64::from_le_bytes(a))
    }

    /// NULまでの文字列を256バイトずつ読む
    fn c_string(&self, off: u64) -> String {
        let mut out = Vec::new();
        let mut cursor = off;
        while out.len() < MAX_PATH_LEN {
            let slice = self.memory.read(
                self.process,
                AddrRange::from_len(self.base + cursor, PATH_CHUNK),
                self.deadline,
            );
            let good = &slice.data[..slice.good_prefix_len()];
            match good.iter().position(|b| *b == 0) {
                Some(end) => {
                    out.extend_from_slice(&good[..end]);
                    break;
                }
                None => {
                    out.extend_from_slice(good);
                    if good.len() < PATH_CHUNK as usize {
                        break;
                    }
                }
            }
            cursor += PATH_CHUNK;
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// PEヘッダの解析結果
#[derive(Debug, Default)]
struct PeHeaders {
    arch: Arch,
    image_base: u64,
    entry_point_voff: u64,
    /// (rva, size)
    dirs: Vec<(u32, u32)>,
    is_pe32_plus: bool,
}

fn parse_pe_headers(reader: &ImageReader<'_>) -> Option<PeHeaders> {
    if reader.bytes(0, 2)? != b"MZ" {
        return None;
    }
    let pe_off = reader.u32(0x3C)? as u64;
    if reader.bytes(pe_off, 4)? != b"PE\0\0" {
        return None;
    }
    let machine = reader.u16(pe_off + 4)?;
    let opt_size = reader.u16(pe_off + 20)? as u64;
    let opt = pe_off + 24;
    let magic = reader.u16(opt)?;
    let is_pe32_plus = match magic {
        0x20B => true,
        0x10B => false,
        _ => return None,
    };

    let arch = match machine {
        0x8664 => Arch::X64,
        0xAA64 => Arch::Arm64,
        0x14C => Arch::X86,
        0x1C4 => Arch::Arm32,
        _ => Arch::Null,
    };
    let entry_point_voff = reader.u32(opt + 16)? as u64;
    let image_base = if is_pe32_plus {
        reader.u64(opt + 24)?
    } else {
        reader.u32(opt + 28)? as u64
    };
    let (count_off, dirs_off) = if is_pe32_plus { (108, 112) } else { (92, 96) };
    let declared = reader.u32(opt + count_off)? as u64;
    let fits = opt_size.saturating_sub(dirs_off) / 8;
    let count = declared.min(fits).min(16);

    let mut dirs = Vec::with_capacity(count as usize);
    for i in 0..count {
        let entry = opt + dirs_off + i * 8;
        dirs.push((reader.u32(entry)?, reader.u32(entry + 4)?));
    }
    Some(PeHeaders {
        arch,
        image_base,
        entry_point_voff,
        dirs,
        is_pe32_plus,
    })
}

fn parse_pdatas(reader: &ImageReader<'_>, headers: &PeHeaders, info: &mut ModuleImageInfo) {
    let Some(&(rva, size)) = headers.dirs.get(IMAGE_DIRECTORY_ENTRY_EXCEPTION) else {
        return;
    };
    if rva == 0 || size == 0 {
        return;
    }
    let Some(raw) = reader.bytes(rva as u64, size as u64) else {
        warn!("Failed to read exception directory at {:#x}", reader.base + rva as u64);
        return;
    };
    let word = |c: &[u8], i: usize| u32::from_le_bytes([c[i], c[i + 1], c[i + 2], c[i + 3]]);
    match headers.arch {
        Arch::Arm64 => {
            info.pdatas_arm64 = raw
                .chunks_exact(8)
                .map(|c| PdataArm64 {
                    voff_first: word(c, 0),
                    combined: word(c, 4),
                })
                .collect();
            info.pdatas_arm64.sort_by_key(|p| p.voff_first);
        }
        _ => {
            info.pdatas_x64 = raw
                .chunks_exact(12)
                .map(|c| PdataX64 {
                    voff_first: word(c, 0),
                    voff_one_past_last: word(c, 4),
                    voff_unwind_info: word(c, 8),
                })
                .collect();
            info.pdatas_x64.sort_by_key(|p| p.voff_first);
        }
    }
}

fn parse_tls(reader: &ImageReader<'_>, headers: &PeHeaders, info: &mut ModuleImageInfo) {
    let Some(&(rva, size)) = headers.dirs.get(IMAGE_DIRECTORY_ENTRY_TLS) else {
        return;
    };
    if rva == 0 || size == 0 {
        return;
    }
    let index_va = if headers.is_pe32_plus {
        reader.u64(rva as u64 + 16)
    } else {
        reader.u32(rva as u64 + 8).map(|v| v as u64)
    };
    if let Some(va) = index_va.filter(|va| *va >= headers.image_base) {
        let rebased = va - headers.image_base + reader.base;
        info.tls_vaddr_range = AddrRange::from_len(rebased, 4);
    }
}

fn parse_debug_path(reader: &ImageReader<'_>, headers: &PeHeaders) -> String {
    let Some(&(rva, size)) = headers.dirs.get(IMAGE_DIRECTORY_ENTRY_DEBUG) else {
        return String::new();
    };
    let count = size as u64 / DEBUG_DIRECTORY_SIZE;
    for i in 0..count {
        let entry = rva as u64 + i * DEBUG_DIRECTORY_SIZE;
        if reader.u32(entry + 12) != Some(IMAGE_DEBUG_TYPE_CODEVIEW) {
            continue;
        }
        let Some(data_rva) = reader.u32(entry + 20).map(|v| v as u64) else {
            continue;
        };
        let path = match reader.bytes(data_rva, 4).as_deref() {
            Some(b"RSDS") => reader.c_string(data_rva + 24),
            Some(b"NB10") => reader.c_string(data_rva + 16),
            _ => continue,
        };
        if !path.is_empty() {
            return path;
        }
    }
    String::new()
}

/// ELFヘッダからエントリポイントのオフセットを取る
fn parse_elf_entry(reader: &ImageReader<'_>) -> Option<(Arch, u64)> {
    if reader.bytes(0, 4)? != b"\x7fELF" {
        return None;
    }
    let class = reader.bytes(4, 1)?[0];
    let e_type = reader.u16(16)?;
    let machine = reader.u16(18)?;
    let entry = if class == 2 {
        reader.u64(24)?
    } else {
        reader.u32(24)? as u64
    };
    let arch = match machine {
        62 => Arch::X64,
        183 => Arch::Arm64,
        3 => Arch::X86,
        40 => Arch::Arm32,
        _ => Arch::Null,
    };
    // ET_EXECは絶対アドレス、ET_DYNはベースからのオフセット
    let voff = if e_type == 2 {
        entry.saturating_sub(reader.base)
    } else {
        entry
    };
    Some((arch, voff))
}

fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// デバッグ情報パスの候補（優先順）
pub fn debug_info_path_candidates(module_path: &str, builtin: &str) -> Vec<PathBuf> {
    let module = Path::new(module_path);
    let mut candidates = Vec::new();
    if !builtin.is_empty() {
        let embedded = Path::new(builtin);
        if embedded.is_absolute() {
            candidates.push(embedded.to_path_buf());
        }
        // Windows形式のパスでもファイル名だけは取り出す
        let file_name = builtin.rsplit(['/', '\\']).next().unwrap_or(builtin);
        if let Some(dir) = module.parent() {
            if !file_name.is_empty() {
                candidates.push(dir.join(file_name));
            }
        }
    }
    if !module_path.is_empty() {
        let with_ext = |ext: &str| {
            let mut p = module.as_os_str().to_os_string();
            p.push(ext);
            PathBuf::from(p)
        };
        candidates.push(module.with_extension("pdb"));
        candidates.push(with_ext(".pdb"));
        candidates.push(module.with_extension("rdi"));
        candidates.push(with_ext(".rdi"));
    }
    candidates
}

/// 最初に見つかった空でないファイル、なければ埋め込みのパス
pub fn choose_initial_debug_info_path(module_path: &str, builtin: &str) -> String {
    debug_info_path_candidates(module_path, builtin)
        .into_iter()
        .find(|p| is_nonempty_file(p))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| builtin.to_string())
}

type ModuleStripe = RwLock<HashMap<Handle, Arc<ModuleImageInfo>>>;

/// モジュールイメージキャッシュ
///
/// 解析結果はモジュールハンドルごとのストライプに置く。
/// 参照は読み取りロックだけで済む。
pub struct ModuleImageCache {
    memory: Arc<ProcessMemoryCache>,
    stripes: Vec<ModuleStripe>,
}

impl ModuleImageCache {
    pub fn new(memory: Arc<ProcessMemoryCache>) -> Self {
        Self {
            memory,
            stripes: (0..STRIPES).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, module: Handle) -> &ModuleStripe {
        let h = module.os.0 ^ module.os.0 >> 17 ^ module.machine_id;
        &self.stripes[(h as usize) % STRIPES]
    }

    /// モジュールを解析して登録する
    pub fn open(&self, process: Handle, module: Handle, vaddr_range: AddrRange, path: &str) -> Arc<ModuleImageInfo> {
        let reader = ImageReader {
            memory: &self.memory,
            process,
            base: vaddr_range.min,
            deadline: Deadline::after(READ_TIMEOUT),
        };
        let mut info = ModuleImageInfo {
            vaddr_range,
            ..Default::default()
        };

        match parse_pe_headers(&reader) {
            Some(headers) => {
                info.arch = headers.arch;
                info.image_base = headers.image_base;
                info.entry_point_voff = headers.entry_point_voff;
                parse_pdatas(&reader, &headers, &mut info);
                parse_tls(&reader, &headers, &mut info);
                info.builtin_debug_info_path = parse_debug_path(&reader, &headers);
                info.initial_debug_info_path =
                    choose_initial_debug_info_path(path, &info.builtin_debug_info_path);
            }
            None => {
                if let Some((arch, entry)) = parse_elf_entry(&reader) {
                    info.arch = arch;
                    info.entry_point_voff = entry;
                }
                if is_nonempty_file(Path::new(path)) {
                    info.initial_debug_info_path = path.to_string();
                }
            }
        }
        debug!(
            "Opened module {} at {}: {} x64 pdata, {} arm64 pdata, debug info {:?}",
            path,
            vaddr_range,
            info.pdatas_x64.len(),
            info.pdatas_arm64.len(),
            info.initial_debug_info_path
        );

        let info = Arc::new(info);
        self.stripe(module).write().insert(module, info.clone());
        info
    }

    pub fn close(&self, module: Handle) {
        self.stripe(module).write().remove(&module);
    }

    pub fn info(&self, module: Handle) -> Option<Arc<ModuleImageInfo>> {
        self.stripe(module).read().get(&module).cloned()
    }

    pub fn pdata_x64_from_voff(&self, module: Handle, voff: u64) -> Option<PdataX64> {
        let info = self.info(module)?;
        pdata_x64_search(&info.pdatas_x64, voff).copied()
    }

    pub fn pdata_arm64_from_voff(&self, module: Handle, voff: u64) -> Option<PdataArm64> {
        let info = self.info(module)?;
        pdata_arm64_search(&info.pdatas_arm64, voff).copied()
    }

    pub fn entry_point_voff(&self, module: Handle) -> Option<u64> {
        self.info(module).map(|i| i.entry_point_voff).filter(|v| *v != 0)
    }

    pub fn tls_range(&self, module: Handle) -> AddrRange {
        self.info(module).map(|i| i.tls_vaddr_range).unwrap_or_default()
    }

    pub fn initial_debug_info_path(&self, module: Handle) -> String {
        self.info(module)
            .map(|i| i.initial_debug_info_path.clone())
            .unwrap_or_default()
    }

    /// プロセスのモジュールをすべて閉じる
    pub fn clear(&self) {
        for stripe in &self.stripes {
            stripe.write().clear();
        }
    }

    /// 登録済みのモジュール数
    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HashStore;
    use crate::config::MemoryCacheConfig;
    use std::io::Write;
    use tomeru_target::{MockApi, OsHandle};

    const PROCESS: OsHandle = OsHandle(7);
    const BASE: u64 = 0x1_4000_0000;

    fn put16(img: &mut [u8], off: usize, v: u16) {
        img[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put32(img: &mut [u8], off: usize, v: u32) {
        img[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put64(img: &mut [u8], off: usize, v: u64) {
        img[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// PE32+のx64イメージ（pdata 2つ、TLS、RSDS）
    fn fake_pe() -> Vec<u8> {
        let mut img = vec![0u8; 0x3000];
        img[0..2].copy_from_slice(b"MZ");
        put32(&mut img, 0x3C, 0x80);
        img[0x80..0x84].copy_from_slice(b"PE\0\0");
        put16(&mut img, 0x84, 0x8664);
        put16(&mut img, 0x94, 240);
        let opt = 0x98;
        put16(&mut img, opt, 0x20B);
        put32(&mut img, opt + 16, 0x1010);
        put64(&mut img, opt + 24, 0x1_4000_0000);
        put32(&mut img, opt + 108, 16);
        let dirs = opt + 112;
        // 例外ディレクトリ（わざと逆順）
        put32(&mut img, dirs + 3 * 8, 0x2000);
        put32(&mut img, dirs + 3 * 8 + 4, 24);
        put32(&mut img, 0x2000, 0x1100);
        put32(&mut img, 0x2004, 0x1180);
        put32(&mut img, 0x2008, 0x2200);
        put32(&mut img, 0x200C, 0x1000);
        put32(&mut img, 0x2010, 0x1040);
        put32(&mut img, 0x2014, 0x2210);
        // デバッグディレクトリ
        put32(&mut img, dirs + 6 * 8, 0x2100);
        put32(&mut img, dirs + 6 * 8 + 4, 28);
        put32(&mut img, 0x2100 + 12, 2);
        put32(&mut img, 0x2100 + 20, 0x2400);
        img[0x2400..0x2404].copy_from_slice(b"RSDS");
        let path = b"C:\\build\\app.pdb\0";
        img[0x2418..0x2418 + path.len()].copy_from_slice(path);
        // TLSディレクトリ
        put32(&mut img, dirs + 9 * 8, 0x2300);
        put32(&mut img, dirs + 9 * 8 + 4, 40);
        put64(&mut img, 0x2300 + 16, 0x1_4000_2800);
        img
    }

    fn cache(api: Arc<MockApi>) -> ModuleImageCache {
        let config = MemoryCacheConfig {
            workers: 1,
            ..Default::default()
        };
        let memory = ProcessMemoryCache::new(api, Arc::new(HashStore::new()), config);
        ModuleImageCache::new(Arc::new(memory))
    }

    #[test]
    fn test_parse_pe_image() {
        let api = Arc::new(MockApi::new());
        let img = fake_pe();
        api.map_memory(PROCESS, BASE, &img);
        let cache = cache(api);
        let module = Handle::local(OsHandle(0x30));
        let range = AddrRange::from_len(BASE, img.len() as u64);
        let info = cache.open(Handle::local(PROCESS), module, range, "/nonexistent/app.exe");

        assert_eq!(info.arch, Arch::X64);
        assert_eq!(cache.entry_point_voff(module), Some(0x1010));
        assert_eq!(info.pdatas_x64.len(), 2);
        assert_eq!(info.pdatas_x64[0].voff_first, 0x1000);
        assert_eq!(cache.pdata_x64_from_voff(module, 0x1120).map(|p| p.voff_unwind_info), Some(0x2200));
        assert!(cache.pdata_x64_from_voff(module, 0x1050).is_none());
        assert!(cache.pdata_arm64_from_voff(module, 0x1120).is_none());
        assert_eq!(cache.tls_range(module), AddrRange::from_len(BASE + 0x2800, 4));
        assert_eq!(info.builtin_debug_info_path, "C:\\build\\app.pdb");
        // 候補がどれも存在しないので埋め込みのパス
        assert_eq!(cache.initial_debug_info_path(module), "C:\\build\\app.pdb");

        cache.close(module);
        assert!(cache.info(module).is_none());
    }

    #[test]
    fn test_non_pe_module_uses_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libfoo.so");
        std::fs::File::create(&path).unwrap().write_all(b"not empty").unwrap();

        let api = Arc::new(MockApi::new());
        api.map_memory(PROCESS, 0x7000_0000, &[0u8; 64]);
        let cache = cache(api);
        let module = Handle::local(OsHandle(0x31));
        let path_str = path.to_string_lossy().into_owned();
        cache.open(
            Handle::local(PROCESS),
            module,
            AddrRange::from_len(0x7000_0000, 0x1000),
            &path_str,
        );
        assert_eq!(cache.initial_debug_info_path(module), path_str);
        assert_eq!(cache.entry_point_voff(module), None);
    }

    #[test]
    fn test_lookups_across_stripes() {
        let api = Arc::new(MockApi::new());
        let img = fake_pe();
        api.map_memory(PROCESS, BASE, &img);
        let cache = cache(api);
        let range = AddrRange::from_len(BASE, img.len() as u64);
        let modules: Vec<Handle> = (0x100..0x140).map(|h| Handle::local(OsHandle(h))).collect();
        for module in &modules {
            cache.open(Handle::local(PROCESS), *module, range, "/nonexistent/app.exe");
        }
        assert_eq!(cache.len(), modules.len());

        std::thread::scope(|s| {
            for chunk in modules.chunks(16) {
                let cache = &cache;
                s.spawn(move || {
                    for module in chunk {
                        assert_eq!(cache.entry_point_voff(*module), Some(0x1010));
                        assert!(cache.pdata_x64_from_voff(*module, 0x1120).is_some());
                    }
                });
            }
        });

        cache.close(modules[0]);
        assert!(cache.info(modules[0]).is_none());
        assert!(cache.info(modules[1]).is_some());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_debug_path_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("app.exe");
        let module_str = module.to_string_lossy().into_owned();

        let candidates = debug_info_path_candidates(&module_str, "C:\\out\\app.pdb");
        assert_eq!(candidates[0], dir.path().join("app.pdb"));
        assert_eq!(candidates[2], dir.path().join("app.exe.pdb"));

        assert_eq!(choose_initial_debug_info_path(&module_str, "C:\\out\\app.pdb"), "C:\\out\\app.pdb");

        std::fs::write(dir.path().join("app.exe.rdi"), b"rdi").unwrap();
        assert_eq!(
            choose_initial_debug_info_path(&module_str, ""),
            dir.path().join("app.exe.rdi").to_string_lossy()
        );
        // 空ファイルは選ばない
        std::fs::write(dir.path().join("app.pdb"), b"").unwrap();
        assert_eq!(
            choose_initial_debug_info_path(&module_str, ""),
            dir.path().join("app.exe.rdi").to_string_lossy()
        );
    }

    #[test]
    fn test_arm64_search_respects_packed_length() {
        // 関数長 = 4命令
        let packed = 1 | (4 << 2);
        let pdatas = [PdataArm64 { voff_first: 0x100, combined: packed }];
        assert!(pdata_arm64_search(&pdatas, 0x10C).is_some());
        assert!(pdata_arm64_search(&pdatas, 0x110).is_none());
        assert!(pdata_arm64_search(&pdatas, 0xFF).is_none());
    }
}
