//! ELFとDWARFの読み込み機能

use crate::Result;
use object::{Object, ObjectSection, ObjectSegment};
use std::fs;
use std::path::{Path, PathBuf};

/// 'static なDWARFリーダー
pub type StaticReader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// DWARFローダー
pub struct DwarfLoader {
    /// 読み込んだファイルのパス
    path: PathBuf,
    /// オブジェクトファイル
    object_file: object::File<'static>,
    /// DWARFコンテキスト
    dwarf: gimli::Dwarf<StaticReader>,
    /// エンディアン
    endian: gimli::RunTimeEndian,
    /// voff計算の基準となる仮想アドレス
    relative_address_base: u64,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // gimliのリーダーは'staticを要求するのでBox::leakで寿命を延ばす
        // プロバイダがパスごとに1回だけ読み込むので増え続けることはない
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse object file {:?}: {}", path, e))?;

        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let dwarf = Self::load_dwarf(&object_file, endian)?;

        // ファイルオフセット0を含むセグメントの仮想アドレスがモジュールベースに対応する
        // PIEなら0、非PIEなら0x400000などになる
        let relative_address_base = object_file
            .segments()
            .filter(|seg| seg.size() > 0)
            .map(|seg| seg.address() & !0xfff)
            .min()
            .unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            object_file,
            dwarf,
            endian,
            relative_address_base,
        })
    }

    /// DWARFセクションを読み込む
    ///
    /// addr2lineのコンテキストも所有権を要求するため、必要なだけ何度でも呼べるようにしている。
    fn load_dwarf(
        object_file: &object::File<'static>,
        endian: gimli::RunTimeEndian,
    ) -> Result<gimli::Dwarf<StaticReader>> {
        let load_section = |id: gimli::SectionId| -> Result<StaticReader> {
            let data = object_file
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };

        gimli::Dwarf::load(load_section)
            .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
    }

    /// 別インスタンスのDWARFコンテキストを作る
    pub fn fresh_dwarf(&self) -> Result<gimli::Dwarf<StaticReader>> {
        Self::load_dwarf(&self.object_file, self.endian)
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<StaticReader> {
        &self.dwarf
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// 読み込んだパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// voffの基準アドレス（ファイル上の仮想アドレス - この値 = voff）
    pub fn relative_address_base(&self) -> u64 {
        self.relative_address_base
    }

    /// ファイル上の仮想アドレスをvoffに変換する
    pub fn voff_from_file_address(&self, address: u64) -> u64 {
        address.wrapping_sub(self.relative_address_base)
    }

    /// PIE（Position Independent Executable）かどうかを判定する
    ///
    /// ET_DYN は PIE実行ファイルまたは共有ライブラリ、ET_EXEC は非PIE実行ファイル。
    pub fn is_pie(&self) -> bool {
        use object::ObjectKind;
        matches!(self.object_file.kind(), ObjectKind::Dynamic)
    }
}
