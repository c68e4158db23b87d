//! ELFとDWARFの読み込み機能

use crate::Result;
use object::{Object, ObjectSection};
use std::path::{Path, PathBuf};

/// DWARFセクションのリーダー型
pub type DwarfReader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// 読み込んだ実行ファイル
///
/// バイナリはセッションの間ずっと参照されるので、読み込んだバイト列は解放しません。
pub struct DwarfLoader {
    path: PathBuf,
    object_file: object::File<'static>,
    endian: gimli::RunTimeEndian,
    dwarf: gimli::Dwarf<DwarfReader>,
}

impl DwarfLoader {
    /// ELFファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;
        Self::from_bytes(path, data)
    }

    /// メモリ上のELFイメージを読み込む
    pub fn from_bytes(path: impl Into<PathBuf>, data: Vec<u8>) -> Result<Self> {
        let path = path.into();
        let data: &'static [u8] = Box::leak(data.into_boxed_slice());

        let object_file = object::File::parse(data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;
        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        let dwarf = sections(&object_file, endian)?;

        Ok(Self {
            path,
            object_file,
            endian,
            dwarf,
        })
    }

    /// 読み込んだファイルのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<DwarfReader> {
        &self.dwarf
    }

    /// 同じセクションを指す新しいDWARFコンテキストを作成する
    ///
    /// addr2lineのように所有権を要求する利用者向けです。
    pub fn fresh_dwarf(&self) -> Result<gimli::Dwarf<DwarfReader>> {
        sections(&self.object_file, self.endian)
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// `.debug_info` を持つかどうか（strip済みならfalse）
    pub fn has_debug_info(&self) -> bool {
        self.object_file
            .section_by_name(".debug_info")
            .is_some_and(|section| section.size() > 0)
    }

    /// PIE（ET_DYN）かどうか
    ///
    /// PIEではシンボルアドレスがオフセットなので、実行時のロードバイアスを加算します。
    pub fn is_pie(&self) -> bool {
        matches!(self.object_file.kind(), object::ObjectKind::Dynamic)
    }
}

/// DWARFセクションを集める（存在しないセクションは空として扱う）
fn sections(
    object_file: &object::File<'static>,
    endian: gimli::RunTimeEndian,
) -> Result<gimli::Dwarf<DwarfReader>> {
    gimli::Dwarf::load(|id: gimli::SectionId| -> Result<DwarfReader> {
        let data = object_file
            .section_by_name(id.name())
            .and_then(|section| section.data().ok())
            .unwrap_or(&[]);
        Ok(gimli::EndianSlice::new(data, endian))
    })
    .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_elf() {
        let result = DwarfLoader::from_bytes("garbage", b"not an object file".to_vec());
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(DwarfLoader::load("/nonexistent/yomi-test-binary").is_err());
    }
}
