//! デバッグメタデータ提供インターフェース

use crate::{FunctionId, FunctionMetadata, Result, SourceLocation, SymbolKind};
use std::ops::Range;

/// デバッグメタデータの提供元
///
/// アドレスはすべてランタイムアドレス（ロードバイアス適用済み）です。
pub trait MetadataProvider {
    /// PCを含む関数を探す
    fn function_at(&self, pc: u64) -> Option<FunctionId>;

    /// 関数のメタデータを取得する
    ///
    /// `Ok(None)` はメタデータが存在しないことを、`Err` は解析の失敗を表します。
    fn function_metadata(&self, id: FunctionId) -> Result<Option<FunctionMetadata>>;

    /// アドレスのシンボル種別を取得する
    fn symbol_kind(&self, addr: u64) -> SymbolKind;

    /// アドレスのシンボル名（表示用）を取得する
    fn symbol_name(&self, addr: u64) -> Option<String>;

    /// アドレスを含むシンボルのコード範囲を取得する
    fn symbol_range(&self, addr: u64) -> Option<Range<u64>>;

    /// シンボル名からアドレスを解決する
    fn symbol_address(&self, name: &str) -> Option<u64>;

    /// アドレスのソース位置を取得する
    fn source_location(&self, _addr: u64) -> Option<SourceLocation> {
        None
    }
}

impl<T: MetadataProvider + ?Sized> MetadataProvider for &T {
    fn function_at(&self, pc: u64) -> Option<FunctionId> {
        (**self).function_at(pc)
    }

    fn function_metadata(&self, id: FunctionId) -> Result<Option<FunctionMetadata>> {
        (**self).function_metadata(id)
    }

    fn symbol_kind(&self, addr: u64) -> SymbolKind {
        (**self).symbol_kind(addr)
    }

    fn symbol_name(&self, addr: u64) -> Option<String> {
        (**self).symbol_name(addr)
    }

    fn symbol_range(&self, addr: u64) -> Option<Range<u64>> {
        (**self).symbol_range(addr)
    }

    fn symbol_address(&self, name: &str) -> Option<u64> {
        (**self).symbol_address(name)
    }

    fn source_location(&self, addr: u64) -> Option<SourceLocation> {
        (**self).source_location(addr)
    }
}
