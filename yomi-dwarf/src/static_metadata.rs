//! テーブル駆動のメタデータ提供
//!
//! 関数メタデータとシンボルを手で登録して使います。
//! 記録済みのセッションの再生や、デバッグ対象なしでのテストに使います。

use crate::{FunctionId, FunctionMetadata, MetadataProvider, Result, SymbolKind};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

/// 登録済みシンボル
#[derive(Debug, Clone)]
struct StaticSymbol {
    name: String,
    address: u64,
    /// サイズ不明ならNone
    range: Option<Range<u64>>,
    kind: SymbolKind,
}

/// テーブル駆動のメタデータ
#[derive(Debug, Default)]
pub struct StaticMetadata {
    functions: BTreeMap<FunctionId, FunctionMetadata>,
    symbols: Vec<StaticSymbol>,
    /// 解析失敗として扱う関数
    broken: BTreeSet<FunctionId>,
}

impl StaticMetadata {
    /// 空のテーブルを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 関数を登録する（同じ範囲の通常シンボルも登録される）
    pub fn add_function(&mut self, function: FunctionMetadata) -> FunctionId {
        let id = function.id;
        self.add_symbol(&function.name, function.range.clone(), SymbolKind::Normal);
        self.functions.insert(id, function);
        id
    }

    /// 種別付きの関数を登録する
    pub fn add_function_with_kind(
        &mut self,
        function: FunctionMetadata,
        kind: SymbolKind,
    ) -> FunctionId {
        let id = function.id;
        self.add_symbol(&function.name, function.range.clone(), kind);
        self.functions.insert(id, function);
        id
    }

    /// コード範囲付きのシンボルを登録する
    pub fn add_symbol(&mut self, name: &str, range: Range<u64>, kind: SymbolKind) {
        self.symbols.push(StaticSymbol {
            name: name.to_string(),
            address: range.start,
            range: Some(range),
            kind,
        });
    }

    /// サイズ不明のシンボルを登録する
    pub fn add_symbol_at(&mut self, name: &str, address: u64, kind: SymbolKind) {
        self.symbols.push(StaticSymbol {
            name: name.to_string(),
            address,
            range: None,
            kind,
        });
    }

    /// 関数メタデータの取得を失敗させる
    pub fn break_function(&mut self, id: FunctionId) {
        self.broken.insert(id);
    }

    fn symbol_at(&self, addr: u64) -> Option<&StaticSymbol> {
        let sized = self
            .symbols
            .iter()
            .filter(|symbol| symbol.range.as_ref().is_some_and(|range| range.contains(&addr)))
            .min_by_key(|symbol| symbol.range.as_ref().map_or(0, |range| range.end - range.start));

        sized.or_else(|| self.symbols.iter().find(|symbol| symbol.address == addr))
    }
}

impl MetadataProvider for StaticMetadata {
    fn function_at(&self, pc: u64) -> Option<FunctionId> {
        self.functions
            .values()
            .filter(|function| function.contains(pc))
            .min_by_key(|function| function.range.end - function.range.start)
            .map(|function| function.id)
    }

    fn function_metadata(&self, id: FunctionId) -> Result<Option<FunctionMetadata>> {
        if self.broken.contains(&id) {
            return Err(anyhow::anyhow!("Malformed debug information for {}", id));
        }
        Ok(self.functions.get(&id).cloned())
    }

    fn symbol_kind(&self, addr: u64) -> SymbolKind {
        self.symbol_at(addr)
            .map_or(SymbolKind::Unknown, |symbol| symbol.kind)
    }

    fn symbol_name(&self, addr: u64) -> Option<String> {
        self.symbol_at(addr).map(|symbol| symbol.name.clone())
    }

    fn symbol_range(&self, addr: u64) -> Option<Range<u64>> {
        self.symbol_at(addr).and_then(|symbol| symbol.range.clone())
    }

    fn symbol_address(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|symbol| symbol.name == name)
            .map(|symbol| symbol.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_lookup() {
        let mut metadata = StaticMetadata::new();
        let id = metadata.add_function(FunctionMetadata::new("work", 0x1000..0x1100));

        assert_eq!(metadata.function_at(0x1050), Some(id));
        assert_eq!(metadata.function_at(0x1100), None);
        assert_eq!(metadata.symbol_kind(0x1050), SymbolKind::Normal);
        assert_eq!(metadata.symbol_name(0x1000).as_deref(), Some("work"));
        assert!(metadata.function_metadata(id).unwrap().is_some());
    }

    #[test]
    fn test_unknown_address() {
        let metadata = StaticMetadata::new();
        assert_eq!(metadata.symbol_kind(0x4000), SymbolKind::Unknown);
        assert!(metadata.function_metadata(FunctionId(0x4000)).unwrap().is_none());
    }

    #[test]
    fn test_broken_function_errors() {
        let mut metadata = StaticMetadata::new();
        let id = metadata.add_function(FunctionMetadata::new("bad", 0x1000..0x1010));
        metadata.break_function(id);
        assert!(metadata.function_metadata(id).is_err());
    }

    #[test]
    fn test_sizeless_symbol() {
        let mut metadata = StaticMetadata::new();
        metadata.add_symbol_at("swift_task_switch", 0x9000, SymbolKind::Normal);

        assert_eq!(metadata.symbol_address("swift_task_switch"), Some(0x9000));
        assert_eq!(metadata.symbol_name(0x9000).as_deref(), Some("swift_task_switch"));
        assert!(metadata.symbol_range(0x9000).is_none());
    }
}
