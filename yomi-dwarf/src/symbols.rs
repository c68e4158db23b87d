//! シンボル解決機能

use crate::{DwarfLoader, Result};
use object::{Object, ObjectSymbol, SymbolKind as ObjectSymbolKind};
use std::collections::HashMap;
use std::ops::Range;

/// シンボル情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: impl Into<String>, address: u64, size: u64) -> Self {
        let name = name.into();
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    /// 表示用の名前を取得（デマングルできなければマングル名）
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }

    /// シンボルのコード範囲（サイズ不明ならNone）
    pub fn range(&self) -> Option<Range<u64>> {
        (self.size > 0).then(|| self.address..self.address + self.size)
    }
}

/// シンボル名をデマングルする
///
/// Rustのシンボルのみ対応し、それ以外（Swiftなど）はそのまま返します。
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    name.to_string()
}

/// シンボル解決
pub struct SymbolResolver {
    /// シンボル名 -> シンボル情報のマップ
    symbols_by_name: HashMap<String, Symbol>,
    /// アドレス順のシンボル
    symbols_by_address: Vec<Symbol>,
}

impl SymbolResolver {
    /// DWARFローダーからシンボル解決を作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let symbols = loader
            .object_file()
            .symbols()
            .filter(|symbol| symbol.kind() == ObjectSymbolKind::Text)
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                (!name.is_empty()).then(|| Symbol::new(name, symbol.address(), symbol.size()))
            })
            .collect();

        Ok(Self::from_symbols(symbols))
    }

    /// シンボル一覧から作成する
    pub fn from_symbols(symbols: Vec<Symbol>) -> Self {
        let mut symbols_by_address = symbols;
        symbols_by_address.sort_by_key(|s| s.address);

        let symbols_by_name = symbols_by_address
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();

        Self {
            symbols_by_name,
            symbols_by_address,
        }
    }

    /// シンボル名からアドレスを解決する
    ///
    /// マングル名で見つからなければデマングル名で探します。
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.symbols_by_name
            .get(symbol)
            .or_else(|| {
                self.symbols_by_address
                    .iter()
                    .find(|s| s.demangled_name == symbol)
            })
            .map(|s| s.address)
    }

    /// アドレスを含むシンボルを探す
    ///
    /// サイズ情報がないシンボルは、次のシンボルの手前までを範囲とみなします。
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let idx = self
            .symbols_by_address
            .partition_point(|s| s.address <= addr)
            .checked_sub(1)?;
        let sym = &self.symbols_by_address[idx];

        if sym.size > 0 {
            return (addr < sym.address + sym.size).then_some(sym);
        }
        Some(sym)
    }

    /// アドレスを含むシンボルの範囲を取得する
    pub fn symbol_range(&self, addr: u64) -> Option<Range<u64>> {
        self.reverse_resolve(addr).and_then(Symbol::range)
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols_by_address.iter()
    }

    /// パターンにマッチするシンボルを検索する
    /// マングル名とデマングル名の両方で検索する
    pub fn find_symbols(&self, pattern: &str) -> Vec<&Symbol> {
        self.symbols_by_address
            .iter()
            .filter(|s| s.name.contains(pattern) || s.demangled_name.contains(pattern))
            .collect()
    }
}
