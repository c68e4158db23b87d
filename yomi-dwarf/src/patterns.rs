//! シンボル名パターンによる種別判定

use crate::{Result, SymbolKind};
use regex::Regex;

/// シンボル名のパターン判定器
pub struct SymbolPatterns {
    /// Swiftのasyncファンクレット（マングル名）
    /// 例: $s1a4MainV4mainyyYFZTQ0_
    async_funclet_pattern: Regex,
    /// Swiftのサンク（マングル名）
    /// 例: $s4main1SVAA1PA2aDP3fooyyFTW
    thunk_pattern: Regex,
    /// デマングル後のサンク表記
    thunk_phrases: Vec<&'static str>,
    /// Rustのシム・async状態機械
    rust_thunk_markers: Vec<&'static str>,
    rust_async_markers: Vec<&'static str>,
}

impl SymbolPatterns {
    /// パターン判定器を作成する
    pub fn new() -> Result<Self> {
        let async_funclet_pattern = Regex::new(r"^_?\$s.*T[QY]\d*_$")?;
        let thunk_pattern = Regex::new(r"^_?\$s.*(?:TW|Tj|Tq|TR|Tr)$")?;

        Ok(Self {
            async_funclet_pattern,
            thunk_pattern,
            thunk_phrases: vec![
                "protocol witness for ",
                "dispatch thunk of ",
                "reabstraction thunk",
                "partial apply forwarder",
            ],
            rust_thunk_markers: vec!["{{vtable.shim}}", "{{reify.shim}}"],
            rust_async_markers: vec!["{async_fn_env#", "{async_block_env#"],
        })
    }

    /// シンボル名から種別を判定する
    ///
    /// マングル名とデマングル名の両方を検査し、どれにも当てはまらなければ `Normal` を返します。
    pub fn classify(&self, mangled: &str, demangled: &str) -> SymbolKind {
        if self.thunk_pattern.is_match(mangled)
            || self.thunk_phrases.iter().any(|p| demangled.contains(p))
            || self.rust_thunk_markers.iter().any(|m| demangled.contains(m))
        {
            return SymbolKind::Thunk;
        }

        if self.async_funclet_pattern.is_match(mangled)
            || self.rust_async_markers.iter().any(|m| demangled.contains(m))
        {
            return SymbolKind::AsyncEntry;
        }

        SymbolKind::Normal
    }
}

impl Default for SymbolPatterns {
    fn default() -> Self {
        Self::new().expect("Failed to create SymbolPatterns")
    }
}
