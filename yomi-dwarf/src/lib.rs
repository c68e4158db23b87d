//! Yomi デバッグメタデータ
//!
//! このクレートは、リゾルバが消費するデバッグメタデータのモデルと提供インターフェース
//! （[`MetadataProvider`]）を定義します。ELF/DWARFを解析する実装と、
//! テーブル駆動の静的実装があります。

pub mod dwarf_metadata;
pub mod lines;
pub mod loader;
pub mod location;
pub mod metadata;
pub mod patterns;
pub mod provider;
pub mod static_metadata;
pub mod symbols;
pub mod utils;

pub use dwarf_metadata::{DwarfMetadata, DEFAULT_CONTEXT_REGISTER};
pub use lines::LineInfoProvider;
pub use loader::{DwarfLoader, DwarfReader};
pub use location::{DecodedLocation, LocationDecoder};
pub use metadata::{
    FunctionId, FunctionMetadata, LivenessRecord, Scope, ScopeId, SlotId, SlotLocation,
    SourceLocation, StorageKind, SymbolKind, VariableSlot,
};
pub use patterns::SymbolPatterns;
pub use provider::MetadataProvider;
pub use static_metadata::StaticMetadata;
pub use symbols::{Symbol, SymbolResolver};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
