//! DWARF/ELFを元にしたメタデータ提供

use crate::location::LocationDecoder;
use crate::utils::DieReader;
use crate::{
    DwarfLoader, DwarfReader, FunctionId, FunctionMetadata, LineInfoProvider, LivenessRecord,
    MetadataProvider, Result, Scope, ScopeId, SlotId, SourceLocation, StorageKind, SymbolKind,
    SymbolPatterns, SymbolResolver, VariableSlot,
};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, warn};

/// asyncコンテキストを受け取る既定のレジスタ（x86-64のr14）
pub const DEFAULT_CONTEXT_REGISTER: u16 = 14;

/// LLVMのswifttailcc呼び出し規約（DW_CC_LLVM_SwiftTail）
const DW_CC_LLVM_SWIFT_TAIL: u8 = 0xcf;

/// 索引に載せる関数DIE
struct FunctionEntry {
    /// ファイル上のアドレス範囲
    ranges: Vec<Range<u64>>,
    unit: gimli::DebugInfoOffset,
    die: gimli::UnitOffset,
    name: String,
    swift_tail: bool,
}

impl FunctionEntry {
    fn low_pc(&self) -> u64 {
        self.ranges.first().map_or(0, |range| range.start)
    }

    fn high_pc(&self) -> u64 {
        self.ranges.iter().map(|range| range.end).max().unwrap_or(0)
    }

    fn contains(&self, addr: u64) -> bool {
        self.ranges.iter().any(|range| range.contains(&addr))
    }
}

/// DWARFメタデータ
pub struct DwarfMetadata {
    loader: DwarfLoader,
    symbols: SymbolResolver,
    lines: Option<LineInfoProvider>,
    patterns: SymbolPatterns,
    functions: Vec<FunctionEntry>,
    /// ファイル上のアドレスに加算するロードバイアス
    load_bias: u64,
    context_register: u16,
}

impl DwarfMetadata {
    /// ELFファイルを読み込んで関数索引を作る
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let loader = DwarfLoader::load(path)?;
        if !loader.has_debug_info() {
            warn!(
                "{:?} has no debug information; variables will be reported as unavailable",
                loader.path()
            );
        }
        let symbols = SymbolResolver::new(&loader)?;
        let lines = match LineInfoProvider::new(&loader) {
            Ok(lines) => Some(lines),
            Err(e) => {
                warn!("Line information unavailable: {}", e);
                None
            }
        };
        let functions = Self::index_functions(loader.dwarf())?;
        debug!(functions = functions.len(), "indexed DWARF subprograms");

        Ok(Self {
            loader,
            symbols,
            lines,
            patterns: SymbolPatterns::new()?,
            functions,
            load_bias: 0,
            context_register: DEFAULT_CONTEXT_REGISTER,
        })
    }

    /// ロードバイアスを設定する（PIEの場合のみ意味を持つ）
    pub fn set_load_bias(&mut self, bias: u64) {
        self.load_bias = if self.loader.is_pie() { bias } else { 0 };
    }

    /// ロードバイアスを取得する
    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    /// PIEかどうか
    pub fn is_pie(&self) -> bool {
        self.loader.is_pie()
    }

    /// asyncコンテキストレジスタを設定する
    pub fn set_context_register(&mut self, register: u16) {
        self.context_register = register;
    }

    /// シンボル解決への参照を取得する
    pub fn symbols(&self) -> &SymbolResolver {
        &self.symbols
    }

    fn to_file(&self, addr: u64) -> Option<u64> {
        addr.checked_sub(self.load_bias)
    }

    fn to_runtime(&self, range: Range<u64>) -> Range<u64> {
        range.start + self.load_bias..range.end + self.load_bias
    }

    /// すべてのコンパイルユニットから関数DIEを集める
    fn index_functions(dwarf: &gimli::Dwarf<DwarfReader>) -> Result<Vec<FunctionEntry>> {
        let mut functions = Vec::new();
        let mut units = dwarf.units();

        while let Some(header) = units.next()? {
            let Some(unit_offset) = header.offset().as_debug_info_offset() else {
                continue;
            };
            let unit = dwarf.unit(header)?;
            let mut entries = unit.entries();

            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() != gimli::DW_TAG_subprogram {
                    continue;
                }
                let ranges = DieReader::ranges(dwarf, &unit, entry)?;
                if ranges.is_empty() {
                    continue;
                }
                let name = DieReader::linkage_or_name(dwarf, &unit, entry)?
                    .unwrap_or_else(|| "<unknown>".to_string());
                let swift_tail =
                    DieReader::calling_convention(entry)? == Some(DW_CC_LLVM_SWIFT_TAIL);

                functions.push(FunctionEntry {
                    ranges,
                    unit: unit_offset,
                    die: entry.offset(),
                    name,
                    swift_tail,
                });
            }
        }

        functions.sort_by_key(FunctionEntry::low_pc);
        Ok(functions)
    }

    /// ファイル上のアドレスを含む関数DIEを探す
    ///
    /// 入れ子の範囲があれば最も狭いものを返します。
    fn entry_at(&self, file_addr: u64) -> Option<&FunctionEntry> {
        self.functions
            .iter()
            .filter(|function| function.contains(file_addr))
            .min_by_key(|function| function.high_pc() - function.low_pc())
    }

    /// 関数DIEからメタデータを構築する
    fn build_metadata(&self, function: &FunctionEntry) -> Result<FunctionMetadata> {
        let dwarf = self.loader.dwarf();
        let header = dwarf.debug_info.header_from_offset(function.unit)?;
        let unit = dwarf.unit(header)?;

        let mut decoder = LocationDecoder::new(unit.encoding(), self.context_register);
        let mut tree = unit.entries_tree(Some(function.die))?;
        let root = tree.root()?;

        if let Some(gimli::AttributeValue::Exprloc(expr)) =
            root.entry().attr_value(gimli::DW_AT_frame_base)?
        {
            decoder = decoder.with_frame_base_bias(decoder.frame_base_bias_of(expr)?);
        }

        let mut metadata = FunctionMetadata::new(
            function.name.clone(),
            self.to_runtime(function.low_pc()..function.high_pc()),
        );
        metadata.scopes[0].ranges = function
            .ranges
            .iter()
            .map(|range| self.to_runtime(range.clone()))
            .collect();

        let mut builder = MetadataBuilder {
            dwarf,
            unit: &unit,
            decoder,
            load_bias: self.load_bias,
            metadata,
        };
        builder.collect(root, ScopeId::BODY)?;

        debug!(
            function = %builder.metadata.name,
            slots = builder.metadata.slots.len(),
            records = builder.metadata.records.len(),
            "built function metadata from DWARF"
        );
        Ok(builder.metadata)
    }
}

/// 関数DIEの子を走査してメタデータを組み立てる
struct MetadataBuilder<'a> {
    dwarf: &'a gimli::Dwarf<DwarfReader>,
    unit: &'a gimli::Unit<DwarfReader>,
    decoder: LocationDecoder,
    load_bias: u64,
    metadata: FunctionMetadata,
}

impl MetadataBuilder<'_> {
    fn collect(
        &mut self,
        node: gimli::EntriesTreeNode<DwarfReader>,
        scope: ScopeId,
    ) -> Result<()> {
        let mut children = node.children();

        while let Some(child) = children.next()? {
            let entry = child.entry();
            match entry.tag() {
                gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
                    self.add_variable(entry, scope)?;
                }
                gimli::DW_TAG_lexical_block => {
                    let ranges = DieReader::ranges(self.dwarf, self.unit, entry)?
                        .into_iter()
                        .map(|r| r.start + self.load_bias..r.end + self.load_bias)
                        .collect();
                    let id = ScopeId(self.metadata.scopes.len() as u32);
                    self.metadata.scopes.push(Scope {
                        id,
                        parent: Some(scope),
                        ranges,
                    });
                    self.collect(child, id)?;
                }
                // インライン展開された関数の変数は呼び出し元の変数ではない
                _ => {}
            }
        }

        Ok(())
    }

    fn add_variable(
        &mut self,
        entry: &gimli::DebuggingInformationEntry<DwarfReader>,
        scope: ScopeId,
    ) -> Result<()> {
        let Some(name) = DieReader::string_attr(self.dwarf, self.unit, entry, gimli::DW_AT_name)?
        else {
            return Ok(());
        };

        let id = SlotId(self.metadata.slots.len() as u32);
        let (type_name, byte_size) = DieReader::type_of(self.dwarf, self.unit, entry)?;
        let mut slot = VariableSlot::new(id.0, name).in_scope(scope);
        slot.type_name = type_name;
        slot.byte_size = byte_size;
        slot.is_argument = entry.tag() == gimli::DW_TAG_formal_parameter;

        match entry.attr_value(gimli::DW_AT_location)? {
            Some(gimli::AttributeValue::Exprloc(expr)) => {
                if let Some(decoded) = self.decoder.decode(expr)? {
                    slot.kind = decoded.kind;
                    slot.declared_location = Some(decoded.location);
                }
            }
            Some(value) => {
                let Some(mut locations) = self.dwarf.attr_locations(self.unit, value)? else {
                    warn!(variable = %slot.name, "Unsupported DW_AT_location form");
                    self.metadata.slots.push(slot);
                    return Ok(());
                };

                let mut kind = None;
                while let Some(location) = locations.next()? {
                    let range = location.range.begin + self.load_bias
                        ..location.range.end + self.load_bias;
                    let record = match self.decoder.decode(location.data)? {
                        Some(decoded) => {
                            kind.get_or_insert(decoded.kind);
                            LivenessRecord::available(range, id, decoded.location)
                        }
                        None => LivenessRecord::unavailable(range, id),
                    };
                    self.metadata.records.push(record);
                }
                slot.kind = kind.unwrap_or(StorageKind::Immediate);
            }
            None => {}
        }

        self.metadata.slots.push(slot);
        Ok(())
    }
}

impl MetadataProvider for DwarfMetadata {
    fn function_at(&self, pc: u64) -> Option<FunctionId> {
        let entry = self.entry_at(self.to_file(pc)?)?;
        Some(FunctionId(entry.low_pc() + self.load_bias))
    }

    fn function_metadata(&self, id: FunctionId) -> Result<Option<FunctionMetadata>> {
        let Some(file_addr) = self.to_file(id.0) else {
            return Ok(None);
        };
        let Some(function) = self
            .functions
            .iter()
            .find(|function| function.low_pc() == file_addr)
        else {
            return Ok(None);
        };

        self.build_metadata(function).map(Some)
    }

    fn symbol_kind(&self, addr: u64) -> SymbolKind {
        let Some(file_addr) = self.to_file(addr) else {
            return SymbolKind::Unknown;
        };
        let Some(symbol) = self.symbols.reverse_resolve(file_addr) else {
            return SymbolKind::Unknown;
        };

        match self.patterns.classify(&symbol.name, &symbol.demangled_name) {
            // 名前は普通でも呼び出し規約がasync用なら判断を保留する
            SymbolKind::Normal
                if self
                    .entry_at(file_addr)
                    .is_some_and(|function| function.swift_tail) =>
            {
                SymbolKind::Unknown
            }
            kind => kind,
        }
    }

    fn symbol_name(&self, addr: u64) -> Option<String> {
        let file_addr = self.to_file(addr)?;
        self.symbols
            .reverse_resolve(file_addr)
            .map(|symbol| symbol.display_name().to_string())
            .or_else(|| self.entry_at(file_addr).map(|function| function.name.clone()))
    }

    fn symbol_range(&self, addr: u64) -> Option<Range<u64>> {
        let file_addr = self.to_file(addr)?;
        self.symbols
            .symbol_range(file_addr)
            .map(|range| self.to_runtime(range))
    }

    fn symbol_address(&self, name: &str) -> Option<u64> {
        self.symbols.resolve(name).map(|addr| addr + self.load_bias)
    }

    fn source_location(&self, addr: u64) -> Option<SourceLocation> {
        let lines = self.lines.as_ref()?;
        match lines.lookup(self.to_file(addr)?) {
            Ok(location) => location,
            Err(e) => {
                debug!("{}", e);
                None
            }
        }
    }
}
