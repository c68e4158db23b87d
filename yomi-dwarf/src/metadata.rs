//! 関数メタデータのデータモデル
//!
//! コンパイラが出力したデバッグ情報を、リゾルバが扱う形に正規化したものです。
//! DWARFバックエンドと静的テーブルの両方がこの型を生成します。

use std::fmt;
use std::ops::Range;

/// 関数ID（ランタイムでのエントリアドレス）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u64);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn@0x{:x}", self.0)
    }
}

/// 変数スロットID（関数内で一意）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

/// スコープID（0 = 関数本体）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

impl ScopeId {
    /// 関数本体のスコープ
    pub const BODY: ScopeId = ScopeId(0);
}

/// 変数の格納方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// レジスタまたはスタック上の値そのもの
    Immediate,
    /// ポインタ経由でのみ到達できる値（address-only / move-only）
    Indirect,
}

/// 変数の格納場所
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLocation {
    /// DWARFレジスタ
    Register(u16),
    /// フレームベースからのオフセット
    FrameOffset(i64),
    /// asyncコンテキストからのオフセット
    ContextOffset(i64),
    /// 静的アドレス
    Address(u64),
    /// 不明
    Unknown,
}

impl fmt::Display for SlotLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotLocation::Register(reg) => write!(f, "reg{}", reg),
            SlotLocation::FrameOffset(offset) => write!(f, "[fb{:+}]", offset),
            SlotLocation::ContextOffset(offset) => write!(f, "[ctx{:+}]", offset),
            SlotLocation::Address(addr) => write!(f, "[0x{:x}]", addr),
            SlotLocation::Unknown => write!(f, "<unknown>"),
        }
    }
}

/// ソースレベルの変数1個
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSlot {
    pub id: SlotId,
    pub name: String,
    pub kind: StorageKind,
    pub type_name: Option<String>,
    pub byte_size: Option<u64>,
    /// 宣言されたスコープ
    pub scope: ScopeId,
    pub is_argument: bool,
    /// 生存区間レコードがないときに使う宣言上の格納場所
    pub declared_location: Option<SlotLocation>,
}

impl VariableSlot {
    /// 即値スロットを作成する
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id: SlotId(id),
            name: name.into(),
            kind: StorageKind::Immediate,
            type_name: None,
            byte_size: None,
            scope: ScopeId::BODY,
            is_argument: false,
            declared_location: None,
        }
    }

    /// 格納方式を設定する
    pub fn with_kind(mut self, kind: StorageKind) -> Self {
        self.kind = kind;
        self
    }

    /// 型を設定する
    pub fn with_type(mut self, type_name: impl Into<String>, byte_size: u64) -> Self {
        self.type_name = Some(type_name.into());
        self.byte_size = Some(byte_size);
        self
    }

    /// スコープを設定する
    pub fn in_scope(mut self, scope: ScopeId) -> Self {
        self.scope = scope;
        self
    }

    /// 引数としてマークする
    pub fn argument(mut self) -> Self {
        self.is_argument = true;
        self
    }

    /// 宣言上の格納場所を設定する
    pub fn declared_at(mut self, location: SlotLocation) -> Self {
        self.declared_location = Some(location);
        self
    }
}

/// レキシカルスコープ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub ranges: Vec<Range<u64>>,
}

impl Scope {
    /// PCがスコープ内かどうか
    pub fn contains(&self, pc: u64) -> bool {
        self.ranges.iter().any(|range| range.contains(&pc))
    }
}

/// コンパイラが出力した生存区間レコード
///
/// `location` が `None` のレコードは「この区間では利用不可」を表します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessRecord {
    pub range: Range<u64>,
    pub slot: SlotId,
    pub location: Option<SlotLocation>,
}

impl LivenessRecord {
    /// 利用可能レコードを作成する
    pub fn available(range: Range<u64>, slot: SlotId, location: SlotLocation) -> Self {
        Self {
            range,
            slot,
            location: Some(location),
        }
    }

    /// 利用不可レコードを作成する
    pub fn unavailable(range: Range<u64>, slot: SlotId) -> Self {
        Self {
            range,
            slot,
            location: None,
        }
    }
}

/// 関数1個分のメタデータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionMetadata {
    pub id: FunctionId,
    pub name: String,
    /// 関数本体のアドレス範囲
    pub range: Range<u64>,
    pub slots: Vec<VariableSlot>,
    /// スコープ木（`scopes[0]` が関数本体）
    pub scopes: Vec<Scope>,
    /// 出力順の生存区間レコード
    pub records: Vec<LivenessRecord>,
}

impl FunctionMetadata {
    /// 変数もレコードも持たない関数を作成する
    pub fn new(name: impl Into<String>, range: Range<u64>) -> Self {
        Self {
            id: FunctionId(range.start),
            name: name.into(),
            scopes: vec![Scope {
                id: ScopeId::BODY,
                parent: None,
                ranges: vec![range.clone()],
            }],
            range,
            slots: Vec::new(),
            records: Vec::new(),
        }
    }

    /// スロットを追加する
    pub fn with_slot(mut self, slot: VariableSlot) -> Self {
        self.slots.push(slot);
        self
    }

    /// 入れ子スコープを追加する
    pub fn with_scope(mut self, id: u32, parent: ScopeId, ranges: Vec<Range<u64>>) -> Self {
        self.scopes.push(Scope {
            id: ScopeId(id),
            parent: Some(parent),
            ranges,
        });
        self
    }

    /// 生存区間レコードを追加する
    pub fn with_record(mut self, record: LivenessRecord) -> Self {
        self.records.push(record);
        self
    }

    /// PCが関数本体に含まれるかどうか
    pub fn contains(&self, pc: u64) -> bool {
        self.range.contains(&pc)
    }

    /// IDからスロットを取得する
    pub fn slot(&self, id: SlotId) -> Option<&VariableSlot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    /// IDからスコープを取得する
    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.iter().find(|scope| scope.id == id)
    }

    /// スコープの入れ子の深さ（関数本体 = 0）
    fn scope_depth(&self, id: ScopeId) -> usize {
        let mut depth = 0;
        let mut current = self.scope(id).and_then(|scope| scope.parent);
        while let Some(parent) = current {
            depth += 1;
            // 壊れた親リンクでの無限ループを防ぐ
            if depth > self.scopes.len() {
                break;
            }
            current = self.scope(parent).and_then(|scope| scope.parent);
        }
        depth
    }

    /// スコープとその祖先すべてがPCを含むかどうか
    fn scope_encloses(&self, id: ScopeId, pc: u64) -> bool {
        let mut current = Some(id);
        let mut steps = 0;
        while let Some(id) = current {
            if id == ScopeId::BODY {
                return self.contains(pc);
            }
            let Some(scope) = self.scope(id) else {
                return false;
            };
            steps += 1;
            if !scope.contains(pc) || steps > self.scopes.len() {
                return false;
            }
            current = scope.parent;
        }
        true
    }

    /// 名前とPCから変数スロットを探す
    ///
    /// PCを含むスコープで宣言された同名スロットのうち、最も内側のものを返します。
    /// 同じ深さなら宣言順で先のものを優先します。
    pub fn find_slot(&self, name: &str, pc: u64) -> Option<&VariableSlot> {
        let mut best: Option<(&VariableSlot, usize)> = None;

        for slot in self.slots.iter().filter(|slot| slot.name == name) {
            if !self.scope_encloses(slot.scope, pc) {
                continue;
            }
            let depth = self.scope_depth(slot.scope);
            if best.map_or(true, |(_, best_depth)| depth > best_depth) {
                best = Some((slot, depth));
            }
        }

        best.map(|(slot, _)| slot)
    }
}

/// シンボルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// 通常の関数
    Normal,
    /// プロトコル/ジェネリックの転送シム
    Thunk,
    /// asyncファンクレットのエントリ
    AsyncEntry,
    /// メタデータからは判断できない
    Unknown,
}

/// ソース上の位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(column) => write!(f, "{}:{}:{}", self.file, self.line, column),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shadowing_function() -> FunctionMetadata {
        FunctionMetadata::new("shadow", 0x1000..0x1100)
            .with_scope(1, ScopeId::BODY, vec![0x1020..0x1080])
            .with_scope(2, ScopeId(1), vec![0x1040..0x1060])
            .with_slot(VariableSlot::new(0, "x"))
            .with_slot(VariableSlot::new(1, "x").in_scope(ScopeId(1)))
            .with_slot(VariableSlot::new(2, "x").in_scope(ScopeId(2)))
            .with_slot(VariableSlot::new(3, "y"))
            .with_slot(VariableSlot::new(4, "y"))
    }

    #[test]
    fn test_find_slot_innermost_scope() {
        let function = shadowing_function();

        assert_eq!(function.find_slot("x", 0x1010).unwrap().id, SlotId(0));
        assert_eq!(function.find_slot("x", 0x1030).unwrap().id, SlotId(1));
        assert_eq!(function.find_slot("x", 0x1050).unwrap().id, SlotId(2));
        assert_eq!(function.find_slot("x", 0x1070).unwrap().id, SlotId(1));
    }

    #[test]
    fn test_find_slot_first_declaration_wins() {
        let function = shadowing_function();
        assert_eq!(function.find_slot("y", 0x1050).unwrap().id, SlotId(3));
    }

    #[test]
    fn test_find_slot_outside_function() {
        let function = shadowing_function();
        assert!(function.find_slot("x", 0x2000).is_none());
        assert!(function.find_slot("z", 0x1010).is_none());
    }

    #[test]
    fn test_find_slot_requires_enclosing_parents() {
        // 親スコープの外にはみ出した子スコープの範囲
        let function = shadowing_function()
            .with_scope(3, ScopeId(1), vec![0x1070..0x10a0])
            .with_slot(VariableSlot::new(5, "z").in_scope(ScopeId(3)));

        assert_eq!(function.find_slot("z", 0x1075).unwrap().id, SlotId(5));
        assert!(function.find_slot("z", 0x1090).is_none());
    }

    #[test]
    fn test_location_display() {
        assert_eq!(SlotLocation::FrameOffset(-24).to_string(), "[fb-24]");
        assert_eq!(SlotLocation::ContextOffset(16).to_string(), "[ctx+16]");
        assert_eq!(SlotLocation::Register(14).to_string(), "reg14");
    }
}
