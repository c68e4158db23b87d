//! 変数の生存区間表
//!
//! 関数ごとに、コンパイラが出力した生存区間レコードを「重ならない区間の列」に
//! 変換し、各区間で利用可能な変数スロットの集合を持たせます。
//! 表は最初の問い合わせで構築し、[`LivenessCache`] に保持します。

use crate::stats::Statistics;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use yomi_dwarf::{
    FunctionId, FunctionMetadata, LivenessRecord, MetadataProvider, SlotId, SlotLocation,
    VariableSlot,
};

/// ある地点での変数の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// 値が有効で、この場所にある
    Available(SlotLocation),
    /// ムーブ済み・未初期化・破棄済み
    Unavailable,
}

impl Liveness {
    pub fn is_available(&self) -> bool {
        matches!(self, Liveness::Available(_))
    }
}

/// 利用可能なスロットの集合（格納場所付き）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessSet {
    live: BTreeMap<SlotId, SlotLocation>,
}

impl LivenessSet {
    /// スロットの状態を取得する
    pub fn get(&self, slot: SlotId) -> Liveness {
        self.live
            .get(&slot)
            .map_or(Liveness::Unavailable, |location| Liveness::Available(*location))
    }

    /// スロットが利用可能かどうか
    pub fn contains(&self, slot: SlotId) -> bool {
        self.live.contains_key(&slot)
    }

    /// 利用可能なスロットを列挙する
    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.live.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn insert(&mut self, slot: SlotId, location: SlotLocation) {
        self.live.insert(slot, location);
    }
}

/// アドレス区間とその区間での利用可能集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramPoint {
    pub range: Range<u64>,
    pub live: LivenessSet,
}

/// 関数1個分の生存区間表
#[derive(Debug, Clone)]
pub struct FunctionFacts {
    id: FunctionId,
    range: Range<u64>,
    /// アドレス順で重ならず、関数本体を隙間なく覆う
    points: Vec<ProgramPoint>,
    /// 構築元のメタデータ（メタデータがなければNone）
    metadata: Option<FunctionMetadata>,
}

impl FunctionFacts {
    /// メタデータから生存区間表を構築する
    ///
    /// 不正なレコード（空・逆転した範囲、本体外の範囲、未知のスロット）は捨てます。
    /// 有効なレコードを1件も持たないスロットは、本体全体で宣言上の場所に
    /// 利用可能とみなします。
    pub fn compile(function: FunctionMetadata) -> Self {
        let body = function.range.clone();
        if body.start >= body.end {
            warn!(function = %function.name, "Function has an empty body range; liveness is permissive");
            return Self {
                id: function.id,
                range: body,
                points: Vec::new(),
                metadata: Some(function),
            };
        }

        let records = usable_records(&function);
        let tracked: BTreeSet<SlotId> = records.iter().map(|record| record.slot).collect();

        let mut boundaries: BTreeSet<u64> = BTreeSet::from([body.start, body.end]);
        for record in &records {
            boundaries.insert(record.range.start);
            boundaries.insert(record.range.end);
        }
        let boundaries: Vec<u64> = boundaries.into_iter().collect();

        let mut points: Vec<ProgramPoint> = Vec::new();
        for window in boundaries.windows(2) {
            let (start, end) = (window[0], window[1]);
            let mut live = LivenessSet::default();

            for slot in &function.slots {
                if !tracked.contains(&slot.id) {
                    live.insert(slot.id, declared_location(slot));
                } else if let Some(location) = decide(&records, slot.id, start) {
                    live.insert(slot.id, location);
                }
            }

            match points.last_mut() {
                Some(last) if last.live == live => last.range.end = end,
                _ => points.push(ProgramPoint {
                    range: start..end,
                    live,
                }),
            }
        }

        debug!(
            function = %function.name,
            records = records.len(),
            points = points.len(),
            "compiled liveness facts"
        );

        Self {
            id: function.id,
            range: body,
            points,
            metadata: Some(function),
        }
    }

    /// メタデータがない関数の表（常に利用可能）
    pub fn permissive(id: FunctionId) -> Self {
        Self {
            id,
            range: id.0..id.0,
            points: Vec::new(),
            metadata: None,
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    /// 関数本体の範囲
    pub fn range(&self) -> &Range<u64> {
        &self.range
    }

    /// 構築済みの区間列
    pub fn points(&self) -> &[ProgramPoint] {
        &self.points
    }

    /// 構築元のメタデータ
    pub fn metadata(&self) -> Option<&FunctionMetadata> {
        self.metadata.as_ref()
    }

    /// 区間表を持たず、すべてを利用可能として扱うかどうか
    pub fn is_permissive(&self) -> bool {
        self.points.is_empty()
    }

    /// PCを含む区間を探す
    pub fn point_at(&self, pc: u64) -> Option<&ProgramPoint> {
        let idx = self.points.partition_point(|point| point.range.end <= pc);
        self.points
            .get(idx)
            .filter(|point| point.range.contains(&pc))
    }

    /// スロットの状態を引く
    ///
    /// 区間表を持たない関数では、宣言上の場所（なければ `Unknown`）で常に利用可能です。
    /// 関数本体の外のPCでは利用不可です。
    pub fn lookup(&self, pc: u64, slot: SlotId) -> Liveness {
        if self.is_permissive() {
            let location = self
                .metadata
                .as_ref()
                .and_then(|function| function.slot(slot))
                .map_or(SlotLocation::Unknown, declared_location);
            return Liveness::Available(location);
        }

        self.point_at(pc)
            .map_or(Liveness::Unavailable, |point| point.live.get(slot))
    }
}

fn declared_location(slot: &VariableSlot) -> SlotLocation {
    slot.declared_location.unwrap_or(SlotLocation::Unknown)
}

/// 有効なレコードだけを本体範囲に切り詰めて返す（出力順は保つ）
fn usable_records(function: &FunctionMetadata) -> Vec<LivenessRecord> {
    let body = &function.range;
    let mut usable = Vec::with_capacity(function.records.len());

    for record in &function.records {
        if record.range.start >= record.range.end {
            warn!(
                function = %function.name,
                "Dropping liveness record with empty range 0x{:x}..0x{:x}",
                record.range.start,
                record.range.end
            );
            continue;
        }
        if function.slot(record.slot).is_none() {
            warn!(function = %function.name, slot = record.slot.0, "Dropping liveness record for unknown slot");
            continue;
        }

        let start = record.range.start.max(body.start);
        let end = record.range.end.min(body.end);
        if start >= end {
            warn!(
                function = %function.name,
                "Dropping liveness record outside the function body: 0x{:x}..0x{:x}",
                record.range.start,
                record.range.end
            );
            continue;
        }

        usable.push(LivenessRecord {
            range: start..end,
            ..record.clone()
        });
    }

    usable
}

/// 区間の先頭アドレスでのスロットの状態を決める
///
/// 複数のレコードが重なる場合は最も狭い範囲のものを採用し、
/// 同じ幅なら先に出力されたものを優先します。
fn decide(records: &[LivenessRecord], slot: SlotId, addr: u64) -> Option<SlotLocation> {
    let mut chosen: Option<&LivenessRecord> = None;

    for record in records
        .iter()
        .filter(|record| record.slot == slot && record.range.contains(&addr))
    {
        let width = record.range.end - record.range.start;
        if chosen.map_or(true, |best| width < best.range.end - best.range.start) {
            chosen = Some(record);
        }
    }

    chosen.and_then(|record| record.location)
}

/// 生存区間表のキャッシュ
///
/// デバッグ対象プロセスのセッションと同じ寿命を持ち、参照で共有します。
/// 構築はロックの外で行い、同じ関数を同時に構築した場合は先に挿入した方を採用します。
pub struct LivenessCache {
    entries: RwLock<HashMap<FunctionId, Arc<FunctionFacts>>>,
    /// 無効化のたびに進む世代
    generation: AtomicU64,
    stats: Arc<Statistics>,
}

impl LivenessCache {
    /// 空のキャッシュを作成する
    pub fn new(stats: Arc<Statistics>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            stats,
        }
    }

    /// 関数の生存区間表を取得する（未構築なら構築する）
    pub fn facts<M>(&self, metadata: &M, id: FunctionId) -> Arc<FunctionFacts>
    where
        M: MetadataProvider + ?Sized,
    {
        if let Some(facts) = self.entries.read().get(&id) {
            self.stats.record_cache_hit();
            return Arc::clone(facts);
        }
        self.stats.record_cache_miss();

        let generation = self.generation.load(Ordering::Acquire);
        let started = Instant::now();
        let facts = Arc::new(match metadata.function_metadata(id) {
            Ok(Some(function)) => FunctionFacts::compile(function),
            Ok(None) => {
                debug!(%id, "No debug metadata; treating variables as available");
                self.stats.record_metadata_missing();
                FunctionFacts::permissive(id)
            }
            Err(e) => {
                warn!(%id, "Failed to read debug metadata, treating variables as available: {}", e);
                self.stats.record_metadata_missing();
                FunctionFacts::permissive(id)
            }
        });
        self.stats.record_compilation(started.elapsed());

        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) != generation {
            // 構築中に無効化された。結果は呼び出し元だけが使う
            self.stats.record_discarded_compilation();
            return facts;
        }
        match entries.entry(id) {
            Entry::Occupied(existing) => {
                self.stats.record_discarded_compilation();
                Arc::clone(existing.get())
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&facts));
                facts
            }
        }
    }

    /// スロットの状態を引く
    pub fn lookup<M>(&self, metadata: &M, id: FunctionId, pc: u64, slot: SlotId) -> Liveness
    where
        M: MetadataProvider + ?Sized,
    {
        self.facts(metadata, id).lookup(pc, slot)
    }

    /// すべて無効化する（再起動時）
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
        self.stats.record_invalidation();
    }

    /// アドレス範囲に重なる関数を無効化する（モジュールのアンロード時）
    ///
    /// 無効化した関数の数を返します。
    pub fn invalidate_range(&self, range: Range<u64>) -> usize {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);

        let before = entries.len();
        entries.retain(|id, facts| {
            let body = facts.range();
            let overlaps = if body.start < body.end {
                body.start < range.end && range.start < body.end
            } else {
                range.contains(&id.0)
            };
            !overlaps
        });
        self.stats.record_invalidation();
        before - entries.len()
    }

    /// キャッシュ済みかどうか
    pub fn contains(&self, id: FunctionId) -> bool {
        self.entries.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yomi_dwarf::{ScopeId, StaticMetadata};

    const K: SlotId = SlotId(0);

    fn location() -> SlotLocation {
        SlotLocation::FrameOffset(-8)
    }

    /// `k` をムーブして再初期化する関数
    fn move_and_reinit() -> FunctionMetadata {
        FunctionMetadata::new("copyable_var_test", 0x1000..0x1100)
            .with_slot(VariableSlot::new(0, "k").with_type("Klass", 8))
            .with_record(LivenessRecord::available(0x1010..0x1040, K, location()))
            .with_record(LivenessRecord::unavailable(0x1040..0x1060, K))
            .with_record(LivenessRecord::available(0x1060..0x10f0, K, location()))
    }

    #[test]
    fn test_compile_state_machine() {
        let facts = FunctionFacts::compile(move_and_reinit());

        assert_eq!(facts.lookup(0x1000, K), Liveness::Unavailable);
        assert_eq!(facts.lookup(0x1020, K), Liveness::Available(location()));
        assert_eq!(facts.lookup(0x1050, K), Liveness::Unavailable);
        assert_eq!(facts.lookup(0x1070, K), Liveness::Available(location()));
        assert_eq!(facts.lookup(0x10f8, K), Liveness::Unavailable);
        assert_eq!(facts.lookup(0x2000, K), Liveness::Unavailable);
    }

    #[test]
    fn test_points_cover_body_without_overlap() {
        let facts = FunctionFacts::compile(move_and_reinit());
        let points = facts.points();

        assert_eq!(points.first().unwrap().range.start, 0x1000);
        assert_eq!(points.last().unwrap().range.end, 0x1100);
        for pair in points.windows(2) {
            assert_eq!(pair[0].range.end, pair[1].range.start);
            assert_ne!(pair[0].live, pair[1].live);
        }
    }

    #[test]
    fn test_narrowest_record_wins() {
        let function = FunctionMetadata::new("overlap", 0x1000..0x1100)
            .with_slot(VariableSlot::new(0, "k"))
            .with_record(LivenessRecord::available(0x1000..0x1100, K, location()))
            .with_record(LivenessRecord::unavailable(0x1040..0x1050, K));
        let facts = FunctionFacts::compile(function);

        assert!(facts.lookup(0x1030, K).is_available());
        assert_eq!(facts.lookup(0x1048, K), Liveness::Unavailable);
        assert!(facts.lookup(0x1050, K).is_available());
    }

    #[test]
    fn test_equal_width_keeps_first_record() {
        let function = FunctionMetadata::new("dup", 0x1000..0x1100)
            .with_slot(VariableSlot::new(0, "k"))
            .with_record(LivenessRecord::available(0x1000..0x1080, K, SlotLocation::Register(3)))
            .with_record(LivenessRecord::available(0x1000..0x1080, K, SlotLocation::Register(12)));
        let facts = FunctionFacts::compile(function);

        assert_eq!(
            facts.lookup(0x1010, K),
            Liveness::Available(SlotLocation::Register(3))
        );
    }

    #[test]
    fn test_malformed_records_are_dropped() {
        let function = FunctionMetadata::new("broken", 0x1000..0x1100)
            .with_slot(VariableSlot::new(0, "k").declared_at(location()))
            .with_record(LivenessRecord::unavailable(0x1050..0x1040, K))
            .with_record(LivenessRecord::unavailable(0x3000..0x3010, K))
            .with_record(LivenessRecord::unavailable(0x1000..0x1100, SlotId(9)));
        let facts = FunctionFacts::compile(function);

        // 有効なレコードが残らないので宣言上の場所で常に利用可能
        assert_eq!(facts.lookup(0x1045, K), Liveness::Available(location()));
        assert_eq!(facts.points().len(), 1);
    }

    #[test]
    fn test_record_clamped_to_body() {
        let function = FunctionMetadata::new("clamp", 0x1000..0x1100)
            .with_slot(VariableSlot::new(0, "k"))
            .with_record(LivenessRecord::available(0x0f00..0x1020, K, location()));
        let facts = FunctionFacts::compile(function);

        assert!(facts.lookup(0x1000, K).is_available());
        assert_eq!(facts.lookup(0x1020, K), Liveness::Unavailable);
        assert_eq!(facts.points()[0].range.start, 0x1000);
    }

    #[test]
    fn test_untracked_slot_always_available() {
        let function = move_and_reinit()
            .with_slot(VariableSlot::new(1, "n").declared_at(SlotLocation::Register(3)));
        let facts = FunctionFacts::compile(function);

        assert_eq!(
            facts.lookup(0x1050, SlotId(1)),
            Liveness::Available(SlotLocation::Register(3))
        );
    }

    #[test]
    fn test_conditional_join_follows_metadata() {
        // 片方の分岐だけでムーブし、合流点以降はコンパイラが「利用不可」と出力している
        let function = FunctionMetadata::new("ccf", 0x1000..0x1100)
            .with_scope(1, ScopeId::BODY, vec![0x1020..0x1040])
            .with_slot(VariableSlot::new(0, "k"))
            .with_record(LivenessRecord::available(0x1000..0x1020, K, location()))
            .with_record(LivenessRecord::unavailable(0x1020..0x1040, K))
            .with_record(LivenessRecord::available(0x1040..0x1060, K, location()))
            .with_record(LivenessRecord::unavailable(0x1060..0x1100, K));
        let facts = FunctionFacts::compile(function);

        assert_eq!(facts.lookup(0x1030, K), Liveness::Unavailable);
        assert!(facts.lookup(0x1050, K).is_available());
        assert_eq!(facts.lookup(0x1060, K), Liveness::Unavailable);
    }

    #[test]
    fn test_cache_builds_once() {
        let stats = Arc::new(Statistics::new());
        let cache = LivenessCache::new(Arc::clone(&stats));
        let mut metadata = StaticMetadata::new();
        let id = metadata.add_function(move_and_reinit());

        assert!(cache.lookup(&metadata, id, 0x1020, K).is_available());
        assert_eq!(cache.lookup(&metadata, id, 0x1050, K), Liveness::Unavailable);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.liveness_cache.compilations, 1);
        assert_eq!(snapshot.liveness_cache.hits, 1);
        assert!(cache.contains(id));
    }

    #[test]
    fn test_cache_degrades_without_metadata() {
        let stats = Arc::new(Statistics::new());
        let cache = LivenessCache::new(Arc::clone(&stats));
        let mut metadata = StaticMetadata::new();
        let id = metadata.add_function(move_and_reinit());
        metadata.break_function(id);

        assert_eq!(
            cache.lookup(&metadata, id, 0x1050, K),
            Liveness::Available(SlotLocation::Unknown)
        );
        assert_eq!(
            cache.lookup(&metadata, FunctionId(0x9000), 0x9000, K),
            Liveness::Available(SlotLocation::Unknown)
        );
        assert_eq!(stats.snapshot().liveness_cache.metadata_missing, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalidation() {
        let cache = LivenessCache::new(Arc::new(Statistics::new()));
        let mut metadata = StaticMetadata::new();
        let first = metadata.add_function(move_and_reinit());
        let second = metadata.add_function(FunctionMetadata::new("other", 0x5000..0x5100));
        cache.facts(&metadata, first);
        cache.facts(&metadata, second);

        assert_eq!(cache.invalidate_range(0x1080..0x1090), 1);
        assert!(!cache.contains(first));
        assert!(cache.contains(second));

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_population_keeps_one_entry() {
        let cache = Arc::new(LivenessCache::new(Arc::new(Statistics::new())));
        let mut metadata = StaticMetadata::new();
        let id = metadata.add_function(move_and_reinit());
        let metadata = Arc::new(metadata);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let metadata = Arc::clone(&metadata);
                std::thread::spawn(move || cache.facts(&*metadata, id))
            })
            .collect();
        let results: Vec<Arc<FunctionFacts>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let cached = cache.facts(&*metadata, id);
        assert_eq!(cache.len(), 1);
        for facts in results {
            assert_eq!(facts.points(), cached.points());
        }
    }
}
