//! 停止をまたいだ変数の生存判定の統合テスト

use std::sync::Arc;
use yomi_core::{
    FailureKind, LivenessCache, NotFoundReason, Resolution, ResolverConfig, Statistics,
    StopSession,
};
use yomi_dwarf::{
    FunctionMetadata, LivenessRecord, ScopeId, SlotId, SlotLocation, StaticMetadata, StorageKind,
    VariableSlot,
};
use yomi_target::{frame, RegisterSnapshot, SnapshotProcess, ThreadHandle};

const THREAD: ThreadHandle = ThreadHandle(1);
const FRAME_BASE: u64 = 0x7fff_0000;
const K: SlotId = SlotId(0);

/// `k` を初期化して使い、ムーブしてから再代入する関数
///
/// ```text
/// 0x1000..0x1010  let k = Klass()       (未初期化)
/// 0x1010..0x1040  use(k)                (利用可能)
/// 0x1040..0x1060  consume(k)            (ムーブ済み)
/// 0x1060..0x10f0  k = Klass(); use(k)   (利用可能)
/// ```
fn copyable_var_test() -> FunctionMetadata {
    let location = SlotLocation::FrameOffset(-8);
    FunctionMetadata::new("$s4main17copyableVarTestyyF", 0x1000..0x1100)
        .with_slot(VariableSlot::new(0, "k").with_type("Klass", 8))
        .with_record(LivenessRecord::available(0x1010..0x1040, K, location))
        .with_record(LivenessRecord::unavailable(0x1040..0x1060, K))
        .with_record(LivenessRecord::available(0x1060..0x10f0, K, location))
}

/// 片方の分岐だけで `k` をムーブし、合流後は利用不可になる関数
fn conditional_move() -> FunctionMetadata {
    let location = SlotLocation::FrameOffset(-8);
    FunctionMetadata::new("$s4main22copyableVarTestCCFTrueyyF", 0x2000..0x2100)
        .with_scope(1, ScopeId::BODY, vec![0x2020..0x2040])
        .with_scope(2, ScopeId::BODY, vec![0x2040..0x2060])
        .with_slot(VariableSlot::new(0, "k").with_type("Klass", 8))
        .with_record(LivenessRecord::available(0x2000..0x2020, K, location))
        .with_record(LivenessRecord::unavailable(0x2020..0x2040, K))
        .with_record(LivenessRecord::available(0x2040..0x2060, K, location))
        .with_record(LivenessRecord::unavailable(0x2060..0x2100, K))
}

struct Target {
    process: SnapshotProcess,
    metadata: StaticMetadata,
    cache: LivenessCache,
    cache_stats: Arc<Statistics>,
    config: ResolverConfig,
    stats: Statistics,
}

impl Target {
    fn new() -> Self {
        let mut metadata = StaticMetadata::new();
        metadata.add_function(copyable_var_test());
        metadata.add_function(conditional_move());
        let process = SnapshotProcess::new();
        process.write_pointer(FRAME_BASE - 8, 0x5555_0000);
        let cache_stats = Arc::new(Statistics::new());
        Self {
            process,
            metadata,
            cache: LivenessCache::new(Arc::clone(&cache_stats)),
            cache_stats,
            config: ResolverConfig::default(),
            stats: Statistics::new(),
        }
    }

    /// 新しい停止を作り、そこで変数を解決する
    fn stop_at(&self, pc: u64, name: &str) -> Resolution {
        self.process.resume();
        self.process.add_thread(
            THREAD,
            vec![frame(pc, FRAME_BASE, RegisterSnapshot::new())],
        );
        let session = StopSession::new(
            &self.process,
            &self.metadata,
            &self.cache,
            &self.config,
            &self.stats,
        );
        let stack = session.logical_stack(THREAD).unwrap();
        session.resolve(&stack, 0, name).unwrap()
    }
}

#[test]
fn test_copyable_variable_across_stops() {
    let target = Target::new();

    let before_init = target.stop_at(0x1004, "k");
    let in_use = target.stop_at(0x1020, "k");
    let moved = target.stop_at(0x1050, "k");
    let reinitialized = target.stop_at(0x1070, "k");

    assert!(before_init.is_deinitialized());
    assert_eq!(
        in_use.value().and_then(|value| value.unsigned()),
        Some(0x5555_0000)
    );
    assert!(moved.is_deinitialized());
    assert_eq!(moved.failure_kind(), Some(FailureKind::VariableDeinitialized));
    assert!(reinitialized.value().is_some());

    // 表の構築は関数ごとに1回だけ
    let stats = target.cache_stats.snapshot();
    assert_eq!(stats.liveness_cache.compilations, 1);
    assert_eq!(stats.liveness_cache.hits, 3);
    assert_eq!(target.stats.snapshot().resolutions.deinitialized, 2);
}

#[test]
fn test_deinitialized_variable_is_not_read() {
    let target = Target::new();
    target.stop_at(0x1020, "k");

    let reads = target.process.reads();
    let moved = target.stop_at(0x1050, "k");

    assert!(moved.is_deinitialized());
    assert_eq!(target.process.reads(), reads);
}

#[test]
fn test_conditional_join() {
    let target = Target::new();

    assert!(target.stop_at(0x2030, "k").is_deinitialized());
    assert!(target.stop_at(0x2050, "k").value().is_some());
    assert!(target.stop_at(0x2070, "k").is_deinitialized());
}

#[test]
fn test_missing_metadata_is_permissive() {
    let mut target = Target::new();
    let id = target.metadata.add_function(
        FunctionMetadata::new("untracked", 0x3000..0x3100).with_slot(
            VariableSlot::new(0, "buffer")
                .with_type("UnsafeMutablePointer", 8)
                .with_kind(StorageKind::Indirect)
                .declared_at(SlotLocation::FrameOffset(-8)),
        ),
    );
    target.process.write_bytes(0x5555_0000, &[7, 0, 0, 0, 0, 0, 0, 0]);

    // 生存区間レコードのない関数はどこでも利用可能
    let value = target.stop_at(0x30f0, "buffer");
    assert_eq!(value.value().and_then(|value| value.unsigned()), Some(7));

    target.metadata.break_function(id);
    target.cache.invalidate_all();
    assert_eq!(
        target.stop_at(0x30f0, "buffer"),
        Resolution::NotFound(NotFoundReason::NoDebugInfo)
    );
    assert_eq!(target.cache_stats.snapshot().liveness_cache.metadata_missing, 1);
}
