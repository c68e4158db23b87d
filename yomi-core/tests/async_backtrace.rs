//! asyncチェーンを含む論理スタックの統合テスト
//!
//! 再帰的なasync関数（fibonacci）が中断している状態をスナップショットで再現します。

use std::sync::Arc;
use yomi_core::{
    FrameKind, FrameOrigin, LivenessCache, NotFoundReason, Resolution, ResolveError,
    ResolverConfig, Statistics, StopSession, Truncation,
};
use yomi_dwarf::{FunctionMetadata, SlotLocation, StaticMetadata, SymbolKind, VariableSlot};
use yomi_target::{frame, RegisterSnapshot, SnapshotProcess, ThreadHandle};

const THREAD: ThreadHandle = ThreadHandle(100);
const CONTEXT_BASE: u64 = 0x10_0000;
const FUNCLET_PC: u64 = 0x3020;
const RESUME_PC: u64 = 0x3040;

fn context(position: usize) -> u64 {
    CONTEXT_BASE + position as u64 * 0x100
}

fn metadata() -> StaticMetadata {
    let mut metadata = StaticMetadata::new();
    metadata.add_function_with_kind(
        FunctionMetadata::new("$s4main9fibonacciyS2iYaFTY0_", 0x3000..0x3100).with_slot(
            VariableSlot::new(0, "n")
                .with_type("Int", 8)
                .argument()
                .declared_at(SlotLocation::ContextOffset(16)),
        ),
        SymbolKind::AsyncEntry,
    );
    metadata.add_function(FunctionMetadata::new("swift_job_run", 0x5000..0x5100));
    metadata.add_function(FunctionMetadata::new("main", 0x6000..0x6100));
    metadata
}

/// 長さ `depth` のチェーンを持つプロセスを作る（位置 k の `n` は k + 1）
fn suspended_fibonacci(depth: usize) -> SnapshotProcess {
    let process = SnapshotProcess::new();
    for position in 0..depth {
        let parent = if position + 1 < depth {
            context(position + 1)
        } else {
            0
        };
        process.write_pointer(context(position), parent);
        process.write_pointer(context(position) + 8, RESUME_PC);
        process.write_pointer(context(position) + 16, position as u64 + 1);
    }
    process.add_thread(
        THREAD,
        vec![
            frame(FUNCLET_PC, 0x7000, RegisterSnapshot::new().with(14, context(0))),
            frame(0x5011, 0x7100, RegisterSnapshot::new()),
            frame(0x6011, 0x7200, RegisterSnapshot::new()),
        ],
    );
    process
}

struct Env {
    metadata: StaticMetadata,
    cache: LivenessCache,
    config: ResolverConfig,
    stats: Statistics,
}

impl Env {
    fn new(config: ResolverConfig) -> Self {
        Self {
            metadata: metadata(),
            cache: LivenessCache::new(Arc::new(Statistics::new())),
            config,
            stats: Statistics::new(),
        }
    }

    fn session<'a>(&'a self, process: &'a SnapshotProcess) -> StopSession<'a, SnapshotProcess, StaticMetadata> {
        StopSession::new(process, &self.metadata, &self.cache, &self.config, &self.stats)
    }
}

#[test]
fn test_fibonacci_chain_pcs() {
    let env = Env::new(ResolverConfig::default());
    let process = suspended_fibonacci(10);

    let stack = env.session(&process).logical_stack(THREAD).unwrap();

    assert_eq!(stack.depth(), 10);
    assert!(!stack.is_truncated());
    assert_eq!(stack.frames()[0].pc, FUNCLET_PC);
    for frame in &stack.frames()[1..] {
        assert_eq!(frame.pc, RESUME_PC);
        assert!(frame.is_async());
        assert_eq!(frame.symbol.as_deref(), Some("$s4main9fibonacciyS2iYaFTY0_"));
    }
    assert_eq!(
        stack.frames()[4].origin,
        FrameOrigin::AsyncContext {
            position: 4,
            context: context(4)
        }
    );
}

#[test]
fn test_async_argument_per_frame() {
    let env = Env::new(ResolverConfig::default());
    let process = suspended_fibonacci(5);
    let session = env.session(&process);
    let stack = session.logical_stack(THREAD).unwrap();

    for index in 0..5 {
        let resolution = session.resolve(&stack, index, "n").unwrap();
        assert_eq!(
            resolution.value().and_then(|value| value.unsigned()),
            Some(index as u64 + 1)
        );
    }
}

#[test]
fn test_read_failure_truncates_at_position() {
    let env = Env::new(ResolverConfig::default());
    let process = suspended_fibonacci(10);
    process.fail_reads_at(context(3));
    let session = env.session(&process);

    let stack = session.logical_stack(THREAD).unwrap();

    assert_eq!(stack.depth(), 3);
    assert_eq!(
        stack.truncation(),
        Some(&Truncation::ReadFailed {
            position: 3,
            address: context(3)
        })
    );
    assert_eq!(env.stats.snapshot().async_unwind.read_failures, 1);
    // 打ち切られる前のフレームは普通に使える
    let resolution = session.resolve(&stack, 2, "n").unwrap();
    assert_eq!(resolution.value().and_then(|value| value.unsigned()), Some(3));
}

#[test]
fn test_depth_bound() {
    let config = ResolverConfig {
        max_async_depth: 4,
        ..ResolverConfig::default()
    };
    let env = Env::new(config);
    let process = suspended_fibonacci(10);

    let stack = env.session(&process).logical_stack(THREAD).unwrap();

    assert_eq!(stack.depth(), 4);
    assert_eq!(
        stack.truncation(),
        Some(&Truncation::DepthExceeded { max_depth: 4 })
    );
    let stats = env.stats.snapshot();
    assert_eq!(stats.async_unwind.chains_truncated, 1);
    assert_eq!(stats.async_unwind.corrupt_chains, 1);
    assert_eq!(stats.async_unwind.read_failures, 0);
}

#[test]
fn test_rewalk_is_identical() {
    let env = Env::new(ResolverConfig::default());
    let process = suspended_fibonacci(6);
    let session = env.session(&process);

    let first = session.logical_stack(THREAD).unwrap();
    let second = session.logical_stack(THREAD).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_resume_during_walk_discards_stack() {
    let env = Env::new(ResolverConfig::default());
    let process = suspended_fibonacci(10);
    let session = env.session(&process);
    process.resume_after_reads(3);

    let result = session.logical_stack(THREAD);

    assert!(matches!(result, Err(ResolveError::Cancelled { .. })));
    assert_eq!(env.stats.snapshot().resolutions.cancelled, 1);
}

#[test]
fn test_null_context_keeps_funclet_frame() {
    let env = Env::new(ResolverConfig::default());
    let process = SnapshotProcess::new();
    process.add_thread(
        THREAD,
        vec![
            frame(FUNCLET_PC, 0x7000, RegisterSnapshot::new().with(14, 0)),
            frame(0x5011, 0x7100, RegisterSnapshot::new()),
        ],
    );

    let stack = env.session(&process).logical_stack(THREAD).unwrap();

    assert_eq!(stack.depth(), 1);
    assert_eq!(stack.frames()[0].kind, FrameKind::AsyncFunclet { context: 0 });
    assert!(!stack.is_truncated());
}

#[test]
fn test_thunk_redirects_to_caller() {
    let mut metadata = StaticMetadata::new();
    metadata.add_function(FunctionMetadata::new("callee", 0x1000..0x1100));
    metadata.add_function_with_kind(
        FunctionMetadata::new("$s4main1SVAA1PA2aDP3fooyyFTW", 0x1200..0x1210),
        SymbolKind::Thunk,
    );
    metadata.add_function(
        FunctionMetadata::new("caller", 0x2000..0x2100).with_slot(
            VariableSlot::new(0, "x")
                .with_type("Int", 8)
                .declared_at(SlotLocation::FrameOffset(-8)),
        ),
    );
    let process = SnapshotProcess::new();
    process.write_pointer(0x7200 - 8, 99);
    process.add_thread(
        THREAD,
        vec![
            frame(0x1010, 0x7000, RegisterSnapshot::new()),
            frame(0x1205, 0x7100, RegisterSnapshot::new()),
            frame(0x2011, 0x7200, RegisterSnapshot::new()),
        ],
    );
    let cache = LivenessCache::new(Arc::new(Statistics::new()));
    let config = ResolverConfig::default();
    let stats = Statistics::new();
    let session = StopSession::new(&process, &metadata, &cache, &config, &stats);

    let stack = session.logical_stack(THREAD).unwrap();
    assert_eq!(stack.frames()[1].kind, FrameKind::Thunk);

    let resolution = session.resolve(&stack, 1, "x").unwrap();
    let value = resolution.value().unwrap();
    assert_eq!(value.unsigned(), Some(99));
    assert_eq!(value.frame_index, 2);

    assert_eq!(
        session.resolve(&stack, 0, "x").unwrap(),
        Resolution::NotFound(NotFoundReason::NoSuchVariable)
    );
}

#[test]
fn test_thunk_redirects_into_async_chain() {
    let mut env = Env::new(ResolverConfig::default());
    env.metadata.add_function_with_kind(
        FunctionMetadata::new("$s4main1SVAA1PA2aDP3fibyS2iYaFTW", 0x1200..0x1210),
        SymbolKind::Thunk,
    );
    let process = SnapshotProcess::new();
    for position in 0..3 {
        let parent = if position < 2 { context(position + 1) } else { 0 };
        process.write_pointer(context(position), parent);
        process.write_pointer(context(position) + 8, RESUME_PC);
        process.write_pointer(context(position) + 16, 77 + position as u64);
    }
    process.add_thread(
        THREAD,
        vec![
            frame(0x1204, 0x7000, RegisterSnapshot::new()),
            frame(FUNCLET_PC + 1, 0x7100, RegisterSnapshot::new().with(14, context(0))),
            frame(0x5011, 0x7200, RegisterSnapshot::new()),
        ],
    );
    let session = env.session(&process);

    let stack = session.logical_stack(THREAD).unwrap();
    let kinds: Vec<FrameKind> = stack.frames().iter().map(|frame| frame.kind).collect();
    assert_eq!(
        kinds,
        vec![
            FrameKind::Thunk,
            FrameKind::AsyncFunclet { context: context(0) },
            FrameKind::AsyncFunclet { context: context(1) },
            FrameKind::AsyncFunclet { context: context(2) },
        ]
    );

    // サンクは値を持たず、ファンクレット（チェーン先頭）で読む
    let redirected = session.resolve(&stack, 0, "n").unwrap();
    let value = redirected.value().unwrap();
    assert_eq!(value.unsigned(), Some(77));
    assert_eq!(value.frame_index, 1);

    let outer = session.resolve(&stack, 2, "n").unwrap();
    assert_eq!(outer.value().and_then(|value| value.unsigned()), Some(78));
}
