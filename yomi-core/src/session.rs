//! 停止1回分のセッション
//!
//! 停止世代を捕まえて、分類・論理スタック構築・変数解決をまとめて提供します。
//! デバッグ対象が再開したら、以降の操作は [`ResolveError::Cancelled`] で失敗します。

use crate::classifier::FrameClassifier;
use crate::config::ResolverConfig;
use crate::errors::ResolveError;
use crate::liveness::LivenessCache;
use crate::resolver::{Resolution, VariableResolver};
use crate::stats::Statistics;
use tracing::{debug, warn};
use yomi_async::{ChainWalker, FrameKind, LogicalFrame, LogicalStack, Truncation};
use yomi_dwarf::MetadataProvider;
use yomi_target::{PhysicalFrame, ProcessControl, StopId, ThreadHandle};

/// 停止セッション
pub struct StopSession<'a, P: ?Sized, M: ?Sized> {
    process: &'a P,
    metadata: &'a M,
    cache: &'a LivenessCache,
    config: &'a ResolverConfig,
    stats: &'a Statistics,
    stop_id: StopId,
}

impl<'a, P, M> StopSession<'a, P, M>
where
    P: ProcessControl + ?Sized,
    M: MetadataProvider + ?Sized,
{
    /// 現在の停止でセッションを開始する
    pub fn new(
        process: &'a P,
        metadata: &'a M,
        cache: &'a LivenessCache,
        config: &'a ResolverConfig,
        stats: &'a Statistics,
    ) -> Self {
        Self {
            process,
            metadata,
            cache,
            config,
            stats,
            stop_id: process.stop_id(),
        }
    }

    /// 開始時の停止世代
    pub fn stop_id(&self) -> StopId {
        self.stop_id
    }

    /// 停止が続いているか確認する
    pub fn ensure_current(&self) -> Result<(), ResolveError> {
        let current = self.process.stop_id();
        if current != self.stop_id {
            self.stats.record_cancellation();
            return Err(ResolveError::Cancelled {
                captured: self.stop_id,
                current,
            });
        }
        Ok(())
    }

    /// 物理フレームを分類する
    pub fn classify(&self, frame: &PhysicalFrame) -> FrameKind {
        FrameClassifier::new(self.process, self.metadata, self.config).classify(frame)
    }

    /// スレッドの論理スタックを構築する
    ///
    /// 最初のasyncファンクレットからはコンテキストチェーンをたどり、
    /// それより外側の物理フレーム（エグゼキュータ）は含めません。
    pub fn logical_stack(&self, thread: ThreadHandle) -> Result<LogicalStack, ResolveError> {
        self.ensure_current()?;

        let frames = self
            .process
            .physical_frames(thread)
            .map_err(|e| ResolveError::Unwind {
                thread,
                message: e.to_string(),
            })?;
        let classifier = FrameClassifier::new(self.process, self.metadata, self.config);
        let walker = ChainWalker::new(self.config.context_layout, self.config.max_async_depth);

        let mut stack = LogicalStack::new();
        for frame in &frames {
            let kind = classifier.classify(frame);

            if let FrameKind::AsyncFunclet { context } = kind {
                let chain = walker
                    .walk_from(self.process, self.metadata, frame, context)
                    .cancel_on_resume(self.stop_id)
                    .finish();

                if chain.truncation == Some(Truncation::Cancelled) {
                    self.ensure_current()?;
                }
                self.stats
                    .record_chain(chain.frames.len(), chain.truncation.as_ref());

                if chain.frames.is_empty() {
                    // nullコンテキスト: ファンクレット自身だけを残す
                    stack.push(self.physical_frame(frame, kind));
                } else {
                    debug!(
                        %thread,
                        async_frames = chain.frames.len(),
                        physical_frames_skipped = frames.len() - frame.index - 1,
                        "replaced executor frames with async chain"
                    );
                    for async_frame in chain.frames {
                        stack.push(async_frame);
                    }
                }
                if let Some(truncation) = chain.truncation {
                    warn!(%thread, "Logical stack truncated: {}", truncation);
                    stack.set_truncation(truncation);
                }
                break;
            }

            stack.push(self.physical_frame(frame, kind));
        }

        self.ensure_current()?;
        Ok(stack)
    }

    fn physical_frame(&self, frame: &PhysicalFrame, kind: FrameKind) -> LogicalFrame {
        let lookup_pc = if frame.index > 0 {
            frame.pc.saturating_sub(1)
        } else {
            frame.pc
        };
        LogicalFrame::from_physical(
            frame,
            kind,
            self.metadata.function_at(lookup_pc),
            self.metadata.symbol_name(lookup_pc),
        )
    }

    fn resolver(&self) -> VariableResolver<'a, P, M> {
        VariableResolver::new(
            self.process,
            self.metadata,
            self.cache,
            self.config,
            self.stats,
            self.stop_id,
        )
    }

    /// 論理スタック上のフレームで変数を解決する
    pub fn resolve(
        &self,
        stack: &LogicalStack,
        index: usize,
        name: &str,
    ) -> Result<Resolution, ResolveError> {
        self.resolver().resolve(stack, index, name)
    }

    /// フレームで見えるすべての変数を解決する
    pub fn resolve_all(
        &self,
        stack: &LogicalStack,
        index: usize,
    ) -> Result<Vec<(String, Resolution)>, ResolveError> {
        self.resolver().resolve_all(stack, index)
    }
}
