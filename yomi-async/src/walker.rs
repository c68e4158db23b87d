//! asyncコンテキストチェーンの走査
//!
//! ファンクレットのコンテキストレジスタから始めて、親ポインタを1つずつたどります。
//! 位置 k のフレームのPCは、位置 k-1 のコンテキストに保存された再開アドレスです
//! （位置 0 だけは物理フレームのPC）。読み取りは必ず先行者の順で1件ずつ行い、
//! 先読みはしません。

use crate::{AsyncContext, ContextLayout, FrameKind, FrameOrigin, LogicalFrame};
use std::fmt;
use tracing::{debug, trace, warn};
use yomi_dwarf::MetadataProvider;
use yomi_target::{PhysicalFrame, ProcessControl, StopId, ThreadHandle};

/// 既定の最大走査深さ
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// チェーンが途中で打ち切られた理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    /// 位置 `position` のコンテキストが読めなかった
    ReadFailed { position: usize, address: u64 },
    /// 深さの上限に達してもチェーンが続いていた（破損の疑い）
    DepthExceeded { max_depth: usize },
    /// 走査中にデバッグ対象が実行を再開した
    Cancelled,
}

impl fmt::Display for Truncation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Truncation::ReadFailed { position, address } => write!(
                f,
                "failed to read async context 0x{:x} at position {}",
                address, position
            ),
            Truncation::DepthExceeded { max_depth } => {
                write!(f, "async chain longer than {} frames", max_depth)
            }
            Truncation::Cancelled => write!(f, "target resumed during unwind"),
        }
    }
}

/// 走査結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncChain {
    pub frames: Vec<LogicalFrame>,
    pub truncation: Option<Truncation>,
}

impl AsyncChain {
    /// 途中で打ち切られたかどうか
    pub fn is_truncated(&self) -> bool {
        self.truncation.is_some()
    }
}

/// チェーン走査の設定
#[derive(Debug, Clone, Copy)]
pub struct ChainWalker {
    layout: ContextLayout,
    max_depth: usize,
}

impl ChainWalker {
    /// 走査器を作成する
    pub fn new(layout: ContextLayout, max_depth: usize) -> Self {
        Self { layout, max_depth }
    }

    /// コンテキストチェーンを走査する
    ///
    /// 返すイテレータは遅延評価で、`next` のたびに1件だけメモリを読みます。
    pub fn walk<'a, P, M>(
        &self,
        process: &'a P,
        metadata: &'a M,
        thread: ThreadHandle,
        start_context: u64,
        start_pc: u64,
    ) -> ContextChainWalk<'a, P, M>
    where
        P: ProcessControl + ?Sized,
        M: MetadataProvider + ?Sized,
    {
        ContextChainWalk {
            process,
            metadata,
            layout: self.layout,
            max_depth: self.max_depth,
            thread,
            origin: None,
            next_context: start_context,
            next_pc: start_pc,
            position: 0,
            stop_id: None,
            truncation: None,
            finished: false,
        }
    }

    /// ファンクレットの物理フレームから走査する
    ///
    /// 位置 0 のフレームには物理フレームが結び付けられ、レジスタを読めるようになります。
    pub fn walk_from<'a, P, M>(
        &self,
        process: &'a P,
        metadata: &'a M,
        frame: &PhysicalFrame,
        start_context: u64,
    ) -> ContextChainWalk<'a, P, M>
    where
        P: ProcessControl + ?Sized,
        M: MetadataProvider + ?Sized,
    {
        let mut walk = self.walk(process, metadata, frame.thread, start_context, frame.pc);
        walk.origin = Some(frame.clone());
        walk
    }
}

impl Default for ChainWalker {
    fn default() -> Self {
        Self::new(ContextLayout::default(), DEFAULT_MAX_DEPTH)
    }
}

/// 走査中のチェーン
pub struct ContextChainWalk<'a, P: ?Sized, M: ?Sized> {
    process: &'a P,
    metadata: &'a M,
    layout: ContextLayout,
    max_depth: usize,
    thread: ThreadHandle,
    origin: Option<PhysicalFrame>,
    next_context: u64,
    next_pc: u64,
    position: usize,
    /// 開始時の停止世代（設定されていれば読み取りごとに照合する）
    stop_id: Option<StopId>,
    truncation: Option<Truncation>,
    finished: bool,
}

impl<'a, P, M> ContextChainWalk<'a, P, M>
where
    P: ProcessControl + ?Sized,
    M: MetadataProvider + ?Sized,
{
    /// 停止世代が変わったら走査を中止する
    pub fn cancel_on_resume(mut self, stop_id: StopId) -> Self {
        self.stop_id = Some(stop_id);
        self
    }

    /// 打ち切り理由（走査終了後に確定する）
    pub fn truncation(&self) -> Option<Truncation> {
        self.truncation
    }

    /// 残りをすべて走査して結果をまとめる
    pub fn finish(mut self) -> AsyncChain {
        let frames = self.by_ref().collect();
        AsyncChain {
            frames,
            truncation: self.truncation,
        }
    }

    fn resumed(&self) -> bool {
        self.stop_id
            .is_some_and(|stop_id| self.process.stop_id() != stop_id)
    }

    fn stop(&mut self, truncation: Option<Truncation>) -> Option<LogicalFrame> {
        self.finished = true;
        self.truncation = truncation;
        None
    }
}

impl<'a, P, M> Iterator for ContextChainWalk<'a, P, M>
where
    P: ProcessControl + ?Sized,
    M: MetadataProvider + ?Sized,
{
    type Item = LogicalFrame;

    fn next(&mut self) -> Option<LogicalFrame> {
        if self.finished {
            return None;
        }

        let address = self.next_context;
        if address == 0 {
            debug!(thread = %self.thread, frames = self.position, "async chain complete");
            return self.stop(None);
        }
        if self.position >= self.max_depth {
            warn!(
                thread = %self.thread,
                max_depth = self.max_depth,
                "async chain exceeds depth bound; truncating"
            );
            return self.stop(Some(Truncation::DepthExceeded {
                max_depth: self.max_depth,
            }));
        }
        if self.resumed() {
            return self.stop(Some(Truncation::Cancelled));
        }

        let context = match AsyncContext::read(self.process, address, &self.layout) {
            Ok(context) => context,
            Err(e) => {
                warn!(
                    thread = %self.thread,
                    position = self.position,
                    "async context read failed at 0x{:x}: {}",
                    address,
                    e
                );
                return self.stop(Some(Truncation::ReadFailed {
                    position: self.position,
                    address,
                }));
            }
        };

        // 読み取り中に再開していたら、その値は今回の停止のものではない
        if self.resumed() {
            return self.stop(Some(Truncation::Cancelled));
        }

        trace!(
            position = self.position,
            context = format_args!("0x{:x}", context.address),
            parent = format_args!("0x{:x}", context.parent),
            resume = format_args!("0x{:x}", context.resume_address),
            "read async context"
        );

        let pc = self.next_pc;
        let frame = LogicalFrame {
            index: self.position,
            thread: self.thread,
            pc,
            kind: FrameKind::AsyncFunclet {
                context: context.address,
            },
            origin: FrameOrigin::AsyncContext {
                position: self.position,
                context: context.address,
            },
            frame_base: context.address,
            function: self.metadata.function_at(pc),
            symbol: self.metadata.symbol_name(pc),
            physical: if self.position == 0 {
                self.origin.clone()
            } else {
                None
            },
        };

        if context.is_root() {
            trace!(position = self.position, "reached root async context");
        }
        self.next_context = context.parent;
        self.next_pc = context.resume_address;
        self.position += 1;
        Some(frame)
    }
}
