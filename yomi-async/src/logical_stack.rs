//! 論理スタック構築

use crate::Truncation;
use std::fmt;
use yomi_dwarf::FunctionId;
use yomi_target::{PhysicalFrame, ThreadHandle};

/// フレームの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// 通常の同期フレーム
    Normal,
    /// asyncファンクレット（コンテキストレジスタの値を保持）
    AsyncFunclet { context: u64 },
    /// 転送用サンク
    Thunk,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Normal => write!(f, "normal"),
            FrameKind::AsyncFunclet { context } => write!(f, "async funclet (ctx 0x{:x})", context),
            FrameKind::Thunk => write!(f, "thunk"),
        }
    }
}

/// 論理フレームの出どころ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// 物理スタック上のフレーム
    Physical { index: usize },
    /// asyncコンテキストチェーンから合成したフレーム
    AsyncContext { position: usize, context: u64 },
}

/// 論理スタックフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalFrame {
    /// 論理スタック上の位置（0 = 最内）
    pub index: usize,
    pub thread: ThreadHandle,
    pub pc: u64,
    pub kind: FrameKind,
    pub origin: FrameOrigin,
    /// 変数のフレーム相対アドレスの基準
    /// （物理フレームはRBP、asyncフレームはコンテキスト）
    pub frame_base: u64,
    pub function: Option<FunctionId>,
    pub symbol: Option<String>,
    /// 対応する物理フレーム（レジスタ読み出しに使う）
    pub physical: Option<PhysicalFrame>,
}

impl LogicalFrame {
    /// 物理フレームから論理フレームを作成する
    pub fn from_physical(
        frame: &PhysicalFrame,
        kind: FrameKind,
        function: Option<FunctionId>,
        symbol: Option<String>,
    ) -> Self {
        Self {
            index: frame.index,
            thread: frame.thread,
            pc: frame.pc,
            kind,
            origin: FrameOrigin::Physical { index: frame.index },
            frame_base: frame.frame_base,
            function,
            symbol,
            physical: Some(frame.clone()),
        }
    }

    /// 物理スタック上の位置（合成フレームならNone）
    pub fn physical_index(&self) -> Option<usize> {
        match self.origin {
            FrameOrigin::Physical { index } => Some(index),
            FrameOrigin::AsyncContext { .. } => self.physical.as_ref().map(|frame| frame.index),
        }
    }

    /// メタデータの検索に使うPC
    ///
    /// 呼び出し元の物理フレームのPCは戻りアドレスなので、呼び出し命令内を指すよう1引きます。
    /// asyncフレームの再開アドレスはそのまま使います。
    pub fn lookup_pc(&self) -> u64 {
        match (self.origin, &self.physical) {
            (FrameOrigin::Physical { index }, _) if index > 0 => self.pc.saturating_sub(1),
            // チェーン先頭が呼び出し元の物理フレームから始まった場合
            (FrameOrigin::AsyncContext { position: 0, .. }, Some(frame)) if frame.index > 0 => {
                self.pc.saturating_sub(1)
            }
            _ => self.pc,
        }
    }

    /// asyncフレームかどうか
    pub fn is_async(&self) -> bool {
        matches!(self.kind, FrameKind::AsyncFunclet { .. })
    }

    /// asyncコンテキストのアドレス
    pub fn context(&self) -> Option<u64> {
        match self.kind {
            FrameKind::AsyncFunclet { context } => Some(context),
            _ => None,
        }
    }

    /// 位置を付け直したコピーを返す
    pub fn at_index(&self, index: usize) -> Self {
        Self {
            index,
            ..self.clone()
        }
    }
}

/// 論理スタック
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalStack {
    frames: Vec<LogicalFrame>,
    truncation: Option<Truncation>,
}

impl LogicalStack {
    /// 空の論理スタックを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// フレームを最外側に追加する（位置は自動で振られる）
    pub fn push(&mut self, frame: LogicalFrame) {
        let index = self.frames.len();
        self.frames.push(frame.at_index(index));
    }

    /// 途中で打ち切られたことを記録する
    pub fn set_truncation(&mut self, truncation: Truncation) {
        self.truncation = Some(truncation);
    }

    /// 全てのフレームを取得する
    pub fn frames(&self) -> &[LogicalFrame] {
        &self.frames
    }

    /// 位置からフレームを取得する
    pub fn get(&self, index: usize) -> Option<&LogicalFrame> {
        self.frames.get(index)
    }

    /// 打ち切り理由
    pub fn truncation(&self) -> Option<&Truncation> {
        self.truncation.as_ref()
    }

    /// 途中で打ち切られたかどうか
    pub fn is_truncated(&self) -> bool {
        self.truncation.is_some()
    }

    /// スタックが空かどうか
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// スタックの深さ
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// 指定フレームより外側にある次の物理フレームを探す
    ///
    /// チェーン先頭のasyncフレームはファンクレットの物理フレームを持つので対象に含めます。
    pub fn next_physical(&self, index: usize) -> Option<&LogicalFrame> {
        let current = self.frames.get(index)?.physical_index();
        self.frames[index + 1..].iter().find(|frame| {
            match (current, frame.physical_index()) {
                (_, None) => false,
                (Some(current), Some(next)) => next > current,
                (None, Some(_)) => true,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yomi_target::RegisterSnapshot;

    fn physical(index: usize, pc: u64) -> PhysicalFrame {
        PhysicalFrame {
            thread: ThreadHandle(1),
            index,
            pc,
            frame_base: 0x7000 + index as u64 * 0x100,
            registers: RegisterSnapshot::new(),
        }
    }

    #[test]
    fn test_lookup_pc_adjusts_callers_only() {
        let leaf = LogicalFrame::from_physical(&physical(0, 0x1000), FrameKind::Normal, None, None);
        let caller = LogicalFrame::from_physical(&physical(1, 0x2005), FrameKind::Normal, None, None);

        assert_eq!(leaf.lookup_pc(), 0x1000);
        assert_eq!(caller.lookup_pc(), 0x2004);
    }

    #[test]
    fn test_push_renumbers_frames() {
        let mut stack = LogicalStack::new();
        stack.push(LogicalFrame::from_physical(&physical(3, 0x1000), FrameKind::Normal, None, None));
        stack.push(LogicalFrame::from_physical(&physical(4, 0x2000), FrameKind::Normal, None, None));

        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.frames()[1].index, 1);
        assert_eq!(stack.frames()[1].physical_index(), Some(4));
        assert!(!stack.is_truncated());
    }

    #[test]
    fn test_next_physical_skips_synthesized_frames() {
        let mut stack = LogicalStack::new();
        stack.push(LogicalFrame::from_physical(&physical(0, 0x1000), FrameKind::Thunk, None, None));
        stack.push(LogicalFrame {
            origin: FrameOrigin::AsyncContext {
                position: 1,
                context: 0x9000,
            },
            physical: None,
            ..LogicalFrame::from_physical(
                &physical(0, 0x3000),
                FrameKind::AsyncFunclet { context: 0x9000 },
                None,
                None,
            )
        });
        stack.push(LogicalFrame::from_physical(&physical(1, 0x2000), FrameKind::Normal, None, None));

        assert_eq!(stack.next_physical(0).unwrap().pc, 0x2000);
        assert!(stack.next_physical(2).is_none());
    }

    #[test]
    fn test_next_physical_accepts_chain_head() {
        let mut stack = LogicalStack::new();
        stack.push(LogicalFrame::from_physical(&physical(0, 0x1204), FrameKind::Thunk, None, None));
        let funclet = physical(1, 0x3021);
        stack.push(LogicalFrame {
            origin: FrameOrigin::AsyncContext {
                position: 0,
                context: 0x9000,
            },
            ..LogicalFrame::from_physical(
                &funclet,
                FrameKind::AsyncFunclet { context: 0x9000 },
                None,
                None,
            )
        });
        stack.push(LogicalFrame {
            origin: FrameOrigin::AsyncContext {
                position: 1,
                context: 0x9100,
            },
            physical: None,
            ..LogicalFrame::from_physical(
                &funclet,
                FrameKind::AsyncFunclet { context: 0x9100 },
                None,
                None,
            )
        });

        let next = stack.next_physical(0).unwrap();
        assert_eq!(next.index, 1);
        assert_eq!(next.physical_index(), Some(1));
        assert!(stack.next_physical(1).is_none());
    }
}
