//! Yomi 非同期関数のアンワインド
//!
//! このクレートは、物理スタックと一致しないasync関数の論理的な呼び出し列を、
//! ターゲットメモリ上のコンテキストチェーンから再構成する機能を提供します。
//! 論理フレーム・論理スタックの型もここで定義します。

pub mod context;
pub mod logical_stack;
pub mod walker;

pub use context::{AsyncContext, ContextLayout};
pub use logical_stack::{FrameKind, FrameOrigin, LogicalFrame, LogicalStack};
pub use walker::{AsyncChain, ChainWalker, ContextChainWalk, Truncation, DEFAULT_MAX_DEPTH};

/// async機能の結果型
pub type Result<T> = anyhow::Result<T>;
