//! エラー型とエラーメッセージ定数

use thiserror::Error;
use yomi_async::Truncation;
use yomi_target::{StopId, ThreadHandle};

/// プロセスに接続されていない場合のエラーメッセージ
pub const ERR_NOT_ATTACHED: &str = "Not attached to a process";

/// DWARF情報がロードされていない場合のエラーメッセージ
pub const ERR_DWARF_NOT_LOADED: &str = "DWARF information not loaded";

/// シンボルが見つからない場合のエラーメッセージ
pub const ERR_SYMBOL_NOT_FOUND: &str = "Symbol not found";

/// 局所的な失敗の分類
///
/// どれもセッションを中断させず、結果の値として表面化します。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// デバッグ情報がない（常に利用可能として扱う）
    MetadataMissing,
    /// メモリやレジスタが読めない
    MemoryReadFailure,
    /// チェーンが深さ上限を超えた
    CorruptChain,
    /// 変数が破棄・ムーブ済み（エラーではなく正当な結果）
    VariableDeinitialized,
}

impl FailureKind {
    /// チェーンの打ち切り理由を分類する（中断はどれにも当たらない）
    pub fn of_truncation(truncation: &Truncation) -> Option<Self> {
        match truncation {
            Truncation::ReadFailed { .. } => Some(FailureKind::MemoryReadFailure),
            Truncation::DepthExceeded { .. } => Some(FailureKind::CorruptChain),
            Truncation::Cancelled => None,
        }
    }
}

/// リゾルバのエラー
#[derive(Debug, Error)]
pub enum ResolveError {
    /// 解決中にデバッグ対象が実行を再開した
    #[error("target resumed during resolution (stop {captured} -> {current}); results discarded")]
    Cancelled { captured: StopId, current: StopId },

    /// 物理スタックを取得できなかった
    #[error("failed to unwind {thread}: {message}")]
    Unwind { thread: ThreadHandle, message: String },

    /// 論理スタックにないフレーム番号
    #[error("no frame #{0} in the logical stack")]
    FrameOutOfRange(usize),

    /// 設定値が不正
    #[error("invalid configuration: {0}")]
    Config(String),
}
