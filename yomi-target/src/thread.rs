//! スレッドと停止世代の識別子

use std::fmt;

/// スレッドID
pub type ThreadId = i32;

/// 停止中スレッドへのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadHandle(pub ThreadId);

impl ThreadHandle {
    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.0
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// 停止世代
///
/// デバッグ対象が実行を再開するたびに単調増加します。
/// 同じ値である間に読んだメモリ・レジスタだけが同じ停止に属します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StopId(pub u64);

impl fmt::Display for StopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
