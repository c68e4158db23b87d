//! Yomi リゾルバのコア機能
//!
//! このクレートは、停止中のスレッドについて「どの変数がまだ有効か」と
//! 「async関数の論理的な呼び出し列」を求める機能を提供します。
//! 生存区間表とそのキャッシュ、フレーム分類、変数の解決、停止セッション、
//! それらをptraceターゲットに結び付けるデバッガ本体を含みます。

pub mod breakpoint;
pub mod classifier;
pub mod command;
pub mod config;
pub mod debugger;
pub mod disasm;
pub mod errors;
pub mod liveness;
pub mod parse;
pub mod resolver;
pub mod session;
pub mod stats;

pub use breakpoint::{Breakpoint, BreakpointId};
pub use classifier::FrameClassifier;
pub use command::Command;
pub use config::ResolverConfig;
pub use debugger::Debugger;
pub use errors::{FailureKind, ResolveError};
pub use liveness::{FunctionFacts, Liveness, LivenessCache, LivenessSet, ProgramPoint};
pub use resolver::{NotFoundReason, Resolution, ResolvedValue, VariableResolver};
pub use session::StopSession;
pub use stats::{Statistics, StatisticsSnapshot};

// 他のクレートから使用するために再エクスポート
pub use yomi_async::{FrameKind, FrameOrigin, LogicalFrame, LogicalStack, Truncation};
pub use yomi_dwarf::{SourceLocation, Symbol};
pub use yomi_target::{StopReason, ThreadHandle};

/// リゾルバの結果型
pub type Result<T> = anyhow::Result<T>;
