//! Yomi ターゲットプロセス制御
//!
//! このクレートは、リゾルバが消費するプロセス制御インターフェース（[`ProcessControl`]）と、
//! その実装を提供します。ptraceによる実プロセス制御と、メモリイメージを保持する
//! スナップショット実装（オフライン再生・テスト用）の2種類があります。

pub mod breakpoint;
pub mod control;
pub mod memory;
pub mod process;
pub mod ptrace;
pub mod registers;
pub mod snapshot;
pub mod thread;
pub mod unwind;

pub use breakpoint::{BreakpointShadow, INT3_OPCODE};
pub use control::{PhysicalFrame, ProcessControl, POINTER_SIZE};
pub use memory::Memory;
pub use process::{Process, StopReason};
pub use ptrace::PtraceTarget;
pub use registers::{dwarf_register, register_name, RegisterSnapshot, Registers};
pub use snapshot::{frame, SnapshotProcess};
pub use thread::{StopId, ThreadHandle, ThreadId};
pub use unwind::walk_frame_pointers;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
