//! 変数の解決
//!
//! 論理フレームと変数名から、生存区間表を引いて値を読み出します。
//! 利用不可の変数はメモリに触れずに [`Resolution::Deinitialized`] を返します。

use crate::config::ResolverConfig;
use crate::errors::{FailureKind, ResolveError};
use crate::liveness::{FunctionFacts, Liveness, LivenessCache};
use crate::stats::Statistics;
use std::fmt;
use tracing::{debug, trace};
use yomi_async::{FrameKind, LogicalFrame, LogicalStack};
use yomi_dwarf::{MetadataProvider, SlotLocation, StorageKind, VariableSlot};
use yomi_target::{register_name, ProcessControl, StopId};

/// 型サイズが不明な変数に読むバイト数
const DEFAULT_VALUE_SIZE: u64 = 8;

/// 解決結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// 値を読み出せた
    Value(ResolvedValue),
    /// 変数は破棄・ムーブ済み（表示用に宣言の型名を持つ）
    Deinitialized { type_name: Option<String> },
    /// 値を得られなかった
    NotFound(NotFoundReason),
}

impl Resolution {
    /// 局所的な失敗の分類（値があればNone）
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Resolution::Value(_) => None,
            Resolution::Deinitialized { .. } => Some(FailureKind::VariableDeinitialized),
            Resolution::NotFound(reason) => reason.failure_kind(),
        }
    }

    pub fn is_deinitialized(&self) -> bool {
        matches!(self, Resolution::Deinitialized { .. })
    }

    /// 値を取得する
    pub fn value(&self) -> Option<&ResolvedValue> {
        match self {
            Resolution::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// 値を得られなかった理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// その名前の変数はこの地点で見えない
    NoSuchVariable,
    /// 関数のデバッグ情報がない
    NoDebugInfo,
    /// 間接参照のポインタがnull
    NullIndirection,
    /// メモリを読めなかった
    ReadFailed { address: u64 },
    /// レジスタを読めなかった
    RegisterUnavailable { register: u16 },
    /// レジスタを読むための物理フレームがない
    NoPhysicalFrame,
    /// コンテキスト相対の場所だがフレームにコンテキストがない
    NoAsyncContext,
    /// 格納場所が不明
    UnknownLocation,
    /// サンクの呼び出し元が論理スタックにない
    ThunkWithoutCaller,
}

impl NotFoundReason {
    /// 局所的な失敗の分類
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            NotFoundReason::NoSuchVariable | NotFoundReason::ThunkWithoutCaller => None,
            NotFoundReason::NoDebugInfo | NotFoundReason::UnknownLocation => {
                Some(FailureKind::MetadataMissing)
            }
            NotFoundReason::NullIndirection
            | NotFoundReason::ReadFailed { .. }
            | NotFoundReason::RegisterUnavailable { .. }
            | NotFoundReason::NoPhysicalFrame
            | NotFoundReason::NoAsyncContext => Some(FailureKind::MemoryReadFailure),
        }
    }
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundReason::NoSuchVariable => write!(f, "no variable with that name in scope"),
            NotFoundReason::NoDebugInfo => write!(f, "no debug information for this frame"),
            NotFoundReason::NullIndirection => write!(f, "indirect value pointer is null"),
            NotFoundReason::ReadFailed { address } => {
                write!(f, "failed to read memory at 0x{:x}", address)
            }
            NotFoundReason::RegisterUnavailable { register } => match register_name(*register) {
                Some(name) => write!(f, "register {} is unavailable", name),
                None => write!(f, "register {} is unavailable", register),
            },
            NotFoundReason::NoPhysicalFrame => write!(f, "frame has no registers"),
            NotFoundReason::NoAsyncContext => write!(f, "frame has no async context"),
            NotFoundReason::UnknownLocation => write!(f, "variable location is unknown"),
            NotFoundReason::ThunkWithoutCaller => write!(f, "thunk has no caller frame"),
        }
    }
}

/// 読み出した値
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedValue {
    pub name: String,
    pub type_name: Option<String>,
    pub location: SlotLocation,
    /// 値の読み出し元アドレス（レジスタ値ならNone）
    pub address: Option<u64>,
    /// リトルエンディアンの生バイト列
    pub bytes: Vec<u8>,
    /// 実際に値を読んだ論理フレーム（サンクからの転送後）
    pub frame_index: usize,
}

impl ResolvedValue {
    /// 8バイト以下の値を符号なし整数として解釈する
    pub fn unsigned(&self) -> Option<u64> {
        if self.bytes.is_empty() || self.bytes.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..self.bytes.len()].copy_from_slice(&self.bytes);
        Some(u64::from_le_bytes(buf))
    }
}

impl fmt::Display for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {} = ", self.type_name.as_deref().unwrap_or("?"), self.name)?;
        match self.unsigned() {
            Some(value) => write!(f, "0x{:x}", value)?,
            None => {
                write!(f, "{{")?;
                for (i, byte) in self.bytes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, "}}")?;
            }
        }
        Ok(())
    }
}

/// 変数リゾルバ
///
/// 1回の停止の間だけ使います。生成時の停止世代と現在の世代が食い違ったら
/// 結果を捨てて [`ResolveError::Cancelled`] を返します。
pub struct VariableResolver<'a, P: ?Sized, M: ?Sized> {
    process: &'a P,
    metadata: &'a M,
    cache: &'a LivenessCache,
    config: &'a ResolverConfig,
    stats: &'a Statistics,
    stop_id: StopId,
}

impl<'a, P, M> VariableResolver<'a, P, M>
where
    P: ProcessControl + ?Sized,
    M: MetadataProvider + ?Sized,
{
    /// リゾルバを作成する
    pub fn new(
        process: &'a P,
        metadata: &'a M,
        cache: &'a LivenessCache,
        config: &'a ResolverConfig,
        stats: &'a Statistics,
        stop_id: StopId,
    ) -> Self {
        Self {
            process,
            metadata,
            cache,
            config,
            stats,
            stop_id,
        }
    }

    /// 論理スタック上のフレームで変数を解決する
    pub fn resolve(
        &self,
        stack: &LogicalStack,
        index: usize,
        name: &str,
    ) -> Result<Resolution, ResolveError> {
        self.ensure_current()?;

        let resolution = match self.target_frame(stack, index)? {
            Ok(frame) => self.resolve_in(frame, name)?,
            Err(reason) => Resolution::NotFound(reason),
        };

        self.record(&resolution);
        Ok(resolution)
    }

    /// フレームで見えるすべての変数を解決する（宣言順）
    pub fn resolve_all(
        &self,
        stack: &LogicalStack,
        index: usize,
    ) -> Result<Vec<(String, Resolution)>, ResolveError> {
        self.ensure_current()?;

        let frame = match self.target_frame(stack, index)? {
            Ok(frame) => frame,
            Err(_) => return Ok(Vec::new()),
        };
        let Some(facts) = self.facts(frame) else {
            return Ok(Vec::new());
        };
        let Some(function) = facts.metadata() else {
            return Ok(Vec::new());
        };

        let pc = frame.lookup_pc();
        let mut names: Vec<&str> = Vec::new();
        for slot in &function.slots {
            if !names.contains(&slot.name.as_str()) && function.find_slot(&slot.name, pc).is_some()
            {
                names.push(&slot.name);
            }
        }

        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let resolution = self.resolve_in(frame, name)?;
            self.record(&resolution);
            results.push((name.to_string(), resolution));
        }
        Ok(results)
    }

    fn ensure_current(&self) -> Result<(), ResolveError> {
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

    fn record(&self, resolution: &Resolution) {
        match resolution {
            Resolution::Value(_) => self.stats.record_value(),
            Resolution::Deinitialized { .. } => self.stats.record_deinitialized(),
            Resolution::NotFound(_) => self.stats.record_not_found(),
        }
    }

    /// 変数を読むフレームを決める（サンクは次の物理フレームへ転送する）
    fn target_frame<'s>(
        &self,
        stack: &'s LogicalStack,
        index: usize,
    ) -> Result<std::result::Result<&'s LogicalFrame, NotFoundReason>, ResolveError> {
        let mut frame = stack
            .get(index)
            .ok_or(ResolveError::FrameOutOfRange(index))?;

        while frame.kind == FrameKind::Thunk {
            match stack.next_physical(frame.index) {
                Some(next) => {
                    trace!(from = frame.index, to = next.index, "redirecting thunk frame");
                    frame = next;
                }
                None => return Ok(Err(NotFoundReason::ThunkWithoutCaller)),
            }
        }

        Ok(Ok(frame))
    }

    fn facts(&self, frame: &LogicalFrame) -> Option<std::sync::Arc<FunctionFacts>> {
        let id = frame
            .function
            .or_else(|| self.metadata.function_at(frame.lookup_pc()))?;
        Some(self.cache.facts(self.metadata, id))
    }

    fn resolve_in(&self, frame: &LogicalFrame, name: &str) -> Result<Resolution, ResolveError> {
        let Some(facts) = self.facts(frame) else {
            return Ok(Resolution::NotFound(NotFoundReason::NoDebugInfo));
        };
        let Some(function) = facts.metadata() else {
            return Ok(Resolution::NotFound(NotFoundReason::NoDebugInfo));
        };

        let pc = frame.lookup_pc();
        let Some(slot) = function.find_slot(name, pc) else {
            return Ok(Resolution::NotFound(NotFoundReason::NoSuchVariable));
        };

        let location = match facts.lookup(pc, slot.id) {
            Liveness::Unavailable => {
                debug!(variable = name, pc = format_args!("0x{:x}", pc), "variable is deinitialized");
                return Ok(Resolution::Deinitialized {
                    type_name: slot.type_name.clone(),
                });
            }
            Liveness::Available(location) => location,
        };

        let resolution = match self.fetch(frame, slot, location) {
            Ok((address, bytes)) => Resolution::Value(ResolvedValue {
                name: slot.name.clone(),
                type_name: slot.type_name.clone(),
                location,
                address,
                bytes,
                frame_index: frame.index,
            }),
            Err(reason) => {
                debug!(variable = name, %reason, "variable value unavailable");
                Resolution::NotFound(reason)
            }
        };

        // 読み取り中に再開していたら、その値は今回の停止のものではない
        self.ensure_current()?;
        Ok(resolution)
    }

    /// 格納場所から値を読む
    fn fetch(
        &self,
        frame: &LogicalFrame,
        slot: &VariableSlot,
        location: SlotLocation,
    ) -> std::result::Result<(Option<u64>, Vec<u8>), NotFoundReason> {
        let size = slot
            .byte_size
            .unwrap_or(DEFAULT_VALUE_SIZE)
            .min(self.config.max_value_bytes) as usize;

        let address = match location {
            SlotLocation::Register(register) => {
                let value = self.read_register(frame, register)?;
                if slot.kind == StorageKind::Immediate {
                    let bytes = value.to_le_bytes();
                    return Ok((None, bytes[..size.min(bytes.len())].to_vec()));
                }
                // レジスタが値へのポインタを持っている
                return self.read_indirect(value, size);
            }
            SlotLocation::FrameOffset(offset) => frame.frame_base.wrapping_add_signed(offset),
            SlotLocation::ContextOffset(offset) => frame
                .context()
                .ok_or(NotFoundReason::NoAsyncContext)?
                .wrapping_add_signed(offset),
            SlotLocation::Address(address) => address,
            SlotLocation::Unknown => return Err(NotFoundReason::UnknownLocation),
        };

        match slot.kind {
            StorageKind::Immediate => self.read_bytes(address, size).map(|bytes| (Some(address), bytes)),
            StorageKind::Indirect => {
                let pointer = self
                    .process
                    .read_pointer(address)
                    .map_err(|_| NotFoundReason::ReadFailed { address })?;
                self.read_indirect(pointer, size)
            }
        }
    }

    fn read_indirect(
        &self,
        pointer: u64,
        size: usize,
    ) -> std::result::Result<(Option<u64>, Vec<u8>), NotFoundReason> {
        if pointer == 0 {
            return Err(NotFoundReason::NullIndirection);
        }
        self.read_bytes(pointer, size).map(|bytes| (Some(pointer), bytes))
    }

    fn read_bytes(&self, address: u64, size: usize) -> std::result::Result<Vec<u8>, NotFoundReason> {
        self.process
            .read_memory(address, size)
            .map_err(|_| NotFoundReason::ReadFailed { address })
    }

    fn read_register(
        &self,
        frame: &LogicalFrame,
        register: u16,
    ) -> std::result::Result<u64, NotFoundReason> {
        let physical = frame.physical.as_ref().ok_or(NotFoundReason::NoPhysicalFrame)?;
        self.process
            .read_register(physical, register)
            .map_err(|_| NotFoundReason::RegisterUnavailable { register })
    }
}
