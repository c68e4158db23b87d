//! フレーム分類
//!
//! 物理フレームが通常フレーム・asyncファンクレット・サンクのどれかを判定します。
//! シンボル種別で決まらない場合は、コードを逆アセンブルしてタスク切り替えへの
//! 末尾ジャンプを探します。

use crate::config::ResolverConfig;
use crate::disasm::find_tail_jump_target;
use std::ops::Range;
use tracing::{debug, warn};
use yomi_async::FrameKind;
use yomi_dwarf::{MetadataProvider, SymbolKind};
use yomi_target::{PhysicalFrame, ProcessControl};

/// シンボル範囲として信用する最大バイト数
const MAX_SCAN_BYTES: u64 = 64 * 1024;

/// フレーム分類器
pub struct FrameClassifier<'a, P: ?Sized, M: ?Sized> {
    process: &'a P,
    metadata: &'a M,
    config: &'a ResolverConfig,
}

impl<'a, P, M> FrameClassifier<'a, P, M>
where
    P: ProcessControl + ?Sized,
    M: MetadataProvider + ?Sized,
{
    /// 分類器を作成する
    pub fn new(process: &'a P, metadata: &'a M, config: &'a ResolverConfig) -> Self {
        Self {
            process,
            metadata,
            config,
        }
    }

    /// 物理フレームを分類する
    ///
    /// 読み取りに失敗しても分類自体は失敗せず、`Normal` として扱います。
    pub fn classify(&self, frame: &PhysicalFrame) -> FrameKind {
        let pc = symbol_pc(frame);

        match self.metadata.symbol_kind(pc) {
            SymbolKind::Normal => FrameKind::Normal,
            SymbolKind::Thunk => FrameKind::Thunk,
            SymbolKind::AsyncEntry => self.async_funclet(frame),
            SymbolKind::Unknown => {
                if self.jumps_to_task_switch(frame) {
                    self.async_funclet(frame)
                } else {
                    FrameKind::Normal
                }
            }
        }
    }

    fn async_funclet(&self, frame: &PhysicalFrame) -> FrameKind {
        match self
            .process
            .read_register(frame, self.config.context_register)
        {
            Ok(context) => FrameKind::AsyncFunclet { context },
            Err(e) => {
                warn!(
                    thread = %frame.thread,
                    frame = frame.index,
                    "Cannot read async context register {}, treating frame as normal: {}",
                    self.config.context_register,
                    e
                );
                FrameKind::Normal
            }
        }
    }

    /// シンボルのコードがタスク切り替えへの末尾ジャンプで終わるかどうか
    fn jumps_to_task_switch(&self, frame: &PhysicalFrame) -> bool {
        let Some(target) = self.metadata.symbol_address(&self.config.task_switch_symbol) else {
            debug!(
                symbol = %self.config.task_switch_symbol,
                "Task switch symbol not found; skipping trampoline check"
            );
            return false;
        };

        let range = self.scan_range(frame);
        let code = match self
            .process
            .read_memory(range.start, (range.end - range.start) as usize)
        {
            Ok(code) => code,
            Err(e) => {
                warn!("Failed to read code at 0x{:x}: {}", range.start, e);
                return false;
            }
        };

        match find_tail_jump_target(&code, range.start) {
            Ok(found) => {
                debug!(
                    pc = format_args!("0x{:x}", frame.pc),
                    target = ?found,
                    "trampoline check"
                );
                found == Some(target)
            }
            Err(e) => {
                warn!("Failed to disassemble code at 0x{:x}: {}", range.start, e);
                false
            }
        }
    }

    fn scan_range(&self, frame: &PhysicalFrame) -> Range<u64> {
        let window = frame.pc..frame.pc.saturating_add(self.config.trampoline_window);
        match self.metadata.symbol_range(symbol_pc(frame)) {
            Some(range) if range.start < range.end && range.end - range.start <= MAX_SCAN_BYTES => {
                range
            }
            _ => window,
        }
    }
}

/// シンボル検索に使うPC（呼び出し元フレームは戻りアドレスなので1引く）
fn symbol_pc(frame: &PhysicalFrame) -> u64 {
    if frame.index > 0 {
        frame.pc.saturating_sub(1)
    } else {
        frame.pc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yomi_dwarf::StaticMetadata;
    use yomi_target::{frame, RegisterSnapshot, SnapshotProcess};

    const TASK_SWITCH: u64 = 0x2000;

    fn metadata() -> StaticMetadata {
        let mut metadata = StaticMetadata::new();
        metadata.add_symbol("main", 0x1000..0x1100, SymbolKind::Normal);
        metadata.add_symbol("$s4main3fooyyYaFTQ0_", 0x1100..0x1200, SymbolKind::AsyncEntry);
        metadata.add_symbol("$s4main1PPTW", 0x1200..0x1210, SymbolKind::Thunk);
        metadata.add_symbol("opaque", 0x1300..0x130c, SymbolKind::Unknown);
        metadata.add_symbol("swift_task_switch", TASK_SWITCH..0x2100, SymbolKind::Normal);
        metadata
    }

    fn registers() -> RegisterSnapshot {
        RegisterSnapshot::new().with(14, 0x9000)
    }

    #[test]
    fn test_symbol_kinds() {
        let process = SnapshotProcess::new();
        let metadata = metadata();
        let config = ResolverConfig::default();
        let classifier = FrameClassifier::new(&process, &metadata, &config);

        assert_eq!(
            classifier.classify(&frame(0x1010, 0, registers())),
            FrameKind::Normal
        );
        assert_eq!(
            classifier.classify(&frame(0x1110, 0, registers())),
            FrameKind::AsyncFunclet { context: 0x9000 }
        );
        assert_eq!(
            classifier.classify(&frame(0x1204, 0, registers())),
            FrameKind::Thunk
        );
    }

    #[test]
    fn test_missing_context_register() {
        let process = SnapshotProcess::new();
        let metadata = metadata();
        let config = ResolverConfig::default();
        let classifier = FrameClassifier::new(&process, &metadata, &config);

        assert_eq!(
            classifier.classify(&frame(0x1110, 0, RegisterSnapshot::new())),
            FrameKind::Normal
        );
    }

    #[test]
    fn test_return_address_uses_previous_byte() {
        let process = SnapshotProcess::new();
        let metadata = metadata();
        let config = ResolverConfig::default();
        let classifier = FrameClassifier::new(&process, &metadata, &config);

        // 戻りアドレスがサンクの直後を指している
        let mut caller = frame(0x1210, 0, registers());
        caller.index = 1;
        assert_eq!(classifier.classify(&caller), FrameKind::Thunk);
    }

    #[test]
    fn test_trampoline_fallback() {
        let process = SnapshotProcess::new();
        process.write_bytes(
            0x1300,
            &[
                0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, // mov rax, 1
                0xe9, 0xf4, 0x0c, 0x00, 0x00, // jmp 0x2000
            ],
        );
        let metadata = metadata();
        let config = ResolverConfig::default();
        let classifier = FrameClassifier::new(&process, &metadata, &config);

        assert_eq!(
            classifier.classify(&frame(0x1304, 0, registers())),
            FrameKind::AsyncFunclet { context: 0x9000 }
        );
    }

    #[test]
    fn test_trampoline_fallback_rejects_other_code() {
        let process = SnapshotProcess::new();
        process.write_bytes(
            0x1300,
            &[0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0x90, 0xc3],
        );
        let metadata = metadata();
        let config = ResolverConfig::default();
        let classifier = FrameClassifier::new(&process, &metadata, &config);

        assert_eq!(
            classifier.classify(&frame(0x1304, 0, registers())),
            FrameKind::Normal
        );
        // コードが読めない場合も通常フレーム
        assert_eq!(
            classifier.classify(&frame(0x5000, 0, registers())),
            FrameKind::Normal
        );
    }
}
