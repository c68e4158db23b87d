//! ソフトウェアブレークポイント（INT3）
//!
//! 書き換えた命令バイトの元の値を覚えておき、メモリ読み取りの結果から
//! INT3を取り除けるようにします。逆アセンブルが書き換え後のコードを見ないためです。

use crate::{Memory, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::trace;

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// 挿入済みブレークポイントの元バイト表
#[derive(Debug, Default)]
pub struct BreakpointShadow {
    /// アドレス -> 書き換え前のバイト
    original: RwLock<BTreeMap<u64, u8>>,
}

impl BreakpointShadow {
    /// 空の表を作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 命令をINT3で置き換える（挿入済みなら何もしない）
    pub fn insert(&self, memory: &Memory, address: u64) -> Result<()> {
        let mut original = self.original.write();
        if original.contains_key(&address) {
            return Ok(());
        }

        let byte = memory.read_u8(address)?;
        memory.write_u8(address, INT3_OPCODE)?;
        original.insert(address, byte);
        trace!("inserted int3 at 0x{:x} (was 0x{:02x})", address, byte);
        Ok(())
    }

    /// 元の命令バイトを書き戻す
    pub fn remove(&self, memory: &Memory, address: u64) -> Result<()> {
        let mut original = self.original.write();
        if let Some(&byte) = original.get(&address) {
            memory.write_u8(address, byte)?;
            original.remove(&address);
        }
        Ok(())
    }

    /// アドレスにINT3が挿入されているか
    pub fn contains(&self, address: u64) -> bool {
        self.original.read().contains_key(&address)
    }

    /// `address` から読んだバイト列の中のINT3を元に戻す
    pub fn unpatch(&self, address: u64, bytes: &mut [u8]) {
        let end = address.saturating_add(bytes.len() as u64);
        for (&addr, &byte) in self.original.read().range(address..end) {
            bytes[(addr - address) as usize] = byte;
        }
    }

    /// 挿入済みのアドレス一覧
    pub fn addresses(&self) -> Vec<u64> {
        self.original.read().keys().copied().collect()
    }

    /// 表だけを差し替える（プロセスに触れない）
    #[cfg(test)]
    fn record(&self, address: u64, byte: u8) {
        self.original.write().insert(address, byte);
    }
}
