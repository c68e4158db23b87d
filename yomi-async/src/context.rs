//! asyncコンテキストレコード
//!
//! コンテキストはデバッグ対象のメモリ上にある片方向リストの1要素です。
//! ここで扱うのは読み出した値の写しであり、元のメモリを所有しません。

use crate::Result;
use serde::{Deserialize, Serialize};
use yomi_target::{ProcessControl, POINTER_SIZE};

/// コンテキストレコード内のフィールド配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextLayout {
    /// 呼び出し元コンテキストへのポインタのオフセット
    pub parent_offset: u64,
    /// 再開アドレスのオフセット
    pub resume_offset: u64,
}

impl ContextLayout {
    /// 2つのフィールドをまとめて読むのに必要なバイト数
    pub fn span(&self) -> u64 {
        self.parent_offset.max(self.resume_offset) + POINTER_SIZE
    }
}

impl Default for ContextLayout {
    fn default() -> Self {
        Self {
            parent_offset: 0,
            resume_offset: POINTER_SIZE,
        }
    }
}

/// asyncコンテキスト
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncContext {
    /// このレコードのアドレス
    pub address: u64,
    /// 呼び出し元（論理的な先行者）のコンテキスト
    pub parent: u64,
    /// 呼び出し元が再開するアドレス
    pub resume_address: u64,
}

impl AsyncContext {
    /// ターゲットメモリからコンテキストを読む
    ///
    /// 両フィールドを1回の読み取りで取得し、途中で値が変わった組み合わせを避けます。
    pub fn read<P>(process: &P, address: u64, layout: &ContextLayout) -> Result<Self>
    where
        P: ProcessControl + ?Sized,
    {
        let bytes = process.read_memory(address, layout.span() as usize)?;
        let field = |offset: u64| -> Result<u64> {
            let start = offset as usize;
            let word: [u8; 8] = bytes
                .get(start..start + POINTER_SIZE as usize)
                .and_then(|slice| slice.try_into().ok())
                .ok_or_else(|| anyhow::anyhow!("Short context read at 0x{:x}", address))?;
            Ok(u64::from_le_bytes(word))
        };

        Ok(Self {
            address,
            parent: field(layout.parent_offset)?,
            resume_address: field(layout.resume_offset)?,
        })
    }

    /// チェーンの末端かどうか
    pub fn is_root(&self) -> bool {
        self.parent == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yomi_target::SnapshotProcess;

    #[test]
    fn test_read_default_layout() {
        let process = SnapshotProcess::new();
        process.write_pointer(0x5000, 0x6000);
        process.write_pointer(0x5008, 0x4242);

        let context = AsyncContext::read(&process, 0x5000, &ContextLayout::default()).unwrap();
        assert_eq!(context.parent, 0x6000);
        assert_eq!(context.resume_address, 0x4242);
        assert!(!context.is_root());
        assert_eq!(process.reads(), 1);
    }

    #[test]
    fn test_read_swapped_layout() {
        let process = SnapshotProcess::new();
        process.write_pointer(0x5000, 0x4242);
        process.write_pointer(0x5008, 0);

        let layout = ContextLayout {
            parent_offset: 8,
            resume_offset: 0,
        };
        let context = AsyncContext::read(&process, 0x5000, &layout).unwrap();
        assert_eq!(context.resume_address, 0x4242);
        assert!(context.is_root());
    }

    #[test]
    fn test_read_unmapped_fails() {
        let process = SnapshotProcess::new();
        assert!(AsyncContext::read(&process, 0x5000, &ContextLayout::default()).is_err());
    }
}
