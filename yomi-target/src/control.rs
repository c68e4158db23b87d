//! プロセス制御インターフェース
//!
//! リゾルバはこのトレイトを通してのみデバッグ対象に触れます。
//! すべての読み取りは独立に失敗しうるものとして扱います。

use crate::{RegisterSnapshot, Result, StopId, ThreadHandle};

/// ポインタサイズ（x86-64）
pub const POINTER_SIZE: u64 = 8;

/// 物理スタックフレーム
///
/// 停止のたびにプロセス制御層から取り直す一時的な値です。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalFrame {
    /// 所属スレッド
    pub thread: ThreadHandle,
    /// 物理スタック上の位置（0 = 最内）
    pub index: usize,
    /// プログラムカウンタ
    pub pc: u64,
    /// フレームベース（RBP）
    pub frame_base: u64,
    /// DWARF番号付けのレジスタ値
    pub registers: RegisterSnapshot,
}

/// プロセス制御層
pub trait ProcessControl {
    /// メモリを読み取る
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// フレームのレジスタ値を読み取る（DWARFレジスタ番号）
    fn read_register(&self, frame: &PhysicalFrame, reg: u16) -> Result<u64>;

    /// 停止中のスレッドを列挙する
    fn stopped_threads(&self) -> Result<Vec<ThreadHandle>>;

    /// スレッドの物理スタックを取得する
    fn physical_frames(&self, thread: ThreadHandle) -> Result<Vec<PhysicalFrame>>;

    /// 現在の停止世代を取得する
    fn stop_id(&self) -> StopId;

    /// ポインタ1個分を読み取る（リトルエンディアン）
    fn read_pointer(&self, addr: u64) -> Result<u64> {
        let bytes = self.read_memory(addr, POINTER_SIZE as usize)?;
        let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!("Short pointer read at 0x{:x}: {} bytes", addr, bytes.len())
        })?;
        Ok(u64::from_le_bytes(array))
    }
}

impl<T: ProcessControl + ?Sized> ProcessControl for &T {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        (**self).read_memory(addr, len)
    }

    fn read_register(&self, frame: &PhysicalFrame, reg: u16) -> Result<u64> {
        (**self).read_register(frame, reg)
    }

    fn stopped_threads(&self) -> Result<Vec<ThreadHandle>> {
        (**self).stopped_threads()
    }

    fn physical_frames(&self, thread: ThreadHandle) -> Result<Vec<PhysicalFrame>> {
        (**self).physical_frames(thread)
    }

    fn stop_id(&self) -> StopId {
        (**self).stop_id()
    }
}
