//! メモリイメージを保持するスナップショットプロセス
//!
//! 停止時点のメモリ領域とスレッドごとの物理フレームを保持し、
//! [`ProcessControl`] として振る舞います。クラッシュダンプの再生やテストで使います。

use crate::{PhysicalFrame, ProcessControl, RegisterSnapshot, Result, StopId, ThreadHandle};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 読み取り回数による再開を行わないことを表す値
const NEVER: usize = usize::MAX;

/// スナップショットプロセス
#[derive(Default)]
pub struct SnapshotProcess {
    /// 開始アドレス -> 連続したバイト列
    regions: RwLock<BTreeMap<u64, Vec<u8>>>,
    threads: RwLock<BTreeMap<ThreadHandle, Vec<PhysicalFrame>>>,
    /// 読み取りを失敗させるアドレス
    failing: RwLock<BTreeSet<u64>>,
    stop_id: AtomicU64,
    reads: AtomicUsize,
    resume_after: AtomicUsize,
}

impl SnapshotProcess {
    /// 空のスナップショットを作成する
    pub fn new() -> Self {
        Self {
            resume_after: AtomicUsize::new(NEVER),
            ..Self::default()
        }
    }

    /// バイト列を書き込む
    ///
    /// 既存の領域と重なる場合は、その領域の中身を上書きします。
    pub fn write_bytes(&self, addr: u64, data: &[u8]) {
        let mut regions = self.regions.write();

        if let Some((&start, bytes)) = regions.range_mut(..=addr).next_back() {
            let offset = (addr - start) as usize;
            if offset + data.len() <= bytes.len() {
                bytes[offset..offset + data.len()].copy_from_slice(data);
                return;
            }
            if offset <= bytes.len() {
                bytes.truncate(offset);
                bytes.extend_from_slice(data);
                return;
            }
        }

        regions.insert(addr, data.to_vec());
    }

    /// ポインタ値を書き込む（リトルエンディアン）
    pub fn write_pointer(&self, addr: u64, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    /// スレッドを最内フレームから順に登録する
    ///
    /// 各フレームの `thread` と `index` は登録順に振り直されます。
    pub fn add_thread(&self, thread: ThreadHandle, frames: Vec<PhysicalFrame>) {
        let frames = frames
            .into_iter()
            .enumerate()
            .map(|(index, frame)| PhysicalFrame {
                thread,
                index,
                ..frame
            })
            .collect();
        self.threads.write().insert(thread, frames);
    }

    /// 指定アドレスを含む読み取りを失敗させる
    pub fn fail_reads_at(&self, addr: u64) {
        self.failing.write().insert(addr);
    }

    /// 実行再開をシミュレートする（停止世代を進める）
    pub fn resume(&self) {
        self.stop_id.fetch_add(1, Ordering::AcqRel);
    }

    /// `count` 回の読み取りの後に実行再開したことにする
    pub fn resume_after_reads(&self, count: usize) {
        self.resume_after
            .store(self.reads.load(Ordering::Acquire) + count, Ordering::Release);
    }

    /// これまでのメモリ読み取り回数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    fn note_read(&self) {
        let done = self.reads.fetch_add(1, Ordering::AcqRel) + 1;
        if done == self.resume_after.load(Ordering::Acquire) {
            self.resume_after.store(NEVER, Ordering::Release);
            self.resume();
        }
    }
}

/// 単純なフレームを作成する補助関数
pub fn frame(pc: u64, frame_base: u64, registers: RegisterSnapshot) -> PhysicalFrame {
    PhysicalFrame {
        thread: ThreadHandle(0),
        index: 0,
        pc,
        frame_base,
        registers,
    }
}

impl ProcessControl for SnapshotProcess {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.note_read();

        let end = addr
            .checked_add(len as u64)
            .ok_or_else(|| anyhow::anyhow!("Read of {} bytes at 0x{:x} overflows", len, addr))?;
        if self.failing.read().range(addr..end).next().is_some() {
            return Err(anyhow::anyhow!("Injected read failure at 0x{:x}", addr));
        }

        let regions = self.regions.read();
        let (start, bytes) = regions
            .range(..=addr)
            .next_back()
            .ok_or_else(|| anyhow::anyhow!("Address 0x{:x} is not mapped", addr))?;
        let offset = (addr - start) as usize;
        if offset + len > bytes.len() {
            return Err(anyhow::anyhow!(
                "Read of {} bytes at 0x{:x} leaves mapped region",
                len,
                addr
            ));
        }

        Ok(bytes[offset..offset + len].to_vec())
    }

    fn read_register(&self, frame: &PhysicalFrame, reg: u16) -> Result<u64> {
        frame.registers.get(reg).ok_or_else(|| {
            anyhow::anyhow!(
                "Register {} unavailable in frame #{} of {}",
                reg,
                frame.index,
                frame.thread
            )
        })
    }

    fn stopped_threads(&self) -> Result<Vec<ThreadHandle>> {
        Ok(self.threads.read().keys().copied().collect())
    }

    fn physical_frames(&self, thread: ThreadHandle) -> Result<Vec<PhysicalFrame>> {
        self.threads
            .read()
            .get(&thread)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown thread: {}", thread))
    }

    fn stop_id(&self) -> StopId {
        StopId(self.stop_id.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RIP;

    #[test]
    fn test_read_written_pointer() {
        let process = SnapshotProcess::new();
        process.write_pointer(0x1000, 0xdead_beef);

        assert_eq!(process.read_pointer(0x1000).unwrap(), 0xdead_beef);
        assert_eq!(process.reads(), 1);
    }

    #[test]
    fn test_adjacent_writes_extend_region() {
        let process = SnapshotProcess::new();
        process.write_pointer(0x1000, 1);
        process.write_pointer(0x1008, 2);

        let bytes = process.read_memory(0x1000, 16).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(process.read_pointer(0x1008).unwrap(), 2);
    }

    #[test]
    fn test_unmapped_and_injected_failures() {
        let process = SnapshotProcess::new();
        process.write_pointer(0x1000, 1);
        process.fail_reads_at(0x1000);

        assert!(process.read_pointer(0x1000).is_err());
        assert!(process.read_pointer(0x9000).is_err());
    }

    #[test]
    fn test_resume_after_reads_bumps_stop_id() {
        let process = SnapshotProcess::new();
        process.write_pointer(0x1000, 1);
        process.resume_after_reads(2);

        process.read_pointer(0x1000).unwrap();
        assert_eq!(process.stop_id(), StopId(0));
        process.read_pointer(0x1000).unwrap();
        assert_eq!(process.stop_id(), StopId(1));
        process.read_pointer(0x1000).unwrap();
        assert_eq!(process.stop_id(), StopId(1));
    }

    #[test]
    fn test_thread_frames_are_renumbered() {
        let process = SnapshotProcess::new();
        let thread = ThreadHandle(7);
        process.add_thread(
            thread,
            vec![
                frame(0x10, 0, RegisterSnapshot::new().with(RIP, 0x10)),
                frame(0x20, 0, RegisterSnapshot::new()),
            ],
        );

        let frames = process.physical_frames(thread).unwrap();
        assert_eq!(frames[1].index, 1);
        assert_eq!(frames[1].thread, thread);
        assert_eq!(process.read_register(&frames[0], RIP).unwrap(), 0x10);
        assert!(process.read_register(&frames[1], RIP).is_err());
        assert_eq!(process.stopped_threads().unwrap(), vec![thread]);
    }
}
