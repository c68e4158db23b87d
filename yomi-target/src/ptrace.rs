//! ptraceバックエンドのプロセス制御

use crate::{
    walk_frame_pointers, BreakpointShadow, Memory, PhysicalFrame, Process, ProcessControl,
    Registers, Result, StopId, ThreadHandle,
};

/// 物理スタック巻き戻しの既定の最大深さ
const DEFAULT_UNWIND_DEPTH: usize = 256;

/// ptraceで制御する実プロセス
pub struct PtraceTarget {
    process: Process,
    memory: Memory,
    breakpoints: BreakpointShadow,
    max_unwind_depth: usize,
}

impl PtraceTarget {
    /// プロセスからターゲットを作成する
    pub fn new(process: Process) -> Self {
        let memory = Memory::new(process.pid());
        Self {
            process,
            memory,
            breakpoints: BreakpointShadow::new(),
            max_unwind_depth: DEFAULT_UNWIND_DEPTH,
        }
    }

    /// プロセスを取得する
    pub fn process(&self) -> &Process {
        &self.process
    }

    /// メモリアクセスを取得する
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// 挿入済みブレークポイントの表を取得する
    pub fn breakpoints(&self) -> &BreakpointShadow {
        &self.breakpoints
    }

    /// INT3を挿入する
    pub fn insert_breakpoint(&self, address: u64) -> Result<()> {
        self.breakpoints.insert(&self.memory, address)
    }

    /// INT3を取り除く
    pub fn remove_breakpoint(&self, address: u64) -> Result<()> {
        self.breakpoints.remove(&self.memory, address)
    }

    /// メインスレッドのレジスタアクセスを取得する
    pub fn registers(&self) -> Registers {
        Registers::new(self.process.pid())
    }
}

impl ProcessControl for PtraceTarget {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        // 挿入したINT3は呼び出し元に見せない
        let mut bytes = self.memory.read(addr, len)?;
        self.breakpoints.unpatch(addr, &mut bytes);
        Ok(bytes)
    }

    fn read_register(&self, frame: &PhysicalFrame, reg: u16) -> Result<u64> {
        // 最内フレームだけは生のレジスタを読み直す
        if frame.index == 0 {
            return Registers::new(frame.thread.tid()).read_dwarf(reg);
        }
        frame.registers.get(reg).ok_or_else(|| {
            anyhow::anyhow!(
                "Register {} not recovered for frame #{} of {}",
                reg,
                frame.index,
                frame.thread
            )
        })
    }

    fn stopped_threads(&self) -> Result<Vec<ThreadHandle>> {
        self.process.threads()
    }

    fn physical_frames(&self, thread: ThreadHandle) -> Result<Vec<PhysicalFrame>> {
        let top = Registers::new(thread.tid()).snapshot()?;
        Ok(walk_frame_pointers(thread, top, self.max_unwind_depth, |addr| {
            self.memory.read_u64(addr)
        }))
    }

    fn stop_id(&self) -> StopId {
        self.process.stop_id()
    }
}
