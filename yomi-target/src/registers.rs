//! レジスタアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::collections::BTreeMap;

/// x86-64 のDWARFレジスタ番号と名前の対応
const DWARF_REGISTERS: [(u16, &str); 17] = [
    (0, "rax"),
    (1, "rdx"),
    (2, "rcx"),
    (3, "rbx"),
    (4, "rsi"),
    (5, "rdi"),
    (6, "rbp"),
    (7, "rsp"),
    (8, "r8"),
    (9, "r9"),
    (10, "r10"),
    (11, "r11"),
    (12, "r12"),
    (13, "r13"),
    (14, "r14"),
    (15, "r15"),
    (16, "rip"),
];

/// RBPのDWARF番号
pub const RBP: u16 = 6;
/// RSPのDWARF番号
pub const RSP: u16 = 7;
/// RIPのDWARF番号（戻りアドレス列）
pub const RIP: u16 = 16;

/// レジスタ名からDWARF番号を取得する
pub fn dwarf_register(name: &str) -> Option<u16> {
    let name = name.trim().trim_start_matches('%').to_ascii_lowercase();
    DWARF_REGISTERS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(num, _)| *num)
}

/// DWARF番号からレジスタ名を取得する
pub fn register_name(num: u16) -> Option<&'static str> {
    DWARF_REGISTERS
        .iter()
        .find(|(n, _)| *n == num)
        .map(|(_, name)| *name)
}

/// DWARF番号付けのレジスタ値
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    values: BTreeMap<u16, u64>,
}

impl RegisterSnapshot {
    /// 空のスナップショットを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// レジスタ値を取得する
    pub fn get(&self, reg: u16) -> Option<u64> {
        self.values.get(&reg).copied()
    }

    /// レジスタ値を設定する
    pub fn set(&mut self, reg: u16, value: u64) {
        self.values.insert(reg, value);
    }

    /// レジスタ値を設定したスナップショットを返す
    pub fn with(mut self, reg: u16, value: u64) -> Self {
        self.set(reg, value);
        self
    }

    /// プログラムカウンタ
    pub fn pc(&self) -> Option<u64> {
        self.get(RIP)
    }

    /// ptraceのレジスタ構造体から構築する
    pub fn from_user_regs(regs: &nix::libc::user_regs_struct) -> Self {
        let values = [
            regs.rax, regs.rdx, regs.rcx, regs.rbx, regs.rsi, regs.rdi, regs.rbp, regs.rsp,
            regs.r8, regs.r9, regs.r10, regs.r11, regs.r12, regs.r13, regs.r14, regs.r15,
            regs.rip,
        ];
        Self {
            values: values
                .iter()
                .enumerate()
                .map(|(num, value)| (num as u16, *value))
                .collect(),
        }
    }
}

/// レジスタ情報
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する（tid単位）
    pub fn new(tid: i32) -> Self {
        Self {
            pid: Pid::from_raw(tid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<nix::libc::user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.pid)?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: nix::libc::user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// 全レジスタのスナップショットを取得する
    pub fn snapshot(&self) -> Result<RegisterSnapshot> {
        Ok(RegisterSnapshot::from_user_regs(&self.read()?))
    }

    /// DWARF番号でレジスタを読み取る
    pub fn read_dwarf(&self, reg: u16) -> Result<u64> {
        self.snapshot()?
            .get(reg)
            .ok_or_else(|| anyhow::anyhow!("Unsupported DWARF register {}", reg))
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        let regs = self.read()?;
        Ok(regs.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }
}
