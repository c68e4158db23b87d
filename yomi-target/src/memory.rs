//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write as _};

/// EIO（未マッピング領域の読み取り）
const EIO: i32 = 5;

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memを使用し、EIOの場合はPTRACE_PEEKDATAにフォールバックします。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) if e.raw_os_error() == Some(EIO) => self.read_via_ptrace(addr, size),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read {} bytes at 0x{:x}: {}",
                size,
                addr,
                e
            )),
        }
    }

    /// /proc/pid/mem経由でメモリを読み取る
    fn read_via_proc_mem(&self, addr: u64, size: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr as usize + offset) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to read via ptrace at 0x{:x}: {}",
                    addr as usize + offset,
                    e
                )
            })?;

            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(word_size);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        Ok(data)
    }

    /// メモリにデータを書き込む
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;
        file.write_all(data).map_err(|e| {
            anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e)
        })?;

        Ok(())
    }

    /// u64値を読み取る（リトルエンディアン）
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, 8)?;
        let array: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Short read at 0x{:x}", addr))?;
        Ok(u64::from_le_bytes(array))
    }

    /// u8値を読み取る
    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        self.read(addr, 1)?
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Empty read at 0x{:x}", addr))
    }

    /// u8値を書き込む
    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    /// 実行可能ファイルのロードベースを取得する
    ///
    /// PIEの場合、最初の実行可能セグメントの開始アドレスからファイルオフセットを引いた値が
    /// シンボルアドレスに加算すべきバイアスになります。
    pub fn get_base_address(&self) -> Result<u64> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;

        // フォーマット: "address perms offset dev inode pathname"
        for line in BufReader::new(file).lines() {
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 || parts[1].chars().nth(2) != Some('x') {
                continue;
            }

            let Some((start, _)) = parts[0].split_once('-') else {
                continue;
            };
            let start = u64::from_str_radix(start, 16)
                .map_err(|e| anyhow::anyhow!("Failed to parse base address: {}", e))?;
            let offset = u64::from_str_radix(parts[2], 16)
                .map_err(|e| anyhow::anyhow!("Failed to parse segment offset: {}", e))?;

            return Ok(start - offset);
        }

        Err(anyhow::anyhow!("Could not find executable segment in memory mappings"))
    }
}
