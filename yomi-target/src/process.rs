//! プロセス制御機能

use crate::{Result, StopId, ThreadHandle};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use std::ffi::CString;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// ブレークポイントヒット（SIGTRAP）
    Breakpoint,
    /// ステップ実行完了（SIGTRAP）
    Step,
    /// シグナル受信
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// その他の停止
    Other,
}

/// デバッグ対象のプロセス
pub struct Process {
    pid: nix::unistd::Pid,
    /// 再開のたびに進む停止世代
    stop_id: AtomicU64,
}

impl Process {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// forkした子でPTRACE_TRACEMEを設定してからexecveします。
    /// execve直後の停止から1命令進め、メモリマッピングが初期化された状態で返します。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        use nix::sys::ptrace;
        use nix::unistd::{execve, fork, ForkResult};

        let program_path = program
            .as_ref()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid program path"))?;
        let program_cstring = CString::new(program_path)?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str())?);
        }

        // 環境変数は親プロセスから継承
        let env: Vec<CString> = std::env::vars()
            .map(|(key, val)| {
                CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from)
            })
            .collect::<Result<Vec<_>>>()?;

        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => {}
                    status => {
                        return Err(anyhow::anyhow!(
                            "Unexpected wait status after execve: {:?}",
                            status
                        ))
                    }
                }

                ptrace::step(child, None)?;
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => Ok(Self {
                        pid: child,
                        stop_id: AtomicU64::new(0),
                    }),
                    status => Err(anyhow::anyhow!(
                        "Unexpected wait status after step: {:?}",
                        status
                    )),
                }
            }
            ForkResult::Child => {
                ptrace::traceme()?;
                execve(&program_cstring, &cstring_args, &env)?;
                unreachable!("execve failed");
            }
        }
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = nix::unistd::Pid::from_raw(pid);
        nix::sys::ptrace::attach(pid)?;
        waitpid(pid, None)?;
        Ok(Self {
            pid,
            stop_id: AtomicU64::new(0),
        })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// 現在の停止世代を取得する
    pub fn stop_id(&self) -> StopId {
        StopId(self.stop_id.load(Ordering::Acquire))
    }

    /// 実行再開を記録する
    ///
    /// 以前の停止で取得したフレームやコンテキストはこれ以降すべて無効です。
    fn mark_resumed(&self) {
        self.stop_id.fetch_add(1, Ordering::AcqRel);
    }

    /// /proc/pid/task からスレッド一覧を取得する
    pub fn threads(&self) -> Result<Vec<ThreadHandle>> {
        let task_dir = format!("/proc/{}/task", self.pid);
        let mut threads = Vec::new();

        for entry in std::fs::read_dir(&task_dir)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", task_dir, e))?
        {
            let entry = entry?;
            if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                threads.push(ThreadHandle(tid));
            }
        }

        threads.sort();
        Ok(threads)
    }

    /// プロセスを実行継続して停止イベントを待機する
    pub fn continue_and_wait(&self) -> Result<StopReason> {
        self.mark_resumed();
        nix::sys::ptrace::cont(self.pid, None)?;
        self.wait(StopReason::Breakpoint)
    }

    /// 1命令だけ実行して停止する（ステップイン）
    pub fn step(&self) -> Result<StopReason> {
        self.mark_resumed();
        nix::sys::ptrace::step(self.pid, None)?;
        self.wait(StopReason::Step)
    }

    /// 停止イベントを待ち、SIGTRAPを `on_trap` として解釈する
    fn wait(&self, on_trap: StopReason) -> Result<StopReason> {
        match waitpid(self.pid, None)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => Ok(on_trap),
            WaitStatus::Stopped(_, signal) => Ok(StopReason::Signal(signal)),
            WaitStatus::Exited(_, code) => Ok(StopReason::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Ok(StopReason::Signal(signal)),
            _ => Ok(StopReason::Other),
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = nix::sys::ptrace::detach(self.pid, None);
    }
}
