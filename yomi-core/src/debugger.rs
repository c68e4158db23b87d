//! デバッガのメインロジック
//!
//! ptraceターゲット・DWARFメタデータ・生存区間キャッシュ・統計を束ね、
//! 停止ごとに [`StopSession`] を作ってリゾルバを呼び出します。

use crate::breakpoint::{Breakpoint, BreakpointId, BreakpointManager};
use crate::config::ResolverConfig;
use crate::errors::{ERR_DWARF_NOT_LOADED, ERR_NOT_ATTACHED, ERR_SYMBOL_NOT_FOUND};
use crate::liveness::LivenessCache;
use crate::resolver::Resolution;
use crate::session::StopSession;
use crate::stats::Statistics;
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use yomi_async::{FrameKind, LogicalStack};
use yomi_dwarf::{DwarfMetadata, MetadataProvider, SourceLocation, Symbol};
use yomi_target::{Process, ProcessControl, PtraceTarget, Registers, StopReason, ThreadHandle};

/// デバッガ
pub struct Debugger {
    /// デバッグ対象プロセス
    target: Option<PtraceTarget>,
    /// DWARF情報
    metadata: Option<DwarfMetadata>,
    /// 生存区間表のキャッシュ（プロセスの寿命と同じ）
    cache: Arc<LivenessCache>,
    stats: Arc<Statistics>,
    config: ResolverConfig,
    /// ブレークポイント管理
    breakpoint_manager: BreakpointManager,
    /// 操作対象のスレッド
    selected_thread: Option<ThreadHandle>,
}

impl Debugger {
    /// 新しいデバッガを作成する
    pub fn new(config: ResolverConfig) -> Self {
        let stats = Arc::new(Statistics::new());
        Self {
            target: None,
            metadata: None,
            cache: Arc::new(LivenessCache::new(Arc::clone(&stats))),
            stats,
            config,
            breakpoint_manager: BreakpointManager::new(),
            selected_thread: None,
        }
    }

    /// 設定を取得する
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// 統計を取得する
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// 生存区間キャッシュを取得する
    pub fn cache(&self) -> &LivenessCache {
        &self.cache
    }

    fn require_target(&self) -> Result<&PtraceTarget> {
        self.target
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))
    }

    fn require_metadata(&self) -> Result<&DwarfMetadata> {
        self.metadata
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_DWARF_NOT_LOADED))
    }

    /// ELFバイナリからDWARF情報を読み込む
    pub fn load_binary<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut metadata = DwarfMetadata::load(path)?;
        metadata.set_context_register(self.config.context_register);
        self.metadata = Some(metadata);
        self.cache.invalidate_all();
        self.apply_load_bias();
        Ok(())
    }

    /// 実行可能ファイルを起動してデバッグを開始する
    ///
    /// プロセスはexecve直後に停止状態で開始されます。
    /// 以前のプロセスで構築した生存区間表はすべて捨てます。
    pub fn spawn<P: AsRef<Path>>(&mut self, program: P, args: &[String]) -> Result<()> {
        let process = Process::spawn(program, args)?;
        info!(pid = process.pid(), "spawned process");
        self.install(process);
        Ok(())
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(&mut self, pid: i32) -> Result<()> {
        let process = Process::attach(pid)?;
        info!(pid, "attached to process");
        self.install(process);
        Ok(())
    }

    fn install(&mut self, process: Process) {
        self.selected_thread = Some(ThreadHandle(process.pid()));
        self.target = Some(PtraceTarget::new(process));
        self.breakpoint_manager = BreakpointManager::new();
        self.cache.invalidate_all();
        self.apply_load_bias();
    }

    /// PIEならロードベースをメタデータに反映する
    fn apply_load_bias(&mut self) {
        let (Some(target), Some(metadata)) = (self.target.as_ref(), self.metadata.as_mut()) else {
            return;
        };
        if !metadata.is_pie() {
            return;
        }
        match target.memory().get_base_address() {
            Ok(bias) => {
                debug!("load bias 0x{:x}", bias);
                metadata.set_load_bias(bias);
            }
            Err(e) => warn!("Failed to determine load bias: {}", e),
        }
    }

    /// ブレークポイントを設定する
    pub fn set_breakpoint(&mut self, address: u64) -> Result<BreakpointId> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        self.breakpoint_manager.add_and_enable(address, None, target)
    }

    /// シンボル名でブレークポイントを設定する
    pub fn set_breakpoint_by_symbol(&mut self, name: &str) -> Result<(BreakpointId, u64)> {
        let address = self
            .require_metadata()?
            .symbol_address(name)
            .ok_or_else(|| anyhow::anyhow!("{}: {}", ERR_SYMBOL_NOT_FOUND, name))?;
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        let id = self
            .breakpoint_manager
            .add_and_enable(address, Some(name.to_string()), target)?;
        Ok((id, address))
    }

    /// ブレークポイントを削除する
    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<()> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        self.breakpoint_manager.remove_and_disable(id, target)
    }

    /// すべてのブレークポイントを取得する
    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoint_manager.all()
    }

    fn registers(&self) -> Result<Registers> {
        Ok(Registers::new(self.current_thread()?.tid()))
    }

    /// プログラムカウンタを取得する
    pub fn get_pc(&self) -> Result<u64> {
        self.registers()?.get_pc()
    }

    /// PCにある有効なブレークポイントを一時的に外して1命令進める
    fn step_over_breakpoint(&mut self) -> Result<Option<StopReason>> {
        let pc = self.get_pc()?;
        if !self.breakpoint_manager.is_enabled_at(pc) {
            return Ok(None);
        }

        let target = self
            .target
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        self.breakpoint_manager.disable_at(pc, target)?;
        let reason = target.process().step();
        self.breakpoint_manager.enable_at(pc, target)?;
        reason.map(Some)
    }

    /// プロセスを実行継続して停止イベントを待機する
    ///
    /// ブレークポイントで止まった場合はPCをINT3の位置に戻します。
    pub fn continue_and_wait(&mut self) -> Result<StopReason> {
        if let Some(reason) = self.step_over_breakpoint()? {
            if reason != StopReason::Step {
                return Ok(reason);
            }
        }

        let reason = self.require_target()?.process().continue_and_wait()?;
        if reason == StopReason::Breakpoint {
            let registers = self.registers()?;
            let pc = registers.get_pc()?;
            let hit = pc.wrapping_sub(1);
            if self.breakpoint_manager.is_enabled_at(hit) {
                registers.set_pc(hit)?;
            }
        }
        Ok(reason)
    }

    /// 1命令だけ実行する
    pub fn step(&mut self) -> Result<StopReason> {
        if let Some(reason) = self.step_over_breakpoint()? {
            return Ok(reason);
        }
        self.require_target()?.process().step()
    }

    /// 停止中のスレッド一覧を取得する
    pub fn threads(&self) -> Result<Vec<ThreadHandle>> {
        self.require_target()?.stopped_threads()
    }

    /// 操作対象のスレッドを選ぶ
    pub fn select_thread(&mut self, tid: i32) -> Result<()> {
        let thread = ThreadHandle(tid);
        if !self.threads()?.contains(&thread) {
            return Err(anyhow::anyhow!("No such thread: {}", tid));
        }
        self.selected_thread = Some(thread);
        Ok(())
    }

    /// 操作対象のスレッド
    pub fn current_thread(&self) -> Result<ThreadHandle> {
        self.selected_thread
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))
    }

    /// 現在の停止でセッションを開始する
    pub fn session(&self) -> Result<StopSession<'_, PtraceTarget, DwarfMetadata>> {
        Ok(StopSession::new(
            self.require_target()?,
            self.require_metadata()?,
            &self.cache,
            &self.config,
            &self.stats,
        ))
    }

    /// 選択中スレッドの論理スタックを取得する
    pub fn backtrace(&self) -> Result<LogicalStack> {
        let thread = self.current_thread()?;
        Ok(self.session()?.logical_stack(thread)?)
    }

    /// 論理フレームの変数を解決する
    pub fn resolve(&self, frame: usize, name: &str) -> Result<Resolution> {
        let session = self.session()?;
        let stack = session.logical_stack(self.current_thread()?)?;
        Ok(session.resolve(&stack, frame, name)?)
    }

    /// 論理フレームで見えるすべての変数を解決する
    pub fn resolve_all(&self, frame: usize) -> Result<Vec<(String, Resolution)>> {
        let session = self.session()?;
        let stack = session.logical_stack(self.current_thread()?)?;
        Ok(session.resolve_all(&stack, frame)?)
    }

    /// 物理フレームを分類する
    pub fn classify(&self, frame: usize) -> Result<FrameKind> {
        let target = self.require_target()?;
        let frames = target.physical_frames(self.current_thread()?)?;
        let physical = frames
            .get(frame)
            .ok_or_else(|| anyhow::anyhow!("No physical frame #{}", frame))?;
        Ok(self.session()?.classify(physical))
    }

    /// アドレスのソース位置を取得する
    pub fn source_location(&self, addr: u64) -> Option<SourceLocation> {
        self.metadata.as_ref()?.source_location(addr)
    }

    /// パターンにマッチするシンボルを検索する
    pub fn find_symbols(&self, pattern: &str) -> Vec<Symbol> {
        self.metadata
            .as_ref()
            .map(|metadata| {
                metadata
                    .symbols()
                    .find_symbols(pattern)
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 統計をJSONで取得する
    pub fn statistics_json(&self) -> Result<String> {
        self.stats.to_json()
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}
