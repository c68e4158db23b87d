//! ブレークポイント管理

use crate::Result;
use std::collections::BTreeMap;
use yomi_target::PtraceTarget;

/// ブレークポイントID
pub type BreakpointId = usize;

/// ブレークポイント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub address: u64,
    /// 設定時に指定したシンボル名
    pub symbol: Option<String>,
    pub enabled: bool,
}

/// ブレークポイントマネージャ
///
/// 論理的なブレークポイントを番号付きで管理し、INT3の挿入と除去は
/// ターゲット側の表に任せます。同じアドレスには1個しか置けません。
#[derive(Debug, Default)]
pub struct BreakpointManager {
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    next_id: BreakpointId,
}

impl BreakpointManager {
    /// 新しいブレークポイントマネージャを作成する
    pub fn new() -> Self {
        Self {
            breakpoints: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// ブレークポイントを追加し、有効化する
    ///
    /// 既に同じアドレスにあれば、そのIDを返します。
    pub fn add_and_enable(
        &mut self,
        address: u64,
        symbol: Option<String>,
        target: &PtraceTarget,
    ) -> Result<BreakpointId> {
        if let Some(id) = self.find_by_address(address) {
            return Ok(id);
        }

        target.insert_breakpoint(address)?;

        let id = self.next_id;
        self.next_id += 1;
        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                address,
                symbol,
                enabled: true,
            },
        );
        Ok(id)
    }

    /// ブレークポイントを削除し、無効化する
    pub fn remove_and_disable(&mut self, id: BreakpointId, target: &PtraceTarget) -> Result<()> {
        let Some(bp) = self.breakpoints.remove(&id) else {
            return Err(anyhow::anyhow!("No breakpoint {}", id));
        };
        if bp.enabled {
            target.remove_breakpoint(bp.address)?;
        }
        Ok(())
    }

    /// アドレスにあるブレークポイントを探す
    pub fn find_by_address(&self, address: u64) -> Option<BreakpointId> {
        self.breakpoints
            .values()
            .find(|bp| bp.address == address)
            .map(|bp| bp.id)
    }

    /// アドレスに有効なブレークポイントがあるか
    pub fn is_enabled_at(&self, address: u64) -> bool {
        self.breakpoints
            .values()
            .any(|bp| bp.address == address && bp.enabled)
    }

    /// アドレスのブレークポイントを一時的に外す（ステップ実行で越えるため）
    pub fn disable_at(&mut self, address: u64, target: &PtraceTarget) -> Result<()> {
        for bp in self.breakpoints.values_mut() {
            if bp.address == address && bp.enabled {
                target.remove_breakpoint(address)?;
                bp.enabled = false;
            }
        }
        Ok(())
    }

    /// アドレスのブレークポイントを戻す
    pub fn enable_at(&mut self, address: u64, target: &PtraceTarget) -> Result<()> {
        for bp in self.breakpoints.values_mut() {
            if bp.address == address && !bp.enabled {
                target.insert_breakpoint(address)?;
                bp.enabled = true;
            }
        }
        Ok(())
    }

    /// ブレークポイントを取得する
    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// 全てのブレークポイントをID順に取得する
    pub fn all(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    /// ブレークポイントの数を取得する
    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }
}
