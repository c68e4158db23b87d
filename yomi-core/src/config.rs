//! リゾルバの設定

use crate::errors::ResolveError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use yomi_async::{ContextLayout, DEFAULT_MAX_DEPTH};
use yomi_dwarf::DEFAULT_CONTEXT_REGISTER;

/// リゾルバの設定
///
/// TOMLファイルから読み込めます。省略した項目は既定値になります。
///
/// ```toml
/// max_async_depth = 128
/// task_switch_symbol = "swift_task_switch"
///
/// [context_layout]
/// parent_offset = 0
/// resume_offset = 8
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// asyncチェーン走査の最大深さ
    pub max_async_depth: usize,
    /// asyncコンテキストを保持するDWARFレジスタ
    pub context_register: u16,
    /// コンテキストレコードの配置
    pub context_layout: ContextLayout,
    /// タスク切り替えのエントリポイント
    pub task_switch_symbol: String,
    /// シンボル範囲が不明なときに逆アセンブルするバイト数
    pub trampoline_window: u64,
    /// 変数1個あたりに読む最大バイト数
    pub max_value_bytes: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_async_depth: DEFAULT_MAX_DEPTH,
            context_register: DEFAULT_CONTEXT_REGISTER,
            context_layout: ContextLayout::default(),
            task_switch_symbol: "swift_task_switch".to_string(),
            trampoline_window: 64,
            max_value_bytes: 4096,
        }
    }
}

impl ResolverConfig {
    /// TOMLファイルから読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {:?}: {}", path, e))?;
        Self::from_toml_str(&text)
    }

    /// TOML文字列から読み込む
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| ResolveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 値の整合性を検査する
    pub fn validate(&self) -> std::result::Result<(), ResolveError> {
        if self.max_async_depth == 0 {
            return Err(ResolveError::Config(
                "max_async_depth must be at least 1".to_string(),
            ));
        }
        if self.trampoline_window == 0 || self.max_value_bytes == 0 {
            return Err(ResolveError::Config(
                "trampoline_window and max_value_bytes must be non-zero".to_string(),
            ));
        }
        if self.context_layout.parent_offset == self.context_layout.resume_offset {
            return Err(ResolveError::Config(
                "context_layout offsets must differ".to_string(),
            ));
        }
        if self.task_switch_symbol.is_empty() {
            return Err(ResolveError::Config(
                "task_switch_symbol must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResolverConfig::default();
        assert_eq!(config.max_async_depth, 512);
        assert_eq!(config.context_register, 14);
        assert_eq!(config.context_layout.resume_offset, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ResolverConfig::from_toml_str(
            r#"
            max_async_depth = 32

            [context_layout]
            parent_offset = 8
            resume_offset = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.max_async_depth, 32);
        assert_eq!(config.context_layout.parent_offset, 8);
        assert_eq!(config.task_switch_symbol, "swift_task_switch");
    }

    #[test]
    fn test_invalid_toml() {
        assert!(ResolverConfig::from_toml_str("max_async_depth = 0").is_err());
        assert!(ResolverConfig::from_toml_str("unknown_key = 1").is_err());
    }
}
