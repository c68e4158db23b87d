//! ソース行情報

use crate::{DwarfLoader, DwarfReader, Result, SourceLocation};

/// ソース行情報の取得
pub struct LineInfoProvider {
    context: addr2line::Context<DwarfReader>,
}

impl LineInfoProvider {
    /// ソース行情報プロバイダを作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let context = addr2line::Context::from_dwarf(loader.fresh_dwarf()?)
            .map_err(|e| anyhow::anyhow!("Failed to build line table context: {}", e))?;
        Ok(Self { context })
    }

    /// アドレス（ファイル上のアドレス）からソース行情報を取得する
    pub fn lookup(&self, addr: u64) -> Result<Option<SourceLocation>> {
        let location = self
            .context
            .find_location(addr)
            .map_err(|e| anyhow::anyhow!("Failed to look up line for 0x{:x}: {}", addr, e))?;

        Ok(location.and_then(|loc| {
            Some(SourceLocation {
                file: loc.file?.to_string(),
                line: loc.line?,
                column: loc.column,
            })
        }))
    }
}
