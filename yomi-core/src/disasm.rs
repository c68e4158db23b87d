//! 逆アセンブル機能
//!
//! 関数のバイト列を逆アセンブルして、末尾の直接ジャンプの飛び先を検出します。

use crate::parse::parse_address;
use crate::Result;
use capstone::prelude::*;

fn capstone() -> Result<Capstone> {
    Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .detail(true)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))
}

fn is_control_flow(mnemonic: &str) -> bool {
    mnemonic.starts_with('j') || mnemonic.starts_with("call") || mnemonic.starts_with("ret")
}

/// 最後の制御フロー命令が直接ジャンプなら、その飛び先を返す
///
/// # Arguments
/// * `code` - 関数のバイト列
/// * `base_addr` - 関数の開始アドレス
///
/// # Returns
/// 末尾呼び出しの飛び先アドレス（間接ジャンプ・ret・callで終わる場合はNone）
pub fn find_tail_jump_target(code: &[u8], base_addr: u64) -> Result<Option<u64>> {
    let cs = capstone()?;
    let insns = cs
        .disasm_all(code, base_addr)
        .map_err(|e| anyhow::anyhow!("Failed to disassemble: {}", e))?;

    let last = insns
        .as_ref()
        .iter()
        .filter(|insn| is_control_flow(insn.mnemonic().unwrap_or("")))
        .last();

    let Some(insn) = last else {
        return Ok(None);
    };
    if insn.mnemonic() != Some("jmp") {
        return Ok(None);
    }

    // 間接ジャンプ（jmp rax, jmp qword ptr [...]）は解析できない
    Ok(insn.op_str().and_then(|op| parse_address(op).ok()))
}
