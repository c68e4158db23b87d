//! パース関連のユーティリティ関数

use anyhow::Result;

/// ブレークポイントの指定先
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakLocation {
    Address(u64),
    Symbol(String),
}

/// アドレス文字列をu64にパース
///
/// `0x` 付きは16進数、それ以外は10進数として解釈します。
///
/// # Examples
/// ```
/// use yomi_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e)),
        None => s
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e)),
    }
}

/// `break` の引数を解釈する
///
/// `*` で始まるもの、または数値として読めるものはアドレス、それ以外はシンボル名です。
pub fn parse_break_location(s: &str) -> BreakLocation {
    let s = s.trim();
    if let Some(addr) = s.strip_prefix('*') {
        if let Ok(addr) = parse_address(addr) {
            return BreakLocation::Address(addr);
        }
    }
    match parse_address(s) {
        Ok(addr) => BreakLocation::Address(addr),
        Err(_) => BreakLocation::Symbol(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_hex() {
        assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0X1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0xABCD").unwrap(), 0xabcd);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("0xghij").is_err());
        assert!(parse_address("abcd").is_err());
    }

    #[test]
    fn test_break_location() {
        assert_eq!(parse_break_location("*0x401000"), BreakLocation::Address(0x401000));
        assert_eq!(parse_break_location("4096"), BreakLocation::Address(4096));
        assert_eq!(
            parse_break_location("$s4main3fooyyYaF"),
            BreakLocation::Symbol("$s4main3fooyyYaF".to_string())
        );
        // 16進数字だけのシンボル名もシンボルとして扱う
        assert_eq!(parse_break_location("add"), BreakLocation::Symbol("add".to_string()));
    }
}
