//! パース関連のユーティリティ関数

use crate::{Error, Result};

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use seedsnap_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| Error::Malformed(format!("invalid hexadecimal value '{}': {}", s, e)))
    } else {
        s.parse::<u64>()
            .map_err(|e| Error::Malformed(format!("invalid value '{}': {}", s, e)))
    }
}

/// ブレークポイント位置の文字列を `-break-insert` の引数に変換する
///
/// `0x` で始まる16進リテラルはアドレス指定 `*0x...` に、
/// それ以外（シンボル名、`file:line` など）はそのまま渡します。
pub fn breakpoint_location(s: &str) -> String {
    let s = s.trim();
    let is_hex_literal = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .is_some_and(|digits| digits.chars().all(|c| c.is_ascii_hexdigit()));

    if is_hex_literal {
        format!("*{}", s)
    } else {
        s.to_string()
    }
}
