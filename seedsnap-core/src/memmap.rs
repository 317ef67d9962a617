//! メモリマップ（`/proc/<pid>/maps`）の解析

use crate::segment::{Permissions, Segment};
use crate::Result;
use regex::Regex;
use std::path::Path;
use tracing::warn;

/// メモリマップのリーダー
pub struct MapsReader {
    /// 行頭の `<hex>-<hex>` パターン
    range_pattern: Regex,
}

impl MapsReader {
    /// メモリマップのリーダーを作成する
    pub fn new() -> Result<Self> {
        // 例: 7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so
        let range_pattern = Regex::new(r"^([0-9a-fA-F]+)-([0-9a-fA-F]+)")?;
        Ok(Self { range_pattern })
    }

    /// メモリマップのテキストを解析する
    ///
    /// 行頭がアドレス範囲でない行（ヘッダ、空行など）は読み飛ばします。
    /// 名前は空白区切りでちょうど6フィールドある場合だけ付きます。
    pub fn parse(&self, text: &str) -> Vec<Segment> {
        let mut segments = Vec::new();

        for line in text.lines() {
            let line = line.trim_end();
            let Some(caps) = self.range_pattern.captures(line) else {
                continue;
            };

            // 64ビットを超える桁数は範囲外
            let (Ok(start), Ok(end)) = (
                u64::from_str_radix(&caps[1], 16),
                u64::from_str_radix(&caps[2], 16),
            ) else {
                warn!(line, "address out of range in maps line");
                continue;
            };

            let fields: Vec<&str> = line.split_whitespace().collect();
            let perms = fields
                .get(1)
                .map(|p| Permissions::from_perm_string(p))
                .unwrap_or_default();
            let name = (fields.len() == 6).then(|| fields[5].to_string());

            match Segment::new(start, end, perms, name) {
                Some(segment) => segments.push(segment),
                None => warn!(line, "empty address range in maps line"),
            }
        }

        segments
    }

    /// ダウンロード済みのメモリマップファイルを読み込んで解析する
    pub fn read<P: AsRef<Path>>(&self, path: P) -> Result<Vec<Segment>> {
        let text = std::fs::read_to_string(path)?;
        Ok(self.parse(&text))
    }
}
