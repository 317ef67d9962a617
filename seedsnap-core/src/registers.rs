//! レジスタ名と値の対応表

use crate::parse::parse_address;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;

/// レジスタ名から値への対応
///
/// 値はデバッガが返した文字列のまま保持します。ベクタレジスタのように
/// 整数にならない値もあるため、整数としての解釈は取り出し時に行います。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RegisterSet {
    values: BTreeMap<String, String>,
}

impl RegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// 整数値を `0x...` 形式で格納する
    pub fn insert_u64(&mut self, name: impl Into<String>, value: u64) {
        self.insert(name, format!("0x{:x}", value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// レジスタ値を64ビット整数として取り出す
    pub fn u64(&self, name: &str) -> Result<u64> {
        let value = self
            .get(name)
            .ok_or_else(|| Error::Malformed(format!("register '{}' not present", name)))?;
        parse_address(value)
    }

    /// 別の対応表の内容で上書き・追加する
    pub fn merge(&mut self, other: RegisterSet) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
