//! アーキテクチャ固有の処理
//!
//! レジスタのバイナリレイアウトと、デバッガから直接読めない
//! 隠しレジスタの取得方法をアーキテクチャごとに定義します。

pub mod x86_64;

use crate::registers::RegisterSet;
use crate::session::Session;
use crate::{Error, Result};
use seedsnap_uzl::Arch;

/// アーキテクチャごとの能力
pub trait Architecture: Send + Sync {
    /// レジストリのキー
    fn name(&self) -> &'static str;

    /// コンテナに記録するアーキテクチャ
    fn uzl_id(&self) -> Arch;

    /// パック時のレジスタの並び
    fn register_layout(&self) -> &'static [&'static str];

    /// レジスタをレイアウト順に64ビットのリトルエンディアン整数として詰める
    fn pack(&self, registers: &RegisterSet) -> Result<Vec<u8>> {
        let layout = self.register_layout();
        let mut out = Vec::with_capacity(layout.len() * 8);
        for name in layout {
            out.extend_from_slice(&registers.u64(name)?.to_le_bytes());
        }
        Ok(out)
    }

    /// 停止中のターゲットから隠しレジスタを取得する
    ///
    /// 終了時にはターゲットのレジスタとメモリを取得前の状態に戻します。
    fn extract_hidden_registers(&self, session: &mut Session) -> Result<RegisterSet>;
}

static REGISTRY: &[&dyn Architecture] = &[&x86_64::X86_64];

/// 名前からアーキテクチャを引く
pub fn architecture(name: &str) -> Result<&'static dyn Architecture> {
    REGISTRY
        .iter()
        .copied()
        .find(|arch| arch.name() == name)
        .ok_or_else(|| {
            let known: Vec<&str> = names().collect();
            Error::Architecture(format!(
                "unknown architecture '{}' (known: {})",
                name,
                known.join(", ")
            ))
        })
}

/// 登録されているアーキテクチャ名
pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|arch| arch.name())
}
