//! プロトコル層のエラー

use thiserror::Error;

/// トランスポートとリスナーのエラー
#[derive(Debug, Error)]
pub enum Error {
    /// デバッガ子プロセスの入出力に失敗した
    #[error("debugger I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// デバッガ子プロセスの起動に失敗した
    #[error("cannot spawn debugger '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// デバッガ側の接続が閉じられた
    #[error("debugger connection closed")]
    Closed,
}
