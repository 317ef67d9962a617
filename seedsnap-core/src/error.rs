//! セッションとキャプチャのエラー

use crate::session::SessionState;
use thiserror::Error;

/// コア処理のエラー
#[derive(Debug, Error)]
pub enum Error {
    /// コマンドの応答ステータスが期待したキーワードと異なる
    #[error("cannot {operation}: expected '{expected}', debugger answered '{received}'")]
    Protocol {
        operation: String,
        expected: &'static str,
        received: String,
    },

    /// リモートターゲットへの接続・切断に失敗した
    #[error("cannot {operation}: {detail}")]
    Connection { operation: String, detail: String },

    /// アーキテクチャが未設定、または未知
    #[error("architecture error: {0}")]
    Architecture(String),

    /// 隠しレジスタの取得に失敗した
    #[error("register extraction failed: {0}")]
    Extraction(String),

    /// 1つのセグメントのダンプに失敗した
    #[error("cannot dump memory region 0x{start:x}-0x{end:x}: {detail}")]
    SegmentDump { start: u64, end: u64, detail: String },

    /// 現在の状態では実行できない操作
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// まだターゲットのプロセスIDが分かっていない
    #[error("target process id is not known yet")]
    UnknownPid,

    /// リスナーが停止し受信キューが閉じた
    #[error("listener disconnected")]
    Disconnected,

    /// 停止イベントの待機が時間切れになった
    #[error("timed out waiting for stop reason '{reason}'")]
    Timeout { reason: String },

    /// 中断要求により待機を打ち切った
    #[error("cancelled")]
    Cancelled,

    /// 応答の形式が想定と異なる
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Transport(#[from] seedsnap_mi::Error),

    #[error(transparent)]
    Encoding(#[from] seedsnap_uzl::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
