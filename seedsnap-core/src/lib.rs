//! seedsnap のコア機能
//!
//! このクレートは、リモートデバッグスタブ上で停止したプロセスの状態を取得する
//! 中核ロジックを提供します。コマンドと応答を対応付けるセッション、
//! メモリマップの解析、セグメントのダンプ、アーキテクチャ固有の
//! 隠しレジスタ取得、取得全体を流すキャプチャ処理を統合します。

pub mod arch;
pub mod capture;
pub mod demux;
pub mod error;
pub mod memmap;
pub mod parse;
pub mod registers;
pub mod segment;
pub mod session;
pub mod storage;

pub use arch::{architecture, Architecture};
pub use capture::{capture, CaptureConfig};
pub use error::Error;
pub use memmap::MapsReader;
pub use registers::RegisterSet;
pub use segment::{Permissions, Segment};
pub use session::{Session, SessionState};
pub use storage::ArtifactStore;

// 他のクレートから使用するために再エクスポート
pub use seedsnap_mi::{GdbTransport, Message, Transport};
pub use seedsnap_uzl::Capture;

/// コア処理の結果型
pub type Result<T> = std::result::Result<T, Error>;
