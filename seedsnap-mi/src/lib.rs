//! seedsnap デバッガ制御プロトコル
//!
//! このクレートは、リモートデバッグスタブを操作するデバッガとの通信路を提供します。
//! MIレコードのパース、デバッガ子プロセスとのトランスポート、
//! 送受信キューを駆動するリスナースレッドを含みます。

pub mod error;
pub mod record;
pub mod transport;
pub mod listener;

pub use error::Error;
pub use record::{parse_record, Message, MessageType, MiTuple, MiValue, Stream};
pub use transport::{GdbTransport, Transport};
pub use listener::{Listener, Outbound};

/// プロトコル層の結果型
pub type Result<T> = std::result::Result<T, Error>;
