//! 受信メッセージの振り分け
//!
//! 送信中のコマンドは常に高々1つなので、待っているトークンは1つだけです。
//! 受信キューから取り出したメッセージは、応答・コンソール出力・停止通知・
//! それ以外のいずれかに振り分けます。停止通知とコンソール出力は
//! 後から取り出せるように無制限のバッファへ積みます。

use seedsnap_mi::{Message, MessageType};
use std::collections::VecDeque;
use tracing::info;

/// 振り分けの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Triage {
    /// 待っているトークンへの応答
    Reply(Message),
    /// コンソール出力としてバッファした
    Console,
    /// 停止通知としてバッファした
    Stop,
    /// 捨てた
    Discarded,
}

/// 応答待ちの状態と未処理通知のバッファ
#[derive(Debug, Default)]
pub struct Demux {
    /// 次に応答を待つトークン
    token: u64,
    stopped: VecDeque<Message>,
    console: Vec<Message>,
    pid: Option<u32>,
}

impl Demux {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在待っているトークン
    pub fn token(&self) -> u64 {
        self.token
    }

    /// 判明したターゲットのプロセスID
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// バッファしたコンソール出力
    pub fn console(&self) -> &[Message] {
        &self.console
    }

    /// 1メッセージを振り分ける
    ///
    /// 応答を受け取った時点でトークンを1つ進めます。
    pub fn triage(&mut self, msg: Message) -> Triage {
        self.observe_pid(&msg);

        if msg.kind == MessageType::Console {
            self.console.push(msg);
            return Triage::Console;
        }

        if msg.is_stop() {
            self.stopped.push_back(msg);
            return Triage::Stop;
        }

        if msg.message.is_some() && msg.token == Some(self.token) {
            self.token += 1;
            return Triage::Reply(msg);
        }

        Triage::Discarded
    }

    /// 理由が一致する停止通知をバッファから取り出す
    pub fn take_stop(&mut self, reason: &str) -> Option<Message> {
        let idx = self
            .stopped
            .iter()
            .position(|msg| msg.stop_reason() == Some(reason))?;
        self.stopped.remove(idx)
    }

    /// ペイロードにプロセスIDがあれば最初の1回だけ記録する
    pub fn observe_pid(&mut self, msg: &Message) {
        if self.pid.is_some() {
            return;
        }
        if let Some(pid) = msg.field("pid").and_then(|p| p.parse::<u32>().ok()) {
            info!(pid, "target process id");
            self.pid = Some(pid);
        }
    }
}
