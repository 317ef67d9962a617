//! 送受信キューを駆動するリスナースレッド
//!
//! リスナーはトランスポートを所有する唯一のスレッドです。
//! 受信メッセージを到着順に受信キューへ流し、送信キューのコマンドを
//! 1つずつトランスポートへ書き込みます。`Outbound::Shutdown` を取り出すと
//! デバッガへ終了ディレクティブを送ってループを抜けます。

use crate::record::Message;
use crate::transport::Transport;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// 受信が無いときに送信キューを待つ最大時間
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// 送信キューの要素
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// トークン付きのコマンド行
    Command(String),
    /// リスナーを停止させる毒値
    Shutdown,
}

/// バックグラウンドで動作するリスナー
pub struct Listener {
    outbound: Sender<Outbound>,
    inbound: Receiver<Message>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Listener {
    /// トランスポートを受け取りリスナースレッドを起動する
    pub fn spawn<T: Transport + 'static>(transport: T, verbose: bool) -> Result<Self> {
        let (out_tx, out_rx) = crossbeam_channel::unbounded();
        let (in_tx, in_rx) = crossbeam_channel::unbounded();

        let handle = std::thread::Builder::new()
            .name("seedsnap-listener".to_string())
            .spawn(move || pump(transport, out_rx, in_tx, verbose))?;

        Ok(Self {
            outbound: out_tx,
            inbound: in_rx,
            handle: Some(handle),
        })
    }

    /// コマンド行を送信キューへ積む
    pub fn send(&self, line: String) -> Result<()> {
        self.outbound
            .send(Outbound::Command(line))
            .map_err(|_| Error::Closed)
    }

    /// 受信キュー
    pub fn inbound(&self) -> &Receiver<Message> {
        &self.inbound
    }

    /// 毒値を積み、リスナースレッドの終了を待つ
    ///
    /// 毒値より前に積まれたコマンドはすべて書き込まれてから停止します。
    pub fn shutdown(mut self) -> Result<()> {
        // スレッドが先に終わっていれば送信は失敗するが、join で結果を拾う
        let _ = self.outbound.send(Outbound::Shutdown);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| Error::Closed)?,
            None => Ok(()),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.outbound.send(Outbound::Shutdown);
            let _ = handle.join();
        }
    }
}

/// リスナーのメインループ
fn pump<T: Transport>(
    mut transport: T,
    outbound: Receiver<Outbound>,
    inbound: Sender<Message>,
    verbose: bool,
) -> Result<()> {
    loop {
        // (a) 届いているメッセージをすべて到着順に転送
        let messages = transport.poll()?;
        let idle = messages.is_empty();
        for msg in messages {
            if verbose {
                debug!(?msg, "read response");
            }
            // 受信側が居なくなっても送信キューの処理は続ける
            let _ = inbound.send(msg);
        }

        // (b) 送信キューから1つ取り出す
        let next = if idle {
            match outbound.recv_timeout(POLL_INTERVAL) {
                Ok(item) => Some(item),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(Outbound::Shutdown),
            }
        } else {
            match outbound.try_recv() {
                Ok(item) => Some(item),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Outbound::Shutdown),
            }
        };

        match next {
            Some(Outbound::Command(line)) => {
                if verbose {
                    debug!(command = %line, "dispatched command");
                }
                transport.write_line(&line)?;
            }
            Some(Outbound::Shutdown) => {
                transport.terminate()?;
                info!("listener stopped");
                return Ok(());
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{parse_record, Stream};
    use std::sync::{Arc, Mutex};

    /// 書き込まれた行を記録し、各行に `^done` を返すトランスポート
    struct Echo {
        written: Arc<Mutex<Vec<String>>>,
        pending: Vec<Message>,
    }

    impl Transport for Echo {
        fn poll(&mut self) -> Result<Vec<Message>> {
            Ok(std::mem::take(&mut self.pending))
        }

        fn write_line(&mut self, line: &str) -> Result<()> {
            self.written.lock().unwrap().push(line.to_string());
            let token: String = line.chars().take_while(char::is_ascii_digit).collect();
            if let Some(msg) = parse_record(&format!("{}^done", token), Stream::Stdout) {
                self.pending.push(msg);
            }
            Ok(())
        }
    }

    #[test]
    fn test_commands_forwarded_in_order_before_shutdown() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let listener = Listener::spawn(
            Echo {
                written: written.clone(),
                pending: Vec::new(),
            },
            false,
        )
        .unwrap();

        for i in 0..5 {
            listener.send(format!("{}-cmd", i)).unwrap();
        }
        for i in 0..5u64 {
            let msg = listener.inbound().recv().unwrap();
            assert_eq!(msg.token, Some(i));
        }
        listener.shutdown().unwrap();

        let written = written.lock().unwrap();
        assert_eq!(
            *written,
            vec!["0-cmd", "1-cmd", "2-cmd", "3-cmd", "4-cmd", "-gdb-exit"]
        );
    }

    #[test]
    fn test_shutdown_after_pending_commands() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let listener = Listener::spawn(
            Echo {
                written: written.clone(),
                pending: Vec::new(),
            },
            true,
        )
        .unwrap();

        listener.send("0-first".to_string()).unwrap();
        listener.send("1-second".to_string()).unwrap();
        listener.shutdown().unwrap();

        let written = written.lock().unwrap();
        assert_eq!(written.last().map(String::as_str), Some("-gdb-exit"));
        assert_eq!(written.len(), 3);
    }
}
