//! デバッガ子プロセスとのトランスポート

use crate::record::{parse_record, Message, Stream};
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

/// デバッガを終了させるディレクティブ
pub const EXIT_DIRECTIVE: &str = "-gdb-exit";

/// デバッガとの生の通信路
///
/// リスナースレッドが所有し、受信メッセージのノンブロッキング取得と
/// コマンド行の書き込みだけを提供します。
pub trait Transport: Send {
    /// 現在届いているメッセージをすべて到着順に返す（ブロックしない）
    fn poll(&mut self) -> Result<Vec<Message>>;

    /// コマンド行をそのまま1回書き込む
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// デバッガに終了ディレクティブを送る
    fn terminate(&mut self) -> Result<()> {
        self.write_line(EXIT_DIRECTIVE)
    }
}

/// MIインタプリタで起動した gdb 子プロセス
pub struct GdbTransport {
    child: Child,
    stdin: ChildStdin,
    incoming: Receiver<Message>,
    readers: Vec<JoinHandle<()>>,
}

impl GdbTransport {
    /// gdb を `--interpreter=mi3` で起動する
    pub fn spawn<S: AsRef<OsStr>>(program: S) -> Result<Self> {
        let program = program.as_ref();
        let mut child = Command::new(program)
            .args(["--nx", "--quiet", "--interpreter=mi3"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.to_string_lossy().into_owned(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(Error::Closed)?;
        let stdout = child.stdout.take().ok_or(Error::Closed)?;
        let stderr = child.stderr.take().ok_or(Error::Closed)?;

        let (tx, incoming) = crossbeam_channel::unbounded();
        let readers = vec![
            spawn_reader(stdout, Stream::Stdout, tx.clone()),
            spawn_reader(stderr, Stream::Stderr, tx),
        ];

        Ok(Self {
            child,
            stdin,
            incoming,
            readers,
        })
    }
}

/// パイプを1行ずつ読み、パースしたメッセージをチャネルへ流す
fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    stream: Stream,
    tx: Sender<Message>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if let Some(msg) = parse_record(&line, stream) {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        }
    })
}

impl Transport for GdbTransport {
    fn poll(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        loop {
            match self.incoming.try_recv() {
                Ok(msg) => messages.push(msg),
                Err(TryRecvError::Empty) => return Ok(messages),
                Err(TryRecvError::Disconnected) => {
                    // 届いた分は先に渡し、切断は次回の poll で報告する
                    if messages.is_empty() {
                        return Err(Error::Closed);
                    }
                    return Ok(messages);
                }
            }
        }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.stdin, "{}", line)?;
        self.stdin.flush()?;
        Ok(())
    }
}

impl Drop for GdbTransport {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}
