//! デバッグセッション
//!
//! コマンドを1つずつ発行し、トークンで応答を対応付けます。
//! 非同期に届く停止通知とコンソール出力はバッファしておき、
//! `wait` で後から取り出せます。

use crate::arch::Architecture;
use crate::demux::{Demux, Triage};
use crate::memmap::MapsReader;
use crate::registers::RegisterSet;
use crate::segment::Segment;
use crate::storage::ArtifactStore;
use crate::{Error, Result};
use crossbeam_channel::{select, Receiver};
use seedsnap_mi::{Listener, Message, MiValue, Transport};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// ブレークポイントヒットの停止理由
pub const BREAKPOINT_HIT: &str = "breakpoint-hit";

/// セッションのライフサイクル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Connected,
    Running,
    Stopped,
    /// 終端状態。以後コマンドは受け付けない
    Shutdown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initialized => "initialized",
            SessionState::Connected => "connected",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Shutdown => "shut down",
        };
        f.write_str(name)
    }
}

/// ターゲットが停止していてメモリやレジスタを触れる状態
const HALTED: &[SessionState] = &[SessionState::Connected, SessionState::Stopped];

/// デバッグセッション
pub struct Session {
    state: SessionState,
    /// 応答待ちトークンと未処理通知
    demux: Demux,
    /// 直近の `vmmap` で得たセグメント
    segments: Vec<Segment>,
    /// 直近の `dump_registers` で得たレジスタ
    registers: RegisterSet,
    arch: Option<&'static dyn Architecture>,
    verbose: bool,
    listener: Option<Listener>,
    /// 値が届いたら待機を打ち切る
    cancel: Receiver<()>,
    store: ArtifactStore,
    maps: MapsReader,
}

impl Session {
    /// 新しいセッションを作成する
    pub fn new(store: ArtifactStore) -> Result<Self> {
        Ok(Self {
            state: SessionState::Uninitialized,
            demux: Demux::new(),
            segments: Vec::new(),
            registers: RegisterSet::new(),
            arch: None,
            verbose: false,
            listener: None,
            cancel: crossbeam_channel::never(),
            store,
            maps: MapsReader::new()?,
        })
    }

    /// ターゲットのアーキテクチャを設定する
    pub fn set_arch(&mut self, arch: &'static dyn Architecture) {
        self.arch = Some(arch);
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// 中断用のチャネルを設定する
    ///
    /// 値を受け取ると、応答や停止イベントを待っている操作が `Error::Cancelled` を返します。
    /// 送信側が全て破棄された場合は中断されないものとして扱います。
    pub fn set_cancel(&mut self, cancel: Receiver<()>) {
        self.cancel = cancel;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 接続時に判明したターゲットのプロセスID
    pub fn pid(&self) -> Option<u32> {
        self.demux.pid()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn registers(&self) -> &RegisterSet {
        &self.registers
    }

    pub fn arch(&self) -> Option<&'static dyn Architecture> {
        self.arch
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// バッファしたコンソール出力
    pub fn console(&self) -> &[Message] {
        self.demux.console()
    }

    /// アーキテクチャを取得する（未設定ならエラー）
    pub fn require_arch(&self) -> Result<&'static dyn Architecture> {
        self.arch
            .ok_or_else(|| Error::Architecture("architecture has not been set".to_string()))
    }

    /// プロセスIDを取得する（未判明ならエラー）
    pub fn require_pid(&self) -> Result<u32> {
        self.pid().ok_or(Error::UnknownPid)
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// リスナーを起動し、デバッガを非同期モードにする
    pub fn init<T: Transport + 'static>(&mut self, transport: T) -> Result<Message> {
        self.require("initialise session", &[SessionState::Uninitialized])?;
        // 通信を始める前にアーキテクチャを確認する
        self.require_arch()?;

        self.listener = Some(Listener::spawn(transport, self.verbose)?);
        self.state = SessionState::Initialized;
        info!("session initialised");

        self.expect_status("-gdb-set mi-async on", "done", || {
            "enable async mode".to_string()
        })
    }

    /// コマンドを1つ発行し、対応する応答を返す
    ///
    /// 現在のトークンを前置して送信キューへ積み、同じトークンの応答が
    /// 届くまで受信キューを読みます。途中で届いた停止通知とコンソール出力は
    /// バッファされ、それ以外は捨てられます。
    pub fn write(&mut self, cmd: &str) -> Result<Message> {
        if matches!(
            self.state,
            SessionState::Uninitialized | SessionState::Shutdown
        ) {
            return Err(Error::InvalidState {
                operation: "issue command",
                state: self.state,
            });
        }
        let listener = self.listener.as_ref().ok_or(Error::Disconnected)?;

        let line = format!("{}{}", self.demux.token(), cmd);
        debug!(command = %line, "issue command");
        listener.send(line).map_err(|_| Error::Disconnected)?;

        loop {
            let Some(msg) = self.next_message(None)? else {
                continue;
            };
            match self.demux.triage(msg) {
                Triage::Reply(reply) => {
                    if self.verbose {
                        debug!(?reply, "response");
                    }
                    return Ok(reply);
                }
                Triage::Stop => debug!("buffered stop event"),
                Triage::Console | Triage::Discarded => {}
            }
        }
    }

    /// コマンドを発行し、応答ステータスが `expected` であることを確認する
    fn expect_status(
        &mut self,
        cmd: &str,
        expected: &'static str,
        operation: impl FnOnce() -> String,
    ) -> Result<Message> {
        let reply = self.write(cmd)?;
        if reply.message.as_deref() == Some(expected) {
            Ok(reply)
        } else {
            Err(Error::Protocol {
                operation: operation(),
                expected,
                received: describe(&reply),
            })
        }
    }

    /// 指定した理由の停止イベントまでブロックする
    ///
    /// 既にバッファされていればそれを返します。
    pub fn wait(&mut self, reason: &str) -> Result<Message> {
        self.wait_until(reason, None)
    }

    /// `wait` と同じだが、`timeout` を過ぎたら `Error::Timeout` を返す
    pub fn wait_timeout(&mut self, reason: &str, timeout: Duration) -> Result<Message> {
        self.wait_until(reason, Some(Instant::now() + timeout))
    }

    fn wait_until(&mut self, reason: &str, deadline: Option<Instant>) -> Result<Message> {
        self.require("wait for stop event", &[SessionState::Running])?;

        if let Some(stop) = self.demux.take_stop(reason) {
            debug!(reason, "stop event already buffered");
            self.state = SessionState::Stopped;
            return Ok(stop);
        }

        loop {
            let Some(msg) = self.next_message(deadline)? else {
                return Err(Error::Timeout {
                    reason: reason.to_string(),
                });
            };

            self.demux.observe_pid(&msg);
            if msg.stop_reason() == Some(reason) {
                self.state = SessionState::Stopped;
                return Ok(msg);
            }
            if msg.is_stop() {
                warn!(reason = ?msg.stop_reason(), "discarding stop event");
            }
        }
    }

    /// 受信キューから1件読む
    ///
    /// `deadline` を過ぎたら `None` を返します。中断要求が届いたら `Error::Cancelled`。
    fn next_message(&self, deadline: Option<Instant>) -> Result<Option<Message>> {
        let listener = self.listener.as_ref().ok_or(Error::Disconnected)?;
        let timeout = deadline.map_or_else(crossbeam_channel::never, crossbeam_channel::at);
        let mut cancel = self.cancel.clone();

        loop {
            select! {
                recv(listener.inbound()) -> msg => {
                    return msg.map(Some).map_err(|_| Error::Disconnected);
                }
                recv(cancel) -> signal => {
                    if signal.is_ok() {
                        info!("cancellation requested");
                        return Err(Error::Cancelled);
                    }
                }
                recv(timeout) -> _ => return Ok(None),
            }
            // 中断の送信側が無くなった
            cancel = crossbeam_channel::never();
        }
    }

    /// リモートの gdbserver に接続する
    pub fn connect(&mut self, address: &str, port: u16) -> Result<Message> {
        self.require("connect", &[SessionState::Initialized])?;

        let reply = self.write(&format!("-target-select remote {}:{}", address, port))?;
        if reply.message.as_deref() != Some("connected") {
            return Err(Error::Connection {
                operation: format!("connect to target '{}:{}'", address, port),
                detail: describe(&reply),
            });
        }

        self.state = SessionState::Connected;
        info!(address, port, pid = ?self.pid(), "connected to target");
        Ok(reply)
    }

    /// リモートターゲットから切り離す
    pub fn disconnect(&mut self) -> Result<Message> {
        self.require("disconnect", HALTED)?;

        let reply = self.write("-target-detach")?;
        if reply.message.as_deref() != Some("done") {
            return Err(Error::Connection {
                operation: "detach from target".to_string(),
                detail: describe(&reply),
            });
        }

        self.state = SessionState::Initialized;
        info!("detached from target");
        Ok(reply)
    }

    /// fork 後に子プロセスを追う
    pub fn follow_child(&mut self) -> Result<Message> {
        self.require("follow child", HALTED)?;
        self.expect_status("-gdb-set follow-fork-mode child", "done", || {
            "follow child processes".to_string()
        })
    }

    /// ブレークポイントを設定する
    ///
    /// `location` は `-break-insert` の引数そのもの（`*0x401126`、`main` など）です。
    pub fn breakpoint(&mut self, location: &str) -> Result<Message> {
        self.require("insert breakpoint", HALTED)?;
        self.expect_status(&format!("-break-insert {}", location), "done", || {
            format!("break on '{}'", location)
        })
    }

    /// ブレークポイントを削除する
    pub fn delete_breakpoint(&mut self, number: &str) -> Result<Message> {
        self.require("delete breakpoint", HALTED)?;
        self.expect_status(&format!("-break-delete {}", number), "done", || {
            format!("delete breakpoint {}", number)
        })
    }

    /// 実行を継続する
    pub fn run(&mut self) -> Result<Message> {
        self.require("continue", HALTED)?;
        let reply = self.expect_status("-exec-continue", "running", || {
            "continue execution".to_string()
        })?;
        self.state = SessionState::Running;
        Ok(reply)
    }

    /// ターゲット上のファイルを成果物ディレクトリへダウンロードする
    pub fn get_file(&mut self, remote: &str, local_name: &str) -> Result<PathBuf> {
        self.require("download file", HALTED)?;
        let pid = self.require_pid()?;
        let local = self.store.path(pid, local_name)?;

        self.expect_status(
            &format!(
                "-target-file-get {} {}",
                mi_quote(remote),
                mi_quote(&local.to_string_lossy())
            ),
            "done",
            || format!("download file '{}'", remote),
        )?;

        if !local.is_file() {
            return Err(Error::Malformed(format!(
                "downloaded file '{}' does not exist",
                local.display()
            )));
        }
        Ok(local)
    }

    /// ターゲットのメモリマップを取得し、セグメント表を置き換える
    pub fn vmmap(&mut self) -> Result<&[Segment]> {
        self.require("read memory map", HALTED)?;
        let pid = self.require_pid()?;

        let maps = self.get_file(&format!("/proc/{}/maps", pid), "maps")?;
        debug!(path = %maps.display(), "downloaded maps file");

        self.segments = self.maps.read(&maps)?;
        info!(count = self.segments.len(), "parsed memory map");
        Ok(&self.segments)
    }

    /// 1つのセグメントを成果物ディレクトリへダンプする
    ///
    /// 失敗は `Error::SegmentDump` になります。
    pub fn dump_segment(&mut self, segment: &Segment) -> Result<PathBuf> {
        self.require("dump segment", HALTED)?;
        let pid = self.require_pid()?;
        let path = self.store.segment_path(pid, segment)?;

        let console = format!(
            "dump memory {} 0x{:x} 0x{:x}",
            mi_quote(&path.to_string_lossy()),
            segment.start(),
            segment.end()
        );
        let reply = self.write(&format!("-interpreter-exec console {}", mi_quote(&console)))?;
        if reply.message.as_deref() != Some("done") {
            return Err(Error::SegmentDump {
                start: segment.start(),
                end: segment.end(),
                detail: describe(&reply),
            });
        }
        Ok(path)
    }

    /// デバッガが直接読めるレジスタを名前と値の対応表として読む
    pub fn read_registers(&mut self) -> Result<RegisterSet> {
        self.require("read registers", HALTED)?;

        let names_reply = self.expect_status("-data-list-register-names", "done", || {
            "dump register names".to_string()
        })?;
        let names = names_reply
            .payload
            .as_ref()
            .and_then(|p| p.get("register-names"))
            .and_then(MiValue::as_list)
            .ok_or_else(|| Error::Malformed("register-names missing".to_string()))?;

        let values_reply = self.expect_status("-data-list-register-values x", "done", || {
            "dump register values".to_string()
        })?;
        let values = values_reply
            .payload
            .as_ref()
            .and_then(|p| p.get("register-values"))
            .and_then(MiValue::as_list)
            .ok_or_else(|| Error::Malformed("register-values missing".to_string()))?;

        let mut registers = RegisterSet::new();
        for entry in values {
            let Some(entry) = entry.as_tuple() else {
                continue;
            };
            let (Some(number), Some(value)) = (entry.get_str("number"), entry.get_str("value"))
            else {
                continue;
            };
            let Ok(number) = number.parse::<usize>() else {
                continue;
            };
            match names.get(number).and_then(MiValue::as_str) {
                Some(name) if !name.is_empty() => registers.insert(name, value),
                _ => debug!(number, "register value without a name"),
            }
        }
        if registers.is_empty() {
            return Err(Error::Malformed("debugger reported no registers".to_string()));
        }
        Ok(registers)
    }

    /// レジスタをすべてダンプする
    ///
    /// デバッガから読めるレジスタに、アーキテクチャ固有の方法で取得した
    /// 隠しレジスタを合わせ、`regs.json` にも書き出します。
    pub fn dump_registers(&mut self) -> Result<RegisterSet> {
        self.require("dump registers", HALTED)?;
        let arch = self.require_arch()?;

        let mut registers = self.read_registers()?;
        let hidden = arch.extract_hidden_registers(self)?;
        registers.merge(hidden);
        self.registers = registers.clone();

        let pid = self.require_pid()?;
        let path = self.store.path(pid, "regs.json")?;
        std::fs::write(&path, serde_json::to_string_pretty(&registers)?)?;
        info!(count = registers.len(), path = %path.display(), "dumped registers");

        Ok(registers)
    }

    /// レジスタに値を書き込む
    pub fn write_register(&mut self, name: &str, value: u64) -> Result<Message> {
        self.require("write register", HALTED)?;
        self.expect_status(&format!("-gdb-set ${}=0x{:x}", name, value), "done", || {
            format!("set register {} to 0x{:x}", name, value)
        })
    }

    /// ターゲットのメモリを読む
    pub fn read_bytes(&mut self, address: u64, count: usize) -> Result<Vec<u8>> {
        self.require("read memory", HALTED)?;
        let reply = self.expect_status(
            &format!("-data-read-memory-bytes 0x{:x} {}", address, count),
            "done",
            || format!("read {} bytes from 0x{:x}", count, address),
        )?;

        let contents = reply
            .payload
            .as_ref()
            .and_then(|p| p.get("memory"))
            .and_then(MiValue::as_list)
            .and_then(|blocks| blocks.first())
            .and_then(MiValue::as_tuple)
            .and_then(|block| block.get_str("contents"))
            .ok_or_else(|| Error::Malformed("memory contents missing".to_string()))?;

        let bytes = hex::decode(contents)
            .map_err(|e| Error::Malformed(format!("memory contents: {}", e)))?;
        if bytes.len() != count {
            return Err(Error::Malformed(format!(
                "read {} bytes from 0x{:x}, expected {}",
                bytes.len(),
                address,
                count
            )));
        }
        Ok(bytes)
    }

    /// ターゲットのメモリに書き込む
    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<Message> {
        self.require("write memory", HALTED)?;
        self.expect_status(
            &format!(
                "-data-write-memory-bytes 0x{:x} {} {}",
                address,
                hex::encode(bytes),
                bytes.len()
            ),
            "done",
            || format!("write {} bytes to 0x{:x}", bytes.len(), address),
        )
    }

    /// リスナーとデバッガを停止する
    ///
    /// 毒値を送信キューへ積み、リスナーの終了を待ちます。以後このセッションは使えません。
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == SessionState::Shutdown {
            return Err(Error::InvalidState {
                operation: "shut down",
                state: self.state,
            });
        }

        self.state = SessionState::Shutdown;
        if let Some(listener) = self.listener.take() {
            listener.shutdown()?;
        }
        info!("session shut down");
        Ok(())
    }
}

/// 応答のステータスとエラーメッセージを1行にまとめる
fn describe(reply: &Message) -> String {
    let status = reply.message.as_deref().unwrap_or("<none>");
    match reply.field("msg") {
        Some(msg) => format!("{} ({})", status, msg),
        None => status.to_string(),
    }
}

/// MIコマンドの引数としてC文字列に包む
fn mi_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}
