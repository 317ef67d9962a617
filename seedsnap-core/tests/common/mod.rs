//! 統合テスト用の擬似デバッグスタブ
//!
//! gdb の代わりに MI のコマンド行を受け取り、メモリとレジスタを持つ
//! 小さなターゲットを操作して MI の応答行を返します。

#![allow(dead_code)]

use seedsnap_core::{ArtifactStore, Session};
use seedsnap_mi::{parse_record, Message, Stream, Transport};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const PID: u32 = 4242;
pub const FS_BASE: u64 = 0x7fff_f7d8_a740;
pub const GS_BASE: u64 = 0x0;

pub const TEXT: u64 = 0x400000;
pub const GADGET: u64 = TEXT + 0x10;
pub const ENTRY: u64 = TEXT + 0x100;
pub const BREAK_AT: u64 = TEXT + 0x200;
pub const DATA: u64 = 0x600000;
pub const HEAP: u64 = 0x602000;
pub const VDSO: u64 = 0x7fff_f7fc_1000;
pub const STACK: u64 = 0x7fff_fffd_e000;

/// gdb が返す順のレジスタ名
pub const REGISTER_NAMES: [&str; 27] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip", "eflags", "cs", "ss", "ds", "es", "fs", "gs", "fs_base", "gs_base",
    "orig_rax",
];

pub struct Region {
    pub start: u64,
    pub perms: &'static str,
    pub name: &'static str,
    pub bytes: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }
}

/// 擬似ターゲットの状態
pub struct Target {
    pub regions: Vec<Region>,
    pub registers: BTreeMap<String, u64>,
    /// 番号 -> アドレス
    pub breakpoints: BTreeMap<u32, u64>,
    next_breakpoint: u32,
    /// 受け取ったコマンド行
    pub received: Vec<String>,
    /// ダンプに失敗させるセグメントの先頭
    pub fail_dump: Option<u64>,
    /// 接続を拒否する
    pub refuse_connection: bool,
    /// 実行を再開しても停止しない
    pub never_stop: bool,
    /// 停止通知を `^running` より先に送る
    pub stop_before_reply: bool,
    /// このプレフィックスのコマンドを受け取ったら通信路を閉じる
    pub crash_on: Option<&'static str>,
    /// このプレフィックスのコマンドに `^error` を返す
    pub fail_on: Option<&'static str>,
    pub closed: bool,
}

impl Target {
    pub fn new() -> Self {
        let mut text = vec![0x90u8; 0x1000];
        text[0x10] = 0x0f;
        text[0x11] = 0x05;
        text[0x1ff] = 0xc3;

        let data: Vec<u8> = (0..0x1000u32).map(|i| (i * 7 + 3) as u8).collect();
        let heap: Vec<u8> = (0..0x1000u32).map(|i| (i % 251) as u8).collect();
        let vdso = vec![0xccu8; 0x2000];
        let stack = vec![0x5au8; 0x1000];

        let regions = vec![
            Region { start: TEXT, perms: "r-xp", name: "/usr/bin/target", bytes: text },
            Region { start: DATA, perms: "rw-p", name: "/usr/bin/target", bytes: data },
            Region { start: HEAP, perms: "rw-p", name: "[heap]", bytes: heap },
            Region { start: VDSO, perms: "r-xp", name: "[vdso]", bytes: vdso },
            Region { start: STACK, perms: "rw-p", name: "[stack]", bytes: stack },
        ];

        let mut registers = BTreeMap::new();
        for (i, name) in REGISTER_NAMES.iter().enumerate() {
            registers.insert(name.to_string(), 0x1000 + i as u64);
        }
        registers.insert("rip".to_string(), ENTRY);
        registers.insert("eflags".to_string(), 0x246);
        registers.insert("cs".to_string(), 0x33);
        registers.insert("ss".to_string(), 0x2b);
        // スタブからは読めない
        registers.insert("fs_base".to_string(), 0);
        registers.insert("gs_base".to_string(), 0);

        Self {
            regions,
            registers,
            breakpoints: BTreeMap::new(),
            next_breakpoint: 1,
            received: Vec::new(),
            fail_dump: None,
            refuse_connection: false,
            never_stop: false,
            stop_before_reply: false,
            crash_on: None,
            fail_on: None,
            closed: false,
        }
    }

    pub fn shared() -> Arc<Mutex<Target>> {
        Arc::new(Mutex::new(Target::new()))
    }

    pub fn maps(&self) -> String {
        let mut out = String::new();
        for r in &self.regions {
            out.push_str(&format!(
                "{:08x}-{:08x} {} 00000000 08:01 1234 {}\n",
                r.start,
                r.end(),
                r.perms,
                r.name
            ));
        }
        out
    }

    pub fn reg(&self, name: &str) -> u64 {
        self.registers.get(name).copied().unwrap_or(0)
    }

    pub fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let r = self
            .regions
            .iter()
            .find(|r| r.start <= addr && addr + len as u64 <= r.end())?;
        let off = (addr - r.start) as usize;
        Some(r.bytes[off..off + len].to_vec())
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> bool {
        let Some(r) = self
            .regions
            .iter_mut()
            .find(|r| r.start <= addr && addr + bytes.len() as u64 <= r.end())
        else {
            return false;
        };
        let off = (addr - r.start) as usize;
        r.bytes[off..off + bytes.len()].copy_from_slice(bytes);
        true
    }

    /// メモリとレジスタの写し
    pub fn state(&self) -> (BTreeMap<String, u64>, Vec<Vec<u8>>) {
        (
            self.registers.clone(),
            self.regions.iter().map(|r| r.bytes.clone()).collect(),
        )
    }

    /// 1コマンドを処理し、応答行を返す
    fn handle(&mut self, line: &str) -> Vec<String> {
        self.received.push(line.to_string());

        let token: String = line.chars().take_while(char::is_ascii_digit).collect();
        let cmd = &line[token.len()..];
        let args = split_args(cmd);
        let t = token.as_str();

        let done = |extra: &str| format!("{}^done{}", t, extra);
        let error = |msg: &str| format!("{}^error,msg=\"{}\"", t, msg);

        if self.fail_on.is_some_and(|prefix| cmd.starts_with(prefix)) {
            return vec![error("Command failed")];
        }

        match args.first().map(String::as_str) {
            Some("-gdb-set") => {
                let setting = args[1..].join(" ");
                if let Some(assign) = setting.strip_prefix('$') {
                    let Some((name, value)) = assign.split_once('=') else {
                        return vec![error("bad assignment")];
                    };
                    let value = u64::from_str_radix(value.trim_start_matches("0x"), 16)
                        .unwrap_or_default();
                    self.registers.insert(name.to_string(), value);
                }
                vec![done("")]
            }
            Some("-target-select") => {
                if self.refuse_connection {
                    return vec![error("Connection refused.")];
                }
                vec![
                    "~\"Remote debugging using localhost:1234\\n\"".to_string(),
                    format!("=thread-group-started,id=\"i1\",pid=\"{}\"", PID),
                    "&\"warning: no symbol table\\n\"".to_string(),
                    // 古いトークンの応答は無視されるはず
                    "77^done".to_string(),
                    format!("{}^connected", t),
                ]
            }
            Some("-target-detach") => vec![done("")],
            Some("-break-insert") => {
                let Some(addr) = args
                    .get(1)
                    .and_then(|loc| loc.strip_prefix("*0x"))
                    .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                else {
                    return vec![error("Function not defined.")];
                };
                let number = self.next_breakpoint;
                self.next_breakpoint += 1;
                self.breakpoints.insert(number, addr);
                vec![done(&format!(
                    ",bkpt={{number=\"{}\",type=\"breakpoint\",addr=\"0x{:x}\"}}",
                    number, addr
                ))]
            }
            Some("-break-delete") => {
                let number = args.get(1).and_then(|n| n.parse::<u32>().ok());
                match number.and_then(|n| self.breakpoints.remove(&n)) {
                    Some(_) => vec![done("")],
                    None => vec![error("Bad breakpoint number")],
                }
            }
            Some("-exec-continue") => self.resume(t),
            Some("-target-file-get") => {
                let (Some(remote), Some(local)) = (args.get(1), args.get(2)) else {
                    return vec![error("usage")];
                };
                if remote != &format!("/proc/{}/maps", PID) {
                    return vec![error("Remote I/O error: No such file or directory")];
                }
                std::fs::write(local, self.maps()).unwrap();
                vec![done("")]
            }
            Some("-interpreter-exec") => {
                let words = args.get(2).map(|c| split_args(c)).unwrap_or_default();
                let words: Vec<&str> = words.iter().map(String::as_str).collect();
                let ["dump", "memory", file, start, end] = words.as_slice() else {
                    return vec![error("Undefined command")];
                };
                let start = u64::from_str_radix(start.trim_start_matches("0x"), 16).unwrap();
                let end = u64::from_str_radix(end.trim_start_matches("0x"), 16).unwrap();
                if self.fail_dump == Some(start) {
                    return vec![error(&format!("Cannot access memory at address 0x{:x}", start))];
                }
                match self.read(start, (end - start) as usize) {
                    Some(bytes) => {
                        std::fs::write(file, bytes).unwrap();
                        vec![done("")]
                    }
                    None => vec![error(&format!("Cannot access memory at address 0x{:x}", start))],
                }
            }
            Some("-data-list-register-names") => {
                let names: Vec<String> = REGISTER_NAMES
                    .iter()
                    .map(|n| format!("\"{}\"", n))
                    .chain(std::iter::once("\"\"".to_string()))
                    .collect();
                vec![done(&format!(",register-names=[{}]", names.join(",")))]
            }
            Some("-data-list-register-values") => {
                let values: Vec<String> = REGISTER_NAMES
                    .iter()
                    .enumerate()
                    .map(|(i, n)| format!("{{number=\"{}\",value=\"0x{:x}\"}}", i, self.reg(n)))
                    .collect();
                vec![done(&format!(",register-values=[{}]", values.join(",")))]
            }
            Some("-data-read-memory-bytes") => {
                let addr = parse_hex(&args[1]);
                let count: usize = args[2].parse().unwrap();
                match self.read(addr, count) {
                    Some(bytes) => vec![done(&format!(
                        ",memory=[{{begin=\"0x{:x}\",offset=\"0x0\",end=\"0x{:x}\",contents=\"{}\"}}]",
                        addr,
                        addr + count as u64,
                        hex::encode(bytes)
                    ))],
                    None => vec![error(&format!("Cannot access memory at address 0x{:x}", addr))],
                }
            }
            Some("-data-write-memory-bytes") => {
                let addr = parse_hex(&args[1]);
                let bytes = hex::decode(&args[2]).unwrap();
                if self.write(addr, &bytes) {
                    vec![done("")]
                } else {
                    vec![error(&format!("Cannot access memory at address 0x{:x}", addr))]
                }
            }
            Some("-gdb-exit") => vec!["^exit".to_string()],
            _ => vec![error("Undefined MI command")],
        }
    }

    /// 実行を再開する
    ///
    /// rip が `syscall` を指していれば1命令だけ実行し、そうでなければ
    /// 番号が最小のブレークポイントまで進んだことにする。
    fn resume(&mut self, t: &str) -> Vec<String> {
        let mut out = vec![format!("{}^running", t), "*running,thread-id=\"all\"".to_string()];
        if self.never_stop {
            return out;
        }

        let rip = self.reg("rip");
        if self.read(rip, 2).as_deref() == Some(&[0x0f, 0x05][..]) {
            if self.reg("rax") == 0x9e {
                let value = match self.reg("rdi") {
                    0x1003 => FS_BASE,
                    0x1004 => GS_BASE,
                    _ => u64::MAX,
                };
                let ptr = self.reg("rsi");
                self.write(ptr, &value.to_le_bytes());
                self.registers.insert("rax".to_string(), 0);
            }
            self.registers.insert("rcx".to_string(), rip + 2);
            self.registers.insert("r11".to_string(), self.reg("eflags"));
            self.registers.insert("rip".to_string(), rip + 2);
        } else if let Some((_, &addr)) = self.breakpoints.iter().next() {
            self.registers.insert("rip".to_string(), addr);
        }

        let rip = self.reg("rip");
        let stop = match self.breakpoints.iter().find(|(_, a)| **a == rip) {
            Some((n, _)) => format!(
                "*stopped,reason=\"breakpoint-hit\",disp=\"keep\",bkptno=\"{}\",frame={{addr=\"0x{:x}\",func=\"??\",args=[]}},thread-id=\"1\"",
                n, rip
            ),
            None => "*stopped,reason=\"exited-normally\"".to_string(),
        };

        if self.stop_before_reply {
            out.insert(0, stop);
        } else {
            out.push("~\"\\n\"".to_string());
            out.push(stop);
        }
        out
    }
}

fn parse_hex(s: &str) -> u64 {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).unwrap()
}

/// 空白区切りの引数を分割する（C文字列の引用を解除する）
fn split_args(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut arg = String::new();
        if c == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '"' => break,
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            arg.push(if escaped == 'n' { '\n' } else { escaped });
                        }
                    }
                    other => arg.push(other),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }
    args
}

/// 擬似ターゲットに繋がったトランスポート
pub struct SimulatedStub {
    target: Arc<Mutex<Target>>,
    pending: VecDeque<Message>,
}

impl SimulatedStub {
    pub fn new(target: Arc<Mutex<Target>>) -> Self {
        Self {
            target,
            pending: VecDeque::new(),
        }
    }
}

impl Transport for SimulatedStub {
    fn poll(&mut self) -> seedsnap_mi::Result<Vec<Message>> {
        if self.target.lock().unwrap().closed && self.pending.is_empty() {
            return Err(seedsnap_mi::Error::Closed);
        }
        Ok(self.pending.drain(..).collect())
    }

    fn write_line(&mut self, line: &str) -> seedsnap_mi::Result<()> {
        let mut target = self.target.lock().unwrap();
        if let Some(prefix) = target.crash_on {
            let cmd = line.trim_start_matches(|c: char| c.is_ascii_digit());
            if cmd.starts_with(prefix) {
                target.received.push(line.to_string());
                target.closed = true;
                return Ok(());
            }
        }
        for reply in target.handle(line) {
            if let Some(msg) = parse_record(&reply, Stream::Stdout) {
                self.pending.push_back(msg);
            }
        }
        Ok(())
    }
}

/// x86_64 を設定したセッションを作る
pub fn session(root: &std::path::Path) -> Session {
    let mut session = Session::new(ArtifactStore::new(root)).unwrap();
    session.set_arch(seedsnap_core::architecture("x86_64").unwrap());
    session
}

/// 初期化して接続し、ブレークポイントで停止させたセッション
pub fn stopped_session(root: &std::path::Path, target: &Arc<Mutex<Target>>) -> Session {
    let mut session = session(root);
    session.init(SimulatedStub::new(target.clone())).unwrap();
    session.connect("127.0.0.1", 1234).unwrap();
    session.breakpoint(&format!("*0x{:x}", BREAK_AT)).unwrap();
    session.run().unwrap();
    session.wait("breakpoint-hit").unwrap();
    session
}
