//! MIレコードのモデルとパーサ
//!
//! デバッガが出力する1行を、型・ステータス・トークン・ペイロードを持つ
//! 構造化メッセージに変換します。

/// メッセージの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// コマンドへの応答（`^done` など）
    Result,
    /// 非同期通知（`*stopped`、`=thread-group-started` など）
    Async,
    /// コンソールストリーム（`~"..."`）
    Console,
    /// ログストリーム（`&"..."`）
    Log,
    /// それ以外の出力
    Output,
}

/// 行が届いたパイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// MIの値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiValue {
    String(String),
    List(Vec<MiValue>),
    Tuple(MiTuple),
}

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MiValue]> {
        match self {
            MiValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&MiTuple> {
        match self {
            MiValue::Tuple(tuple) => Some(tuple),
            _ => None,
        }
    }
}

/// 順序付きのキー/値の組
///
/// MIではキーの重複があり得るため、マップではなく出現順のリストで保持します。
/// 検索は最初に一致したエントリを返します。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiTuple {
    entries: Vec<(String, MiValue)>,
}

impl MiTuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: MiValue) {
        self.entries.push((key.into(), value));
    }

    pub fn get(&self, key: &str) -> Option<&MiValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MiValue::as_str)
    }
}

/// デバッガからの1メッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    /// ステータスキーワード（`done`、`running`、`stopped` など）
    pub message: Option<String>,
    /// エコーされたトークン
    pub token: Option<u64>,
    pub payload: Option<MiTuple>,
    /// ストリームレコードの本文
    pub text: Option<String>,
    pub stream: Stream,
}

impl Message {
    /// パースできなかった行をそのまま包む
    pub fn output(line: &str, stream: Stream) -> Self {
        Self {
            kind: MessageType::Output,
            message: None,
            token: None,
            payload: None,
            text: Some(line.to_string()),
            stream,
        }
    }

    /// 停止通知かどうか
    pub fn is_stop(&self) -> bool {
        self.message.as_deref() == Some("stopped")
    }

    /// 停止通知の理由
    pub fn stop_reason(&self) -> Option<&str> {
        if !self.is_stop() {
            return None;
        }
        self.payload.as_ref()?.get_str("reason")
    }

    /// ペイロード内の文字列フィールド
    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.get_str(key)
    }
}

/// デバッガ出力の1行をパースする
///
/// プロンプト `(gdb)` と空行は `None` になります。
/// MIとして解釈できない行は `MessageType::Output` として返します。
pub fn parse_record(line: &str, stream: Stream) -> Option<Message> {
    let line = line.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed == "(gdb)" {
        return None;
    }

    if stream == Stream::Stderr {
        return Some(Message::output(line, stream));
    }

    Some(parse_mi(line, stream).unwrap_or_else(|| Message::output(line, stream)))
}

fn parse_mi(line: &str, stream: Stream) -> Option<Message> {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    let token = if digits > 0 {
        Some(line[..digits].parse::<u64>().ok()?)
    } else {
        None
    };
    let rest = &line[digits..];
    let sigil = rest.chars().next()?;
    let body = &rest[sigil.len_utf8()..];

    match sigil {
        '^' | '*' | '+' | '=' => {
            let kind = if sigil == '^' {
                MessageType::Result
            } else {
                MessageType::Async
            };
            let (class, results) = match body.find(',') {
                Some(idx) => (&body[..idx], Some(&body[idx + 1..])),
                None => (body, None),
            };
            if class.is_empty() {
                return None;
            }
            let payload = match results {
                Some(results) => {
                    let mut parser = Parser::new(results);
                    let tuple = parser.results()?;
                    if !parser.at_end() {
                        return None;
                    }
                    Some(tuple)
                }
                None => None,
            };
            Some(Message {
                kind,
                message: Some(class.to_string()),
                token,
                payload,
                text: None,
                stream,
            })
        }
        '~' | '&' | '@' => {
            let kind = match sigil {
                '~' => MessageType::Console,
                '&' => MessageType::Log,
                _ => MessageType::Output,
            };
            let mut parser = Parser::new(body);
            let text = parser.c_string()?;
            if !parser.at_end() {
                return None;
            }
            Some(Message {
                kind,
                message: None,
                token,
                payload: None,
                text: Some(text),
                stream,
            })
        }
        _ => None,
    }
}

/// MI値の再帰下降パーサ
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// result ( "," result )*
    fn results(&mut self) -> Option<MiTuple> {
        let mut tuple = MiTuple::new();
        loop {
            let (key, value) = self.result()?;
            tuple.push(key, value);
            if !self.eat(b',') {
                return Some(tuple);
            }
        }
    }

    /// variable "=" value
    fn result(&mut self) -> Option<(String, MiValue)> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'=' {
                break;
            }
            if matches!(b, b',' | b'{' | b'}' | b'[' | b']' | b'"') {
                return None;
            }
            self.pos += 1;
        }
        if self.pos == start || !self.eat(b'=') {
            return None;
        }
        let key = std::str::from_utf8(&self.input[start..self.pos - 1]).ok()?;
        let value = self.value()?;
        Some((key.to_string(), value))
    }

    fn value(&mut self) -> Option<MiValue> {
        match self.peek()? {
            b'"' => self.c_string().map(MiValue::String),
            b'{' => self.tuple().map(MiValue::Tuple),
            b'[' => self.list().map(MiValue::List),
            _ => None,
        }
    }

    fn tuple(&mut self) -> Option<MiTuple> {
        if !self.eat(b'{') {
            return None;
        }
        if self.eat(b'}') {
            return Some(MiTuple::new());
        }
        let tuple = self.results()?;
        if !self.eat(b'}') {
            return None;
        }
        Some(tuple)
    }

    fn list(&mut self) -> Option<Vec<MiValue>> {
        if !self.eat(b'[') {
            return None;
        }
        let mut items = Vec::new();
        if self.eat(b']') {
            return Some(items);
        }
        loop {
            let item = match self.peek()? {
                b'"' | b'{' | b'[' => self.value()?,
                _ => {
                    // 名前付き要素のリストは1要素のタプルとして保持する
                    let (key, value) = self.result()?;
                    let mut single = MiTuple::new();
                    single.push(key, value);
                    MiValue::Tuple(single)
                }
            };
            items.push(item);
            if self.eat(b']') {
                return Some(items);
            }
            if !self.eat(b',') {
                return None;
            }
        }
    }

    /// C形式の文字列リテラルをデコードする
    fn c_string(&mut self) -> Option<String> {
        if !self.eat(b'"') {
            return None;
        }
        let mut out = Vec::new();
        loop {
            let b = self.peek()?;
            self.pos += 1;
            match b {
                b'"' => break,
                b'\\' => {
                    let esc = self.peek()?;
                    self.pos += 1;
                    match esc {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'"' => out.push(b'"'),
                        b'\\' => out.push(b'\\'),
                        b'0'..=b'7' => {
                            let mut value = u32::from(esc - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'7') => {
                                        value = value * 8 + u32::from(d - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((value & 0xff) as u8);
                        }
                        other => {
                            out.push(b'\\');
                            out.push(other);
                        }
                    }
                }
                other => out.push(other),
            }
        }
        Some(String::from_utf8_lossy(&out).into_owned())
    }
}
