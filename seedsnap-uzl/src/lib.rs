//! UZL コンテナ形式
//!
//! 取得したプロセススナップショット（メモリレコード群とレジスタレコード）を
//! 1つのバイト列へ詰め、また元へ戻します。
//!
//! ```text
//! "UZL"                      マジック
//! HDR  type=0 len=14         version:u16 arch:u32 data_size:u64
//! zlib {
//!   MEM  type=1 len          start:u64 end:u64 size:u64 perms:u8
//!                            name_flag:u8 name_size:u64 data name
//!   ...
//!   REG  type=2 len          size:u64 registers
//! }
//! ```
//!
//! 整数はすべてリトルエンディアンです。

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

/// マジックバイト
pub const MAGIC: &[u8; 3] = b"UZL";

/// 形式のバージョン
pub const VERSION: u16 = 0;

const HDR_TYPE: u16 = 0x0000;
const MEM_TYPE: u16 = 0x0001;
const REG_TYPE: u16 = 0x0002;

/// ヘッダ本体の長さ（version + arch + data_size）
const HDR_LEN: u64 = 2 + 4 + 8;
/// メモリレコードの固定部の長さ
const MEM_HDR_LEN: u64 = 8 + 8 + 8 + 1 + 1 + 8;
/// レジスタレコードの固定部の長さ
const REG_HDR_LEN: u64 = 8;

/// メモリ権限ビット
pub const PERM_READ: u8 = 0x04;
pub const PERM_WRITE: u8 = 0x02;
pub const PERM_EXECUTE: u8 = 0x01;

/// 形式のエラー
#[derive(Debug, Error)]
pub enum Error {
    #[error("unrecognised file type")]
    BadMagic,
    #[error("malformed header record")]
    BadHeader,
    #[error("unknown architecture code {0}")]
    UnknownArch(u32),
    #[error("unknown record type 0x{0:04x}")]
    UnknownRecord(u16),
    #[error("record data truncated")]
    Truncated,
    #[error("missing register record")]
    MissingRegisters,
    #[error("compressed body is {actual} bytes, header says {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// プロセッサアーキテクチャ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64 = 0,
    X86_32 = 1,
    Arm = 2,
    Aarch64 = 3,
    Ppc64 = 4,
    Ppc32 = 5,
    Mips64 = 6,
    Mips32 = 7,
}

impl Arch {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            0 => Arch::X86_64,
            1 => Arch::X86_32,
            2 => Arch::Arm,
            3 => Arch::Aarch64,
            4 => Arch::Ppc64,
            5 => Arch::Ppc32,
            6 => Arch::Mips64,
            7 => Arch::Mips32,
            other => return Err(Error::UnknownArch(other)),
        })
    }
}

/// 1つのメモリセグメントの記録
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRecord {
    pub start: u64,
    pub end: u64,
    pub perms: u8,
    pub data: Vec<u8>,
    pub name: Option<String>,
}

/// コンテナに入る内容全体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub arch: Arch,
    pub memory: Vec<MemoryRecord>,
    /// アーキテクチャ固有レイアウトで詰めたレジスタ
    pub registers: Vec<u8>,
}

/// キャプチャをUZL形式のバイト列にする
pub fn pack(capture: &Capture) -> Result<Vec<u8>> {
    let mut body = Vec::new();

    for rec in &capture.memory {
        let name = rec.name.as_deref().map(str::as_bytes).unwrap_or_default();
        let size = rec.data.len() as u64;

        body.extend_from_slice(&MEM_TYPE.to_le_bytes());
        body.extend_from_slice(&(MEM_HDR_LEN + size + name.len() as u64).to_le_bytes());
        body.extend_from_slice(&rec.start.to_le_bytes());
        body.extend_from_slice(&rec.end.to_le_bytes());
        body.extend_from_slice(&size.to_le_bytes());
        body.push(rec.perms);
        body.push(u8::from(rec.name.is_some()));
        body.extend_from_slice(&(name.len() as u64).to_le_bytes());
        body.extend_from_slice(&rec.data);
        body.extend_from_slice(name);
    }

    let regs = &capture.registers;
    body.extend_from_slice(&REG_TYPE.to_le_bytes());
    body.extend_from_slice(&(REG_HDR_LEN + regs.len() as u64).to_le_bytes());
    body.extend_from_slice(&(regs.len() as u64).to_le_bytes());
    body.extend_from_slice(regs);

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&body)?;
    let compressed = encoder.finish()?;

    let mut out = Vec::with_capacity(MAGIC.len() + 10 + HDR_LEN as usize + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&HDR_TYPE.to_le_bytes());
    out.extend_from_slice(&HDR_LEN.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&capture.arch.code().to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// UZL形式のバイト列からキャプチャを復元する
pub fn unpack(data: &[u8]) -> Result<Capture> {
    let mut cur = Cursor::new(data);

    if cur.bytes(MAGIC.len()).map_err(|_| Error::BadMagic)? != MAGIC {
        return Err(Error::BadMagic);
    }
    if cur.u16()? != HDR_TYPE || cur.u64()? != HDR_LEN {
        return Err(Error::BadHeader);
    }
    let _version = cur.u16()?;
    let arch = Arch::from_code(cur.u32()?)?;
    let data_size = cur.u64()?;

    let mut body = Vec::new();
    ZlibDecoder::new(cur.rest()).read_to_end(&mut body)?;
    if body.len() as u64 != data_size {
        return Err(Error::SizeMismatch {
            expected: data_size,
            actual: body.len() as u64,
        });
    }

    let mut cur = Cursor::new(&body);
    let mut memory = Vec::new();
    let mut registers = None;

    while !cur.at_end() {
        let kind = cur.u16()?;
        let _length = cur.u64()?;
        match kind {
            MEM_TYPE => {
                let start = cur.u64()?;
                let end = cur.u64()?;
                let size = to_usize(cur.u64()?)?;
                let perms = cur.u8()?;
                let has_name = cur.u8()? != 0;
                let name_size = to_usize(cur.u64()?)?;
                let data = cur.bytes(size)?.to_vec();
                let name = cur.bytes(name_size)?;
                memory.push(MemoryRecord {
                    start,
                    end,
                    perms,
                    data,
                    name: has_name.then(|| String::from_utf8_lossy(name).into_owned()),
                });
            }
            REG_TYPE => {
                let size = to_usize(cur.u64()?)?;
                registers = Some(cur.bytes(size)?.to_vec());
            }
            other => return Err(Error::UnknownRecord(other)),
        }
    }

    Ok(Capture {
        arch,
        memory,
        registers: registers.ok_or(Error::MissingRegisters)?,
    })
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::Truncated)
}

/// 境界チェック付きのリトルエンディアン読み取り
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Error::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(Error::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}
