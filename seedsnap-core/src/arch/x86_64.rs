//! x86-64
//!
//! fs_base と gs_base はデバッグスタブから読めないため、ターゲットに
//! `arch_prctl(ARCH_GET_FS / ARCH_GET_GS, scratch)` を実行させて取得します。

use super::Architecture;
use crate::registers::RegisterSet;
use crate::session::{Session, BREAKPOINT_HIT};
use crate::{Error, Result};
use seedsnap_mi::MiValue;
use seedsnap_uzl::Arch;
use tracing::{debug, info, warn};

pub struct X86_64;

/// `syscall` 命令
const SYSCALL: [u8; 2] = [0x0f, 0x05];

const SYS_ARCH_PRCTL: u64 = 0x9e;
const ARCH_GET_FS: u64 = 0x1003;
const ARCH_GET_GS: u64 = 0x1004;

/// 注入で値が変わるレジスタ
///
/// rax, rdi, rsi, rip は書き込むもの。rcx と r11 は `syscall` 命令が上書きする。
const CLOBBERED: [&str; 6] = ["rip", "rax", "rdi", "rsi", "rcx", "r11"];

const LAYOUT: [&str; 27] = [
    "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx",
    "rsi", "rdi", "orig_rax", "rip", "cs", "eflags", "rsp", "ss", "fs_base", "gs_base", "ds",
    "es", "fs", "gs",
];

impl Architecture for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn uzl_id(&self) -> Arch {
        Arch::X86_64
    }

    fn register_layout(&self) -> &'static [&'static str] {
        &LAYOUT
    }

    fn extract_hidden_registers(&self, session: &mut Session) -> Result<RegisterSet> {
        let mut hidden = RegisterSet::new();
        for (name, code) in [("fs_base", ARCH_GET_FS), ("gs_base", ARCH_GET_GS)] {
            let value = arch_prctl(session, code)?;
            info!(register = name, value = format_args!("0x{:x}", value), "recovered hidden register");
            hidden.insert_u64(name, value);
        }
        Ok(hidden)
    }
}

/// `arch_prctl` を注入して1つのセグメントベースを読む
fn arch_prctl(session: &mut Session, code: u64) -> Result<u64> {
    let gadget = find_syscall_gadget(session)?;
    let scratch = scratch_address(session)?;
    debug!(
        gadget = format_args!("0x{:x}", gadget),
        scratch = format_args!("0x{:x}", scratch),
        "injecting arch_prctl"
    );

    let mut injection = Injection::begin(session, scratch)?;
    injection.arm(gadget + SYSCALL.len() as u64)?;

    let target = injection.session();
    target.write_register("rax", SYS_ARCH_PRCTL)?;
    target.write_register("rdi", code)?;
    target.write_register("rsi", scratch)?;
    target.write_register("rip", gadget)?;

    injection.execute()?;
    let bytes = injection.session().read_bytes(scratch, 8)?;
    injection.restore()?;

    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Extraction("short read from scratch memory".to_string()))?;
    Ok(u64::from_le_bytes(bytes))
}

/// ダンプ済みの実行可能セグメントから `syscall` 命令を探す
fn find_syscall_gadget(session: &Session) -> Result<u64> {
    let pid = session.require_pid()?;

    for segment in session
        .segments()
        .iter()
        .filter(|s| s.is_executable() && !s.is_kernel())
    {
        let path = session.store().segment_path(pid, segment)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "executable segment has no dump");
                continue;
            }
        };
        if let Some(offset) = find_syscall(&data) {
            return Ok(segment.start() + offset as u64);
        }
    }

    Err(Error::Extraction(
        "no syscall instruction in any dumped executable segment".to_string(),
    ))
}

fn find_syscall(data: &[u8]) -> Option<usize> {
    data.windows(SYSCALL.len()).position(|w| w == SYSCALL)
}

/// 最初の書き込み可能セグメントの先頭
fn scratch_address(session: &Session) -> Result<u64> {
    session
        .segments()
        .iter()
        .find(|s| s.is_writable())
        .map(|s| s.start())
        .ok_or_else(|| Error::Extraction("no writable segment for scratch memory".to_string()))
}

/// 注入中のターゲット状態
///
/// 生成時にスクラッチ領域とレジスタを保存します。`restore` を呼ばずに
/// 破棄された場合（エラーで抜けた場合）は `Drop` で復元を試みます。
struct Injection<'s> {
    session: &'s mut Session,
    scratch: u64,
    saved_bytes: Vec<u8>,
    saved_registers: Vec<(&'static str, u64)>,
    /// 注入用に設定したブレークポイント番号
    breakpoint: Option<String>,
    restored: bool,
}

impl<'s> Injection<'s> {
    fn begin(session: &'s mut Session, scratch: u64) -> Result<Self> {
        let saved_bytes = session.read_bytes(scratch, 8)?;
        let current = session.read_registers()?;
        let saved_registers = CLOBBERED
            .iter()
            .map(|&name| current.u64(name).map(|value| (name, value)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            session,
            scratch,
            saved_bytes,
            saved_registers,
            breakpoint: None,
            restored: false,
        })
    }

    fn session(&mut self) -> &mut Session {
        &mut *self.session
    }

    /// `syscall` 直後にブレークポイントを置く
    fn arm(&mut self, address: u64) -> Result<()> {
        let reply = self.session.breakpoint(&format!("*0x{:x}", address))?;
        self.breakpoint = reply
            .payload
            .as_ref()
            .and_then(|p| p.get("bkpt"))
            .and_then(MiValue::as_tuple)
            .and_then(|bkpt| bkpt.get_str("number"))
            .map(str::to_string);
        Ok(())
    }

    /// 実行を再開し、注入用ブレークポイントで止まるのを待つ
    fn execute(&mut self) -> Result<()> {
        self.session.run()?;
        let stop = self.session.wait(BREAKPOINT_HIT)?;

        match (self.breakpoint.as_deref(), stop.field("bkptno")) {
            (Some(ours), Some(hit)) if ours != hit => Err(Error::Extraction(format!(
                "stopped at breakpoint {} instead of {}",
                hit, ours
            ))),
            _ => Ok(()),
        }
    }

    fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.put_back()
    }

    /// 保存した状態を書き戻す
    ///
    /// 途中で失敗しても残りの書き戻しは続け、最初のエラーを返す。
    fn put_back(&mut self) -> Result<()> {
        let mut first_error = None;

        for &(name, value) in &self.saved_registers {
            if let Err(e) = self.session.write_register(name, value) {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.session.write_bytes(self.scratch, &self.saved_bytes) {
            first_error.get_or_insert(e);
        }
        if let Some(number) = self.breakpoint.take() {
            if let Err(e) = self.session.delete_breakpoint(&number) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Injection<'_> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.put_back() {
            warn!(error = %e, "failed to restore target after aborted injection");
        }
    }
}
