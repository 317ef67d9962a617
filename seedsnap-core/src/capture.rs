//! キャプチャ処理
//!
//! 接続からブレークポイントでの停止、メモリとレジスタのダンプまでを
//! 1つのセッションで順に実行し、エンコーダへ渡す内容を組み立てます。

use crate::parse::breakpoint_location;
use crate::segment::Segment;
use crate::session::{Session, BREAKPOINT_HIT};
use crate::{architecture, Error, Result};
use seedsnap_mi::Transport;
use seedsnap_uzl::{Capture, MemoryRecord};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// キャプチャの設定
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// gdbserver のアドレス
    pub address: String,
    pub port: u16,
    /// アーキテクチャ名（レジストリのキー）
    pub arch: String,
    /// ブレークポイント位置（`0x...` ならアドレス、それ以外はシンボル等）
    pub breakpoint: String,
    pub follow_child: bool,
    pub verbose: bool,
    /// 成果物ディレクトリのルート
    pub work_dir: PathBuf,
    /// 最初の停止を待つ時間の上限
    pub stop_timeout: Option<Duration>,
}

/// キャプチャを実行する
///
/// 成否にかかわらず最後にセッションを停止します。
pub fn capture<T: Transport + 'static>(
    session: &mut Session,
    transport: T,
    config: &CaptureConfig,
) -> Result<Capture> {
    session.set_arch(architecture(&config.arch)?);
    session.set_verbose(config.verbose);
    let result = session
        .init(transport)
        .and_then(|_| run(session, config));
    let shutdown = session.shutdown();

    let capture = result?;
    shutdown?;
    Ok(capture)
}

fn run(session: &mut Session, config: &CaptureConfig) -> Result<Capture> {
    let arch = session.require_arch()?;

    session.connect(&config.address, config.port)?;
    if config.follow_child {
        session.follow_child()?;
    }
    session.breakpoint(&breakpoint_location(&config.breakpoint))?;
    session.run()?;
    match config.stop_timeout {
        Some(timeout) => session.wait_timeout(BREAKPOINT_HIT, timeout)?,
        None => session.wait(BREAKPOINT_HIT)?,
    };
    info!(pid = ?session.pid(), "target stopped at breakpoint");

    let segments: Vec<Segment> = session
        .vmmap()?
        .iter()
        .filter(|s| s.is_dumpable())
        .cloned()
        .collect();

    let mut memory = Vec::with_capacity(segments.len());
    for segment in &segments {
        match dump(session, segment) {
            Ok(record) => memory.push(record),
            Err(e @ Error::SegmentDump { .. }) => warn!(error = %e, "skipping segment"),
            Err(e) => return Err(e),
        }
    }
    info!(dumped = memory.len(), total = segments.len(), "dumped memory segments");

    let registers = session.dump_registers()?;
    let packed = arch.pack(&registers)?;

    Ok(Capture {
        arch: arch.uzl_id(),
        memory,
        registers: packed,
    })
}

/// 1セグメントをダンプして記録にする
fn dump(session: &mut Session, segment: &Segment) -> Result<MemoryRecord> {
    let path = session.dump_segment(segment)?;
    let data = std::fs::read(&path).map_err(|e| Error::SegmentDump {
        start: segment.start(),
        end: segment.end(),
        detail: format!("cannot read {}: {}", path.display(), e),
    })?;

    Ok(MemoryRecord {
        start: segment.start(),
        end: segment.end(),
        perms: segment.perms().bits(),
        data,
        name: segment.name().map(str::to_string),
    })
}
