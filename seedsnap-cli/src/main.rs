//! seedsnap CLI
//!
//! gdbserver 上のプロセスをブレークポイントで止め、メモリとレジスタを
//! UZL ファイルに書き出します。

use anyhow::{Context, Result};
use clap::Parser;
use seedsnap_core::{capture, ArtifactStore, CaptureConfig, GdbTransport, Session};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// seedsnap - capture a process snapshot through a remote gdbserver
#[derive(Parser)]
#[command(name = "seedsnap")]
#[command(version)]
#[command(about = "Capture memory and registers of a remote process at a breakpoint", long_about = None)]
struct Cli {
    /// Address of the gdbserver
    address: String,

    /// Port of the gdbserver
    port: u16,

    /// Target architecture
    #[arg(short, long)]
    arch: String,

    /// Breakpoint location (hex address or symbol)
    #[arg(short, long)]
    breakpoint: String,

    /// Output UZL file
    #[arg(short, long)]
    out_file: PathBuf,

    /// Follow the child process after fork
    #[arg(short, long)]
    follow_child: bool,

    /// Log every debugger message
    #[arg(short, long)]
    verbose: bool,

    /// Debugger executable
    #[arg(long, default_value = "gdb")]
    gdb: String,

    /// Directory for downloaded maps, segment dumps and regs.json
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Give up if the breakpoint is not hit within this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl Cli {
    fn config(&self) -> CaptureConfig {
        CaptureConfig {
            address: self.address.clone(),
            port: self.port,
            arch: self.arch.clone(),
            breakpoint: self.breakpoint.clone(),
            follow_child: self.follow_child,
            verbose: self.verbose,
            work_dir: self.work_dir.clone(),
            stop_timeout: self.timeout.map(Duration::from_secs),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.config();
    let transport = GdbTransport::spawn(&cli.gdb)
        .with_context(|| format!("failed to start debugger '{}'", cli.gdb))?;

    let mut session = Session::new(ArtifactStore::new(&config.work_dir))?;

    // Ctrl-C でも待機を打ち切ってデバッガを終了させる
    let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling...");
        let _ = cancel_tx.try_send(());
    })
    .context("failed to install Ctrl-C handler")?;
    session.set_cancel(cancel_rx);

    let snapshot = capture(&mut session, transport, &config)
        .with_context(|| format!("capture from {}:{} failed", config.address, config.port))?;

    let bytes = seedsnap_uzl::pack(&snapshot)?;
    std::fs::write(&cli.out_file, &bytes)
        .with_context(|| format!("failed to write {}", cli.out_file.display()))?;

    info!(
        path = %cli.out_file.display(),
        segments = snapshot.memory.len(),
        bytes = bytes.len(),
        "wrote snapshot"
    );
    Ok(())
}

/// `RUST_LOG` があればそれに従い、無ければ `--verbose` で debug にする
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
