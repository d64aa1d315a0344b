//! syncnorris CLI: synchronize two directory trees.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use syncnorris::config::{SyncMode, SyncOptions};
use syncnorris::error::SyncError;
use syncnorris::fs::LocalBackend;
use syncnorris::sync::{
    ChannelSink, ComparisonMethod, DifferencesReport, ProgressEvent, ResolutionPolicy, SyncEngine,
};

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Oneway,
    Bidirectional,
}

#[derive(Clone, Copy, ValueEnum)]
enum CompareArg {
    NameSize,
    Timestamp,
    Binary,
    Hash,
    Md5,
}

#[derive(Clone, Copy, ValueEnum)]
enum ConflictArg {
    SourceWins,
    DestWins,
    Newer,
    Both,
    Ask,
}

/// Synchronize two directory trees, one-way or bidirectionally.
#[derive(Parser)]
#[command(name = "syncnorris")]
#[command(about = "Sync two directory trees; use --dry-run to preview.")]
struct Cli {
    /// Source directory.
    source: PathBuf,

    /// Destination directory.
    dest: PathBuf,

    /// Sync direction.
    #[arg(long, value_enum, default_value = "oneway")]
    mode: ModeArg,

    /// File comparison method.
    #[arg(long, value_enum, default_value = "hash")]
    compare: CompareArg,

    /// Conflict resolution policy (bidirectional).
    #[arg(long, value_enum, default_value = "newer")]
    conflict: ConflictArg,

    /// Exclude patterns (glob syntax). Can be given multiple times.
    #[arg(long, short = 'e', num_args = 1..)]
    exclude: Vec<String>,

    /// Plan and report without touching either side.
    #[arg(long)]
    dry_run: bool,

    /// One-way: delete destination files absent from the source.
    #[arg(long)]
    delete_orphans: bool,

    /// Number of transfer workers. Default: CPU count.
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Bandwidth limit in bytes per second. 0 disables the limit.
    #[arg(long, default_value = "0")]
    bwlimit: u64,

    /// Transfer buffer size in bytes.
    #[arg(long, default_value = "262144")]
    buffer_size: usize,

    /// Bidirectional: do not persist sync state between runs.
    #[arg(long)]
    no_state: bool,

    /// Write the differences report as JSON to this path.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Print the differences as text after the summary.
    #[arg(long)]
    diff: bool,

    /// Suppress the progress display.
    #[arg(long, short = 'q')]
    quiet: bool,
}

impl Cli {
    fn options(&self) -> SyncOptions {
        let defaults = SyncOptions::default();
        SyncOptions {
            mode: match self.mode {
                ModeArg::Oneway => SyncMode::OneWay,
                ModeArg::Bidirectional => SyncMode::Bidirectional,
            },
            comparison: match self.compare {
                CompareArg::NameSize => ComparisonMethod::NameSize,
                CompareArg::Timestamp => ComparisonMethod::Timestamp,
                CompareArg::Binary => ComparisonMethod::Binary,
                CompareArg::Hash => ComparisonMethod::Hash,
                CompareArg::Md5 => ComparisonMethod::Md5,
            },
            conflict_policy: match self.conflict {
                ConflictArg::SourceWins => ResolutionPolicy::SourceWins,
                ConflictArg::DestWins => ResolutionPolicy::DestWins,
                ConflictArg::Newer => ResolutionPolicy::Newer,
                ConflictArg::Both => ResolutionPolicy::Both,
                ConflictArg::Ask => ResolutionPolicy::Ask,
            },
            exclude_patterns: self.exclude.clone(),
            dry_run: self.dry_run,
            delete_orphans: self.delete_orphans,
            max_workers: self.workers.unwrap_or(defaults.max_workers),
            bandwidth_limit: self.bwlimit,
            buffer_size: self.buffer_size,
            stateful: !self.no_state,
            ..defaults
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Render progress events until the engine drops its sink.
async fn drive_progress(mut rx: tokio::sync::mpsc::Receiver<ProgressEvent>) {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::default_spinner());
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut done: u64 = 0;
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::ScanProgress { side, files, .. } => {
                bar.set_message(format!("scanning {side:?}: {files} files"));
            }
            ProgressEvent::FileStart { path, .. } => {
                bar.set_message(format!("[{done}] {path}"));
            }
            ProgressEvent::FileProgress { path, bytes_done, total } => {
                bar.set_message(format!("[{done}] {path} ({bytes_done}/{total})"));
            }
            ProgressEvent::FileComplete { .. } => done += 1,
            ProgressEvent::FileError { path, message } => {
                bar.println(format!("error: {path}: {message}"));
            }
            _ => {}
        }
    }
    bar.finish_and_clear();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let options = cli.options();
    let source = Arc::new(LocalBackend::new(cli.source.clone()));
    let dest = Arc::new(LocalBackend::new(cli.dest.clone()));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let mut engine = SyncEngine::new(source, dest, options)?.with_cancellation(cancel);

    let progress_task = if cli.quiet {
        None
    } else {
        let (sink, rx) = ChannelSink::new(256);
        engine = engine.with_progress(Arc::new(sink));
        Some(tokio::spawn(drive_progress(rx)))
    };

    let report = match engine.run().await {
        Ok(report) => report,
        Err(err) => {
            eprintln!("sync failed: {err}");
            let code = match err {
                SyncError::Cancelled => 3,
                _ => 2,
            };
            std::process::exit(code);
        }
    };

    // Dropping the engine drops its sink, ending the progress drain task.
    drop(engine);
    if let Some(task) = progress_task {
        let _ = task.await;
    }

    print!("{}", report.summary());

    if cli.diff || cli.report.is_some() {
        let differences = DifferencesReport::from_report(&report);
        if cli.diff {
            print!("{}", differences.to_text());
        }
        if let Some(path) = &cli.report {
            std::fs::write(path, differences.to_json()?)?;
            println!("differences report written to {}", path.display());
        }
    }

    std::process::exit(report.status.exit_code());
}
