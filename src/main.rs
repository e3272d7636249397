use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use slicetrace::config::{Config, OutputConfig, OutputFormat};
use slicetrace::sched::{SchedulingSlice, SliceListener, UNKNOWN_PID};
use slicetrace::session::Session;
use slicetrace::sink::{JsonLinesSink, SummarySink};
use slicetrace::tracer::stats::EventStats;

/// Per-core scheduling slices from the kernel context switch stream.
#[derive(Parser)]
#[command(name = "slicetrace", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply without one.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Trace until Ctrl-C or until the duration elapses (the default).
    Run {
        /// Stop after this long, e.g. "10s" or "2m".
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        duration: Option<Duration>,

        /// How often live event counters are logged.
        #[arg(long, default_value = "10s", value_parser = humantime_serde::re::humantime::parse_duration)]
        stats_interval: Duration,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (duration, stats_interval) = match cli.command {
        Some(Command::Version) => {
            println!("slicetrace {}", version::full());
            return Ok(());
        }
        Some(Command::Run {
            duration,
            stats_interval,
        }) => (duration, stats_interval),
        None => (None, Duration::from_secs(10)),
    };

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // Initialize tracing. Logs go to stderr so slice output owns stdout.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting slicetrace",
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg, duration, stats_interval))
}

async fn run(cfg: Config, duration: Option<Duration>, stats_interval: Duration) -> Result<()> {
    let output = Output::new(&cfg.output);
    let session = Arc::new(Session::new(platform_source()?, &cfg, output.listener()));

    {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || session.start())
            .await
            .context("joining session start")??;
    }

    let cancel = CancellationToken::new();
    let reporter = spawn_event_stats_reporter(session.event_stats(), stats_interval, cancel.clone());

    wait_for_shutdown(duration).await;

    cancel.cancel();
    if let Err(e) = reporter.await {
        debug!(error = %e, "event stats reporter ended abnormally");
    }

    let diagnostics = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || session.stop())
            .await
            .context("joining session stop")?
    };

    output.finish(cfg.output.summary_top)?;

    if let Some(diagnostics) = diagnostics {
        let json =
            serde_json::to_string_pretty(&diagnostics).context("encoding diagnostics")?;
        eprintln!("{json}");
    }

    info!("slicetrace stopped");

    Ok(())
}

#[cfg(all(windows, feature = "etw"))]
fn platform_source() -> Result<slicetrace::tracer::etw::EtwSource> {
    Ok(slicetrace::tracer::etw::EtwSource::new())
}

#[cfg(not(all(windows, feature = "etw")))]
fn platform_source() -> Result<slicetrace::tracer::scripted::ScriptedSource> {
    anyhow::bail!("live kernel tracing requires Windows and the `etw` feature")
}

async fn wait_for_shutdown(duration: Option<Duration>) {
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("received Ctrl-C, stopping"),
            Err(e) => warn!(error = %e, "listening for Ctrl-C failed, stopping"),
        },
        () = deadline => info!(?duration, "trace duration elapsed, stopping"),
    }
}

fn spawn_event_stats_reporter(
    stats: Arc<EventStats>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let snapshot = stats.snapshot();
                    let total = snapshot.total();

                    if total == 0 && snapshot.malformed == 0 {
                        continue;
                    }

                    info!(
                        events = total,
                        slices = snapshot.slices,
                        malformed = snapshot.malformed,
                        interval = ?period,
                        "event stats",
                    );

                    for (kind, count) in &snapshot.by_kind {
                        debug!(kind = %kind, count, "event stats by kind");
                    }
                }
            }
        }
    })
}

/// Slice destination selected by `output.format`.
enum Output {
    Jsonl(Arc<JsonLinesSink<io::Stdout>>),
    Summary(Arc<SummarySink>),
    Discard,
}

impl Output {
    fn new(cfg: &OutputConfig) -> Self {
        match cfg.format {
            OutputFormat::Jsonl => Self::Jsonl(Arc::new(JsonLinesSink::new(io::stdout()))),
            OutputFormat::Summary => Self::Summary(Arc::new(SummarySink::new())),
            OutputFormat::None => Self::Discard,
        }
    }

    fn listener(&self) -> Arc<dyn SliceListener> {
        match self {
            Self::Jsonl(sink) => Arc::clone(sink) as Arc<dyn SliceListener>,
            Self::Summary(sink) => Arc::clone(sink) as Arc<dyn SliceListener>,
            Self::Discard => Arc::new(|_: SchedulingSlice| {}),
        }
    }

    fn finish(&self, top: usize) -> Result<()> {
        match self {
            Self::Jsonl(sink) => {
                sink.flush().context("flushing slice output")?;
                if sink.write_errors() > 0 {
                    warn!(
                        written = sink.written(),
                        failed = sink.write_errors(),
                        "some slices could not be written"
                    );
                }
            }
            Self::Summary(sink) => {
                println!(
                    "{:>10} {:>12} {:>10} {:>8} {:>6} {:>14}",
                    "PID", "ON_CPU_MS", "SLICES", "THREADS", "CORES", "MAX_SLICE_US"
                );
                for p in sink.top(top) {
                    let pid = if p.pid == UNKNOWN_PID {
                        "?".to_string()
                    } else {
                        p.pid.to_string()
                    };
                    println!(
                        "{:>10} {:>12.3} {:>10} {:>8} {:>6} {:>14.1}",
                        pid,
                        p.on_cpu_ns as f64 / 1e6,
                        p.slices,
                        p.threads,
                        p.cores,
                        p.max_slice_ns as f64 / 1e3,
                    );
                }
            }
            Self::Discard => {}
        }

        Ok(())
    }
}
