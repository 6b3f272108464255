use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use driftwatch::adaptive::{compute_window_sizes, derive_stream_characteristics};
use driftwatch::autotune::{
    AutoTuneController, FeedbackStats, Thresholds, TuneHistoryLog, TuneOutcome,
};
use driftwatch::config::{DetectionProfile, EngineConfig, LogFormat};
use driftwatch::{DetectError, IngestOutcome, StreamManager};

#[derive(Parser)]
#[command(
    name = "driftwatch",
    about = "Compression-based drift and anomaly detection for event streams",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults: $DRIFTWATCH_CONFIG, then /etc/driftwatch/driftwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines event file through a detector
    Detect {
        /// Event file, one event per line
        #[arg(long)]
        input: PathBuf,

        /// Detection profile preset (sensitive, balanced, strict, custom)
        #[arg(long)]
        profile: Option<DetectionProfile>,

        /// Stream name used for logs and records
        #[arg(long, default_value = "default")]
        stream: String,

        /// Print the full explanation under every anomaly
        #[arg(long)]
        explain: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Recommend baseline and window sizes for an event sample
    Size {
        /// Event file, one event per line
        #[arg(long)]
        input: PathBuf,

        /// Time span the sample covers, in seconds
        #[arg(long)]
        span_secs: Option<u64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Evaluate threshold adjustments from feedback counts
    Tune {
        /// Feedback entries in the evaluation period
        #[arg(long)]
        total: usize,

        /// Entries marked false positive
        #[arg(long)]
        false_positives: usize,

        /// Entries marked confirmed
        #[arg(long)]
        confirmed: usize,

        /// Mean NCD of the false positives
        #[arg(long, default_value = "0")]
        avg_fp_ncd: f64,

        /// Current NCD threshold
        #[arg(long)]
        ncd: f64,

        /// Current p-value threshold
        #[arg(long)]
        p_value: f64,

        /// Stream the feedback belongs to
        #[arg(long, default_value = "default")]
        stream: String,

        /// Tune history file (JSON lines); enables cooldown across runs
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Apply a detection profile preset first
        #[arg(long)]
        profile: Option<DetectionProfile>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default(),
    };

    init_tracing(&config, cli.log_json);

    match cli.command {
        Commands::Detect {
            input,
            profile,
            stream,
            explain,
            json,
        } => run_detect(config, &input, profile, &stream, explain, json).await?,
        Commands::Size {
            input,
            span_secs,
            json,
        } => run_size(&config, &input, span_secs, json).await?,
        Commands::Tune {
            total,
            false_positives,
            confirmed,
            avg_fp_ncd,
            ncd,
            p_value,
            stream,
            history,
        } => {
            anyhow::ensure!(
                false_positives + confirmed <= total,
                "false positives plus confirmed exceed total feedback"
            );
            let stats = FeedbackStats::new(total, false_positives, confirmed).with_avg_fp_ncd(avg_fp_ncd);
            run_tune(&config, &stream, stats, Thresholds { ncd, p_value }, history.as_deref()).await?;
        }
        Commands::Config { profile } => {
            let mut config = config;
            if let Some(profile) = profile {
                config.detector = config.detector.with_profile(profile);
            }
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

fn init_tracing(config: &EngineConfig, force_json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if force_json || config.logging.format == LogFormat::Json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn read_events(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read events: {}", path.display()))?;
    Ok(content.lines().map(str::to_owned).collect())
}

async fn run_detect(
    mut config: EngineConfig,
    input: &Path,
    profile: Option<DetectionProfile>,
    stream: &str,
    explain: bool,
    json: bool,
) -> Result<()> {
    if let Some(profile) = profile {
        config.detector = config.detector.with_profile(profile);
    }
    let events = read_events(input).await?;

    let manager = StreamManager::new(&config)?;
    manager.create_stream(stream, config.detector.clone())?;
    tracing::info!(
        stream,
        events = events.len(),
        baseline = config.detector.baseline_size,
        window = config.detector.window_size,
        "replaying events"
    );

    let (mut cycles, mut anomalies, mut dropped, mut skipped) = (0usize, 0usize, 0usize, 0usize);
    for (idx, line) in events.iter().enumerate() {
        let lineno = idx + 1;
        match manager.ingest(stream, line.as_bytes()) {
            Ok(IngestOutcome::Added) => {}
            Ok(IngestOutcome::Dropped) => {
                dropped += 1;
                continue;
            }
            Err(DetectError::EmptyInput) => {
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("{}:{lineno}", input.display())),
        }

        let Some(record) = manager.poll(stream)? else {
            continue;
        };
        cycles += 1;
        let m = &record.outcome.metrics;
        if m.is_anomaly {
            anomalies += 1;
        }

        if json {
            println!("{}", serde_json::to_string(&record)?);
        } else {
            println!(
                "line {:>6} | {:<7} | ncd {:.3} | p {:.3} | composite {:.2} | confidence {:>5.1}%",
                lineno,
                if m.is_anomaly { "ANOMALY" } else { "ok" },
                m.ncd,
                m.p_value,
                m.composite_score,
                m.confidence_level * 100.0
            );
            if explain && m.is_anomaly {
                for text in m.explanation.lines() {
                    println!("    {text}");
                }
            }
        }
    }

    let stats = manager.stats(stream)?;
    if !stats.is_ready {
        tracing::warn!(
            needed = config.detector.events_to_ready(),
            have = stats.baseline_len + stats.window_len,
            "not enough events for a detection cycle"
        );
    }
    if !json {
        println!(
            "\n{} events, {} cycles, {} anomalies, {} dropped, {} blank",
            events.len(),
            cycles,
            anomalies,
            dropped,
            skipped
        );
    }
    Ok(())
}

async fn run_size(config: &EngineConfig, input: &Path, span_secs: Option<u64>, json: bool) -> Result<()> {
    let events = read_events(input).await?;
    let chars = derive_stream_characteristics(&events, span_secs.map(Duration::from_secs));
    let rec = compute_window_sizes(&chars, &config.adaptive);

    if json {
        let out = serde_json::json!({ "characteristics": chars, "recommendation": rec });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Stream characteristics");
        println!("  events/hour       {:.0}", chars.avg_events_per_hour);
        println!("  avg event size    {} bytes", chars.avg_event_size_bytes);
        println!("  entropy           {:.2} bits/byte", chars.avg_baseline_entropy);
        println!("  pattern diversity {:.2}", chars.pattern_diversity);
        println!("Recommendation");
        println!("  baseline_size     {}", rec.baseline_size);
        println!("  window_size       {}", rec.window_size);
    }
    Ok(())
}

async fn run_tune(
    config: &EngineConfig,
    stream: &str,
    stats: FeedbackStats,
    current: Thresholds,
    history: Option<&Path>,
) -> Result<()> {
    let controller = AutoTuneController::new(config.autotune.clone());
    let log = match history {
        Some(path) => {
            let log = TuneHistoryLog::open(path).await?;
            if let Some(last) = log.last_tune(stream).await? {
                controller.restore_last_tune(stream, last);
            }
            Some(log)
        }
        None => None,
    };

    match controller.maybe_tune(stream, &stats, current, Utc::now()) {
        TuneOutcome::Cooling { remaining } => {
            println!(
                "cooling down: {}m {}s until the next adjustment is allowed",
                remaining.num_minutes(),
                remaining.num_seconds() % 60
            );
        }
        TuneOutcome::Evaluated { decision, records } => {
            println!(
                "{}: ncd {:.4} -> {:.4}, p-value {:.4} -> {:.4} ({})",
                decision.reason,
                current.ncd,
                decision.new_ncd,
                current.p_value,
                decision.new_p_value,
                if decision.should_adjust { "applied" } else { "unchanged" }
            );
            if let Some(log) = &log {
                log.append_all(&records).await?;
                if !records.is_empty() {
                    tracing::info!(path = %log.path().display(), count = records.len(), "tune history appended");
                }
            }
        }
    }
    Ok(())
}
