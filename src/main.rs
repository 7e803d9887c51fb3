use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use rangebot::backfill::{read_bar_file, HistoricalSource, JsonlHistory, MemoryHistory, NoHistory};
use rangebot::config::EngineConfig;
use rangebot::engine::{run_feed, Engine};
use rangebot::execution::PaperGateway;
use rangebot::journal::ExecutionJournal;
use rangebot::models::Bar;
use rangebot::sim::{merge_feeds, SessionBarGenerator, SessionScenario};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rangebot", about = "Session opening-range breakout engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a JSON-lines bar file with paper execution
    Replay {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        bars: PathBuf,
        /// JSON-lines bars served to streams that start mid-window
        #[arg(long)]
        history: Option<PathBuf>,
        /// Overrides the journal path from the config file
        #[arg(long)]
        journal: Option<PathBuf>,
    },
    /// Run one synthetic session with paper execution
    Simulate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        #[arg(long, value_enum, default_value = "breakout-up")]
        scenario: SessionScenario,
        #[arg(long, default_value_t = 5000.0)]
        base_price: f64,
        /// Exchange-local HH:MM to start the live feed; earlier bars become history
        #[arg(long, value_parser = parse_hhmm)]
        start_at: Option<NaiveTime>,
        /// Journal file; in-memory when omitted
        #[arg(long)]
        journal: Option<PathBuf>,
    },
    /// Print the entries of an execution journal
    Journal {
        #[arg(long)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    match Cli::parse().command {
        Command::Replay {
            config,
            bars,
            history,
            journal,
        } => replay(&config, &bars, history, journal).await,
        Command::Simulate {
            config,
            date,
            seed,
            scenario,
            base_price,
            start_at,
            journal,
        } => simulate(&config, date, seed, scenario, base_price, start_at, journal).await,
        Command::Journal { path } => print_journal(&path),
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rangebot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("invalid time '{}': {}", s, e))
}

async fn replay(
    config_path: &Path,
    bars_path: &Path,
    history: Option<PathBuf>,
    journal: Option<PathBuf>,
) -> Result<()> {
    let config = EngineConfig::load(config_path)?;
    let journal_path = journal.unwrap_or_else(|| config.journal_path.clone());
    let journal = ExecutionJournal::open(&journal_path)
        .with_context(|| format!("opening journal {}", journal_path.display()))?;

    let mut feed = read_bar_file(bars_path)
        .await
        .with_context(|| format!("reading bars from {}", bars_path.display()))?;
    feed.sort_by_key(|b| b.timestamp);

    let history: Arc<dyn HistoricalSource> = match history {
        Some(path) => Arc::new(JsonlHistory::new(path)),
        None => Arc::new(NoHistory),
    };

    tracing::info!("🚀 Replaying {} bars from {}", feed.len(), bars_path.display());
    run(&config, journal, feed, history).await
}

async fn simulate(
    config_path: &Path,
    date: NaiveDate,
    seed: u64,
    scenario: SessionScenario,
    base_price: f64,
    start_at: Option<NaiveTime>,
    journal: Option<PathBuf>,
) -> Result<()> {
    let config = EngineConfig::load(config_path)?;
    let clock = config.clock()?;
    let interval = config.bar_interval();

    let mut start = None;
    let mut end = None;
    let mut breakout = None;
    for session in &config.sessions {
        let ws = clock.to_instant(date, session.range_start)?;
        let cutoff = clock.to_instant(date, session.cutoff)?;
        start = Some(start.map_or(ws, |s: DateTime<Utc>| s.min(ws)));
        end = Some(end.map_or(cutoff, |e: DateTime<Utc>| e.max(cutoff)));
        if let Some(first_slot) = session.slots.iter().min() {
            let lock = clock.to_instant(date, *first_slot)?;
            breakout = Some(breakout.map_or(lock, |b: DateTime<Utc>| b.min(lock)));
        }
    }
    let (Some(start), Some(end)) = (start, end) else {
        anyhow::bail!("no sessions configured");
    };
    let breakout = breakout.unwrap_or(start);
    let end = end + interval * 2;

    let feeds: Vec<Vec<Bar>> = config
        .instruments
        .iter()
        .enumerate()
        .map(|(idx, policy)| {
            let mut generator = SessionBarGenerator::new(
                seed + idx as u64,
                policy.symbol.clone(),
                base_price,
                policy.tick_size,
            );
            generator.generate(scenario, start, end, interval, breakout)
        })
        .collect();
    let all = merge_feeds(feeds);

    let feed_start = match start_at {
        Some(t) => clock.to_instant(date, t)?,
        None => start,
    };
    let feed: Vec<Bar> = all.iter().filter(|b| b.timestamp >= feed_start).cloned().collect();
    let history: Arc<dyn HistoricalSource> = Arc::new(MemoryHistory::new(all));

    let journal = match journal {
        Some(path) => ExecutionJournal::open(&path)
            .with_context(|| format!("opening journal {}", path.display()))?,
        None => ExecutionJournal::in_memory(),
    };

    tracing::info!(
        "🎲 Simulating {:?} on {} (seed {}): {} bars from {}",
        scenario,
        date,
        seed,
        feed.len(),
        feed_start
    );
    run(&config, journal, feed, history).await
}

async fn run(
    config: &EngineConfig,
    journal: ExecutionJournal,
    feed: Vec<Bar>,
    history: Arc<dyn HistoricalSource>,
) -> Result<()> {
    let mut engine = Engine::new(config, PaperGateway::new(), journal)?;
    run_feed(&mut engine, feed, history).await;

    let snapshot = engine.diagnostics();
    tracing::info!("\n📊 Session summary:");
    for stream in &snapshot.streams {
        let outcome = stream
            .completion
            .as_ref()
            .map(|c| format!("{:?}", c))
            .unwrap_or_else(|| "incomplete".to_string());
        tracing::info!("  {} [{}] {}", stream.stream, stream.state, outcome);
    }
    for exposure in snapshot.exposure.iter().filter(|e| e.open_qty > 0) {
        tracing::warn!("⚠️  Open exposure left: {:?}", exposure);
    }

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn print_journal(path: &Path) -> Result<()> {
    let journal = ExecutionJournal::open(path)
        .with_context(|| format!("opening journal {}", path.display()))?;

    for entry in journal.entries() {
        println!(
            "{:>5} {} {} {:<14} {} {}",
            entry.seq,
            entry.recorded_at.format("%Y-%m-%dT%H:%M:%SZ"),
            entry.trading_date,
            entry.stream,
            entry.fingerprint.short(),
            serde_json::to_string(&entry.event)?
        );
    }

    // Latest outcome per fingerprint, in first-seen order
    let mut seen = std::collections::HashSet::new();
    println!();
    for entry in journal.entries() {
        if !seen.insert(entry.fingerprint.clone()) {
            continue;
        }
        if let Some(outcome) = journal.outcome(&entry.fingerprint) {
            println!("{} {:<14} {:?}", entry.fingerprint.short(), entry.stream, outcome);
        }
    }
    tracing::info!("📒 {} journal entries, {} fingerprints", journal.len(), seen.len());
    Ok(())
}
