use crate::engine::EngineEvent;
use crate::models::{Bar, StreamId};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad history line {line}: {detail}")]
    Parse { line: usize, detail: String },

    #[error("history unavailable: {0}")]
    Unavailable(String),
}

/// History needed by one stream activated mid-window
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillRequest {
    pub trading_date: NaiveDate,
    pub stream: StreamId,
    pub instrument: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Statistics from screening fetched bars
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillStats {
    pub fetched: usize,
    pub kept: usize,
    pub out_of_window: usize,
    pub validation_failures: usize,
}

/// Source of historical bars
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    /// Bars for `instrument` with timestamps in [start, end)
    async fn fetch_bars(
        &self,
        instrument: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BackfillError>;
}

/// No history at all: every request fails fast
pub struct NoHistory;

#[async_trait]
impl HistoricalSource for NoHistory {
    async fn fetch_bars(
        &self,
        instrument: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BackfillError> {
        Err(BackfillError::Unavailable(format!(
            "no historical source configured for {}",
            instrument
        )))
    }
}

/// History held in memory, filtered per request
pub struct MemoryHistory {
    bars: Vec<Bar>,
}

impl MemoryHistory {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self { bars }
    }
}

#[async_trait]
impl HistoricalSource for MemoryHistory {
    async fn fetch_bars(
        &self,
        instrument: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BackfillError> {
        Ok(self
            .bars
            .iter()
            .filter(|b| b.instrument == instrument && b.timestamp >= start && b.timestamp < end)
            .cloned()
            .collect())
    }
}

/// History read from a JSON-lines file of bars
pub struct JsonlHistory {
    path: PathBuf,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HistoricalSource for JsonlHistory {
    async fn fetch_bars(
        &self,
        instrument: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BackfillError> {
        let mut bars = read_bar_file(&self.path).await?;
        bars.retain(|b| b.instrument == instrument && b.timestamp >= start && b.timestamp < end);
        Ok(bars)
    }
}

/// Every bar in a JSON-lines file, in file order
pub async fn read_bar_file(path: &Path) -> Result<Vec<Bar>, BackfillError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let mut bars = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let bar: Bar = serde_json::from_str(line).map_err(|e| BackfillError::Parse {
            line: idx + 1,
            detail: e.to_string(),
        })?;
        bars.push(bar);
    }
    Ok(bars)
}

/// Sanity checks on one historical bar
fn validate_bar(bar: &Bar) -> Result<(), String> {
    let prices = [bar.open, bar.high, bar.low, bar.close];
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return Err(format!("non-positive or non-finite price in {:?}", prices));
    }
    if bar.high < bar.low {
        return Err(format!("high ({}) is less than low ({})", bar.high, bar.low));
    }
    if bar.high < bar.open.max(bar.close) || bar.low > bar.open.min(bar.close) {
        return Err("open/close outside high-low".to_string());
    }
    Ok(())
}

/// Keep only valid bars inside the requested window, oldest first
pub fn screen_bars(mut bars: Vec<Bar>, request: &BackfillRequest) -> (Vec<Bar>, BackfillStats) {
    let mut stats = BackfillStats {
        fetched: bars.len(),
        ..Default::default()
    };
    bars.sort_by_key(|b| b.timestamp);
    bars.retain(|bar| {
        if bar.instrument != request.instrument
            || bar.timestamp < request.start
            || bar.timestamp >= request.end
        {
            stats.out_of_window += 1;
            return false;
        }
        if let Err(e) = validate_bar(bar) {
            tracing::warn!(stream = %request.stream, ts = %bar.timestamp, error = %e, "Historical bar failed validation");
            stats.validation_failures += 1;
            return false;
        }
        true
    });
    stats.kept = bars.len();
    (bars, stats)
}

/// Fetch history off the dispatch path and report back as an engine event
///
/// The result always arrives as exactly one `BackfillCompleted` or
/// `BackfillFailed`, unless the engine has already shut down.
pub fn spawn_backfill(
    source: Arc<dyn HistoricalSource>,
    request: BackfillRequest,
    timeout: Duration,
    tx: mpsc::Sender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            stream = %request.stream,
            instrument = %request.instrument,
            start = %request.start,
            end = %request.end,
            "Backfill started"
        );

        let fetched = tokio::time::timeout(
            timeout,
            source.fetch_bars(&request.instrument, request.start, request.end),
        )
        .await;

        let event = match fetched {
            Ok(Ok(bars)) => {
                let (bars, stats) = screen_bars(bars, &request);
                tracing::info!(
                    stream = %request.stream,
                    fetched = stats.fetched,
                    kept = stats.kept,
                    out_of_window = stats.out_of_window,
                    validation_failures = stats.validation_failures,
                    "Backfill fetched"
                );
                EngineEvent::BackfillCompleted {
                    trading_date: request.trading_date,
                    stream: request.stream,
                    bars,
                }
            }
            Ok(Err(e)) => EngineEvent::BackfillFailed {
                trading_date: request.trading_date,
                stream: request.stream,
                reason: e.to_string(),
            },
            Err(_) => EngineEvent::BackfillFailed {
                trading_date: request.trading_date,
                stream: request.stream,
                reason: format!("timed out after {:?}", timeout),
            },
        };

        if tx.send(event).await.is_err() {
            tracing::debug!("Engine gone before backfill result was delivered");
        }
    })
}
