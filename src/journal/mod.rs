// Append-only execution journal
//
// One JSON object per line. Every entry is flushed and synced before the
// caller acts on it, so the file is always at least as far along as the
// gateway.
use crate::execution::{Fingerprint, Intent, OrderId};
use crate::models::{ExitReason, StreamId};
use crate::range::FrozenRange;
use crate::stream::BracketPlan;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt journal entry at line {line}: {detail}")]
    Corrupt { line: usize, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEvent {
    RangeLocked {
        range: FrozenRange,
        brackets: Option<BracketPlan>,
    },
    IntentRecorded {
        intent: Intent,
    },
    Submitted {
        order_id: OrderId,
    },
    /// Cumulative filled quantity of the entry
    EntryFilled {
        filled_qty: u32,
        price: f64,
    },
    /// Written before the protective pair reaches the gateway
    ProtectiveRequested {
        quantity: u32,
        stop_price: f64,
        target_price: f64,
    },
    ProtectivePlaced {
        stop_order: OrderId,
        target_order: OrderId,
        quantity: u32,
        stop_price: f64,
        target_price: f64,
    },
    BreakEvenApplied {
        stop_price: f64,
    },
    /// Written before a market order closing open quantity is sent
    FlattenRequested {
        reason: ExitReason,
        quantity: u32,
    },
    FlattenSubmitted {
        order_id: OrderId,
        reason: ExitReason,
        quantity: u32,
    },
    Exited {
        reason: ExitReason,
        exit_qty: u32,
        price: f64,
    },
    Cancelled,
    Rejected {
        reason: String,
    },
    FailClosed {
        reason: String,
    },
}

/// Coarse lifecycle position derived from the latest event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Locked,
    Recorded,
    Submitted,
    Filled,
    Protecting,
    Protected,
    Flattening,
    Exited,
    Cancelled,
    Rejected,
    FailClosed,
}

impl JournalEvent {
    pub fn outcome(&self) -> Outcome {
        match self {
            JournalEvent::RangeLocked { .. } => Outcome::Locked,
            JournalEvent::IntentRecorded { .. } => Outcome::Recorded,
            JournalEvent::Submitted { .. } => Outcome::Submitted,
            JournalEvent::EntryFilled { .. } => Outcome::Filled,
            JournalEvent::ProtectiveRequested { .. } => Outcome::Protecting,
            JournalEvent::FlattenRequested { .. } | JournalEvent::FlattenSubmitted { .. } => {
                Outcome::Flattening
            }
            JournalEvent::ProtectivePlaced { .. } | JournalEvent::BreakEvenApplied { .. } => {
                Outcome::Protected
            }
            JournalEvent::Exited { .. } => Outcome::Exited,
            JournalEvent::Cancelled => Outcome::Cancelled,
            JournalEvent::Rejected { .. } => Outcome::Rejected,
            JournalEvent::FailClosed { .. } => Outcome::FailClosed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub fingerprint: Fingerprint,
    pub trading_date: NaiveDate,
    pub stream: StreamId,
    pub recorded_at: DateTime<Utc>,
    pub event: JournalEvent,
}

/// Frozen range and brackets recovered for a restarted stream
#[derive(Debug, Clone, PartialEq)]
pub struct LockedState {
    pub range: FrozenRange,
    pub brackets: Option<BracketPlan>,
}

/// What the journal knows about one intent
#[derive(Debug, Clone, PartialEq)]
pub struct IntentRecord {
    pub intent: Intent,
    pub outcome: Outcome,
    pub order_id: Option<OrderId>,
}

impl IntentRecord {
    /// Recorded but never confirmed as sent to the gateway
    pub fn is_unknown_submission(&self) -> bool {
        self.outcome == Outcome::Recorded
    }
}

pub struct ExecutionJournal {
    path: Option<PathBuf>,
    file: Option<File>,
    entries: Vec<JournalEntry>,
    latest: HashMap<Fingerprint, usize>,
}

impl ExecutionJournal {
    /// Journal that lives only in memory (replays and tests)
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: None,
            entries: Vec::new(),
            latest: HashMap::new(),
        }
    }

    /// Open (or create) a file-backed journal and load its history
    ///
    /// A torn final line from a crash mid-write is dropped and truncated
    /// away. Damage anywhere else is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut raw = String::new();
        file.read_to_string(&mut raw)?;

        let mut journal = Self::in_memory();
        let mut good_len = 0usize;
        let lines: Vec<&str> = raw.split_inclusive('\n').collect();

        for (idx, line) in lines.iter().enumerate() {
            let is_last = idx + 1 == lines.len();
            let text = line.trim_end();
            if text.is_empty() {
                good_len += line.len();
                continue;
            }

            match (serde_json::from_str::<JournalEntry>(text), line.ends_with('\n')) {
                (Ok(entry), true) => {
                    journal.index(entry);
                    good_len += line.len();
                }
                _ if is_last => {
                    tracing::warn!(
                        path = %path.display(),
                        line = idx + 1,
                        "Dropping torn final journal line"
                    );
                }
                (Err(e), _) => {
                    return Err(JournalError::Corrupt {
                        line: idx + 1,
                        detail: e.to_string(),
                    })
                }
                (Ok(_), false) => {
                    return Err(JournalError::Corrupt {
                        line: idx + 1,
                        detail: "missing line terminator".to_string(),
                    })
                }
            }
        }

        if good_len < raw.len() {
            file.set_len(good_len as u64)?;
        }

        tracing::info!(
            path = %path.display(),
            entries = journal.entries.len(),
            "Execution journal opened"
        );

        journal.path = Some(path);
        journal.file = Some(file);
        Ok(journal)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn index(&mut self, entry: JournalEntry) {
        self.latest
            .insert(entry.fingerprint.clone(), self.entries.len());
        self.entries.push(entry);
    }

    /// Durably append one event; returns its sequence number
    pub fn append(
        &mut self,
        fingerprint: Fingerprint,
        trading_date: NaiveDate,
        stream: StreamId,
        recorded_at: DateTime<Utc>,
        event: JournalEvent,
    ) -> Result<u64, JournalError> {
        let seq = self.entries.last().map_or(1, |e| e.seq + 1);
        let entry = JournalEntry {
            seq,
            fingerprint,
            trading_date,
            stream,
            recorded_at,
            event,
        };

        if let Some(file) = self.file.as_mut() {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
            file.flush()?;
            file.sync_data()?;
        }

        tracing::debug!(
            seq,
            fingerprint = %entry.fingerprint,
            stream = %entry.stream,
            outcome = ?entry.event.outcome(),
            "Journal append"
        );

        self.index(entry);
        Ok(seq)
    }

    /// Latest entry for a fingerprint
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<&JournalEntry> {
        self.latest.get(fingerprint).map(|&idx| &self.entries[idx])
    }

    pub fn outcome(&self, fingerprint: &Fingerprint) -> Option<Outcome> {
        self.lookup(fingerprint).map(|e| e.event.outcome())
    }

    /// All entries for a fingerprint, oldest first
    pub fn history<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
    ) -> impl Iterator<Item = &'a JournalEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| &e.fingerprint == fingerprint)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn restore_locked_state(
        &self,
        trading_date: NaiveDate,
        stream: &StreamId,
    ) -> Option<LockedState> {
        let fingerprint = Fingerprint::for_range_lock(trading_date, stream);
        let locked = self.history(&fingerprint).find_map(|entry| match &entry.event {
            JournalEvent::RangeLocked { range, brackets } => Some(LockedState {
                range: range.clone(),
                brackets: brackets.clone(),
            }),
            _ => None,
        });
        locked
    }

    /// Every intent recorded for a stream on a date, with its latest outcome
    pub fn intents_for(&self, trading_date: NaiveDate, stream: &StreamId) -> Vec<IntentRecord> {
        self.entries
            .iter()
            .filter(|e| e.trading_date == trading_date && &e.stream == stream)
            .filter_map(|e| match &e.event {
                JournalEvent::IntentRecorded { intent } => Some(intent),
                _ => None,
            })
            .map(|intent| {
                let order_id = self.history(&intent.fingerprint).find_map(|e| match &e.event {
                    JournalEvent::Submitted { order_id } => Some(order_id.clone()),
                    _ => None,
                });
                IntentRecord {
                    outcome: self
                        .outcome(&intent.fingerprint)
                        .unwrap_or(Outcome::Recorded),
                    intent: intent.clone(),
                    order_id,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentPolicy;
    use crate::models::{Direction, StreamKey};
    use crate::stream::{compute_brackets, round_to_tick};
    use chrono::{NaiveTime, TimeZone};
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()
    }

    fn key() -> StreamKey {
        StreamKey::new(date(), "ES", "S1", NaiveTime::from_hms_opt(7, 30, 0).unwrap())
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 12, 30, 0).unwrap()
    }

    fn intent() -> Intent {
        Intent::new(
            date(),
            key().id(),
            "ES",
            Direction::Long,
            5010.25,
            Some(4990.25),
            Some(5020.25),
            5016.75,
            5010.5,
            2,
        )
    }

    fn range() -> FrozenRange {
        FrozenRange {
            high: Some(5010.0),
            low: Some(5000.0),
            bar_count: 12,
            expected_bars: 12,
            window_start: ts() - chrono::Duration::hours(1),
            lock: ts(),
        }
    }

    #[test]
    fn test_latest_outcome_tracked() {
        let mut journal = ExecutionJournal::in_memory();
        let i = intent();
        let fp = i.fingerprint.clone();

        assert!(journal.lookup(&fp).is_none());
        journal
            .append(fp.clone(), date(), key().id(), ts(), JournalEvent::IntentRecorded { intent: i })
            .unwrap();
        assert_eq!(journal.outcome(&fp), Some(Outcome::Recorded));

        journal
            .append(
                fp.clone(),
                date(),
                key().id(),
                ts(),
                JournalEvent::Submitted {
                    order_id: OrderId("o-1".to_string()),
                },
            )
            .unwrap();
        assert_eq!(journal.outcome(&fp), Some(Outcome::Submitted));
        assert_eq!(journal.history(&fp).count(), 2);
        assert_eq!(journal.entries()[1].seq, 2);
    }

    #[test]
    fn test_reload_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("journal.jsonl");
        let i = intent();

        {
            let mut journal = ExecutionJournal::open(&path).unwrap();
            journal
                .append(
                    Fingerprint::for_range_lock(date(), &key().id()),
                    date(),
                    key().id(),
                    ts(),
                    JournalEvent::RangeLocked {
                        range: range(),
                        brackets: None,
                    },
                )
                .unwrap();
            journal
                .append(
                    i.fingerprint.clone(),
                    date(),
                    key().id(),
                    ts(),
                    JournalEvent::IntentRecorded { intent: i.clone() },
                )
                .unwrap();
        }

        let journal = ExecutionJournal::open(&path).unwrap();
        assert_eq!(journal.len(), 2);
        let locked = journal.restore_locked_state(date(), &key().id()).unwrap();
        assert_eq!(locked.range, range());

        let records = journal.intents_for(date(), &key().id());
        assert_eq!(records.len(), 1);
        assert!(records[0].is_unknown_submission());
        assert_eq!(records[0].intent, i);
    }

    #[test]
    fn test_restored_lock_is_bit_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let policy = InstrumentPolicy {
            symbol: "GC".to_string(),
            tick_size: 0.1,
            quantity: 1,
            target_distance: 10.0,
            stop_multiplier: 3.0,
            breakeven_fraction: 0.65,
            breakeven_offset_ticks: 1,
        };
        let frozen = FrozenRange {
            high: Some(round_to_tick(10000.4, 0.1)),
            low: Some(round_to_tick(9993.7, 0.1)),
            ..range()
        };
        let plan = compute_brackets(&frozen, &policy).unwrap();

        {
            let mut journal = ExecutionJournal::open(&path).unwrap();
            journal
                .append(
                    Fingerprint::for_range_lock(date(), &key().id()),
                    date(),
                    key().id(),
                    ts(),
                    JournalEvent::RangeLocked {
                        range: frozen.clone(),
                        brackets: Some(plan.clone()),
                    },
                )
                .unwrap();
        }

        let journal = ExecutionJournal::open(&path).unwrap();
        let locked = journal.restore_locked_state(date(), &key().id()).unwrap();
        assert_eq!(locked.range, frozen);
        assert_eq!(locked.brackets, Some(plan.clone()));
        assert_eq!(
            locked.brackets.unwrap().long.entry.to_bits(),
            plan.long.entry.to_bits()
        );
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        {
            let mut journal = ExecutionJournal::open(&path).unwrap();
            journal
                .append(
                    intent().fingerprint,
                    date(),
                    key().id(),
                    ts(),
                    JournalEvent::Cancelled,
                )
                .unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":2,\"fingerp").unwrap();
        drop(file);

        let mut journal = ExecutionJournal::open(&path).unwrap();
        assert_eq!(journal.len(), 1);
        journal
            .append(intent().fingerprint, date(), key().id(), ts(), JournalEvent::Cancelled)
            .unwrap();
        drop(journal);

        let journal = ExecutionJournal::open(&path).unwrap();
        assert_eq!(journal.len(), 2);
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        fs::write(&path, "not json\n{}\n").unwrap();
        assert!(matches!(
            ExecutionJournal::open(&path),
            Err(JournalError::Corrupt { line: 1, .. })
        ));
    }
}
