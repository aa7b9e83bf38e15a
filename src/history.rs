//! Circular log buffer history
//!
//! Circles log pulse counts into a ring of [`LOG_BUFFER_SLOTS`] slots, four
//! timestamped entries per slot. A pull walks the ring from the slot after
//! the stored cursor to the slot the device is currently writing, converts
//! each entry to watts and watt-hours and advances the cursor only once the
//! whole batch has been read.
//!
//! This module is pure: the device model performs the reads and hands the
//! slots in here.

use chrono::NaiveDateTime;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::codec::LOG_BUFFER_SLOTS;
use crate::power::{pulses_to_kws, Calibration};
use crate::protocol::LogSlot;

/// Upper bound on slots read in one pull
pub const DEFAULT_BATCH_SLOTS: u32 = 100;

/// Interval assumed when no neighbouring entry gives one
pub const FALLBACK_INTERVAL_SECS: i64 = 3600;

/// Entries per log buffer slot
pub const ENTRIES_PER_SLOT: u8 = 4;

/// Position of the last entry handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogCursor {
    pub index: u32,
    /// Entries of `index` already consumed, 0 to 4
    pub sub_index: u8,
    /// Timestamp of the last consumed entry; `None` accepts everything
    pub timestamp: Option<NaiveDateTime>,
}

impl LogCursor {
    /// First slot and sub entry still to be read
    pub fn next_position(&self) -> (u32, u8) {
        if self.sub_index >= ENTRIES_PER_SLOT {
            ((self.index + 1) % LOG_BUFFER_SLOTS, 0)
        } else {
            (self.index % LOG_BUFFER_SLOTS, self.sub_index)
        }
    }
}

/// One completed logging interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub timestamp: NaiveDateTime,
    pub watts: f64,
    pub watt_hours: f64,
}

/// A converted entry together with its position inside the slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotRow {
    pub sub_index: u8,
    pub row: HistoryRow,
}

/// Slots to read for the next pull, in order
///
/// Walks circularly from the slot after the cursor up to `last_written`,
/// capped at `batch` slots. Empty when the cursor is already past the slot
/// being written.
pub fn plan_slots(cursor: &LogCursor, last_written: u32, batch: u32) -> Vec<u32> {
    let (first, _) = cursor.next_position();
    let last = last_written % LOG_BUFFER_SLOTS;
    let span = (last + LOG_BUFFER_SLOTS - first) % LOG_BUFFER_SLOTS;
    if span == LOG_BUFFER_SLOTS - 1 {
        // first == last + 1: everything up to the write position is consumed
        return Vec::new();
    }
    let count = (span + 1).min(batch.max(1));
    (0..count).map(|n| (first + n) % LOG_BUFFER_SLOTS).collect()
}

/// Convert the written entries of one slot to rows
///
/// `previous` is the timestamp of the entry before this slot, used to size
/// the first interval. Production entries share the timestamp of the usage
/// entry they follow; their interval comes from the entry before that.
pub fn slot_rows(
    slot: &LogSlot,
    previous: Option<NaiveDateTime>,
    calibration: &Calibration,
    reverse_polarity: bool,
) -> Vec<SlotRow> {
    let written: Vec<(u8, NaiveDateTime, i64)> = slot
        .entries
        .iter()
        .enumerate()
        .filter_map(|(i, e)| e.timestamp.map(|ts| (i as u8, ts, e.pulses)))
        .collect();
    let Some(&(_, first_ts, _)) = written.first() else {
        return Vec::new();
    };

    let mut prev = previous.unwrap_or(first_ts);
    let mut prev2 = prev;
    let mut intervals: Vec<i64> = Vec::with_capacity(written.len());
    for &(_, ts, _) in &written {
        let base = if ts == prev { prev2 } else { prev };
        intervals.push((ts - base).num_seconds());
        prev2 = prev;
        prev = ts;
    }

    for i in 0..written.len() {
        if intervals[i] > 0 {
            continue;
        }
        let ts = written[i].1;
        let neighbour = match (written.get(i + 1), written.get(i + 2)) {
            (Some(next), Some(after)) if next.1 == ts => (after.1 - ts).num_seconds(),
            (Some(next), _) if next.1 != ts => (next.1 - ts).num_seconds(),
            _ => 0,
        };
        intervals[i] = if neighbour > 0 {
            neighbour
        } else {
            debug!("log slot {}: no usable neighbour for entry {}, assuming one hour", slot.index, i);
            FALLBACK_INTERVAL_SECS
        };
    }

    written
        .iter()
        .zip(intervals)
        .map(|(&(sub_index, timestamp, pulses), interval)| {
            let seconds = interval as f64;
            let kws = pulses_to_kws(calibration.correct(pulses as f64, seconds));
            let mut watts = kws / seconds * 1000.0;
            let mut watt_hours = kws / 3600.0 * 1000.0;
            if reverse_polarity {
                watts = -watts;
                watt_hours = -watt_hours;
            }
            SlotRow {
                sub_index,
                row: HistoryRow { timestamp, watts, watt_hours },
            }
        })
        .collect()
}

/// Collects rows across slots, filtering already-seen entries and merging
/// usage/production pairs that share a timestamp
#[derive(Debug, Clone)]
pub struct HistoryAccumulator {
    production: bool,
    last_ts: Option<NaiveDateTime>,
    rows: Vec<HistoryRow>,
    consumed: Option<(u32, u8)>,
}

impl HistoryAccumulator {
    pub fn new(cursor: &LogCursor, production: bool) -> Self {
        Self {
            production,
            last_ts: cursor.timestamp,
            rows: Vec::new(),
            consumed: None,
        }
    }

    /// Timestamp of the newest accepted entry, or the cursor's
    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.last_ts
    }

    /// Offer one converted entry from slot `index`
    ///
    /// Returns whether the entry was consumed.
    pub fn push(&mut self, index: u32, entry: SlotRow) -> bool {
        let ts = entry.row.timestamp;
        if let Some(last) = self.last_ts {
            if ts < last {
                return false;
            }
        }

        let collides = self.last_ts == Some(ts) && self.production && entry.sub_index & 1 == 1;
        match self.rows.last_mut() {
            Some(prev) if collides && prev.timestamp == ts => {
                prev.watts += entry.row.watts;
                prev.watt_hours += entry.row.watt_hours;
            }
            _ => self.rows.push(entry.row),
        }
        self.last_ts = Some(ts);
        self.consumed = Some((index, entry.sub_index + 1));
        true
    }

    /// Rows and the cursor to store once every slot was read successfully
    pub fn finish(self, previous: &LogCursor) -> (Vec<HistoryRow>, LogCursor) {
        let cursor = match self.consumed {
            Some((index, sub_index)) => LogCursor {
                index,
                sub_index,
                timestamp: self.last_ts,
            },
            None => *previous,
        };
        (self.rows, cursor)
    }
}

/// Turn a batch of slots, read in plan order, into rows and a new cursor
///
/// The sub-entry filter from the cursor applies to the first slot only.
pub fn collect_history(
    cursor: &LogCursor,
    slots: &[LogSlot],
    calibration: &Calibration,
    production: bool,
    reverse_polarity: bool,
) -> (Vec<HistoryRow>, LogCursor) {
    let (_, first_sub) = cursor.next_position();
    let mut acc = HistoryAccumulator::new(cursor, production);

    for (n, slot) in slots.iter().enumerate() {
        let skip_below = if n == 0 { first_sub } else { 0 };
        for entry in slot_rows(slot, acc.last_timestamp(), calibration, reverse_polarity) {
            if entry.sub_index < skip_below {
                continue;
            }
            acc.push(slot.index, entry);
        }
    }
    acc.finish(cursor)
}

/// Logging interval in minutes and whether production is logged, judged
/// from the newest entries of the log
///
/// Needs at least three rows; two equal trailing timestamps mean the
/// device interleaves production entries.
pub fn detect_interval(rows: &[HistoryRow]) -> Option<(u32, bool)> {
    if rows.len() < 3 {
        warn!("too few log entries to determine the logging interval");
        return None;
    }
    let n = rows.len();
    let step = rows[n - 1].timestamp - rows[n - 2].timestamp;
    let (span, production) = if step.num_seconds() == 0 {
        (rows[n - 1].timestamp - rows[n - 3].timestamp, true)
    } else {
        (step, false)
    };
    let minutes = span.num_minutes();
    if minutes <= 0 {
        return None;
    }
    Some((minutes as u32, production))
}
