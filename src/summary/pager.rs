//! Cursor-addressed slicing of a run's result buckets.
//!
//! A summary is flattened into a stable sequence of bucket entries (one per
//! non-empty subfeature bucket, tiers in summary order). The cursor is the
//! decimal offset into that sequence.

use serde::{Deserialize, Serialize};

use super::{Reports, RunSummary};
use crate::storage::{Envelope, Report};

/// Page size used when none (or zero, or garbage) is requested.
pub const DEFAULT_PAGE_LIMIT: usize = 2;
/// Largest page size a client may request.
pub const MAX_PAGE_LIMIT: usize = 10;

/// One bucket of items, shaped like the `items` stream message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketEntry {
    pub run_id: String,
    pub tier: Option<String>,
    pub key: String,
    pub chunk_index: u32,
    pub page: Envelope,
}

/// Result of [`build_items_slice`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsSlice {
    pub events: Vec<BucketEntry>,
    /// `None` once the slice reaches the end of the sequence.
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub total: usize,
    /// Offset the slice actually started at after clamping.
    pub offset: usize,
}

/// Resolve a requested page size. Zero or unparseable values fall back to
/// [`DEFAULT_PAGE_LIMIT`]; everything else is clamped to `1..=MAX_PAGE_LIMIT`.
pub fn clamp_limit(raw: Option<&str>) -> usize {
    match raw.and_then(parse_saturating) {
        None | Some(0) => DEFAULT_PAGE_LIMIT,
        Some(n) => n.clamp(1, MAX_PAGE_LIMIT as i64) as usize,
    }
}

/// Resolve a cursor to an offset in `0..=total`.
pub fn resolve_offset(raw: Option<&str>, total: usize) -> usize {
    match raw.and_then(parse_saturating) {
        Some(n) if n > 0 => (n as u64).min(total as u64) as usize,
        _ => 0,
    }
}

/// Parse a decimal integer. Digit strings too long for `i64` saturate
/// instead of being treated as garbage.
fn parse_saturating(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return Some(n);
    }
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(if negative { i64::MIN } else { i64::MAX })
}

fn report_entries(run_id: &str, tier: Option<&str>, report: &Report, out: &mut Vec<BucketEntry>) {
    for (index, bucket) in report.buckets.iter().enumerate() {
        if bucket.page.items.is_empty() {
            continue;
        }
        out.push(BucketEntry {
            run_id: run_id.to_string(),
            tier: tier.map(str::to_string),
            key: bucket.key.clone(),
            chunk_index: index as u32,
            page: bucket.page.clone(),
        });
    }
}

/// Flatten every non-empty bucket of the summary, in delivery order.
pub fn bucket_entries(summary: &RunSummary) -> Vec<BucketEntry> {
    let mut entries = Vec::new();
    match &summary.reports {
        Some(Reports::Tiered(tiers)) => {
            for tier in tiers {
                report_entries(&summary.run_id, Some(&tier.tier), &tier.report, &mut entries);
            }
        }
        Some(Reports::Single(report)) => {
            report_entries(&summary.run_id, report.tier.as_deref(), report, &mut entries);
        }
        None => {}
    }
    entries
}

/// Slice the summary's bucket sequence at `cursor`, returning at most `limit`
/// entries. Never fails: bad input is clamped.
pub fn build_items_slice(
    summary: &RunSummary,
    cursor: Option<&str>,
    limit: Option<&str>,
) -> ItemsSlice {
    let entries = bucket_entries(summary);
    let total = entries.len();
    let limit = clamp_limit(limit);
    let offset = resolve_offset(cursor, total);

    let events: Vec<BucketEntry> = entries.into_iter().skip(offset).take(limit).collect();
    let end = offset + events.len();
    let next_cursor = (end < total).then(|| end.to_string());

    ItemsSlice {
        has_more: next_cursor.is_some(),
        next_cursor,
        total,
        offset,
        events,
    }
}
