//! Merges one parsed feed snapshot into the store under the newer-wins rule.
//!
//! Planning is pure ([`plan`]); applying the plan happens inside a single
//! write transaction, so a feed's changes either all commit or none do.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{ReaderError, Result};
use crate::storage::entries::{insert_entry, load_entries_updated, update_entry};
use crate::storage::feeds::{load_feed_for_update, write_caching_info, write_feed};
use crate::storage::{Database, EntryData, FeedForUpdate, ParsedFeed};

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The feed row (title, link, updated, ...) was overwritten.
    pub feed_updated: bool,
    /// Ids of entries inserted for the first time, in snapshot order.
    pub new_entries: Vec<String>,
    /// Ids of existing entries whose content was overwritten.
    pub modified_entries: Vec<String>,
}

impl ReconcileOutcome {
    /// True if nothing visible changed.
    pub fn is_unchanged(&self) -> bool {
        !self.feed_updated && self.new_entries.is_empty() && self.modified_entries.is_empty()
    }
}

/// Strict "newer" with a total order over optional timestamps.
///
/// A missing stored value is older than any present one; a missing incoming
/// value is never newer.
pub fn is_newer(parsed: Option<DateTime<Utc>>, stored: Option<DateTime<Utc>>) -> bool {
    match (parsed, stored) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(parsed), Some(stored)) => parsed > stored,
    }
}

/// The minimal set of writes for one snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Plan<'a> {
    pub write_feed: bool,
    pub write_caching: bool,
    pub inserts: Vec<&'a EntryData>,
    pub updates: Vec<&'a EntryData>,
}

impl Plan<'_> {
    fn is_empty(&self) -> bool {
        !self.write_feed
            && !self.write_caching
            && self.inserts.is_empty()
            && self.updates.is_empty()
    }
}

/// Reject snapshots the store cannot key; keep the last occurrence of a
/// repeated id.
fn validate<'a>(feed_url: &str, parsed: &'a ParsedFeed) -> Result<Vec<&'a EntryData>> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut entries: Vec<&EntryData> = Vec::with_capacity(parsed.entries.len());

    for entry in &parsed.entries {
        if entry.id.trim().is_empty() {
            return Err(ReaderError::parse_message(feed_url, "entry without id"));
        }
        match positions.get(entry.id.as_str()) {
            Some(&pos) => {
                tracing::debug!(feed = %feed_url, entry = %entry.id, "Duplicate entry id in snapshot, keeping last");
                entries[pos] = entry;
            }
            None => {
                positions.insert(entry.id.as_str(), entries.len());
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}

/// Decide what to write, given the stored state of the feed and its entries.
pub(crate) fn plan<'a>(
    stored: &FeedForUpdate,
    stored_entries: &HashMap<String, Option<DateTime<Utc>>>,
    parsed: &'a ParsedFeed,
    entries: &[&'a EntryData],
) -> Plan<'a> {
    let mut plan = Plan {
        write_caching: parsed.caching != stored.caching,
        ..Plan::default()
    };

    let feed_newer = stored.stale || is_newer(parsed.feed.updated, stored.updated);
    let both_dated = parsed.feed.updated.is_some() && stored.updated.is_some();
    if both_dated && !feed_newer {
        // Same or older snapshot of a dated feed: nothing in it is new.
        return plan;
    }

    plan.write_feed = feed_newer;

    for &entry in entries {
        match stored_entries.get(&entry.id) {
            None => plan.inserts.push(entry),
            Some(&stored_updated) => {
                if stored.stale || is_newer(entry.updated, stored_updated) {
                    plan.updates.push(entry);
                }
            }
        }
    }
    plan
}

/// Reconcile one parsed snapshot into the store in a single transaction.
///
/// Replaying the same snapshot performs no writes.
///
/// # Errors
///
/// - `ReaderError::Parse` if an entry has no id (nothing is written)
/// - `ReaderError::FeedNotFound` if the feed was removed meanwhile
/// - `ReaderError::Storage` if the transaction fails
pub async fn reconcile(
    db: &Database,
    feed_url: &str,
    parsed: &ParsedFeed,
) -> Result<ReconcileOutcome> {
    let entries = validate(feed_url, parsed)?;
    let now = Utc::now();

    // Take the write lock up front: a deferred transaction that reads first
    // cannot be upgraded once another writer has committed (SQLITE_BUSY_SNAPSHOT).
    let mut tx = db.pool.begin_with("BEGIN IMMEDIATE").await?;

    let stored = load_feed_for_update(&mut tx, feed_url)
        .await?
        .ok_or_else(|| ReaderError::feed_not_found(feed_url))?;
    let stored_entries = load_entries_updated(&mut tx, feed_url).await?;

    let plan = plan(&stored, &stored_entries, parsed, &entries);
    if plan.is_empty() {
        tracing::info!(feed = %feed_url, "Feed not updated, skipping");
        return Ok(ReconcileOutcome::default());
    }

    if plan.write_feed {
        write_feed(&mut tx, feed_url, &parsed.feed, now).await?;
    }
    if plan.write_caching {
        write_caching_info(&mut tx, feed_url, &parsed.caching).await?;
    }
    for entry in &plan.inserts {
        insert_entry(&mut tx, feed_url, entry, now).await?;
    }
    for entry in &plan.updates {
        update_entry(&mut tx, feed_url, entry).await?;
    }

    tx.commit().await?;

    let outcome = ReconcileOutcome {
        feed_updated: plan.write_feed,
        new_entries: plan.inserts.iter().map(|e| e.id.clone()).collect(),
        modified_entries: plan.updates.iter().map(|e| e.id.clone()).collect(),
    };
    tracing::info!(
        feed = %feed_url,
        feed_updated = outcome.feed_updated,
        new = outcome.new_entries.len(),
        modified = outcome.modified_entries.len(),
        "Reconciled feed"
    );
    Ok(outcome)
}
