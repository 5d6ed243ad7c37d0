use chrono::{DateTime, Duration, Utc};

use postpilot_core::{Platform, SchedulerConfig};

use crate::{
    error::{Result, SchedulerError},
    store::PostStore,
    timestamp::ceil_to_hour,
    types::Commitments,
};

/// Picks publish times that keep each platform's posts at least `spacing`
/// apart. Reads the store, never writes it.
///
/// The `*_in` variants plan against a [`Commitments`] snapshot; the
/// submitter runs them inside [`PostStore::create_planned`] so the snapshot
/// cannot go stale before the new post is inserted.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    store: PostStore,
    spacing: Duration,
    first_slot_offset: Duration,
}

impl SlotAllocator {
    pub fn new(store: PostStore, spacing: Duration, first_slot_offset: Duration) -> Self {
        Self {
            store,
            spacing,
            first_slot_offset,
        }
    }

    pub fn from_config(store: PostStore, config: &SchedulerConfig) -> Self {
        Self::new(store, config.spacing(), config.post_time_offset())
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Earliest instant `>= after` that is at least `spacing` past the latest
    /// pending or processing post on `platform`.
    ///
    /// An idle platform gets `after` rounded up to the hour plus the
    /// configured first-slot offset. Comparisons use exact instants.
    pub fn next_available_slot(
        &self,
        platform: &Platform,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        self.slot_in(&self.store.commitments()?, platform, after)
    }

    /// The earliest slot free on every platform in `platforms`.
    pub fn next_slot_for(
        &self,
        platforms: &[Platform],
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        self.slot_for_in(&self.store.commitments()?, platforms, after)
    }

    /// `count` slots exactly `spacing` apart, the first of which is free on
    /// all of `platforms` and not before `start_after`.
    pub fn space_batch(
        &self,
        platforms: &[Platform],
        count: usize,
        start_after: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.space_batch_in(&self.store.commitments()?, platforms, count, start_after)
    }

    pub fn slot_in(
        &self,
        committed: &Commitments,
        platform: &Platform,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        match committed.latest(platform) {
            Some(last) => Ok(after.max(offset(last, self.spacing)?)),
            None => self.first_slot(after),
        }
    }

    pub fn slot_for_in(
        &self,
        committed: &Commitments,
        platforms: &[Platform],
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mut slot = None;
        for platform in platforms {
            let candidate = self.slot_in(committed, platform, after)?;
            slot = Some(slot.map_or(candidate, |s: DateTime<Utc>| s.max(candidate)));
        }
        match slot {
            Some(slot) => Ok(slot),
            None => self.first_slot(after),
        }
    }

    pub fn space_batch_in(
        &self,
        committed: &Commitments,
        platforms: &[Platform],
        count: usize,
        start_after: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let count = i32::try_from(count).map_err(|_| {
            SchedulerError::Validation(format!("batch of {count} posts is too large"))
        })?;
        let first = self
            .slot_for_in(committed, platforms, start_after)?
            .max(start_after);
        (0..count)
            .map(|i| {
                let step = self.spacing.checked_mul(i).ok_or_else(out_of_range)?;
                offset(first, step)
            })
            .collect()
    }

    /// Display form of a slot: rounded up to the whole hour.
    pub fn present_slot(slot: DateTime<Utc>) -> DateTime<Utc> {
        ceil_to_hour(slot)
    }

    fn first_slot(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        offset(ceil_to_hour(after), self.first_slot_offset)
    }
}

fn offset(at: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>> {
    at.checked_add_signed(by).ok_or_else(out_of_range)
}

fn out_of_range() -> SchedulerError {
    SchedulerError::Validation("slot falls outside the representable time range".to_string())
}
