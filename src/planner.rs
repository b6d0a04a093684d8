//! Deterministic extraction planning.
//!
//! The task set is the Cartesian product of active endpoints, the time
//! buckets covering the requested range, and each endpoint's modality set
//! (or the single null modality). Identical inputs always produce the same
//! task ids and the same plan fingerprint, and inserts are if-absent, so
//! planning is idempotent and safe to repeat on every run.

use chrono::{Datelike, NaiveDate};
use log::info;
use sha2::{Digest, Sha256};

use crate::config::EndpointConfig;
use crate::data_structures::{DateBucket, ExtractionTask, Granularity};
use crate::error::{ExtractError, ExtractResult};
use crate::writer::WriterHandle;

pub struct PlanSummary {
    pub tasks_planned: usize,
    pub tasks_inserted: usize,
}

fn last_day_of_month(d: NaiveDate) -> NaiveDate {
    let (year, month) = if d.month() == 12 { (d.year() + 1, 1) } else { (d.year(), d.month() + 1) };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .unwrap_or(d)
}

/// Inclusive buckets covering `[start, end]`, clipped to the range at both
/// edges. A task's `data_date` is its bucket's (clipped) start.
pub fn time_buckets(start: NaiveDate, end: NaiveDate, granularity: Granularity) -> Vec<DateBucket> {
    let mut buckets = Vec::new();
    if start > end {
        return buckets;
    }
    match granularity {
        Granularity::Day => {
            let mut day = start;
            while day <= end {
                buckets.push(DateBucket { start: day, end: day });
                match day.succ_opt() {
                    Some(next) => day = next,
                    None => break,
                }
            }
        }
        Granularity::Month => {
            let mut cursor = start;
            while cursor <= end {
                let month_end = last_day_of_month(cursor);
                let bucket_end = month_end.min(end);
                buckets.push(DateBucket { start: cursor, end: bucket_end });
                match bucket_end.succ_opt() {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
        }
    }
    buckets
}

/// Rebuild the bucket a persisted task belongs to. `data_date` is the bucket
/// start the planner stored; only the clipped end needs recomputing.
pub fn bucket_for(data_date: NaiveDate, granularity: Granularity, range_end: NaiveDate) -> DateBucket {
    match granularity {
        Granularity::Day => DateBucket { start: data_date, end: data_date },
        Granularity::Month => DateBucket {
            start: data_date,
            end: last_day_of_month(data_date).min(range_end),
        },
    }
}

/// Hash of the planning inputs: sorted endpoint descriptors, modality sets,
/// granularities and the requested range. Stable under permutation of the
/// catalog order.
pub fn plan_fingerprint(
    endpoints: &[EndpointConfig],
    start: NaiveDate,
    end: NaiveDate,
    granularity_override: Option<Granularity>,
) -> String {
    let mut sorted: Vec<&EndpointConfig> = endpoints.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    hasher.update(format!("range:{}..{}|override:{:?}\n", start, end, granularity_override));
    for ep in sorted {
        let mut modalities = ep.modalities.clone();
        modalities.sort_unstable();
        hasher.update(format!(
            "{}|{}|{:?}|{}|{}|{}|{:?}\n",
            ep.name,
            ep.path,
            granularity_override.unwrap_or(ep.granularity),
            ep.page_size,
            ep.date_params[0],
            ep.date_params[1],
            modalities,
        ));
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

pub fn build_tasks(
    endpoints: &[EndpointConfig],
    start: NaiveDate,
    end: NaiveDate,
    granularity_override: Option<Granularity>,
    fingerprint: &str,
) -> Vec<ExtractionTask> {
    let mut tasks = Vec::new();
    for ep in endpoints {
        let granularity = granularity_override.unwrap_or(ep.granularity);
        for bucket in time_buckets(start, end, granularity) {
            if ep.modalities.is_empty() {
                tasks.push(ExtractionTask::new(&ep.name, bucket.start, None, fingerprint));
            } else {
                for modality in &ep.modalities {
                    tasks.push(ExtractionTask::new(&ep.name, bucket.start, Some(*modality), fingerprint));
                }
            }
        }
    }
    tasks
}

/// Plan the run and persist the task set through the writer. The caller
/// computes the fingerprint (it needs it for the drift gate anyway).
pub async fn plan(
    endpoints: &[EndpointConfig],
    start: NaiveDate,
    end: NaiveDate,
    granularity_override: Option<Granularity>,
    fingerprint: &str,
    writer: &WriterHandle,
) -> ExtractResult<PlanSummary> {
    if endpoints.is_empty() {
        return Err(ExtractError::Config("no active endpoints to plan".to_string()));
    }
    if start > end {
        return Err(ExtractError::Config(format!(
            "inverted date range: {} is after {}",
            start, end
        )));
    }

    let tasks = build_tasks(endpoints, start, end, granularity_override, fingerprint);
    let tasks_planned = tasks.len();
    let tasks_inserted = writer.insert_tasks(tasks).await?;
    info!(
        "planned {} tasks ({} new) under fingerprint {}",
        tasks_planned, tasks_inserted, fingerprint
    );
    Ok(PlanSummary { tasks_planned, tasks_inserted })
}
