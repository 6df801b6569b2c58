//! Cron-side job builders: window scrapes, AOI month segments, IPF scrapers, backfill.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use s1acq_adapters::{format_bound, ScrapePurpose};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::catalog::{CatalogAcquisition, DOC_TYPE};
use crate::emit::DATASETS_CFG;
use crate::mozart::{JobPayload, JobSubmitter};
use crate::ConfigError;

pub const SCRAPE_JOB_TYPE: &str = "job-acquisition_ingest-scihub";
pub const DAILY_SCRAPE_JOB_TYPE: &str = "job-acquisition_ingest-scihub_daily";
pub const AOI_JOB_TYPE: &str = "job-acquisition_ingest-aoi";
pub const SCRAPER_QUEUE: &str = "factotum-job_worker-apihub_scraper_throttled";
pub const SCRAPE_PRIORITY: u8 = 5;
pub const AOI_PRIORITY: u8 = 6;
pub const IPF_PRIORITY: u8 = 5;
pub const BACKFILL_PRIORITY: u8 = 0;
pub const BACKFILL_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCadence {
    Daily,
    Hourly,
    Explicit,
}

/// Resolves the scrape window start; exactly one of the three inputs may be set.
pub fn validate_temporal_input(
    starttime: Option<&str>,
    hours: Option<i64>,
    days: Option<i64>,
    now: DateTime<Utc>,
) -> Result<(String, WindowCadence), ConfigError> {
    match (starttime, hours, days) {
        (None, None, Some(days)) => Ok((
            format_bound(&(now - chrono::Duration::days(days))),
            WindowCadence::Daily,
        )),
        (None, Some(hours), None) => Ok((
            format_bound(&(now - chrono::Duration::hours(hours))),
            WindowCadence::Hourly,
        )),
        (Some(start), None, None) => Ok((start.to_string(), WindowCadence::Explicit)),
        (None, None, None) => Err(ConfigError::MissingTemporalInput),
        (starttime, hours, days) => Err(ConfigError::ConflictingTemporalInput {
            starttime: starttime.map(str::to_string),
            hours,
            days,
        }),
    }
}

/// Window bound with `-` and `:` removed, as used in job names.
pub fn compact_bound(bound: &str) -> String {
    bound.replace(['-', ':'], "")
}

pub fn submit_stamp(now: DateTime<Utc>) -> String {
    now.format("%d_%b_%Y_%H:%M:%S").to_string()
}

fn strip_job_prefix(name: &str) -> String {
    name.strip_prefix("job-").unwrap_or(name).to_string()
}

pub fn scrape_job(
    start: &str,
    end: &str,
    cadence: WindowCadence,
    release: &str,
    now: DateTime<Utc>,
) -> JobPayload {
    let job_type = match cadence {
        WindowCadence::Daily => DAILY_SCRAPE_JOB_TYPE,
        WindowCadence::Hourly | WindowCadence::Explicit => SCRAPE_JOB_TYPE,
    };
    let spec = format!("{job_type}:{release}");
    let (cs, ce, stamp) = (compact_bound(start), compact_bound(end), submit_stamp(now));
    let name = match cadence {
        WindowCadence::Daily => format!("{spec}-{cs}-daily-{ce}-{stamp}"),
        WindowCadence::Hourly => format!("{spec}-{cs}-hourly-{ce}-{stamp}"),
        WindowCadence::Explicit => format!("{spec}-{cs}-{ce}-{stamp}"),
    };

    let payload = JobPayload::new(job_type, release, SCRAPER_QUEUE, SCRAPE_PRIORITY)
        .named(strip_job_prefix(&name))
        .param("ds_cfg", DATASETS_CFG)
        .param("starttime", start)
        .param("endtime", end)
        .param("ingest_flag", "--ingest");
    match cadence {
        WindowCadence::Daily => payload.param("report_flag", "--report"),
        _ => payload,
    }
}

fn first_of_next_month(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if ts.month() == 12 {
        (ts.year() + 1, 1)
    } else {
        (ts.year(), ts.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Splits `[start, end)` at every first-of-month midnight strictly inside it.
pub fn month_segments(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut segments = Vec::new();
    if start >= end {
        return segments;
    }
    let mut cursor = start;
    while let Some(boundary) = first_of_next_month(cursor).filter(|b| *b < end) {
        segments.push((cursor, boundary));
        cursor = boundary;
    }
    segments.push((cursor, end));
    segments
}

#[derive(Debug, Clone, PartialEq)]
pub struct AoiRequest {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub polygon: JsonValue,
    pub dataset_version: String,
}

pub fn aoi_jobs(aoi: &AoiRequest, release: &str, now: DateTime<Utc>) -> Vec<JobPayload> {
    let spec = format!("{AOI_JOB_TYPE}:{release}");
    month_segments(aoi.start, aoi.end)
        .into_iter()
        .map(|(start, end)| {
            let (start, end) = (format_bound(&start), format_bound(&end));
            let name = format!(
                "{spec}-{}-{}-{}-{}",
                aoi.name,
                compact_bound(&start),
                compact_bound(&end),
                submit_stamp(now)
            );
            JobPayload::new(AOI_JOB_TYPE, release, SCRAPER_QUEUE, AOI_PRIORITY)
                .named(strip_job_prefix(&name))
                .param("aoi_name", aoi.name.as_str())
                .param("ds_cfg", DATASETS_CFG)
                .param("starttime", start)
                .param("endtime", end)
                .param("ingest_flag", "--ingest")
                .param("report_flag", "--report")
                .param("polygon_flag", "--polygon")
                .param("polygon", aoi.polygon.clone())
                .param("ds_flag", "--dataset_version")
                .param("ds_version", aoi.dataset_version.as_str())
                .param("purpose_flag", "--purpose")
                .param("purpose", ScrapePurpose::AoiScrape.as_str())
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpfEndpoint {
    Asf,
    Scihub,
}

impl IpfEndpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpfEndpoint::Asf => "asf",
            IpfEndpoint::Scihub => "scihub",
        }
    }

    pub fn job_type(&self) -> &'static str {
        match self {
            IpfEndpoint::Asf => "job-ipf-scraper-asf",
            IpfEndpoint::Scihub => "job-ipf-scraper-scihub",
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            IpfEndpoint::Asf => "ipf-scraper-asf",
            IpfEndpoint::Scihub => "ipf-scraper-scihub",
        }
    }
}

/// ASF has the product once it is more than a day old.
pub fn ipf_endpoint(sensing_start: DateTime<Utc>, now: DateTime<Utc>) -> IpfEndpoint {
    if sensing_start < now - chrono::Duration::days(1) {
        IpfEndpoint::Asf
    } else {
        IpfEndpoint::Scihub
    }
}

pub fn ipf_job(
    acquisition: &CatalogAcquisition,
    release: &str,
    now: DateTime<Utc>,
) -> Option<JobPayload> {
    let Some(sensing_start) = acquisition.sensing_start() else {
        warn!(
            doc_id = %acquisition.doc_id,
            "acquisition has no parsable sensingStart; skipping IPF scrape"
        );
        return None;
    };
    let endpoint = ipf_endpoint(sensing_start, now);
    Some(
        JobPayload::new(endpoint.job_type(), release, endpoint.queue(), IPF_PRIORITY)
            .named(format!("{}-{}-{}", endpoint.job_type(), acquisition.doc_id, release))
            .param("acq_id", acquisition.doc_id.as_str())
            .param("acq_met", acquisition.metadata.clone())
            .param("index", acquisition.index.as_str())
            .param("dataset_type", DOC_TYPE)
            .param("endpoint", endpoint.as_str())
            .param("ds_cfg", DATASETS_CFG),
    )
}

/// Consecutive daily windows covering `start_date..=end_date`.
pub fn backfill_windows(start_date: NaiveDate, end_date: NaiveDate) -> Vec<(String, String)> {
    let days: Vec<String> = start_date
        .iter_days()
        .take_while(|d| *d <= end_date)
        .filter_map(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| format_bound(&Utc.from_utc_datetime(&d)))
        .collect();
    days.windows(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

pub fn backfill_job(start: &str, end: &str, release: &str) -> JobPayload {
    JobPayload::new(SCRAPE_JOB_TYPE, release, SCRAPER_QUEUE, BACKFILL_PRIORITY)
        .named(format!(
            "{SCRAPE_JOB_TYPE}:{release}-{}-{}",
            compact_bound(start),
            compact_bound(end)
        ))
        .param("ds_cfg", DATASETS_CFG)
        .param("starttime", start)
        .param("endtime", end)
        .param("ingest_flag", "--ingest")
}

/// Submits jobs one at a time, sleeping `delay` between submissions.
pub async fn submit_all(
    submitter: &dyn JobSubmitter,
    jobs: &[JobPayload],
    delay: Duration,
) -> anyhow::Result<Vec<String>> {
    let mut job_ids = Vec::with_capacity(jobs.len());
    for (i, job) in jobs.iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let job_id = submitter
            .submit(job)
            .await
            .with_context(|| format!("submitting {}", job.job_name))?;
        info!(job_name = %job.job_name, %job_id, "job submitted");
        job_ids.push(job_id);
    }
    Ok(job_ids)
}
