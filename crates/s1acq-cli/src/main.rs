use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use s1acq_adapters::{format_bound, ScrapePurpose};
use s1acq_core::SourceKind;
use s1acq_storage::append_error_artifacts;
use s1acq_sync::submit::{self, AoiRequest, IpfEndpoint};
use s1acq_sync::{
    parse_bound, scrape_ipf, AreaOfInterest, ConfigError, EmitMode, IpfRequest, PipelineConfig,
    ScrapePipeline, ScrapeRequest,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "s1acq")]
#[command(about = "Sentinel-1 acquisition scraping, reconciliation and job submission")]
struct Cli {
    /// Acquisition dataset version (overrides S1ACQ_DATASET_VERSION).
    #[arg(long, global = true)]
    dataset_version: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    #[value(name = "esa_scihub")]
    Scihub,
    Asf,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Scihub => SourceKind::Scihub,
            SourceArg::Asf => SourceKind::Asf,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EndpointArg {
    Scihub,
    Asf,
}

impl From<EndpointArg> for IpfEndpoint {
    fn from(arg: EndpointArg) -> Self {
        match arg {
            EndpointArg::Scihub => IpfEndpoint::Scihub,
            EndpointArg::Asf => IpfEndpoint::Asf,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape a window, reconcile against the catalog and emit what is missing.
    Scrape {
        #[arg(long, value_enum, default_value = "esa_scihub")]
        source: SourceArg,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// GeoJSON polygon or bare coordinate ring.
        #[arg(long)]
        polygon: Option<String>,
        #[arg(long, default_value = "scrape")]
        purpose: String,
        #[arg(long)]
        aoi_name: Option<String>,
        /// Submit an ingest job per missing acquisition.
        #[arg(long)]
        ingest: bool,
        /// Write dataset directories for missing acquisitions.
        #[arg(long)]
        create_only: bool,
        /// Write a report dataset listing acquisitions still missing.
        #[arg(long)]
        report: bool,
        /// Fetch browse images for created datasets.
        #[arg(long)]
        browse: bool,
        /// Release of the ingest job type.
        #[arg(long)]
        tag: Option<String>,
    },
    /// Submit a window scrape job (exactly one of --starttime, --hours, --days).
    SubmitScrape {
        #[arg(long)]
        starttime: Option<String>,
        #[arg(long)]
        hours: Option<i64>,
        #[arg(long)]
        days: Option<i64>,
        #[arg(long)]
        endtime: Option<String>,
        #[arg(long, default_value = "master")]
        tag: String,
    },
    /// Submit one AOI scrape job per calendar month of the window.
    SubmitAoi {
        #[arg(long)]
        aoi_name: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        polygon: String,
        #[arg(long, default_value = "master")]
        tag: String,
    },
    /// Submit IPF scraper jobs for catalogued acquisitions lacking a processing version.
    SubmitIpf {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        polygon: Option<String>,
        #[arg(long, default_value = "master")]
        tag: String,
    },
    /// Look up the processing version of one catalog document and record it.
    Ipf {
        #[arg(long)]
        acq_id: String,
        /// Catalog metadata of the acquisition as JSON.
        #[arg(long)]
        acq_met: String,
        #[arg(long, value_enum, default_value = "scihub")]
        endpoint: EndpointArg,
        #[arg(long)]
        index: Option<String>,
    },
    /// Submit one scrape job per day between two dates.
    Backfill {
        #[arg(long)]
        start_date: NaiveDate,
        #[arg(long)]
        end_date: NaiveDate,
        #[arg(long, default_value = "master")]
        tag: String,
        #[arg(long, default_value_t = submit::BACKFILL_DELAY.as_secs())]
        delay_secs: u64,
    },
    /// Tag a catalog document as deprecated.
    Deprecate {
        #[arg(long)]
        id: String,
        #[arg(long)]
        index: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = init_tracing() {
        eprintln!("failed to initialize logging: {err:#}");
        return ExitCode::FAILURE;
    }
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "s1acq failed");
            if let Err(io_err) = append_error_artifacts(Path::new("."), &err) {
                eprintln!("failed to write error artifacts: {io_err}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("s1acq=info".parse()?))
        .init();
    Ok(())
}

fn pipeline_config(dataset_version: Option<String>) -> PipelineConfig {
    let mut config = PipelineConfig::from_env();
    if let Some(version) = dataset_version {
        config.dataset_version = version;
    }
    config
}

fn area(polygon: Option<&str>) -> Result<Option<AreaOfInterest>, ConfigError> {
    polygon.map(AreaOfInterest::parse).transpose()
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = pipeline_config(cli.dataset_version);

    match cli.command {
        Commands::Scrape {
            source,
            start,
            end,
            polygon,
            purpose,
            aoi_name,
            ingest,
            create_only,
            report,
            browse,
            tag,
        } => {
            let emit_mode = EmitMode::from_flags(ingest, create_only)?;
            let purpose = purpose.parse::<ScrapePurpose>().map_err(ConfigError::from)?;
            let mut request =
                ScrapeRequest::new(source.into(), parse_bound(&start)?, parse_bound(&end)?)?;
            request.purpose = purpose;
            request.area = area(polygon.as_deref())?;
            request.aoi_name = aoi_name;
            request.emit_mode = emit_mode;
            request.report = report;
            request.browse = browse;
            if let Some(tag) = tag {
                config.job_release = tag;
            }

            let summary = ScrapePipeline::new(config)?.run_once(&request).await?;
            println!(
                "scrape complete: run_id={} scraped={} dropped={} new={} present={} deprecated={} emitted={} still_missing={}",
                summary.run_id,
                summary.scraped,
                summary.dropped,
                summary.new,
                summary.already_present,
                summary.deprecated,
                summary.emitted.len(),
                summary.still_missing.len()
            );
        }
        Commands::SubmitScrape {
            starttime,
            hours,
            days,
            endtime,
            tag,
        } => {
            let now = Utc::now();
            let (start, cadence) =
                submit::validate_temporal_input(starttime.as_deref(), hours, days, now)?;
            let end = endtime.unwrap_or_else(|| format_bound(&now));
            let job = submit::scrape_job(&start, &end, cadence, &tag, now);
            let pipeline = ScrapePipeline::new(config)?;
            let ids = submit::submit_all(pipeline.submitter(), &[job], Duration::ZERO).await?;
            println!("submitted scrape job: {}", ids.join(","));
        }
        Commands::SubmitAoi {
            aoi_name,
            start,
            end,
            polygon,
            tag,
        } => {
            let aoi = AoiRequest {
                name: aoi_name,
                start: parse_bound(&start)?,
                end: parse_bound(&end)?,
                polygon: AreaOfInterest::parse(&polygon)?.geojson,
                dataset_version: config.dataset_version.clone(),
            };
            let jobs = submit::aoi_jobs(&aoi, &tag, Utc::now());
            let pipeline = ScrapePipeline::new(config)?;
            let ids = submit::submit_all(pipeline.submitter(), &jobs, Duration::ZERO).await?;
            println!("submitted {} aoi scrape jobs for {}", ids.len(), aoi.name);
        }
        Commands::SubmitIpf {
            start,
            end,
            polygon,
            tag,
        } => {
            let (start, end) = (parse_bound(&start)?, parse_bound(&end)?);
            let area = area(polygon.as_deref())?;
            let pipeline = ScrapePipeline::new(config)?;
            let acquisitions = pipeline
                .catalog()
                .non_ipf_acquisitions(&start, &end, area.as_ref().map(|a| &a.geojson))
                .await
                .context("querying acquisitions without processing version")?;
            info!(count = acquisitions.len(), "acquisitions lacking processing version");
            let now = Utc::now();
            let jobs: Vec<_> = acquisitions
                .iter()
                .filter_map(|acq| submit::ipf_job(acq, &tag, now))
                .collect();
            let ids = submit::submit_all(pipeline.submitter(), &jobs, Duration::ZERO).await?;
            println!("submitted {} ipf scraper jobs", ids.len());
        }
        Commands::Ipf {
            acq_id,
            acq_met,
            endpoint,
            index,
        } => {
            let acq_met: serde_json::Value = serde_json::from_str(&acq_met)
                .map_err(|e| ConfigError::Metadata(e.to_string()))?;
            let request = IpfRequest {
                acq_id,
                acq_met,
                index: index.unwrap_or_else(|| config.catalog_index()),
                endpoint: endpoint.into(),
            };
            let pipeline = ScrapePipeline::new(config)?;
            let version = scrape_ipf(&pipeline.catalog(), &pipeline.ipf_scraper(), &request)
                .await
                .with_context(|| format!("failed to get IPF for {}", request.acq_id))?;
            println!("processing version of {}: {version}", request.acq_id);
        }
        Commands::Backfill {
            start_date,
            end_date,
            tag,
            delay_secs,
        } => {
            let jobs: Vec<_> = submit::backfill_windows(start_date, end_date)
                .iter()
                .map(|(start, end)| submit::backfill_job(start, end, &tag))
                .collect();
            let pipeline = ScrapePipeline::new(config)?;
            let delay = Duration::from_secs(delay_secs);
            let ids = submit::submit_all(pipeline.submitter(), &jobs, delay).await?;
            println!("submitted {} backfill jobs", ids.len());
        }
        Commands::Deprecate { id, index } => {
            let index = index.unwrap_or_else(|| config.catalog_index());
            ScrapePipeline::new(config)?
                .catalog()
                .deprecate_document(&index, &id)
                .await?;
            println!("deprecated {id} in {index}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_scrape_flags() {
        let cli = Cli::parse_from([
            "s1acq",
            "--dataset-version",
            "v2.1",
            "scrape",
            "--source",
            "asf",
            "--start",
            "2019-03-01T00:00:00Z",
            "--end",
            "2019-03-02T00:00:00Z",
            "--create-only",
        ]);
        assert_eq!(cli.dataset_version.as_deref(), Some("v2.1"));
        match cli.command {
            Commands::Scrape {
                source, create_only, ingest, purpose, ..
            } => {
                assert!(matches!(source, SourceArg::Asf));
                assert!(create_only && !ingest);
                assert_eq!(purpose, "scrape");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflicting_emit_flags_fail_before_any_request() {
        let cli = Cli::parse_from([
            "s1acq",
            "scrape",
            "--start",
            "2019-03-01T00:00:00Z",
            "--end",
            "2019-03-02T00:00:00Z",
            "--ingest",
            "--create-only",
        ]);
        let err = run(cli).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ConflictingEmitModes)
        ));
    }

    #[tokio::test]
    async fn unknown_purpose_is_a_config_error() {
        let cli = Cli::parse_from([
            "s1acq",
            "scrape",
            "--start",
            "2019-03-01T00:00:00Z",
            "--end",
            "2019-03-02T00:00:00Z",
            "--purpose",
            "harvest",
        ]);
        let err = run(cli).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownPurpose(_))
        ));
    }

    #[tokio::test]
    async fn ipf_metadata_must_be_json() {
        let cli = Cli::parse_from([
            "s1acq",
            "ipf",
            "--acq-id",
            "acquisition-S1A_X-esa_scihub",
            "--acq-met",
            "{not json",
            "--endpoint",
            "asf",
        ]);
        let err = run(cli).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Metadata(_))
        ));
    }

    #[test]
    fn backfill_dates_parse_as_calendar_days() {
        let cli = Cli::parse_from([
            "s1acq",
            "backfill",
            "--start-date",
            "2015-05-02",
            "--end-date",
            "2015-05-04",
        ]);
        match cli.command {
            Commands::Backfill { delay_secs, .. } => assert_eq!(delay_secs, 60),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
