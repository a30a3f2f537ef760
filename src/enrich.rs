use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use std::{path::Path, sync::atomic::AtomicBool};
use tracing::{info, warn};

use crate::{
    cache::PatientCache,
    config::Settings,
    credentials::CredentialPool,
    legacy_export::{DbfConverter, LegacyExportConverter, extract_first_entry},
    merge::merge,
    model::ResolvedRecord,
    patients_file::PatientsFile,
    progress::{BarProgress, LogProgress, ProgressSink},
    scheduler::{ReconcileOutcome, reconcile_with_registry},
    session::{RegistrySession, SrzSession},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct EnrichOptions {
    pub cache_only: bool,
    pub show_progress: bool,
}

#[derive(Debug, Default)]
pub struct EnrichReport {
    pub rows: usize,
    pub filled_from_cache: usize,
    pub filled_from_registry: usize,
    /// Keys sent to the registry in this run.
    pub requested: usize,
    /// Rows still without a surname after saving.
    pub remaining: usize,
    /// Registry records written to the cache after the file was saved.
    pub cached: usize,
    pub outcome: Option<ReconcileOutcome>,
}

impl EnrichReport {
    pub fn resolved(&self) -> usize {
        self.outcome.as_ref().map_or(0, |o| o.resolved.len())
    }
}

/// Cache fill, registry reconciliation, merge, then write back in place.
pub async fn enrich_patients_file(
    settings: &Settings,
    patients_path: &Path,
    options: EnrichOptions,
    shutdown: &AtomicBool,
) -> Result<EnrichReport> {
    let file = PatientsFile::open(patients_path, &settings.column_aliases)?;
    let mut cache = PatientCache::open(&settings.cache_db)?;
    let mut report = EnrichReport {
        rows: file.len(),
        ..EnrichReport::default()
    };
    println!(
        "Loaded {} rows from {}; {} without names.",
        file.len(),
        patients_path.display(),
        file.count_missing_names()
    );

    let mut cached = Vec::new();
    for key in file.unknown_keys(usize::MAX) {
        if let Some(record) = cache.get(&key.insurance_number)? {
            cached.push(record);
        }
    }
    report.filled_from_cache = merge(&cached, &file).rows_filled;
    println!(
        "Filled {} rows from cache ({} cached candidates).",
        report.filled_from_cache,
        cached.len()
    );

    let keys = file.unknown_keys(settings.request_limit);
    if options.cache_only || settings.credentials.is_empty() || keys.is_empty() {
        if !options.cache_only && settings.credentials.is_empty() && !keys.is_empty() {
            warn!("no registry credentials configured; only cached names were used");
        }
        return finish(file, patients_path, report);
    }

    report.requested = keys.len();
    println!(
        "Requesting {} names from the registry ({} credentials, quota {}).",
        keys.len(),
        settings.credentials.len(),
        settings.total_quota()
    );
    let bar = options
        .show_progress
        .then(|| BarProgress::new("registry", keys.len()));
    let sink: &dyn ProgressSink = match &bar {
        Some(bar) => bar,
        None => &LogProgress,
    };

    let outcome = reconcile_with_registry(
        keys,
        settings.credentials.clone(),
        settings.endpoint(),
        &settings.scheduler_options(),
        sink,
        shutdown,
    )
    .await?;
    if let Some(bar) = &bar {
        if outcome.interrupted {
            bar.abandon(outcome.summary());
        } else {
            bar.finish(outcome.summary());
        }
    }

    let stats = merge(&outcome.resolved, &file);
    report.filled_from_registry = stats.rows_filled;
    if stats.records_unmatched > 0 {
        warn!(
            unmatched = stats.records_unmatched,
            "registry names did not match the initials in the file"
        );
    }
    report.outcome = Some(outcome);

    let mut report = finish(file, patients_path, report)?;
    if let Some(outcome) = &report.outcome {
        report.cached = remember_resolved(&mut cache, &outcome.resolved);
    }
    Ok(report)
}

/// Cache write after the patients file is saved; failures are logged, not returned.
fn remember_resolved(cache: &mut PatientCache, records: &[ResolvedRecord]) -> usize {
    match cache.upsert_many(records) {
        Ok(written) => written,
        Err(err) => {
            warn!(
                records = records.len(),
                "failed caching registry names: {err:#}"
            );
            0
        }
    }
}

fn finish(file: PatientsFile, path: &Path, mut report: EnrichReport) -> Result<EnrichReport> {
    file.save(path)?;
    report.remaining = file.count_missing_names();
    println!(
        "Requested {}, resolved {}, remaining without names {}.",
        report.requested,
        report.resolved(),
        report.remaining
    );
    Ok(report)
}

/// Downloads the export for `on_date`, converts it and writes the patients CSV.
pub async fn download_patients_file(
    settings: &Settings,
    on_date: NaiveDate,
    output: &Path,
) -> Result<usize> {
    let mut session = authenticated_session(settings).await?;
    let archive = session.download_export(on_date).await;
    if let Err(err) = session.close().await {
        warn!(error = %err, "registry logout failed");
    }
    let archive = archive?;

    let dbf = extract_first_entry(&archive)?;
    let table = DbfConverter
        .convert(&dbf)
        .context("Failed converting registry export")?;
    let file = PatientsFile::from_table(table, &settings.column_aliases)?;
    file.save(output)?;
    println!(
        "Saved {} rows for {} to {}.",
        file.len(),
        on_date.format("%d.%m.%Y"),
        output.display()
    );
    Ok(file.len())
}

/// Authenticates and logs out; returns the login that worked.
pub async fn check_connection(settings: &Settings) -> Result<String> {
    let mut session = authenticated_session(settings).await?;
    let login = session.login().unwrap_or_default().to_string();
    session
        .close()
        .await
        .context("Registry logout failed after a successful login")?;
    println!("Connection to {} is working (login {login}).", settings.base_url);
    Ok(login)
}

/// First credential that the registry accepts, in configured order.
async fn authenticated_session(settings: &Settings) -> Result<SrzSession> {
    if settings.credentials.is_empty() {
        bail!("No registry credentials configured");
    }
    let pool = CredentialPool::new(settings.credentials.clone());
    let endpoint = settings.endpoint();
    for index in 0..pool.len() {
        let Some(credential) = pool.get(index) else {
            continue;
        };
        let mut session = SrzSession::new(endpoint.clone())?;
        match session.authenticate(credential).await {
            Ok(()) => {
                info!(login = credential.login(), "registry login succeeded");
                return Ok(session);
            }
            Err(err) => warn!(login = credential.login(), error = %err, "registry login failed"),
        }
    }
    bail!("None of the {} configured credentials were accepted", pool.len())
}

pub fn parse_file_date(value: Option<&str>) -> Result<NaiveDate> {
    match value {
        Some(text) => NaiveDate::parse_from_str(text.trim(), "%d.%m.%Y")
            .with_context(|| format!("Invalid date {text}, expected dd.mm.yyyy")),
        None => Ok(chrono::Local::now().date_naive()),
    }
}
