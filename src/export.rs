use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::{self, CollectorSettings, PageProgress, ProgressSink};
use crate::config::{ApiArgs, ExportArgs};
use crate::provider::{FusionClient, PageSource};
use crate::types::RunOutcome;

/// File layout of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExportFormat {
    /// Every record verbatim, as a pretty-printed JSON array.
    #[default]
    Json,
    /// One row per record; `attributes` entries become `attr_<key>` columns.
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

/// What one resource export produced.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub resource: String,
    pub path: PathBuf,
    pub written: usize,
    pub outcome: RunOutcome,
}

/// Logs item counts as pages arrive.
struct LogProgress<'a> {
    resource: &'a str,
}

#[async_trait::async_trait]
impl<'a> ProgressSink for LogProgress<'a> {
    async fn publish(&self, page: PageProgress) {
        info!(resource = self.resource, items = page.scanned, cursor = %page.cursor, "export progress");
    }
}

/// Export every requested resource into `out_dir`.
pub async fn run_export(api: &ApiArgs, args: &ExportArgs) -> Result<Vec<ExportReport>> {
    let settings = api.collector_settings()?;
    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on(tokio::signal::ctrl_c(), cancel.clone()));

    let mut reports = Vec::new();
    for resource in &args.resources {
        let client = FusionClient::new(api.client_settings(resource)?)?;
        let path = args.out_dir.join(export_file_name(resource, args.format));
        let report =
            export_resource(&client, resource, &settings, &cancel, args.format, &path).await?;
        println!(
            "{:<16} {:>7} records -> {} ({:?})",
            report.resource,
            report.written,
            report.path.display(),
            report.outcome
        );
        reports.push(report);
        if cancel.is_cancelled() {
            break;
        }
    }
    Ok(reports)
}

/// Cancel `cancel` once `signal` fires. A signal that cannot be listened
/// for leaves the export running.
async fn cancel_on<F>(signal: F, cancel: CancellationToken)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("interrupted, finishing current resource");
            cancel.cancel();
        }
        Err(err) => warn!(error = %err, "cannot listen for Ctrl-C; export is not interruptible"),
    }
}

/// Collect every record of one resource and write them to `path`.
///
/// A run that ends early still writes what it collected.
pub async fn export_resource<S>(
    source: &S,
    resource: &str,
    settings: &CollectorSettings,
    cancel: &CancellationToken,
    format: ExportFormat,
    path: &Path,
) -> Result<ExportReport>
where
    S: PageSource<Value> + ?Sized,
{
    let sink = LogProgress { resource };
    let result = collector::collect(source, settings, |_: &Value| true, cancel, &sink).await;
    if result.truncated() {
        warn!(
            resource,
            outcome = ?result.outcome,
            error = result.error.as_deref().unwrap_or(""),
            "export ended early, writing partial data"
        );
    }
    match format {
        ExportFormat::Json => write_records_json(path, &result.items)?,
        ExportFormat::Csv => write_records_csv(path, &result.items)?,
    }
    Ok(ExportReport {
        resource: resource.to_string(),
        path: path.to_path_buf(),
        written: result.items.len(),
        outcome: result.outcome,
    })
}

/// `notifications/active` -> `fusion_notifications_active.json`
pub fn export_file_name(resource: &str, format: ExportFormat) -> String {
    let stem: String = resource
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("fusion_{stem}.{}", format.extension())
}

fn write_records_json(path: &Path, records: &[Value]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.flush()?;
    Ok(())
}

/// Columns are the sorted union of every row's keys; missing cells are empty.
fn write_records_csv(path: &Path, records: &[Value]) -> Result<()> {
    let rows: Vec<BTreeMap<String, String>> = records.iter().map(flatten_record).collect();
    let header: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    if !header.is_empty() {
        writer.write_record(&header)?;
        for row in &rows {
            writer.write_record(
                header
                    .iter()
                    .map(|column| row.get(*column).map(String::as_str).unwrap_or("")),
            )?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// One CSV row: top-level fields by name, `attributes` entries as `attr_<key>`.
fn flatten_record(record: &Value) -> BTreeMap<String, String> {
    let mut row = BTreeMap::new();
    let Value::Object(fields) = record else {
        row.insert("value".to_string(), cell(record));
        return row;
    };
    for (key, value) in fields {
        match (key.as_str(), value) {
            ("attributes", Value::Object(attributes)) => {
                for (name, v) in attributes {
                    row.insert(format!("attr_{name}"), cell(v));
                }
            }
            ("attributes", Value::Null) => {}
            _ => {
                row.insert(key.clone(), cell(value));
            }
        }
    }
    row
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
