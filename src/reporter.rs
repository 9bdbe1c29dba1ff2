use crate::analysis::AnalysisError;
use crate::models::{
    DuplicatePair, FindingCategory, FindingMetrics, IndexFinding, InstanceContext,
    RemediationStatement,
};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{presets::ASCII_FULL_CONDENSED, Table, TableComponent};
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
pub enum ReporterError {
    #[snafu(display("Failed to write output: {}", source))]
    OutputError { source: std::io::Error },

    #[snafu(display("Failed to format report: {}", source))]
    FormatError { source: std::fmt::Error },

    #[snafu(display("Failed to serialize report: {}", source))]
    SerializeError { source: serde_json::Error },

    #[snafu(display("Failed to write report file {}: {}", path.display(), source))]
    FileWriteError {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T, E = ReporterError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// psql-style table
    Table,
    /// Markdown formatted report
    Markdown,
    /// JSON report document
    Json,
}

/// One finding flattened for output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FindingRecord {
    pub database_name: String,
    pub schema_name: String,
    pub index_name: String,
    pub index_size: u64,
    pub category: FindingCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_scan: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_index_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_resolved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bloat_ratio: Option<f64>,
    pub replica_attached: bool,
    pub in_recovery: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    /// Why no remediation was produced when advice was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation_error: Option<String>,
}

impl FindingRecord {
    pub fn from_finding(finding: &IndexFinding<'_>) -> Self {
        let mut record = Self {
            database_name: finding.identity.database.clone(),
            schema_name: finding.identity.schema.clone(),
            index_name: finding.identity.index.clone(),
            index_size: finding.size_bytes,
            category: finding.category(),
            index_scan: None,
            last_scan: None,
            invalid_kind: None,
            original_index_name: None,
            duplicate_resolved: None,
            bloat_ratio: None,
            replica_attached: finding.context.replica_attached,
            in_recovery: finding.context.in_recovery,
            remediation: None,
            remediation_error: None,
        };

        match &finding.metrics {
            FindingMetrics::Usage {
                scan_count,
                last_scan,
            } => {
                record.index_scan = Some(*scan_count);
                record.last_scan =
                    last_scan.map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string());
            }
            FindingMetrics::Invalidity { kind } => record.invalid_kind = Some(kind.clone()),
            FindingMetrics::Duplicate(pair) => {
                record.original_index_name = Some(pair.counterpart().qualified_name());
                record.duplicate_resolved = Some(matches!(pair, DuplicatePair::Ordered { .. }));
            }
            FindingMetrics::Bloat { ratio_percent } => record.bloat_ratio = Some(*ratio_percent),
        }

        record
    }
}

/// The document operators script against: `report_name`, `database_name`,
/// `total_index_count` and `indexes`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub report_name: String,
    pub database_name: String,
    pub total_index_count: usize,
    pub indexes: Vec<FindingRecord>,
    #[serde(skip)]
    pub category: FindingCategory,
    #[serde(skip)]
    pub caveat: Option<&'static str>,
    #[serde(skip)]
    pub advice: Option<Vec<String>>,
}

impl IndexReport {
    pub fn new(
        category: FindingCategory,
        database_name: &str,
        context: &InstanceContext,
        findings: &[IndexFinding<'_>],
        generated_at: DateTime<Utc>,
    ) -> Self {
        let indexes: Vec<FindingRecord> =
            findings.iter().map(FindingRecord::from_finding).collect();
        let caveat = match category {
            FindingCategory::Unused | FindingCategory::Inefficient => context.usage_caveat(),
            _ => None,
        };

        Self {
            report_name: format!(
                "{}_{}_index_{}_{:06}",
                database_name,
                category.slug(),
                generated_at.timestamp(),
                generated_at.timestamp_subsec_micros()
            ),
            database_name: database_name.to_string(),
            total_index_count: indexes.len(),
            indexes,
            category,
            caveat,
            advice: None,
        }
    }

    /// Attaches advisory output, one result per finding in report order.
    pub fn with_advice(
        mut self,
        advice: Vec<std::result::Result<RemediationStatement, AnalysisError>>,
    ) -> Self {
        let mut lines = Vec::with_capacity(advice.len());
        for (record, outcome) in self.indexes.iter_mut().zip(advice) {
            match outcome {
                Ok(statement) => {
                    lines.push(statement.sql.clone());
                    record.remediation = Some(statement.sql);
                }
                Err(err) => {
                    lines.push(format!("-- not advised: {err}"));
                    record.remediation_error = Some(err.to_string());
                }
            }
        }
        self.advice = Some(lines);
        self
    }

    /// Writes `<dir>/<report_name>.json`, or `<report_name>_<n>.json` when that name is
    /// already taken. Existing files are never overwritten.
    pub fn write_json_file(&self, dir: &Path) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(self).context(SerializeSnafu)?;

        let mut attempt = 1u32;
        loop {
            let path = match attempt {
                1 => dir.join(format!("{}.json", self.report_name)),
                n => dir.join(format!("{}_{}.json", self.report_name, n)),
            };
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(json.as_bytes())
                        .context(FileWriteSnafu { path: path.clone() })?;
                    return Ok(path);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(source) => return Err(source).context(FileWriteSnafu { path }),
            }
        }
    }
}

pub struct Reporter {
    format: ReportFormat,
}

impl Reporter {
    pub fn new(format: ReportFormat) -> Self {
        Self { format }
    }

    pub fn report(&self, report: &IndexReport) -> Result<()> {
        let rendered = self.render(report)?;
        print_rendered(&rendered)
    }

    /// Reports on several databases at once. JSON output is a single array so stdout
    /// stays one parseable document.
    pub fn report_all(&self, reports: &[IndexReport]) -> Result<()> {
        let rendered = self.render_all(reports)?;
        print_rendered(&rendered)
    }

    pub fn render(&self, report: &IndexReport) -> Result<String> {
        match self.format {
            ReportFormat::Table => self.render_table(report),
            ReportFormat::Markdown => self.render_markdown(report),
            ReportFormat::Json => render_json(report),
        }
    }

    pub fn render_all(&self, reports: &[IndexReport]) -> Result<String> {
        if self.format == ReportFormat::Json {
            return render_json(reports);
        }

        let mut out = String::new();
        for report in reports {
            out.push_str(&self.render(report)?);
        }
        Ok(out)
    }

    fn render_table(&self, report: &IndexReport) -> Result<String> {
        let mut out = String::new();

        if report.indexes.is_empty() {
            writeln!(
                out,
                "No {} index found for database: {}",
                report.category.slug(),
                report.database_name
            )
            .context(FormatSnafu)?;
            return Ok(out);
        }

        let columns = columns_for(report.category);
        let mut table = psql_style_table();
        table.set_header(columns.iter().map(|(name, _)| *name).collect::<Vec<_>>());
        for record in &report.indexes {
            table.add_row(
                columns
                    .iter()
                    .map(|(_, cell)| cell(record))
                    .collect::<Vec<_>>(),
            );
        }
        writeln!(out, "{}", table).context(FormatSnafu)?;

        if let Some(caveat) = report.caveat {
            writeln!(out, "Note: scan counts may be incomplete: {}", caveat).context(FormatSnafu)?;
        }

        if let Some(advice) = &report.advice {
            writeln!(out).context(FormatSnafu)?;
            writeln!(
                out,
                "-- Remediation statements (not executed; review before running):"
            )
            .context(FormatSnafu)?;
            for line in advice {
                writeln!(out, "{}", line).context(FormatSnafu)?;
            }
        }

        Ok(out)
    }

    fn render_markdown(&self, report: &IndexReport) -> Result<String> {
        let mut out = String::new();

        writeln!(
            out,
            "# {} Index Report: {}\n",
            report.category.as_str(),
            report.database_name
        )
        .context(FormatSnafu)?;
        writeln!(out, "- **Findings**: {}", report.total_index_count).context(FormatSnafu)?;
        if let Some(caveat) = report.caveat {
            writeln!(out, "- **Caveat**: {}", caveat).context(FormatSnafu)?;
        }
        writeln!(out).context(FormatSnafu)?;

        if report.indexes.is_empty() {
            writeln!(
                out,
                "No {} index found for database: {}",
                report.category.slug(),
                report.database_name
            )
            .context(FormatSnafu)?;
            return Ok(out);
        }

        let columns = columns_for(report.category);
        let header: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        writeln!(out, "| {} |", header.join(" | ")).context(FormatSnafu)?;
        writeln!(out, "|{}", "---|".repeat(header.len())).context(FormatSnafu)?;
        for record in &report.indexes {
            let cells: Vec<String> = columns.iter().map(|(_, cell)| cell(record)).collect();
            writeln!(out, "| {} |", cells.join(" | ")).context(FormatSnafu)?;
        }

        if let Some(advice) = &report.advice {
            writeln!(out, "\n## Remediation\n").context(FormatSnafu)?;
            writeln!(out, "Not executed; review before running.\n").context(FormatSnafu)?;
            writeln!(out, "```sql").context(FormatSnafu)?;
            for line in advice {
                writeln!(out, "{}", line).context(FormatSnafu)?;
            }
            writeln!(out, "```").context(FormatSnafu)?;
        }

        Ok(out)
    }
}

fn print_rendered(rendered: &str) -> Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    write!(handle, "{}", rendered).context(OutputSnafu)?;
    Ok(())
}

fn render_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut json = serde_json::to_string_pretty(value).context(SerializeSnafu)?;
    json.push('\n');
    Ok(json)
}

/// An ASCII table laid out like `psql` prints query results.
fn psql_style_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(ASCII_FULL_CONDENSED)
        .set_style(TableComponent::HeaderLines, '-')
        .set_style(TableComponent::LeftHeaderIntersection, '|')
        .set_style(TableComponent::MiddleHeaderIntersections, '+')
        .set_style(TableComponent::RightHeaderIntersection, '|');
    table
}

type Cell = fn(&FindingRecord) -> String;

fn columns_for(category: FindingCategory) -> Vec<(&'static str, Cell)> {
    let mut columns: Vec<(&'static str, Cell)> = Vec::new();
    columns.push(("Database Name", |r| r.database_name.clone()));
    columns.push(("Schema Name", |r| r.schema_name.clone()));
    columns.push(("Index Name", |r| r.index_name.clone()));
    columns.push(("Index Size", |r| format_bytes(r.index_size)));

    match category {
        FindingCategory::Unused => {
            columns.push(("Index Scan Count", |r| display_or_dash(r.index_scan)));
            columns.push(("Last Scan Date", |r| display_or_dash(r.last_scan.as_ref())));
        }
        FindingCategory::Invalid => {
            columns.push(("Invalid Kind", |r| display_or_dash(r.invalid_kind.as_ref())));
        }
        FindingCategory::Duplicate => {
            columns.push(("Original Index Name", |r| {
                display_or_dash(r.original_index_name.as_ref())
            }));
            columns.push(("Resolved", |r| display_or_dash(r.duplicate_resolved)));
        }
        FindingCategory::Bloated => {
            columns.push(("Bloat Ratio", |r| {
                r.bloat_ratio
                    .map(|ratio| format!("{:.1}%", ratio))
                    .unwrap_or_else(|| "-".to_string())
            }));
        }
        FindingCategory::Inefficient => {
            columns.push(("Reason", |r| {
                match (&r.invalid_kind, r.index_scan) {
                    (Some(kind), _) => format!("invalid ({})", kind),
                    (None, Some(scans)) => format!("{} scans", scans),
                    (None, None) => "-".to_string(),
                }
            }));
        }
    }

    columns.push(("Category", |r| r.category.as_str().to_string()));
    if matches!(category, FindingCategory::Unused | FindingCategory::Inefficient) {
        columns.push(("Replica Node Exists", |r| r.replica_attached.to_string()));
        columns.push(("Database Recovery Mode", |r| r.in_recovery.to_string()));
    }
    columns
}

fn display_or_dash<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Sizes the way `pg_size_pretty` prints them.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["kB", "MB", "GB", "TB", "PB"];
    const LIMIT: u64 = 10 * 1024;

    if bytes < LIMIT {
        return format!("{} bytes", bytes);
    }

    let mut value = bytes;
    let mut unit = 0;
    loop {
        let rounded = (value + 512) / 1024;
        if rounded < LIMIT || unit == UNITS.len() - 1 {
            return format!("{} {}", rounded, UNITS[unit]);
        }
        value /= 1024;
        unit += 1;
    }
}
