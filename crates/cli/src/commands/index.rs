// `annosync index` — inspect or clear the local annotation index.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Args, Subcommand};
use serde::Serialize;
use tracing::debug;

use annosync_client::config::ClientConfig;
use annosync_client::store::{AnnotationIndex, LocalAnnotationRecord, SqliteAnnotationIndex};

use crate::exit_code::UsageError;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct IndexLocation {
    /// Index database (defaults to the configured path or ~/.annosync/index.db).
    #[arg(long, value_name = "PATH")]
    index: Option<PathBuf>,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum IndexCommand {
    /// List indexed annotations
    List(ListArgs),
    /// Show the page and server id of one annotation
    Lookup(LookupArgs),
    /// Remove every record (what logout does)
    Clear(ClearArgs),
}

impl IndexCommand {
    pub fn json_requested(&self) -> bool {
        match self {
            Self::List(args) => args.location.json,
            Self::Lookup(args) => args.location.json,
            Self::Clear(args) => args.location.json,
        }
    }
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    location: IndexLocation,
    /// Only list annotations of this document.
    #[arg(long)]
    document: Option<String>,
}

#[derive(Debug, Args)]
pub struct LookupArgs {
    #[command(flatten)]
    location: IndexLocation,
    /// Annotation id assigned by the viewer.
    annotation_id: String,
    #[arg(long)]
    document: String,
    /// Page to match instead of the stored one.
    #[arg(long)]
    page: Option<u32>,
}

#[derive(Debug, Args)]
pub struct ClearArgs {
    #[command(flatten)]
    location: IndexLocation,
    /// Confirm removing every record.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecordEntry {
    pub annotation_id: String,
    pub server_id: Option<String>,
    pub document_id: String,
    pub page_number: u32,
}

impl From<LocalAnnotationRecord> for RecordEntry {
    fn from(record: LocalAnnotationRecord) -> Self {
        Self {
            annotation_id: record.annotation_id,
            server_id: record.server_id,
            document_id: record.document_id,
            page_number: record.page_number,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub index_path: String,
    pub records: Vec<RecordEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupResult {
    pub annotation_id: String,
    pub document_id: String,
    pub page_number: Option<u32>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub index_path: String,
    pub removed: usize,
}

pub fn run(cmd: IndexCommand) -> anyhow::Result<()> {
    match cmd {
        IndexCommand::List(args) => {
            let format = OutputFormat::detect(args.location.json);
            let path = resolve_index_path(args.location.index)?;
            let result = list_records(&path, args.document.as_deref())?;
            output::print_output(format, &result, format_list_human)?;
        }
        IndexCommand::Lookup(args) => {
            let format = OutputFormat::detect(args.location.json);
            let path = resolve_index_path(args.location.index)?;
            let result = lookup(&path, &args.annotation_id, &args.document, args.page)?;
            output::print_output(format, &result, format_lookup_human)?;
        }
        IndexCommand::Clear(args) => {
            let format = OutputFormat::detect(args.location.json);
            if !args.yes {
                return Err(UsageError(
                    "refusing to clear the annotation index without --yes".into(),
                )
                .into());
            }
            let path = resolve_index_path(args.location.index)?;
            let result = clear(&path)?;
            if result.removed == 0 {
                output::print_warning(
                    format,
                    "INDEX_EMPTY",
                    "the annotation index was already empty",
                );
            }
            output::print_output(format, &result, |r| {
                format!("Removed {} record(s) from {}", r.removed, r.index_path)
            })?;
        }
    }
    Ok(())
}

fn resolve_index_path(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let path = flag
        .or_else(|| ClientConfig::load().resolved_index_path())
        .ok_or_else(|| anyhow!("could not determine the annotation index path; pass --index"))?;
    debug!(path = %path.display(), "using annotation index");
    Ok(path)
}

fn open_existing(path: &Path) -> anyhow::Result<SqliteAnnotationIndex> {
    if !path.exists() {
        bail!("no annotation index at `{}`", path.display());
    }
    SqliteAnnotationIndex::open(path)
        .with_context(|| format!("failed to open annotation index at `{}`", path.display()))
}

fn list_records(path: &Path, document: Option<&str>) -> anyhow::Result<ListResult> {
    let index = open_existing(path)?;
    let records = match document {
        Some(document_id) => index.records_for_document(document_id),
        None => index.all_records(),
    }
    .context("failed to list annotation index records")?;

    Ok(ListResult {
        index_path: path.display().to_string(),
        records: records.into_iter().map(RecordEntry::from).collect(),
    })
}

fn lookup(
    path: &Path,
    annotation_id: &str,
    document_id: &str,
    page: Option<u32>,
) -> anyhow::Result<LookupResult> {
    let index = open_existing(path)?;
    let stored_page = index
        .lookup_page_number(annotation_id, document_id)
        .context("failed to look up page number")?;
    let server_id = match page.or(stored_page) {
        Some(page) => index
            .lookup_server_id(annotation_id, document_id, page)
            .context("failed to look up server id")?,
        None => None,
    };

    Ok(LookupResult {
        annotation_id: annotation_id.to_string(),
        document_id: document_id.to_string(),
        page_number: stored_page,
        server_id,
    })
}

fn clear(path: &Path) -> anyhow::Result<ClearResult> {
    let mut index = open_existing(path)?;
    let removed = index.clear().context("failed to clear annotation index")?;
    Ok(ClearResult { index_path: path.display().to_string(), removed })
}

fn format_list_human(result: &ListResult) -> String {
    if result.records.is_empty() {
        return format!("No indexed annotations in {}.", result.index_path);
    }

    let mut lines = vec![format!("{} annotation(s)", result.records.len())];
    for r in &result.records {
        let server_id = r.server_id.as_deref().unwrap_or("(unconfirmed)");
        lines.push(format!(
            "  {} / {}  page {}  -> {}",
            r.document_id, r.annotation_id, r.page_number, server_id
        ));
    }
    lines.join("\n")
}

fn format_lookup_human(result: &LookupResult) -> String {
    match (&result.server_id, result.page_number) {
        (Some(server_id), Some(page)) => format!(
            "{} in {}: page {}, server id {}",
            result.annotation_id, result.document_id, page, server_id
        ),
        (None, Some(page)) => format!(
            "{} in {}: stored on page {}, no server id for the requested page",
            result.annotation_id, result.document_id, page
        ),
        _ => format!("{} is not indexed for {}", result.annotation_id, result.document_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_index(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("index.db");
        let mut index = SqliteAnnotationIndex::open(&path).expect("index should open");
        for record in [
            LocalAnnotationRecord::new("a1", Some("s1".into()), "d1", 2),
            LocalAnnotationRecord::new("a2", None, "d1", 1),
            LocalAnnotationRecord::new("b1", Some("s3".into()), "d2", 7),
        ] {
            index.put(&record).expect("seed put should succeed");
        }
        path
    }

    #[test]
    fn list_filters_by_document() {
        let dir = TempDir::new().unwrap();
        let path = seeded_index(&dir);

        let all = list_records(&path, None).unwrap();
        assert_eq!(all.records.len(), 3);

        let d1 = list_records(&path, Some("d1")).unwrap();
        let ids: Vec<_> = d1.records.iter().map(|r| r.annotation_id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a1"]);
    }

    #[test]
    fn missing_index_is_not_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.db");

        let error = list_records(&path, None).unwrap_err();
        assert!(error.to_string().contains("no annotation index"));
        assert!(!path.exists());
    }

    #[test]
    fn lookup_uses_stored_page_unless_overridden() {
        let dir = TempDir::new().unwrap();
        let path = seeded_index(&dir);

        let hit = lookup(&path, "a1", "d1", None).unwrap();
        assert_eq!(hit.page_number, Some(2));
        assert_eq!(hit.server_id.as_deref(), Some("s1"));

        let wrong_page = lookup(&path, "a1", "d1", Some(9)).unwrap();
        assert_eq!(wrong_page.server_id, None);

        let miss = lookup(&path, "zz", "d1", None).unwrap();
        assert_eq!(miss.page_number, None);
        assert!(format_lookup_human(&miss).contains("not indexed"));
    }

    #[test]
    fn clear_reports_removed_count() {
        let dir = TempDir::new().unwrap();
        let path = seeded_index(&dir);

        assert_eq!(clear(&path).unwrap().removed, 3);
        assert_eq!(clear(&path).unwrap().removed, 0);
    }

    #[test]
    fn human_list_marks_unconfirmed_records() {
        let dir = TempDir::new().unwrap();
        let path = seeded_index(&dir);
        let output = format_list_human(&list_records(&path, Some("d1")).unwrap());

        assert!(output.contains("2 annotation(s)"));
        assert!(output.contains("d1 / a1  page 2  -> s1"));
        assert!(output.contains("(unconfirmed)"));
    }

    #[test]
    fn human_list_empty() {
        let result = ListResult { index_path: "/tmp/index.db".into(), records: Vec::new() };
        assert_eq!(format_list_human(&result), "No indexed annotations in /tmp/index.db.");
    }
}
