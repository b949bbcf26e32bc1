//! kerf - Recover records from damaged SQLite database files
//!
//! This tool scans database images for live and deleted records, matching
//! carved fragments against a user-supplied schema manifest, and writes the
//! recovered rows out per table.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, ValueEnum};
use kerf_core::{
    BlobCache, Carver, CarverConfig, ColumnType, Descriptor, FileSource, Row, RowStatus, Schema,
    Value,
};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Recover active and deleted records from damaged SQLite database files
#[derive(Parser, Debug)]
#[command(name = "kerf")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    input: InputMode,

    /// Schema manifest describing the tables and indexes to recover
    #[arg(short, long)]
    schema: PathBuf,

    /// Output directory for recovered row files
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Only report deleted (carved) records
    #[arg(long)]
    deleted_only: bool,

    /// Maximum carved records per page (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_carved: usize,

    /// Dry run - don't write files, just show what would be recovered
    #[arg(long)]
    dry_run: bool,

    /// Overwrite existing files without prompting
    #[arg(long)]
    force: bool,

    /// Only list per-table recovery counts without writing rows
    #[arg(long)]
    list_only: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single database image to recover from
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory of database images to process
    #[arg(short, long)]
    directory: Option<PathBuf>,
}

/// Output format for recovered rows
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// One annotated line per row
    Text,
    /// Comma-separated values with a provenance prefix
    Csv,
}

/// Tracks emitted rows for deduplication and statistics
#[derive(Default)]
struct RowRegistry {
    /// Content hashes of rows already emitted, per table
    seen: HashMap<String, Vec<String>>,
    stats: RegistryStats,
}

#[derive(Default)]
struct RegistryStats {
    total_found: usize,
    duplicates_skipped: usize,
    written: usize,
}

impl RowRegistry {
    fn new() -> Self {
        Self::default()
    }

    /// Compute a short content hash of a rendered row (first 8 chars of blake3)
    fn content_hash(rendered: &str) -> String {
        let hash = blake3::hash(rendered.as_bytes());
        hash.to_hex()[..8].to_string()
    }

    /// Register a rendered row; returns false if an identical one was
    /// already emitted for this table.
    ///
    /// The same deleted record is frequently recoverable from several
    /// residues (page copies, partially vacuumed space), so identical carved
    /// rows are collapsed. Live rows are genuine duplicates only if the
    /// table itself holds duplicate data, which provenance distinguishes.
    fn register(&mut self, table: &str, rendered: &str) -> bool {
        self.stats.total_found += 1;
        let hash = Self::content_hash(rendered);
        let entries = self.seen.entry(table.to_string()).or_default();
        if entries.contains(&hash) {
            trace!("skipping duplicate row in {} (hash: {})", table, hash);
            self.stats.duplicates_skipped += 1;
            return false;
        }
        entries.push(hash);
        true
    }

    fn print_summary(&self) {
        info!(
            "Summary: {} rows found, {} duplicates skipped, {} files written",
            self.stats.total_found, self.stats.duplicates_skipped, self.stats.written
        );
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    let schema = load_schema(&cli.schema)
        .with_context(|| format!("Failed to load schema manifest: {}", cli.schema.display()))?;

    // Dispatch based on input mode
    if let Some(ref file) = cli.input.file {
        process_single_file(&cli, &schema, file)
    } else if let Some(ref directory) = cli.input.directory {
        process_directory(&cli, &schema, directory)
    } else {
        bail!("Either --file or --directory must be specified")
    }
}

/// Process a single database image
fn process_single_file(cli: &Cli, schema: &Schema, file: &Path) -> Result<()> {
    if !file.exists() {
        bail!("Input file does not exist: {}", file.display());
    }
    if !file.is_file() {
        bail!("Input path is not a file: {}", file.display());
    }

    let mut registry = RowRegistry::new();
    process_database(cli, schema, file, &mut registry)?;

    if !cli.list_only && !cli.dry_run {
        registry.print_summary();
    }

    Ok(())
}

/// Process a directory of database images recursively
fn process_directory(cli: &Cli, schema: &Schema, directory: &Path) -> Result<()> {
    if !directory.exists() {
        bail!("Directory does not exist: {}", directory.display());
    }
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!("Scanning directory: {}", directory.display());

    let mut registry = RowRegistry::new();
    let mut databases_processed = 0;

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if !path.is_file() {
            continue;
        }

        // Skip hidden files
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
        {
            continue;
        }

        if !is_sqlite_file(path) {
            trace!("Skipping non-database file: {}", path.display());
            continue;
        }

        debug!("Processing database: {}", path.display());
        if let Err(e) = process_database(cli, schema, path, &mut registry) {
            // Log error but continue with other files
            warn!("Error processing {}: {}", path.display(), e);
        }
        databases_processed += 1;
    }

    info!("Processed {} databases", databases_processed);

    if !cli.list_only && !cli.dry_run {
        registry.print_summary();
    }

    Ok(())
}

/// Check whether a file starts with the SQLite header magic
fn is_sqlite_file(path: &Path) -> bool {
    use std::io::Read;
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 16];
    file.read_exact(&mut magic).is_ok() && &magic == b"SQLite format 3\0"
}

/// Run recovery over one database image and emit its rows
fn process_database(
    cli: &Cli,
    schema: &Schema,
    db_path: &Path,
    registry: &mut RowRegistry,
) -> Result<()> {
    trace!("Reading {}", db_path.display());
    let source = FileSource::open(db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    let db_name = db_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("db")
        .to_string();

    let config = CarverConfig::new()
        .include_active(!cli.deleted_only)
        .max_carved_per_page(cli.max_carved);
    let blobs = BlobCache::new();
    let carver = Carver::new(&source, schema)
        .with_config(config)
        .with_blob_cache(&blobs, &db_name);

    let report = carver.carve_database();
    debug!(
        "{}: {} pages scanned, {} active rows, {} carved rows, {} blobs cached",
        db_path.display(),
        report.pages_scanned,
        report.active_rows(),
        report.carved_rows(),
        blobs.len()
    );

    // Group rows by table, dropping live rows in deleted-only mode
    let mut by_table: BTreeMap<String, Vec<&Row>> = BTreeMap::new();
    for row in &report.rows {
        if cli.deleted_only && row.status == RowStatus::Active {
            continue;
        }
        by_table.entry(row.table.clone()).or_default().push(row);
    }

    if cli.list_only {
        for (table, rows) in &by_table {
            let carved = rows
                .iter()
                .filter(|r| r.status == RowStatus::Carved)
                .count();
            println!(
                "{}: {} rows ({} active, {} carved)",
                table,
                rows.len(),
                rows.len() - carved,
                carved
            );
        }
        return Ok(());
    }

    for (table, rows) in &by_table {
        let mut lines = Vec::new();
        for row in rows {
            let rendered = match cli.format {
                OutputFormat::Text => render_text(row),
                OutputFormat::Csv => render_csv(row),
            };
            if registry.register(table, &rendered) {
                lines.push(rendered);
            }
        }
        if lines.is_empty() {
            continue;
        }

        let extension = match cli.format {
            OutputFormat::Text => "txt",
            OutputFormat::Csv => "csv",
        };
        let output_path = cli.output.join(format!("{db_name}.{table}.{extension}"));

        if cli.dry_run {
            println!("Would write: {} ({} rows)", output_path.display(), lines.len());
            if cli.verbose > 0 {
                for line in &lines {
                    println!("  {line}");
                }
            }
            continue;
        }

        match write_rows_file(&output_path, &lines, cli.force) {
            Ok(()) => {
                println!("Wrote {} ({} rows)", output_path.display(), lines.len());
                registry.stats.written += 1;
            }
            Err(e) => {
                error!("Failed to write {}: {}", output_path.display(), e);
            }
        }
    }

    Ok(())
}

/// Render a row as an annotated text line
fn render_text(row: &Row) -> String {
    let status = match row.status {
        RowStatus::Active => "active",
        RowStatus::Carved => "carved",
    };
    let rowid = row
        .rowid
        .map(|r| r.to_string())
        .unwrap_or_else(|| "-".to_string());
    let values: Vec<String> = row.values.iter().map(|v| v.to_string()).collect();
    format!(
        "[{status}] page={} offset={} rowid={rowid}: {}",
        row.page,
        row.offset,
        values.join(", ")
    )
}

/// Render a row as a CSV line: status, page, offset, rowid, then the columns
fn render_csv(row: &Row) -> String {
    let status = match row.status {
        RowStatus::Active => "active",
        RowStatus::Carved => "carved",
    };
    let mut fields = vec![
        status.to_string(),
        row.page.to_string(),
        row.offset.to_string(),
        row.rowid.map(|r| r.to_string()).unwrap_or_default(),
    ];
    for value in &row.values {
        let rendered = match value {
            Value::Null => String::new(),
            other => other.to_string(),
        };
        fields.push(csv_escape(&rendered));
    }
    fields.join(",")
}

/// Quote a CSV field when it contains a delimiter, quote, or newline
fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Write recovered rows to disk, refusing to clobber without --force
fn write_rows_file(output_path: &Path, lines: &[String], force: bool) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    if output_path.exists() && !force {
        bail!(
            "File already exists: {} (use --force to overwrite)",
            output_path.display()
        );
    }

    let mut file = fs::File::create(output_path)
        .with_context(|| format!("Failed to create file: {}", output_path.display()))?;
    for line in lines {
        writeln!(file, "{line}")
            .with_context(|| format!("Failed to write file: {}", output_path.display()))?;
    }

    Ok(())
}

/// Load a schema manifest.
///
/// One object per line:
///
/// ```text
/// # tables: name, root page, rowid handling, column signature
/// table users root=2 rowid ipk=0 columns=INT,TEXT,BLOB
/// table kv root=5 norowid columns=TEXT,BLOB
/// index users_name root=3 table=users columns=TEXT
/// view active_users
/// ```
///
/// This is a descriptor supply channel, not a SQL parser; signatures come
/// from whatever produced the manifest.
fn load_schema(path: &Path) -> Result<Schema> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

    let mut descriptors = Vec::new();
    for (line_number, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let descriptor = parse_manifest_line(line)
            .with_context(|| format!("line {}: '{}'", line_number + 1, line))?;
        descriptors.push(descriptor);
    }

    Schema::new(descriptors).context("manifest declares no recoverable objects")
}

fn parse_manifest_line(line: &str) -> Result<Descriptor> {
    let mut tokens = line.split_whitespace();
    let kind = tokens.next().context("missing object kind")?;
    let name = tokens.next().context("missing object name")?.to_string();

    let mut root_page = 0u32;
    let mut has_rowid = true;
    let mut ipk_alias = None;
    let mut table = None;
    let mut columns = Vec::new();

    for token in tokens {
        if let Some(value) = token.strip_prefix("root=") {
            root_page = value.parse().context("invalid root page")?;
        } else if let Some(value) = token.strip_prefix("ipk=") {
            ipk_alias = Some(value.parse::<usize>().context("invalid ipk column")?);
        } else if let Some(value) = token.strip_prefix("table=") {
            table = Some(value.to_string());
        } else if let Some(value) = token.strip_prefix("columns=") {
            for keyword in value.split(',') {
                let column = ColumnType::from_keyword(keyword)
                    .with_context(|| format!("unknown column type '{keyword}'"))?;
                columns.push(column);
            }
        } else if token == "rowid" {
            has_rowid = true;
        } else if token == "norowid" {
            has_rowid = false;
        } else {
            bail!("unrecognized token '{token}'");
        }
    }

    match kind {
        "table" => {
            if columns.is_empty() {
                bail!("table '{name}' declares no columns");
            }
            let mut descriptor = Descriptor::table(name, root_page, columns, has_rowid);
            if let Some(column) = ipk_alias {
                descriptor = descriptor.with_ipk_alias(column);
            }
            Ok(descriptor)
        }
        "index" => {
            let table = table.context("index is missing table=")?;
            if columns.is_empty() {
                bail!("index '{name}' declares no columns");
            }
            Ok(Descriptor::index(name, root_page, table, columns))
        }
        "view" => Ok(Descriptor::view(name)),
        other => bail!("unknown object kind '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kerf_core::DescriptorKind;
    use tempfile::TempDir;

    #[test]
    fn test_parse_table_line() {
        let descriptor =
            parse_manifest_line("table users root=2 rowid ipk=0 columns=INT,TEXT,BLOB").unwrap();
        assert_eq!(descriptor.name, "users");
        assert_eq!(descriptor.root_page, 2);
        let info = descriptor.table_info().unwrap();
        assert!(info.has_rowid);
        assert_eq!(info.ipk_alias, Some(0));
        assert_eq!(
            info.columns,
            vec![ColumnType::Int, ColumnType::Text, ColumnType::Blob]
        );
    }

    #[test]
    fn test_parse_index_and_view_lines() {
        let index = parse_manifest_line("index users_name root=3 table=users columns=TEXT").unwrap();
        assert!(matches!(index.kind, DescriptorKind::Index(_)));
        assert_eq!(index.root_page, 3);

        let view = parse_manifest_line("view active_users").unwrap();
        assert!(matches!(view.kind, DescriptorKind::View));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_manifest_line("table users root=x columns=INT").is_err());
        assert!(parse_manifest_line("table users root=2").is_err());
        assert!(parse_manifest_line("table users root=2 columns=WIDGET").is_err());
        assert!(parse_manifest_line("blob users").is_err());
        assert!(parse_manifest_line("index idx root=3 columns=TEXT").is_err());
    }

    #[test]
    fn test_load_schema_skips_comments_and_blanks() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("schema.txt");
        fs::write(
            &manifest,
            "# recovered from sqlite_master\n\ntable users root=2 columns=INT,TEXT\n",
        )
        .unwrap();
        let schema = load_schema(&manifest).unwrap();
        assert_eq!(schema.descriptors().len(), 1);
    }

    #[test]
    fn test_load_schema_empty_manifest_is_error() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("schema.txt");
        fs::write(&manifest, "# nothing here\n").unwrap();
        assert!(load_schema(&manifest).is_err());
    }

    #[test]
    fn test_is_sqlite_file() {
        let dir = TempDir::new().unwrap();

        let db = dir.path().join("real.db");
        let mut f = fs::File::create(&db).unwrap();
        f.write_all(b"SQLite format 3\0").unwrap();
        f.write_all(&[0u8; 84]).unwrap();
        assert!(is_sqlite_file(&db));

        let other = dir.path().join("other.db");
        fs::write(&other, b"not a database at all").unwrap();
        assert!(!is_sqlite_file(&other));
    }

    #[test]
    fn test_registry_deduplicates_per_table() {
        let mut registry = RowRegistry::new();
        assert!(registry.register("users", "[carved] row"));
        assert!(!registry.register("users", "[carved] row"));
        // Same content under a different table is distinct
        assert!(registry.register("logs", "[carved] row"));
        assert_eq!(registry.stats.duplicates_skipped, 1);
        assert_eq!(registry.stats.total_found, 3);
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn test_write_rows_file_respects_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        let lines = vec!["one".to_string()];
        write_rows_file(&path, &lines, false).unwrap();
        assert!(write_rows_file(&path, &lines, false).is_err());
        write_rows_file(&path, &lines, true).unwrap();
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
