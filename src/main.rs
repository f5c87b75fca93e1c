use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use cullrs::config::IndexOptions;
use cullrs::core::extractor::PixelEmbeddingExtractor;
use cullrs::services::cache::{CacheLayer, CacheOptions, JsonFileStore};
use cullrs::services::grouping::{BatchReport, GroupingPipeline, IndexProgress, PhotoInput, SimilarityGroup};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

const HISTORY_FILE: &str = ".history.jsonl";
const CACHE_FILE: &str = "features.json";

#[derive(Serialize, Deserialize, Debug)]
struct CullHistoryRecord {
    timestamp: String,
    retained: String,
    culled: Vec<String>,
    action: String,
    /// Where culled files went; older records always used `<dir>/duplicates`.
    #[serde(default)]
    target_dir: Option<String>,
    /// Actual destination of each culled file, when it had to be renamed.
    #[serde(default)]
    moved_to: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(name = "cullrs", version, about = "Find and cull near-duplicate photos")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// JSON file with indexing options
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Where cached fingerprints and features live (default: user cache dir)
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Do not read or write the feature cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Duplicate workflows
    Duplicates {
        #[command(subcommand)]
        command: Dups,
    },

    /// Work with cull history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },

    /// Manage the feature cache
    Cache {
        #[command(subcommand)]
        command: CacheCmd,
    },
}

#[derive(Args, Debug)]
struct AnalysisArgs {
    /// Directory to scan
    #[arg(short, long, value_name = "DIR")]
    path: PathBuf,

    /// Hash similarity (0-100) two photos need to be grouped
    #[arg(long, value_name = "SCORE")]
    threshold: Option<f64>,

    /// Worker threads for feature extraction
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Also compare pixel embeddings (slower, stricter)
    #[arg(long)]
    deep: bool,
}

#[derive(Subcommand, Debug)]
enum Dups {
    /// Find and list groups of similar photos
    Scan {
        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Print groups as JSON
        #[arg(long)]
        json: bool,
    },

    /// Keep the best photo of each group and move the rest into `<dir>/duplicates`
    Cull {
        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Only show what would be moved
        #[arg(long)]
        dry_run: bool,

        /// Directory to move duplicates into (default: `<dir>/duplicates`)
        #[arg(long, value_name = "DIR")]
        target_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all cull history records
    List {
        /// Directory containing the photos
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// Move culled files back to where they were
    Restore {
        /// Directory containing the photos
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Restore a specific record index
        #[arg(long, conflicts_with = "all")]
        record: Option<usize>,
        /// Restore all records
        #[arg(long, conflicts_with = "record")]
        all: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCmd {
    /// Drop every cached entry
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.global.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    match cli.command {
        Commands::Duplicates { command } => match command {
            Dups::Scan { analysis, json } => {
                if !json {
                    println!("▶ Scanning for similar photos in: {}", analysis.path.display());
                }
                let options = load_options(&cli.global, &analysis)?;
                let culled = analysis.path.join("duplicates");
                let (groups, report) =
                    analyze(&cli.global, &analysis.path, options, analysis.deep, Some(&culled))?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&groups)?);
                } else {
                    print_report(&report);
                    print_groups(&groups);
                }
            }

            Dups::Cull {
                analysis,
                dry_run,
                target_dir,
            } => {
                println!("▶ Culling similar photos in: {}", analysis.path.display());
                let dup_dir = target_dir.unwrap_or_else(|| analysis.path.join("duplicates"));
                let options = load_options(&cli.global, &analysis)?;
                let (groups, report) = analyze(&cli.global, &analysis.path, options, analysis.deep, Some(&dup_dir))?;
                print_report(&report);
                if groups.is_empty() {
                    println!("No duplicates found.");
                    return Ok(());
                }
                cull(&analysis.path, &dup_dir, &groups, dry_run)?;
            }
        },

        Commands::History { command } => match command {
            HistoryCmd::List { path } => list_history(&path)?,
            HistoryCmd::Restore { path, record, all } => restore_history(&path, record, all)?,
        },

        Commands::Cache { command } => match command {
            CacheCmd::Clear => {
                let dir = cache_dir(&cli.global)?;
                let cache = CacheLayer::with_store(
                    CacheOptions::default(),
                    Box::new(JsonFileStore::new(dir.join(CACHE_FILE))),
                );
                let entries = cache.len();
                cache.clear();
                println!("🧹 Cleared {} cache entries in {}", entries, dir.display());
            }
        },
    }

    Ok(())
}

/// Config file first, then command-line overrides.
fn load_options(global: &GlobalArgs, analysis: &AnalysisArgs) -> Result<IndexOptions> {
    let mut options = match &global.config {
        Some(path) => IndexOptions::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => IndexOptions::default(),
    };
    if let Some(threshold) = analysis.threshold {
        options.similarity_threshold = threshold;
    }
    if let Some(workers) = analysis.workers {
        options.max_concurrent_tasks = workers;
    }
    if analysis.deep {
        options.enabled_levels.high = true;
    }
    if global.no_cache {
        options.cache.enabled = false;
    }
    options.validate().context("Invalid options")?;
    Ok(options)
}

fn cache_dir(global: &GlobalArgs) -> Result<PathBuf> {
    match &global.cache_dir {
        Some(dir) => Ok(dir.clone()),
        None => dirs::cache_dir()
            .map(|d| d.join("cullrs"))
            .context("Could not determine a cache directory; pass --cache-dir"),
    }
}

fn open_cache(global: &GlobalArgs, options: &IndexOptions) -> Result<CacheLayer> {
    if !options.cache.enabled {
        return Ok(CacheLayer::new(options.cache.clone()));
    }
    let dir = cache_dir(global)?;
    Ok(CacheLayer::with_store(
        options.cache.clone(),
        Box::new(JsonFileStore::new(dir.join(CACHE_FILE))),
    ))
}

/// Recursively walk `dir`, returning every supported image outside `skip`.
fn scan_directory(dir: &Path, options: &IndexOptions, skip: Option<&Path>) -> Result<Vec<PathBuf>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for images…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut images = Vec::new();
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| skip.is_none_or(|s| e.path() != s));
    for entry in walker.filter_map(Result::ok) {
        let path = entry.path();
        if path.is_file() && options.is_supported(path) {
            images.push(path.to_path_buf());
        }
        spinner.tick();
    }
    spinner.finish_with_message(format!("Found {} images", images.len()));
    Ok(images)
}

/// Indexes every photo under `dir` and groups them.
fn analyze(
    global: &GlobalArgs,
    dir: &Path,
    options: IndexOptions,
    deep: bool,
    skip: Option<&Path>,
) -> Result<(Vec<SimilarityGroup>, BatchReport)> {
    let images = scan_directory(dir, &options, skip)?;
    let mut inputs = Vec::with_capacity(images.len());
    for path in &images {
        inputs.push(PhotoInput::from_path(path).with_context(|| format!("Failed to stat {:?}", path))?);
    }

    let cache = Arc::new(open_cache(global, &options)?);
    let bar = ProgressBar::new(inputs.len() as u64);
    bar.set_style(ProgressStyle::with_template(
        "{bar:40.cyan/blue} {pos}/{len} {wide_msg}",
    )?);

    let (sender, receiver) = crossbeam_channel::unbounded::<IndexProgress>();
    let progress = {
        let bar = bar.clone();
        std::thread::spawn(move || {
            for update in receiver {
                bar.set_position(update.processed as u64);
                bar.set_message(update.current_photo);
            }
        })
    };

    let deep = deep && options.enabled_levels.high;
    let mut builder = GroupingPipeline::builder(options)
        .cache(cache.clone())
        .with_progress_sender(sender);
    if deep {
        builder = builder.extractor(Arc::new(PixelEmbeddingExtractor::default()));
    }
    let pipeline = builder.build()?;

    let (report, groups) = benchmark("indexing and grouping", || -> Result<_> {
        let report = pipeline.index_photos(inputs)?;
        let groups = pipeline.group()?;
        Ok((report, groups))
    })?;

    // Dropping the pipeline closes the progress channel
    drop(pipeline);
    let _ = progress.join();
    bar.finish_and_clear();
    cache.flush();

    Ok((groups, report))
}

fn print_report(report: &BatchReport) {
    if report.from_cache > 0 {
        println!("▶ {} of {} photos came from cache", report.from_cache, report.total);
    }
    if report.failed() == 0 {
        return;
    }
    eprintln!("⚠️  {} photo(s) could not be processed:", report.failed());
    for (kind, count) in report.failure_counts() {
        eprintln!("     {}: {}", kind, count);
    }
    for failure in &report.failures {
        log::debug!("{} ({}): {}", failure.photo_id, failure.kind, failure.message);
    }
}

fn print_groups(groups: &[SimilarityGroup]) {
    if groups.is_empty() {
        println!("No duplicates found.");
        return;
    }
    println!("Found {} similar group(s):", groups.len());
    for (i, group) in groups.iter().enumerate() {
        println!(
            " Group {} ({} photos, {:.1}% similar):",
            i + 1,
            group.members.len(),
            group.average_similarity
        );
        for member in &group.members {
            let marker = if *member == group.representative { "🏆" } else { "▶" };
            println!("   {} {}", marker, member);
        }
    }
}

fn cull(dir: &Path, dup_dir: &Path, groups: &[SimilarityGroup], dry_run: bool) -> Result<()> {
    if !dry_run {
        fs::create_dir_all(dup_dir).with_context(|| format!("Failed to create directory {:?}", dup_dir))?;
    }

    let history_file = dir.join(HISTORY_FILE);
    let mut history_out = if dry_run {
        None
    } else {
        Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&history_file)
                .with_context(|| format!("Failed to open history file {:?}", history_file))?,
        )
    };

    for (i, group) in groups.iter().enumerate() {
        println!("\n✨ Group {}:", i + 1);
        println!("   🏆 Keeping → {}", group.representative);
        let mut culled_paths = Vec::new();
        let mut moved_to = Vec::new();

        for member in group.members.iter().filter(|m| **m != group.representative) {
            let source = Path::new(member);
            if dry_run {
                println!("   📦 [dry-run] MOVE {} → {}", source.display(), dup_dir.display());
                culled_paths.push(member.clone());
                continue;
            }
            let dest = unique_destination(dup_dir, source)?;
            fs::rename(source, &dest).with_context(|| format!("Failed to move {:?} → {:?}", source, dest))?;
            println!("   📦 Moved {} → {}", source.display(), dest.display());
            culled_paths.push(member.clone());
            moved_to.push(dest.to_string_lossy().into_owned());
        }

        if let Some(out) = history_out.as_mut() {
            let record = CullHistoryRecord {
                timestamp: Utc::now().to_rfc3339(),
                retained: group.representative.clone(),
                culled: culled_paths,
                action: "moved".to_string(),
                target_dir: Some(dup_dir.to_string_lossy().into_owned()),
                moved_to,
            };
            writeln!(out, "{}", serde_json::to_string(&record)?)?;
        }
    }

    if dry_run {
        println!("\n⚠️  Dry-run only; no files were changed.");
    } else {
        println!("\n✅ Recorded cull history in {}", history_file.display());
    }
    Ok(())
}

/// `dup_dir/<name>`, or `dup_dir/<stem>_<n>.<ext>` when that is taken.
fn unique_destination(dup_dir: &Path, source: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .with_context(|| format!("{:?} has no file name", source))?;
    let candidate = dup_dir.join(name);
    if !candidate.exists() {
        return Ok(candidate);
    }
    let stem = source.file_stem().unwrap_or(name).to_string_lossy();
    let extension = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| dup_dir.join(format!("{}_{}{}", stem, n, extension)))
        .find(|p| !p.exists())
        .context("No free file name in target directory")
}

/// The history file as read: every raw line, plus the records that parsed
/// along with the line each came from.
struct History {
    lines: Vec<String>,
    records: Vec<(usize, CullHistoryRecord)>,
}

fn read_history(dir: &Path) -> Result<History> {
    let history_file = dir.join(HISTORY_FILE);
    let file = File::open(&history_file)
        .with_context(|| format!("Could not open history file {:?}", history_file))?;

    let mut history = History {
        lines: Vec::new(),
        records: Vec::new(),
    };
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if !line.trim().is_empty() {
            match serde_json::from_str::<CullHistoryRecord>(&line) {
                Ok(record) => history.records.push((i, record)),
                Err(err) => eprintln!("⚠️  Skipping malformed entry {}: {}", i, err),
            }
        }
        history.lines.push(line);
    }
    Ok(history)
}

fn list_history(dir: &Path) -> Result<()> {
    println!("🗂️  Cull History:");
    for (i, (_, record)) in read_history(dir)?.records.iter().enumerate() {
        println!(
            "[{}] {}\n     kept: {}\n     culled: {:?}\n     action: {}\n",
            i, record.timestamp, record.retained, record.culled, record.action
        );
    }
    Ok(())
}

fn restore_history(dir: &Path, record: Option<usize>, all: bool) -> Result<()> {
    let history_file = dir.join(HISTORY_FILE);
    let history = read_history(dir)?;
    let stored: Vec<&(usize, CullHistoryRecord)> = history
        .records
        .iter()
        .filter(|(_, r)| r.action == "moved")
        .collect();
    if stored.is_empty() {
        anyhow::bail!("No valid 'moved' history records to restore");
    }

    let restore_indices: Vec<usize> = if all {
        (0..stored.len()).collect()
    } else {
        let idx = record.unwrap_or(stored.len() - 1);
        if idx >= stored.len() {
            anyhow::bail!(
                "Invalid history index {}; valid range is 0..{}",
                idx,
                stored.len() - 1
            );
        }
        vec![idx]
    };

    for &i in &restore_indices {
        let record = &stored[i].1;
        let target = record
            .target_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| dir.join("duplicates"));
        println!(
            "🔄 Restoring {} files from record {}...",
            record.culled.len(),
            record.timestamp
        );
        for (n, original) in record.culled.iter().enumerate() {
            let src = match record.moved_to.get(n) {
                Some(moved) => PathBuf::from(moved),
                None => target.join(Path::new(original).file_name().unwrap_or_default()),
            };
            let dest = Path::new(original);

            if !src.exists() {
                eprintln!("⚠️ Source file {:?} does not exist; skipping", src);
                continue;
            }
            if src == dest {
                eprintln!("⚠️ Source and destination are the same; skipping {:?}", src);
                continue;
            }
            fs::rename(&src, dest).with_context(|| format!("Failed to restore {:?} → {:?}", src, dest))?;
            println!("🔄 Restored {:?} → {:?}", src, dest);
        }
    }

    // Everything but the restored records stays, unreadable lines included
    let restored_lines: HashSet<usize> = restore_indices.iter().map(|&i| stored[i].0).collect();
    let remaining: Vec<&str> = history
        .lines
        .iter()
        .enumerate()
        .filter(|(n, line)| !restored_lines.contains(n) && !line.trim().is_empty())
        .map(|(_, line)| line.as_str())
        .collect();
    let new_content = if remaining.is_empty() {
        String::new()
    } else {
        remaining.join("\n") + "\n"
    };
    fs::write(&history_file, new_content)
        .with_context(|| format!("Failed to update history file {:?}", history_file))?;

    println!("🧹 Updated history, removed {} record(s)", restore_indices.len());
    Ok(())
}

/// Run `f()`, log how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    log::info!("{} took {:.2?}", label, start.elapsed());
    result
}
