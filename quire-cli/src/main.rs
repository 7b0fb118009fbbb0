//! Quire CLI - Browse and maintain composition history

use clap::{ArgAction, ArgGroup, CommandFactory, Parser, Subcommand};
use quire_core::query::match_context;
use quire_core::timestamp::file_stamp;
use quire_core::{
    format_size, Composition, Config, History, ListOptions, RetentionPolicy, SortBy,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Config file picked up from the history directory when `--config` is absent
const CONFIG_FILE_NAME: &str = "config.toml";

/// Matches shown per search result in text output
const SEARCH_CONTEXT_MATCHES: usize = 3;
const SEARCH_CONTEXT_RADIUS: usize = 30;
const PREVIEW_CHARS: usize = 60;

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Composition history with full-text search", long_about = None)]
struct Cli {
    /// History directory (default: platform data dir)
    #[arg(long, global = true, env = "QUIRE_HISTORY_DIR")]
    history_dir: Option<PathBuf>,

    /// Config file (default: config.toml in the history directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log debug output to stderr
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a composition (reads stdin when no text is given)
    New {
        /// Working directory recorded with the composition
        #[arg(long)]
        dir: String,
        text: Option<String>,
    },

    /// Print a composition
    Show { path: PathBuf },

    /// List compositions
    List {
        /// recent, oldest, directory, size or lines
        #[arg(long, default_value = "recent")]
        sort: SortBy,
        /// Only compositions from this working directory
        #[arg(long)]
        dir: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// List working directories with composition counts
    Dirs,

    /// Full-text search
    Search {
        query: String,
        /// Only compositions from this working directory
        #[arg(long)]
        dir: Option<String>,
    },

    /// Delete a composition from disk and index
    Delete { path: PathBuf },

    /// Compare files with the index (exit 1 on drift)
    Verify,

    /// Rebuild the index from the files
    Rebuild,

    /// Copy the index database next to itself
    Backup,

    /// Show history statistics
    Stats,

    /// Delete compositions by policy (preview unless --execute)
    #[command(group(ArgGroup::new("policy").required(true)))]
    Cleanup {
        #[arg(long, group = "policy")]
        older_than_days: Option<u32>,
        /// Keep the N most recent
        #[arg(long, group = "policy")]
        keep: Option<usize>,
        #[arg(long, group = "policy")]
        delete_oldest: Option<usize>,
        /// Everything from one working directory
        #[arg(long, group = "policy")]
        in_dir: Option<String>,
        #[arg(long, group = "policy")]
        all: bool,
        /// Actually delete (default is a preview)
        #[arg(long)]
        execute: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = run(&cli);

    if let Err(e) = result {
        if cli.json {
            let error_json = match &e {
                quire_core::QuireError::Drift { .. } => {
                    serde_json::json!({ "code": "drift", "message": e.to_string(), "hint": "run 'quire rebuild'" })
                }
                _ => serde_json::json!({ "code": "error", "message": e.to_string(), "hint": "" }),
            };
            match serde_json::to_string_pretty(&error_json) {
                Ok(text) => eprintln!("{text}"),
                Err(_) => eprintln!("Error: {e}"),
            }
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> quire_core::Result<()> {
    let history_dir = resolve_history_dir(cli.history_dir.as_deref())?;
    let config = load_config(cli.config.as_deref(), &history_dir)?;
    debug!(history_dir = %history_dir.display(), "Resolved history directory");
    let history = History::open(&history_dir, &config)?;
    let json = cli.json;

    match &cli.command {
        Commands::New { dir, text } => cmd_new(&history, dir, text.as_deref(), json),
        Commands::Show { path } => cmd_show(&history, path, json),
        Commands::List {
            sort,
            dir,
            limit,
            offset,
        } => {
            let mut options = ListOptions::new().with_sort(*sort).with_offset(*offset);
            if let Some(dir) = dir {
                options = options.with_working_dir(dir.as_str());
            }
            if let Some(limit) = limit {
                options = options.with_limit(*limit);
            }
            cmd_list(&history, &options, json)
        }
        Commands::Dirs => cmd_dirs(&history, json),
        Commands::Search { query, dir } => cmd_search(&history, query, dir.as_deref(), json),
        Commands::Delete { path } => cmd_delete(&history, path, json),
        Commands::Verify => cmd_verify(&history, json),
        Commands::Rebuild => cmd_rebuild(&history, json),
        Commands::Backup => cmd_backup(&history, json),
        Commands::Stats => cmd_stats(&history, json),
        Commands::Cleanup {
            older_than_days,
            keep,
            delete_oldest,
            in_dir,
            all,
            execute,
        } => {
            let policy = if let Some(days) = older_than_days {
                RetentionPolicy::OlderThanDays(*days)
            } else if let Some(n) = keep {
                RetentionPolicy::KeepRecent(*n)
            } else if let Some(n) = delete_oldest {
                RetentionPolicy::DeleteOldest(*n)
            } else if let Some(dir) = in_dir {
                RetentionPolicy::Directory(dir.clone())
            } else if *all {
                RetentionPolicy::All
            } else {
                Cli::command()
                    .error(
                        clap::error::ErrorKind::MissingRequiredArgument,
                        "cleanup needs a policy",
                    )
                    .exit()
            };
            cmd_cleanup(&history, &policy, *execute, json)
        }
    }
}

fn resolve_history_dir(explicit: Option<&Path>) -> quire_core::Result<PathBuf> {
    let dir = match explicit {
        Some(dir) => dir.to_path_buf(),
        None => directories::ProjectDirs::from("", "", "quire")
            .map(|dirs| dirs.data_dir().join("history"))
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "could not locate a data directory, pass --history-dir",
                )
            })?,
    };

    // index keys are paths, so keep them absolute whatever the cwd
    if dir.is_absolute() {
        Ok(dir)
    } else {
        Ok(std::env::current_dir()?.join(dir))
    }
}

fn load_config(explicit: Option<&Path>, history_dir: &Path) -> quire_core::Result<Config> {
    if let Some(path) = explicit {
        return Config::load(path);
    }
    let default_path = history_dir.join(CONFIG_FILE_NAME);
    if default_path.is_file() {
        Config::load(&default_path)
    } else {
        Ok(Config::default())
    }
}

/// Accept absolute paths, or names relative to the history directory
fn resolve_composition_path(history: &History, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let in_history = history.dir().join(path);
    if in_history.exists() || !path.exists() {
        in_history
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("Error: failed to encode JSON: {e}"),
    }
}

fn preview(content: &str) -> String {
    let first_line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut preview: String = first_line.chars().take(PREVIEW_CHARS).collect();
    if first_line.chars().count() > PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_composition_line(composition: &Composition) -> quire_core::Result<()> {
    use colored::Colorize;

    println!(
        "{} {} {} {}",
        file_stamp(composition.created_at)?.dimmed(),
        file_name(&composition.file_path).cyan(),
        composition.working_directory.blue(),
        preview(&composition.content)
    );
    Ok(())
}

fn cmd_new(history: &History, dir: &str, text: Option<&str>, json: bool) -> quire_core::Result<()> {
    use colored::Colorize;

    let content = match text {
        Some(text) => text.to_string(),
        None => std::io::read_to_string(std::io::stdin())?,
    };

    let session = history.session();
    let path = session.new_composition(dir, &content)?;

    if json {
        print_json(&session.metadata(&path)?);
    } else {
        println!("{} {}", "Created".green(), path.display());
    }
    Ok(())
}

fn cmd_show(history: &History, path: &Path, json: bool) -> quire_core::Result<()> {
    use colored::Colorize;

    let path = resolve_composition_path(history, path);
    let session = history.session();
    let content = session.load(&path)?;
    let metadata = session.metadata(&path).ok();

    if json {
        print_json(&serde_json::json!({
            "file_path": path,
            "content": content,
            "metadata": metadata,
        }));
    } else {
        match &metadata {
            Some(meta) => println!(
                "{}",
                format!(
                    "// {} | {} | {} chars, {} lines",
                    file_name(&path),
                    meta.working_directory,
                    meta.character_count,
                    meta.line_count
                )
                .dimmed()
            ),
            None => println!("{}", format!("// {} (not indexed)", file_name(&path)).dimmed()),
        }
        print!("{content}");
        if !content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn cmd_list(history: &History, options: &ListOptions, json: bool) -> quire_core::Result<()> {
    let compositions = history.listing().list(options)?;

    if json {
        print_json(&compositions);
    } else {
        for composition in &compositions {
            print_composition_line(composition)?;
        }
        println!("({} compositions)", compositions.len());
    }
    Ok(())
}

fn cmd_dirs(history: &History, json: bool) -> quire_core::Result<()> {
    use colored::Colorize;

    let listing = history.listing();
    let mut rows = Vec::new();
    for dir in listing.unique_directories()? {
        let count = listing.count_in_directory(&dir)?;
        rows.push((dir, count));
    }

    if json {
        let value: Vec<_> = rows
            .iter()
            .map(|(dir, count)| serde_json::json!({ "working_directory": dir, "count": count }))
            .collect();
        print_json(&value);
    } else {
        for (dir, count) in &rows {
            println!("{} {}", dir.blue(), format!("({count})").dimmed());
        }
    }
    Ok(())
}

fn cmd_search(history: &History, query: &str, dir: Option<&str>, json: bool) -> quire_core::Result<()> {
    use colored::Colorize;

    let engine = history.query();
    let results = match dir {
        Some(dir) => engine.search_in_directory(query, dir)?,
        None => engine.search(query)?,
    };

    if json {
        print_json(&results);
        return Ok(());
    }

    for result in &results {
        let composition = &result.composition;
        println!(
            "{} {} {}",
            file_name(&composition.file_path).cyan(),
            composition.working_directory.blue(),
            format!("[{} matches]", result.match_count()).dimmed()
        );
        for m in result.matches.iter().take(SEARCH_CONTEXT_MATCHES) {
            let context = match_context(&composition.content, m, SEARCH_CONTEXT_RADIUS);
            let flattened = context.replace('\n', " ");
            println!("  …{}…", flattened.replace(&m.text, &m.text.yellow().to_string()));
        }
    }
    println!("({} results)", results.len());
    Ok(())
}

fn cmd_delete(history: &History, path: &Path, json: bool) -> quire_core::Result<()> {
    use colored::Colorize;

    let path = resolve_composition_path(history, path);
    history.session().delete(&path)?;

    if json {
        print_json(&serde_json::json!({ "deleted": path }));
    } else {
        println!("{} {}", "Deleted".green(), path.display());
    }
    Ok(())
}

fn cmd_verify(history: &History, json: bool) -> quire_core::Result<()> {
    use colored::Colorize;

    let report = history.checker().verify()?;

    if json {
        print_json(&report);
    } else {
        println!(
            "{}: {} files, {} index entries",
            "Checked".blue(),
            report.total_files,
            report.total_entries
        );
        for path in &report.missing_entries {
            println!("{} {}", "not indexed".yellow(), path.display());
        }
        for path in &report.missing_files {
            println!("{} {}", "file missing".yellow(), path.display());
        }
        for mismatch in &report.mismatches {
            println!(
                "{} {} (file {} B, index {} B; modified {}, indexed {})",
                "mismatch".yellow(),
                mismatch.file_path.display(),
                mismatch.file_size,
                mismatch.indexed_size,
                file_stamp(mismatch.file_modified)?,
                file_stamp(mismatch.indexed_updated)?
            );
        }
        if report.is_synced() {
            println!("{}", "In sync".green());
        }
    }

    report.into_result().map(|_| ())
}

fn cmd_rebuild(history: &History, json: bool) -> quire_core::Result<()> {
    use colored::Colorize;

    let report = history.checker().rebuild()?;

    if json {
        print_json(&report);
    } else {
        println!(
            "{}: {} files ({} added, {} refreshed, {} stale entries removed)",
            "Rebuilt".green(),
            report.files_seen,
            report.inserted,
            report.updated,
            report.pruned
        );
        for failure in &report.failures {
            eprintln!(
                "{}: {}: {}",
                "Warning".yellow(),
                failure.file_path.display(),
                failure.error
            );
        }
    }
    Ok(())
}

fn cmd_backup(history: &History, json: bool) -> quire_core::Result<()> {
    use colored::Colorize;

    let backup = history.checker().backup()?;

    if json {
        print_json(&serde_json::json!({ "backup": backup }));
    } else {
        println!("{} {}", "Backed up to".green(), backup.display());
    }
    Ok(())
}

fn cmd_stats(history: &History, json: bool) -> quire_core::Result<()> {
    use colored::Colorize;

    let stats = history.retention().statistics()?;

    if json {
        print_json(&stats);
        return Ok(());
    }

    println!("{}: {}", "History".blue(), history.dir().display());
    println!("{}: {}", "Compositions".blue(), stats.total_compositions);
    println!("{}: {}", "Total size".blue(), format_size(stats.total_size));
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        println!("{}: {}", "Oldest".blue(), file_stamp(oldest)?);
        println!("{}: {}", "Newest".blue(), file_stamp(newest)?);
    }
    if let Some(days) = stats.age_days {
        println!("{}: {} days", "Age".blue(), days);
    }
    for (dir, count) in &stats.directory_counts {
        println!("  {} {}", dir, format!("({count})").dimmed());
    }
    Ok(())
}

fn cmd_cleanup(
    history: &History,
    policy: &RetentionPolicy,
    execute: bool,
    json: bool,
) -> quire_core::Result<()> {
    use colored::Colorize;

    let retention = history.retention();

    if !execute {
        let selection = retention.evaluate(policy)?;
        if json {
            print_json(&selection);
        } else {
            for composition in &selection.compositions {
                print_composition_line(composition)?;
            }
            println!(
                "{}: {} would delete {} compositions ({}); rerun with --execute",
                "Preview".yellow(),
                policy,
                selection.count(),
                format_size(selection.total_size)
            );
        }
        return Ok(());
    }

    let outcome = retention.apply(policy)?;
    if json {
        print_json(&outcome);
    } else {
        println!(
            "{}: {} compositions ({})",
            "Deleted".green(),
            outcome.deleted,
            format_size(outcome.selection.total_size)
        );
        for failure in &outcome.failures {
            eprintln!(
                "{}: {}: {}",
                "Warning".yellow(),
                failure.file_path.display(),
                failure.error
            );
        }
    }
    Ok(())
}
