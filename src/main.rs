use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use fourgram::bitmap::{Bitmap, ScanError};
use fourgram::engine::filter_file;
use fourgram::filter::NgramFilter;
use fourgram::pack::{self, pack_store};
use fourgram::store::{Store, StoreError};

#[derive(Parser)]
#[command(name = "4gram", version = "1.0.0", about = "Persistent n-gram index for fast substring filtering")]
struct Cli {
    /// Index root (default: /4gram if writable, else $HOME/.cache/4gram)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a file (or stdin) and write its raw bitmap to stdout
    Bitmap {
        file: Option<PathBuf>,
    },
    /// Pack the loose records of every bucket into per-bucket packfiles
    Pack,
    /// Filter candidate files: print the ones that may contain a pattern
    Filter {
        /// Literal pattern; repeatable. Any pattern may match a file
        #[arg(short = 'e', long = "expr", required = true, num_args = 1..)]
        expr: Vec<String>,
        /// Require every pattern instead of any
        #[arg(long)]
        all: bool,
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },
    /// Print per-bucket store statistics as JSON
    Stats,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("4gram: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        // ── Bitmap ───────────────────────────────────────────────────────────
        Commands::Bitmap { file } => {
            let mut bitmap = Bitmap::new();
            let scanned = match &file {
                Some(path) => bitmap.apply_stream(File::open(path)?),
                None => {
                    if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
                        eprintln!("Usage:\n 4gram bitmap <logfile>\n echo <string> | 4gram bitmap");
                        return Ok(ExitCode::FAILURE);
                    }
                    bitmap.apply_stream(io::stdin().lock())
                }
            };
            match scanned {
                Ok(()) => {}
                Err(ScanError::TruncatedGzip) => {
                    eprintln!("gzip stream truncated");
                    return Ok(ExitCode::FAILURE);
                }
                Err(ScanError::Io(e)) => return Err(e.into()),
            }
            io::stdout().write_all(bitmap.as_bytes())?;
            Ok(ExitCode::SUCCESS)
        }

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack => {
            let store = open_store(&cli.root)?;
            let report = pack_store(&store)?;
            println!(
                "Packed {} record(s) across {} bucket(s) ({} busy)",
                report.files, report.buckets, report.busy
            );
            Ok(ExitCode::SUCCESS)
        }

        // ── Filter ───────────────────────────────────────────────────────────
        Commands::Filter { expr, all, files } => {
            let store = open_store(&cli.root)?;
            let terms: Vec<&[u8]> = expr.iter().map(|s| s.as_bytes()).collect();
            let filter = if all {
                NgramFilter::all_of(&terms)
            } else {
                NgramFilter::any_of(&terms)
            };

            let mut indexed = 0usize;
            for path in &files {
                match filter_file(&store, path, &filter) {
                    Ok(outcome) => {
                        if outcome.bitmap_created() {
                            indexed += 1;
                        }
                        if outcome.is_match() {
                            println!("{}", path.display());
                        }
                    }
                    // An unfinished gzip stream cannot rule the file out;
                    // keep it as a candidate and say why.
                    Err(StoreError::Truncated) => {
                        eprintln!("4gram: {}: gzip stream truncated", path.display());
                        println!("{}", path.display());
                    }
                    Err(StoreError::NotFound(_)) => {
                        eprintln!("4gram: {}: no such file", path.display());
                    }
                    Err(e) => {
                        eprintln!("4gram: {}: {e}", path.display());
                    }
                }
            }
            if indexed > 0 {
                eprintln!("4gram: indexed {indexed} new file(s)");
            }
            Ok(ExitCode::SUCCESS)
        }

        // ── Stats ────────────────────────────────────────────────────────────
        Commands::Stats => {
            let store = open_store(&cli.root)?;
            let stats = collect_stats(&store)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(root: &Option<PathBuf>) -> Result<Store, StoreError> {
    match root {
        Some(path) => Store::at(path.clone()).map_err(StoreError::Io),
        None => Store::open_default(),
    }
}

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct BucketStats {
    bucket: String,
    loose_records: usize,
    packfile_bytes: u64,
    indexed_records: usize,
}

#[derive(Serialize)]
struct StoreStats {
    root: String,
    buckets: Vec<BucketStats>,
}

fn collect_stats(store: &Store) -> io::Result<StoreStats> {
    let mut buckets = Vec::new();
    for entry in fs::read_dir(store.root())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        let dir = entry.path();

        let mut loose_records = 0usize;
        for child in fs::read_dir(&dir)? {
            let child_name = child?.file_name().to_string_lossy().into_owned();
            if child_name.starts_with('.')
                || child_name == pack::PACKFILE_NAME
                || child_name == pack::PACK_INDEX_NAME
            {
                continue;
            }
            loose_records += 1;
        }

        let packfile_bytes = fs::metadata(dir.join(pack::PACKFILE_NAME))
            .map(|m| m.len())
            .unwrap_or(0);
        let indexed_records = fs::metadata(dir.join(pack::PACK_INDEX_NAME))
            .map(|m| m.len() as usize / pack::INDEX_ENTRY_SIZE)
            .unwrap_or(0);

        buckets.push(BucketStats { bucket: name, loose_records, packfile_bytes, indexed_records });
    }
    buckets.sort_by(|a, b| a.bucket.cmp(&b.bucket));
    Ok(StoreStats { root: store.root().display().to_string(), buckets })
}
