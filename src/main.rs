//! Main entry point for the rezip CLI application.
//!
//! Lists, extracts and edits ZIP archives. Editing subcommands change the
//! archive in place; sources for listing, extraction and merging may also
//! be HTTP URLs, read with Range requests.

use anyhow::{Context, Result};
use clap::Parser;
use globset::GlobSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use rezip::cli::{ArchiveArgs, Command, glob_set, is_http_url};
use rezip::{
    Cli, CompressionMethod, HttpRangeReader, LocalFile, StoredEntry, ZipExtractor, ZipFile, ZipFileOptions,
};

/// Application entry point.
///
/// Parses command-line arguments, sets up logging and dispatches to the
/// subcommand handler.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.quiet {
        0 => "warn",
        1 => "error",
        _ => "off",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Command::List { file, verbose } => {
            let (zip, remote) = open_source(file, &cli.archive).await?;
            list_files(&zip, *verbose);
            report_transfer(remote.as_deref(), &cli);
        }
        Command::Extract { file, .. } => {
            let (zip, remote) = open_source(file, &cli.archive).await?;
            extract_files(&zip, &cli).await?;
            report_transfer(remote.as_deref(), &cli);
        }
        Command::Add {
            archive,
            paths,
            store,
        } => {
            let stored = glob_set(store)?;
            let mut zip = open_archive(archive, &cli.archive).await?;
            for path in paths {
                zip.add_recursively(Path::new(path), |file| method_for(&stored, file))
                    .await
                    .with_context(|| format!("adding {}", path))?;
                if !cli.is_quiet() {
                    println!("  adding: {}", path);
                }
            }
            zip.close().await?;
        }
        Command::Delete { archive, names } => {
            let mut zip = open_archive(archive, &cli.archive).await?;
            for name in names {
                zip.delete(name)?;
                if !cli.is_quiet() {
                    println!("  deleting: {}", name);
                }
            }
            zip.close().await?;
        }
        Command::Merge {
            archive,
            source,
            exclude,
        } => {
            let excluded = glob_set(exclude)?;
            let (mut source_zip, remote) = open_source(source, &cli.archive).await?;
            let mut zip = open_archive(archive, &cli.archive).await?;
            zip.merge_from(&mut source_zip, |name| excluded.is_match(name))
                .await?;
            zip.close().await?;
            source_zip.close().await?;
            report_transfer(remote.as_deref(), &cli);
        }
        Command::Align { archive } => {
            let mut zip = open_archive(archive, &cli.archive).await?;
            let moved = zip.realign_all().await?;
            zip.close().await?;
            if !cli.is_quiet() {
                println!("{}", if moved { "realigned" } else { "already aligned" });
            }
        }
        Command::Sort { archive } => {
            let mut zip = open_archive(archive, &cli.archive).await?;
            zip.sort_zip_contents().await?;
            zip.close().await?;
        }
    }

    Ok(())
}

/// Open an archive for editing, creating it if it does not exist.
async fn open_archive(path: &str, args: &ArchiveArgs) -> Result<ZipFile> {
    let options = ZipFileOptions {
        read_only_if_source_read_only: false,
        ..args.zip_options()?
    };
    ZipFile::open(path, options)
        .await
        .with_context(|| format!("opening {}", path))
}

/// Open an archive for reading, from a local path or an HTTP URL.
///
/// For URLs the remote reader is returned too, for transfer statistics.
async fn open_source(
    file: &str,
    args: &ArchiveArgs,
) -> Result<(ZipFile, Option<Arc<HttpRangeReader>>)> {
    let options = args.zip_options()?;
    let (zip, remote) = if is_http_url(file) {
        let reader = Arc::new(HttpRangeReader::new(file.to_string()).await?);
        (
            ZipFile::open_reader(reader.clone(), options).await,
            Some(reader),
        )
    } else {
        let reader = Arc::new(
            LocalFile::open(Path::new(file)).with_context(|| format!("opening {}", file))?,
        );
        (ZipFile::open_reader(reader, options).await, None)
    };
    let zip = zip.with_context(|| format!("opening {}", file))?;
    Ok((zip, remote))
}

/// Display network transfer statistics for HTTP sources
fn report_transfer(remote: Option<&HttpRangeReader>, cli: &Cli) {
    if let Some(reader) = remote {
        if !cli.is_quiet() {
            eprintln!(
                "\nTotal bytes transferred: {}",
                format_size(reader.transferred_bytes())
            );
        }
    }
}

fn method_for(stored: &GlobSet, path: &Path) -> CompressionMethod {
    if stored.is_match(path) {
        CompressionMethod::Stored
    } else {
        CompressionMethod::Deflate
    }
}

/// List entries of the archive.
///
/// Supports two output formats:
/// - Simple format: just entry names, one per line
/// - Verbose format (`-v`): table with sizes, compression ratio, timestamps and data offsets
fn list_files(zip: &ZipFile, verbose: bool) {
    let entries = zip.entries();

    if verbose {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  {:>10}  Name",
            "Length", "Size", "Cmpr", "Date", "Time", "Offset"
        );
        println!("{}", "-".repeat(82));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in &entries {
        if !verbose {
            println!("{}", entry.name());
            continue;
        }

        let header = entry.header();
        let (year, month, day) = header.mod_date();
        let (hour, minute, _second) = header.mod_time();
        let offset = entry
            .data_offset()
            .map(|offset| offset.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {:>10}  {}",
            entry.uncompressed_size(),
            entry.compressed_size(),
            ratio(entry.compressed_size(), entry.uncompressed_size()),
            year,
            month,
            day,
            hour,
            minute,
            offset,
            entry.name()
        );

        if !entry.is_directory() {
            total_uncompressed += entry.uncompressed_size();
            total_compressed += entry.compressed_size();
            file_count += 1;
        }
    }

    if verbose {
        println!("{}", "-".repeat(82));
        println!(
            "{:>10}  {:>10}  {}  {:>33}  {} files",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            "",
            file_count
        );
        println!(
            "{} used of {}",
            format_size(zip.used_size()),
            format_size(zip.tracked_size())
        );
    }
}

fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

/// Extract the entries selected by the `extract` subcommand.
async fn extract_files(zip: &ZipFile, cli: &Cli) -> Result<()> {
    let Command::Extract { files, exclude, pipe, .. } = &cli.command else {
        return Ok(());
    };

    let requested = glob_set(files)?;
    let excluded = glob_set(exclude)?;
    let extractor = ZipExtractor::new(zip);

    // Directories are created as needed during extraction
    let selected: Vec<&StoredEntry> = extractor
        .list_files()
        .into_iter()
        .filter(|e| !e.is_directory())
        .filter(|e| {
            files.is_empty()
                || requested.is_match(e.name())
                || files.iter().any(|f| base_name(e.name()) == *f)
        })
        .filter(|e| !excluded.is_match(e.name()) && !exclude.iter().any(|x| e.name().contains(x)))
        .collect();

    let show_names = *pipe && selected.len() > 1;
    for entry in selected {
        extract_file(&extractor, entry, cli, show_names).await?;
    }

    Ok(())
}

/// Extract a single entry.
///
/// Handles various extraction options:
/// - Pipe mode (`-p`): Write to stdout instead of file
/// - Custom output directory (`-d`): Extract to specified directory
/// - Junk paths (`-j`): Ignore directory structure in archive
/// - Overwrite control (`-n`, `-o`): Handle existing files
async fn extract_file(
    extractor: &ZipExtractor<'_>,
    entry: &StoredEntry,
    cli: &Cli,
    show_filename: bool,
) -> Result<()> {
    let Command::Extract {
        extract_dir,
        never_overwrite,
        overwrite,
        junk_paths,
        pipe,
        ..
    } = &cli.command
    else {
        return Ok(());
    };

    if *pipe {
        if show_filename {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(format!("--- {} ---\n", entry.name()).as_bytes())
                .await?;
        }
        extractor.extract_to_stdout(entry).await?;
        return Ok(());
    }

    let file_name = if *junk_paths {
        base_name(entry.name()).to_string()
    } else {
        entry.name().to_string()
    };
    let output_path = match extract_dir {
        Some(dir) => PathBuf::from(dir).join(&file_name),
        None => PathBuf::from(&file_name),
    };

    if output_path.exists() {
        if *never_overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (file exists)", entry.name());
            }
            return Ok(());
        }

        if !*overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (use -o to overwrite)", entry.name());
            }
            return Ok(());
        }
    }

    if !cli.is_quiet() {
        println!("  extracting: {}", entry.name());
    }
    extractor
        .extract_to_file(entry, &output_path)
        .await
        .with_context(|| format!("extracting {}", entry.name()))?;

    Ok(())
}

fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Format a byte size into a human-readable string.
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
