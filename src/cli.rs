use clap::{Args, Parser, Subcommand};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};
use crate::zip::{AlignmentRules, ZipFileOptions};

#[derive(Parser, Debug)]
#[command(name = "rezip")]
#[command(version)]
#[command(about = "Edit ZIP archives in place, with alignment and free-space reuse", long_about = None)]
#[command(after_help = "Examples:\n  \
  rezip add app.apk lib/ -0 '*.so' -a '*.so=4096'   add a tree, .so files stored and page-aligned\n  \
  rezip delete app.apk classes2.dex                remove an entry without rewriting the archive\n  \
  rezip merge out.zip https://example.com/a.zip    copy entries from a remote archive")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub archive: ArchiveArgs,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', global = true, action = clap::ArgAction::Count)]
    pub quiet: u8,
}

/// Options applied to the archive being edited
#[derive(Args, Debug, Default)]
pub struct ArchiveArgs {
    /// Align entry data: PATTERN=BYTES for matching names, or BYTES for all (first match wins)
    #[arg(short = 'a', long = "align", value_name = "RULE", global = true)]
    pub align: Vec<String>,

    /// Lay entries out in name order on every write
    #[arg(long, global = true)]
    pub auto_sort: bool,

    /// Leave this many bytes between the last entry and the central directory
    #[arg(long, value_name = "BYTES", global = true)]
    pub extra_offset: Option<u64>,

    /// Stamp new entries with 1980-01-01 00:00 instead of the current time
    #[arg(long, global = true)]
    pub no_timestamps: bool,

    /// Absorb gaps between entries into padding extra fields
    #[arg(long, global = true)]
    pub cover_empty_space: bool,

    /// Compress on the calling thread
    #[arg(long, global = true)]
    pub no_background: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List entries
    List {
        /// ZIP file path or HTTP URL
        #[arg(value_name = "FILE")]
        file: String,

        /// List verbosely
        #[arg(short = 'v')]
        verbose: bool,
    },

    /// Extract entries
    Extract {
        /// ZIP file path or HTTP URL
        #[arg(value_name = "FILE")]
        file: String,

        /// Files to extract (default: all)
        #[arg(value_name = "FILES")]
        files: Vec<String>,

        /// Extract files into exdir
        #[arg(short = 'd', value_name = "DIR")]
        extract_dir: Option<String>,

        /// Exclude files that follow
        #[arg(short = 'x', value_name = "FILE", num_args = 1..)]
        exclude: Vec<String>,

        /// Never overwrite existing files
        #[arg(short = 'n')]
        never_overwrite: bool,

        /// Overwrite files WITHOUT prompting
        #[arg(short = 'o')]
        overwrite: bool,

        /// Junk paths (do not make directories)
        #[arg(short = 'j')]
        junk_paths: bool,

        /// Extract files to pipe, no messages
        #[arg(short = 'p')]
        pipe: bool,
    },

    /// Add files or directory trees, replacing entries with the same name
    Add {
        /// Archive to edit, created if missing
        #[arg(value_name = "ARCHIVE")]
        archive: String,

        /// Files or directories to add
        #[arg(value_name = "PATHS", required = true)]
        paths: Vec<String>,

        /// Store files matching PATTERN without compression
        #[arg(short = '0', long = "store", value_name = "PATTERN")]
        store: Vec<String>,
    },

    /// Delete entries
    Delete {
        #[arg(value_name = "ARCHIVE")]
        archive: String,

        #[arg(value_name = "NAMES", required = true)]
        names: Vec<String>,
    },

    /// Copy the entries of another archive into this one
    Merge {
        #[arg(value_name = "ARCHIVE")]
        archive: String,

        /// Source ZIP file path or HTTP URL
        #[arg(value_name = "SOURCE")]
        source: String,

        /// Skip source entries matching PATTERN
        #[arg(short = 'x', value_name = "PATTERN")]
        exclude: Vec<String>,
    },

    /// Move entries whose data is not aligned per the -a rules
    Align {
        #[arg(value_name = "ARCHIVE")]
        archive: String,
    },

    /// Rewrite entries in name order
    Sort {
        #[arg(value_name = "ARCHIVE")]
        archive: String,
    },
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || matches!(self.command, Command::Extract { pipe: true, .. })
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }
}

impl ArchiveArgs {
    /// Archive options described by the flags
    pub fn zip_options(&self) -> Result<ZipFileOptions> {
        let mut alignment = AlignmentRules::new();
        for rule in &self.align {
            alignment = match rule.rsplit_once('=') {
                Some((pattern, bytes)) => alignment.with_pattern(pattern, parse_alignment(bytes)?)?,
                None => alignment.with_all(parse_alignment(rule)?),
            };
        }

        Ok(ZipFileOptions {
            alignment,
            auto_sort_files: self.auto_sort,
            extra_directory_offset: self.extra_offset,
            no_timestamps: self.no_timestamps,
            cover_empty_space_using_extra_field: self.cover_empty_space,
            background_compression: !self.no_background,
            ..Default::default()
        })
    }
}

pub fn is_http_url(file: &str) -> bool {
    file.starts_with("http://") || file.starts_with("https://")
}

/// Compile glob patterns into one matcher
pub fn glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn parse_alignment(bytes: &str) -> Result<u64> {
    match bytes.trim().parse::<u64>() {
        Ok(alignment) if alignment > 0 => Ok(alignment),
        _ => Err(Error::InvalidState(format!(
            "invalid alignment '{}', expected a positive number of bytes",
            bytes
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommand_with_global_flags() {
        let cli = Cli::parse_from([
            "rezip", "add", "out.zip", "lib", "-0", "*.so", "-a", "*.so=4096", "-a", "4",
            "--no-timestamps",
        ]);
        let Command::Add { archive, paths, store } = &cli.command else {
            panic!("expected add, got {:?}", cli.command);
        };
        assert_eq!(archive, "out.zip");
        assert_eq!(paths, &["lib"]);
        assert_eq!(store, &["*.so"]);

        let options = cli.archive.zip_options().unwrap();
        assert!(options.no_timestamps);
        assert!(options.background_compression);
        assert_eq!(options.alignment.alignment("lib/libfoo.so"), 4096);
        assert_eq!(options.alignment.alignment("classes.dex"), 4);
    }

    #[test]
    fn rejects_bad_alignment() {
        let args = ArchiveArgs {
            align: vec!["*.so=0".to_string()],
            ..Default::default()
        };
        assert!(args.zip_options().is_err());

        let args = ArchiveArgs {
            align: vec!["page".to_string()],
            ..Default::default()
        };
        assert!(args.zip_options().is_err());
    }

    #[test]
    fn pipe_extraction_is_quiet() {
        let cli = Cli::parse_from(["rezip", "extract", "-p", "a.zip"]);
        assert!(cli.is_quiet());
        assert!(!cli.is_very_quiet());

        let cli = Cli::parse_from(["rezip", "list", "a.zip"]);
        assert!(!cli.is_quiet());
    }

    #[test]
    fn recognizes_urls() {
        assert!(is_http_url("https://example.com/a.zip"));
        assert!(is_http_url("http://example.com/a.zip"));
        assert!(!is_http_url("a.zip"));
    }

    #[test]
    fn glob_set_matches_any_pattern() {
        let set = glob_set(&["*.so".to_string(), "assets/*".to_string()]).unwrap();
        assert!(set.is_match("lib/arm64/libfoo.so"));
        assert!(set.is_match("assets/a.png"));
        assert!(!set.is_match("classes.dex"));
    }
}
