use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "plakar",
    version,
    about = "Deduplicating, content-addressed snapshot backups",
    after_help = "\
The working repository defaults to $HOME/.plakar/store; override it with
--at or $PLAKAR_REPOSITORY. Remote repositories use URI schemes
(fs://, plakar://).

Environment variables:
  PLAKAR_PASSPHRASE   Repository passphrase (skips the interactive prompt)
  PLAKAR_REPOSITORY   Repository location (overridden by --at)"
)]
pub(crate) struct Cli {
    /// Repository to operate on
    #[arg(long = "at", global = true)]
    pub at: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Create a new repository
    Create {
        /// Hashing algorithm (sha256, blake2b)
        #[arg(long, default_value = "sha256")]
        hashing: String,

        /// Compression algorithm (lz4, zstd, none)
        #[arg(long, default_value = "lz4")]
        compression: String,

        /// Create the repository without encryption
        #[arg(long)]
        plaintext: bool,
    },

    /// Back up a directory into a new snapshot
    Backup {
        /// Directory to back up (defaults to the current directory)
        directory: Option<String>,

        /// Tag the snapshot (repeatable)
        #[arg(short = 't', long = "tag")]
        tags: Vec<String>,

        /// Exclude pattern, gitignore syntax (repeatable)
        #[arg(short = 'e', long = "exclude")]
        excludes: Vec<String>,

        /// File containing one exclude pattern per line
        #[arg(long = "excludes")]
        excludes_file: Option<String>,

        /// Worker pool size (0 = 8 x CPUs + 1)
        #[arg(short = 'c', long, default_value_t = 0)]
        concurrency: usize,
    },

    /// Restore a snapshot (or one of its subtrees)
    Restore {
        /// snapshot[:path]
        target: String,

        /// Destination directory
        #[arg(long = "to", default_value = ".")]
        to: String,

        /// Strip the subtree prefix from restored paths
        #[arg(long)]
        rebase: bool,
    },

    /// List snapshots, or the contents of one
    Ls {
        /// snapshot[:path]; lists snapshots when omitted
        target: Option<String>,
    },

    /// Print a file's contents from a snapshot
    Cat {
        /// snapshot:path
        target: String,
    },

    /// Show repository or snapshot information
    Info {
        /// Snapshot id prefix; shows the repository when omitted
        snapshot: Option<String>,
    },

    /// Verify snapshot integrity
    Check {
        /// Skip per-blob data verification
        #[arg(long)]
        fast: bool,

        /// Snapshot id prefix; checks everything when omitted
        snapshot: Option<String>,
    },

    /// Remove snapshots
    Rm {
        /// Snapshot id prefixes
        snapshots: Vec<String>,
    },

    /// Synchronize snapshots with another repository
    Sync {
        /// Optional snapshot id prefix, then: {to|from|with} REPOSITORY
        args: Vec<String>,
    },

    /// Print the version
    Version,
}
