mod cli;
mod cmd;
mod repo;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    plakar_core::storage::register_default_backends();
    plakar_core::snapshot::importer::register_default_importers();
    plakar_core::snapshot::exporter::register_default_exporters();

    let location = repo::resolve_location(cli.at.as_deref());
    let result = match cli.command {
        Commands::Create {
            hashing,
            compression,
            plaintext,
        } => cmd::create::run(&location, &hashing, &compression, plaintext),
        Commands::Backup {
            directory,
            tags,
            excludes,
            excludes_file,
            concurrency,
        } => cmd::backup::run(
            &location,
            directory.as_deref(),
            tags,
            excludes,
            excludes_file.as_deref(),
            concurrency,
        ),
        Commands::Restore { target, to, rebase } => {
            cmd::restore::run(&location, &target, &to, rebase)
        }
        Commands::Ls { target } => cmd::ls::run(&location, target.as_deref()),
        Commands::Cat { target } => cmd::cat::run(&location, &target),
        Commands::Info { snapshot } => cmd::info::run(&location, snapshot.as_deref()),
        Commands::Check { fast, snapshot } => {
            cmd::check::run(&location, fast, snapshot.as_deref())
        }
        Commands::Rm { snapshots } => cmd::rm::run(&location, &snapshots),
        Commands::Sync { args } => cmd::sync::run(&location, &args),
        Commands::Version => {
            println!("plakar {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("plakar: {e}");
            ExitCode::FAILURE
        }
    }
}
