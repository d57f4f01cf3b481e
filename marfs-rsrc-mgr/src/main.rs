mod cli;
mod sandbox;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;

use cli::Cli;
use marfs::rsrc::{self, RsrcMgrOpts};

fn main() -> ExitCode {
    let args = Cli::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(&args) {
        Ok(errors) if errors == 0 => ExitCode::SUCCESS,
        Ok(errors) => {
            log::error!("Resource manager pass finished with {errors} errors");
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("Resource manager pass failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Cli) -> Result<u64, Box<dyn std::error::Error>> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => std::env::var_os("MARFS_CONFIG_PATH")
            .map(PathBuf::from)
            .ok_or("no config given; pass -c or set MARFS_CONFIG_PATH")?,
    };
    let config = sandbox::load(&config_path)?;
    config.verify()?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let mut opts = RsrcMgrOpts {
        thresholds: args.thresholds(now),
        rebuild_loc: args.rebuild_loc.map(|loc| loc.0),
        delete: args.delete,
        ns_target: args.namespace.clone(),
        log_root: args.log_root.clone(),
        rank: args.rank,
        n_ranks: args.ranks,
        ..Default::default()
    };
    if let Some(iteration) = &args.iteration {
        opts.iteration = iteration.clone();
    }
    if let Some(threads) = args.threads {
        opts.n_prod = threads.producers;
        opts.n_cons = threads.consumers;
    }

    let summary = rsrc::run(&config, &opts)?;
    for ns in &summary.namespaces {
        println!("{ns}");
    }
    Ok(summary.errors())
}
