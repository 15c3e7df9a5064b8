mod auth;
mod cache;
mod cli;
mod config;
mod downloader;
mod error;
mod feed;
mod filter;
mod helpers;
mod xml;

use clap::Parser;
use std::process;
use tracing::{Level, error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Mode};
use crate::config::Settings;
use crate::error::Result;
use crate::helpers::{FzfChooser, Selection};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(args).await {
        Ok(true) => {}
        Ok(false) => info!("nothing downloaded"),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(dir) = args.cache_dir {
        settings.cache_dir = dir;
    }
    if let Some(dir) = args.download_dir {
        settings.download_dir = dir;
    }

    let selection = Selection {
        live: args.mode == Mode::Live,
        channels: args.channels,
        days: args.days,
        refresh_minutes: args.refresh,
        pick_sport: args.sports,
        search: args.search,
        bitrate: args.bitrate,
    };
    helpers::search_and_download(&settings, &selection, &mut FzfChooser).await
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
