use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::auth::BitrateChoice;

// a century of replays, a year between refreshes
const MAX_DAYS: i64 = 36_500;
const MAX_REFRESH_MINUTES: i64 = 525_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Finished events, served from the local cache when it is fresh
    Replay,
    /// Events airing now
    Live,
}

#[derive(Debug, Parser)]
#[command(name = "espn-dl", version, about = "Browse and download WatchESPN replays and live events")]
pub struct Args {
    #[arg(short, long, value_enum, default_value_t = Mode::Replay)]
    pub mode: Mode,

    /// How many days back to list replays
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(i64).range(1..=MAX_DAYS))]
    pub days: i64,

    /// max, min, prompt or a target such as 1200k
    #[arg(short, long, default_value = "max")]
    pub bitrate: BitrateChoice,

    /// Pick a sport before picking the event
    #[arg(long)]
    pub sports: bool,

    /// Case-insensitive regex matched against the whole feed entry, repeatable
    #[arg(short, long = "search")]
    pub search: Vec<String>,

    /// Channel to list, repeatable
    #[arg(short, long = "channel", default_value = "espn3")]
    pub channels: Vec<String>,

    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Refetch the feed when the cache is older than this many minutes
    #[arg(short, long, default_value_t = 60, value_parser = clap::value_parser!(i64).range(0..=MAX_REFRESH_MINUTES))]
    pub refresh: i64,

    /// Config file, defaults to <config dir>/espn-dl/config.toml
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,

    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}
