use chrono::Utc;
use flate2::read::GzDecoder;
use fzf_wrapped::Fzf;
use reqwest::Client;
use std::io::Read;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::auth::{BitrateChoice, Identity, Resolver};
use crate::cache::EventCache;
use crate::config::Settings;
use crate::downloader::{Downloader, ProcessRunner};
use crate::error::Result;
use crate::feed::{self, FeedAction, FeedSource, HttpFeed, NetworkTable};
use crate::filter;

// characters that break paths or need quoting in a shell
const UNSAFE_CHARS: &[char] = &[
    ':', '/', '\\', '<', '>', '|', '*', '?', '"', '\'', '&', ';', '$', '`', '(', ')', '!',
];

/// Filesystem safe name: unsafe characters and whitespace become single
/// underscores, never at either end.
pub fn sanitize_filename(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '_' || c.is_whitespace() || c.is_control() || UNSAFE_CHARS.contains(&c) {
            if !name.is_empty() && !name.ends_with('_') {
                name.push('_');
            }
        } else {
            name.push(c);
        }
    }
    while name.ends_with('_') {
        name.pop();
    }
    if name.is_empty() {
        return "event".to_string();
    }
    name
}

pub async fn ensure_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).await?;
    }
    Ok(())
}

/// Some feed endpoints answer gzip without saying so. Check for the magic header (0x1F 0x8B).
pub fn decode_body(content: &[u8]) -> Result<String> {
    if content.len() >= 2 && content[0] == 0x1F && content[1] == 0x8B {
        let mut decoder = GzDecoder::new(content);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed)?;
        return Ok(decompressed);
    }
    Ok(String::from_utf8_lossy(content).into_owned())
}

pub async fn fetch_text(client: &Client, url: &str) -> Result<String> {
    debug!("GET {}", url);
    let response = client.get(url).send().await?.error_for_status()?;
    let content = response.bytes().await?;
    decode_body(&content)
}

pub trait TextFetcher {
    async fn get_text(&self, url: &str) -> Result<String>;
}

impl TextFetcher for Client {
    async fn get_text(&self, url: &str) -> Result<String> {
        fetch_text(self, url).await
    }
}

/// Interactive single choice, `Ok(None)` when the user backs out.
pub trait Chooser {
    fn choose(&mut self, prompt: &str, options: &[String]) -> Result<Option<usize>>;
}

pub struct FzfChooser;

impl Chooser for FzfChooser {
    fn choose(&mut self, prompt: &str, options: &[String]) -> Result<Option<usize>> {
        if options.is_empty() {
            return Ok(None);
        }
        // NOTE: fzf only gives back the line it showed, so the number in front is how
        // we find the entry again (two games can have the exact same title)
        let readable: Vec<String> = options
            .iter()
            .enumerate()
            .map(|(i, option)| format!("{}: {}", i + 1, option))
            .collect();
        info!("{}: pick one of {} entries", prompt, readable.len());

        let mut fzf = Fzf::default();
        fzf.run()?;
        fzf.add_items(readable)?;

        let selected = fzf.output().and_then(|selection| {
            selection
                .split(':')
                .next()
                .and_then(|s| s.trim().parse::<usize>().ok())
        });
        Ok(selected.filter(|n| *n >= 1 && *n <= options.len()).map(|n| n - 1))
    }
}

pub struct Selection {
    pub live: bool,
    pub channels: Vec<String>,
    pub days: i64,
    pub refresh_minutes: i64,
    pub pick_sport: bool,
    pub search: Vec<String>,
    pub bitrate: BitrateChoice,
}

/// Lists events, lets the user pick one, resolves and downloads it.
/// Returns `Ok(false)` when nothing was downloaded because a menu was cancelled
/// or there was nothing to pick from.
pub async fn search_and_download(
    settings: &Settings,
    selection: &Selection,
    chooser: &mut dyn Chooser,
) -> Result<bool> {
    let client = settings.http_client()?;
    let networks = NetworkTable::new(settings.networks.clone());
    let patterns = filter::compile_patterns(&selection.search)?;
    let feed = HttpFeed::new(client.clone(), &settings.feed_url);
    let now = Utc::now();

    let mut events = if selection.live {
        let document = feed.fetch(FeedAction::Live, &selection.channels, None).await?;
        feed::parse_feed(&document, &networks)?
    } else {
        let cache = EventCache::new(&settings.cache_dir, feed, networks.clone());
        let mut all = Vec::new();
        for channel in &selection.channels {
            all.extend(
                cache
                    .get_events(channel, selection.days, selection.refresh_minutes, now)
                    .await?,
            );
        }
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        filter::within_days(all, now, selection.days)
    };

    events = filter::search(events, &patterns);
    if selection.pick_sport {
        match filter::choose_sport(events, chooser)? {
            Some(picked) => events = picked,
            None => return Ok(false),
        }
    }
    if events.is_empty() {
        warn!("no events match the given filters");
        return Ok(false);
    }
    info!("{} events to choose from", events.len());

    let Some(event) = filter::choose_event(events, chooser)? else {
        return Ok(false);
    };
    info!("selected {} ({})", event.name, event.id);

    let identity = Identity::load(&settings.identity_file).await?;
    let resolver = Resolver::new(&client, &settings.auth_url, &settings.player_config_url, &identity);
    let Some(descriptor) = resolver.resolve(&event, &selection.bitrate, chooser).await? else {
        return Ok(false);
    };

    println!("Downloading {}...", event.name);
    let downloader = Downloader::new(ProcessRunner, settings.download_settings());
    let path = downloader
        .download(&descriptor, &event.filename, &settings.download_dir)
        .await?;
    println!("Saved to {}", path.display());
    return Ok(true);
}
