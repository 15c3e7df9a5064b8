use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::downloader::DownloadSettings;
use crate::error::{Error, Result};

const APP_DIR: &str = "espn-dl";
const CONFIG_FILE: &str = "config.toml";
const IDENTITY_FILE: &str = "userdata.xml";

const FEED_URL: &str = "http://espn.go.com/watchespn/feeds/startup";
const PLAYER_CONFIG_URL: &str = "http://espn.go.com/watchespn/player/config";
const AUTH_URL: &str =
    "https://espn-ws.bamnetworks.com/pubajaxws/bamrest/MediaService2_0/op-findUserVerifiedEvent/v-2.1";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// What the config file may set, everything optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    identity_file: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    download_dir: Option<PathBuf>,
    feed_url: Option<String>,
    player_config_url: Option<String>,
    auth_url: Option<String>,
    request_timeout_secs: Option<u64>,
    download_attempts: Option<u32>,
    retry_delay_secs: Option<u64>,
    ffmpeg: Option<String>,
    rtmpdump: Option<String>,
    user_agent: Option<String>,
    /// Extra or replacement network codes, e.g. `n388 = "espn3"`.
    networks: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub identity_file: PathBuf,
    pub cache_dir: PathBuf,
    pub download_dir: PathBuf,
    pub feed_url: String,
    pub player_config_url: String,
    pub auth_url: String,
    pub request_timeout: Duration,
    pub download_attempts: u32,
    pub retry_delay: Duration,
    pub ffmpeg: String,
    pub rtmpdump: String,
    pub user_agent: String,
    pub networks: HashMap<String, String>,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

impl Settings {
    /// Reads `path`, or the default config file when there is one. An explicit
    /// path that can't be read is an error, a missing default file is not.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let (path, required) = match path {
            Some(path) => (Some(path.to_path_buf()), true),
            None => (default_config_path(), false),
        };
        match path {
            Some(path) if required || path.exists() => {
                debug!("loading config from {:?}", path);
                let text = fs::read_to_string(&path)
                    .map_err(|e| Error::Config(format!("can't read {:?}: {}", path, e)))?;
                Settings::from_toml(&text)
            }
            _ => Settings::from_toml(""),
        }
    }

    pub fn from_toml(text: &str) -> Result<Settings> {
        let file: FileConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {}", e)))?;

        let cache_dir = match file.cache_dir {
            Some(dir) => dir,
            None => dirs::cache_dir()
                .ok_or_else(|| Error::Config("failed to determine cache directory".into()))?
                .join(APP_DIR),
        };
        let identity_file = match file.identity_file {
            Some(path) => path,
            None => dirs::config_dir()
                .ok_or_else(|| Error::Config("failed to determine config directory".into()))?
                .join(APP_DIR)
                .join(IDENTITY_FILE),
        };

        Ok(Settings {
            identity_file,
            cache_dir,
            download_dir: file.download_dir.unwrap_or_else(|| PathBuf::from(".")),
            feed_url: file.feed_url.unwrap_or_else(|| FEED_URL.to_string()),
            player_config_url: file.player_config_url.unwrap_or_else(|| PLAYER_CONFIG_URL.to_string()),
            auth_url: file.auth_url.unwrap_or_else(|| AUTH_URL.to_string()),
            request_timeout: Duration::from_secs(file.request_timeout_secs.unwrap_or(30)),
            download_attempts: file.download_attempts.unwrap_or(100),
            retry_delay: Duration::from_secs(file.retry_delay_secs.unwrap_or(2)),
            ffmpeg: file.ffmpeg.unwrap_or_else(|| "ffmpeg".to_string()),
            rtmpdump: file.rtmpdump.unwrap_or_else(|| "rtmpdump".to_string()),
            user_agent: file.user_agent.unwrap_or_else(|| USER_AGENT.to_string()),
            networks: file.networks,
        })
    }

    pub fn http_client(&self) -> Result<Client> {
        Ok(Client::builder()
            .timeout(self.request_timeout)
            .user_agent(self.user_agent.as_str())
            .build()?)
    }

    pub fn download_settings(&self) -> DownloadSettings {
        DownloadSettings {
            ffmpeg: self.ffmpeg.clone(),
            rtmpdump: self.rtmpdump.clone(),
            attempts: self.download_attempts,
            retry_delay: self.retry_delay,
        }
    }
}
