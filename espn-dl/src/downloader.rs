use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::auth::StreamDescriptor;
use crate::error::{Error, Result};
use crate::helpers;

pub trait CommandRunner {
    /// Runs `program` to completion, `true` on a zero exit status.
    async fn run(&self, program: &str, args: &[String]) -> Result<bool>;
}

pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<bool> {
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| Error::Download(format!("can't start {}: {}", program, e)))?;
        if !status.success() {
            warn!("{} exited with {:?}", program, status.code());
        }
        return Ok(status.success());
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub ffmpeg: String,
    pub rtmpdump: String,
    pub attempts: u32,
    pub retry_delay: Duration,
}

pub fn output_path(descriptor: &StreamDescriptor, filename: &str, dir: &Path) -> PathBuf {
    let extension = match descriptor {
        StreamDescriptor::Hls { .. } => "ts",
        StreamDescriptor::Rtmp { .. } => "mp4",
    };
    dir.join(format!("{}.{}", filename, extension))
}

pub fn ffmpeg_args(playlist_url: &str, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        playlist_url.into(),
        "-c".into(),
        "copy".into(),
        "-f".into(),
        "mpegts".into(),
        output.to_string_lossy().into_owned(),
    ]
}

pub fn rtmpdump_args(base_url: &str, play_path: &str, auth: Option<&str>, output: &Path) -> Vec<String> {
    let play_path = match auth {
        Some(auth) => format!("{}?{}", play_path, auth),
        None => play_path.to_string(),
    };
    vec![
        "-r".into(),
        base_url.into(),
        "-y".into(),
        play_path,
        "-o".into(),
        output.to_string_lossy().into_owned(),
        // resume, rtmpdump drops out a lot and we don't want to start over every time
        "-e".into(),
    ]
}

pub struct Downloader<R> {
    runner: R,
    settings: DownloadSettings,
}

impl<R: CommandRunner> Downloader<R> {
    pub fn new(runner: R, settings: DownloadSettings) -> Self {
        Downloader { runner, settings }
    }

    pub async fn download(&self, descriptor: &StreamDescriptor, filename: &str, dir: &Path) -> Result<PathBuf> {
        helpers::ensure_directory(dir).await?;
        let output = output_path(descriptor, filename, dir);
        info!("downloading to {:?}", output);

        match descriptor {
            StreamDescriptor::Hls { playlist_url } => {
                let args = ffmpeg_args(playlist_url, &output);
                if !self.runner.run(&self.settings.ffmpeg, &args).await? {
                    return Err(Error::Download(format!("{} failed", self.settings.ffmpeg)));
                }
            }
            StreamDescriptor::Rtmp {
                base_url,
                play_path,
                auth,
                bitrate,
            } => {
                info!("fetching {}k rtmp stream", bitrate / 1000);
                let args = rtmpdump_args(base_url, play_path, auth.as_deref(), &output);
                self.run_with_retry(&self.settings.rtmpdump, &args).await?;
            }
        }
        Ok(output)
    }

    async fn run_with_retry(&self, program: &str, args: &[String]) -> Result<()> {
        let attempts = self.settings.attempts.max(1);
        for attempt in 1..=attempts {
            if self.runner.run(program, args).await? {
                return Ok(());
            }
            if attempt < attempts {
                warn!(
                    "{} attempt {}/{} failed, retrying in {:?}",
                    program, attempt, attempts, self.settings.retry_delay
                );
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }
        Err(Error::Download(format!("{} failed {} times", program, attempts)))
    }
}
