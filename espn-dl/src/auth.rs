//! Turns a chosen event into something a stream fetcher can play.
//!
//! Two requests are made per event: the signed auth request, which answers with
//! a media item url, then that url itself re-signed with a fresh cache buster.
//! HLS answers with a playlist that goes to ffmpeg untouched. HDS answers with a
//! SMIL manifest listing one rtmp variant per bitrate.

use rand::Rng;
use rand::distr::{Alphanumeric, SampleString};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::feed::{Event, StreamSource};
use crate::helpers::{Chooser, TextFetcher};
use crate::xml::Element;

pub const BITRATE_LADDER: [u64; 4] = [400_000, 800_000, 1_200_000, 2_200_000];

const MEDIA_URL_PATH: &str = "user-verified-event/user-verified-content/user-verified-media-item/url";

// key order is checked by the provider, keep these in sync with its player
pub const HDS_SCHEMA: &[&str] = &[
    "playbackScenario",
    "channel",
    "partnerContentId",
    "eventId",
    "contentId",
    "rand",
    "cdnName",
    "identityPointId",
    "playerId",
];

pub const HLS_SCHEMA: &[&str] = &[
    "playbackScenario",
    "channel",
    "simulcastAiringId",
    "partnerContentId",
    "eventId",
    "contentId",
    "token",
    "tokenType",
    "rand",
    "cdnName",
    "identityPointId",
    "playerId",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitrateChoice {
    Max,
    Min,
    Prompt,
    Target(u64),
}

impl FromStr for BitrateChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "max" => Ok(BitrateChoice::Max),
            "min" => Ok(BitrateChoice::Min),
            "prompt" => Ok(BitrateChoice::Prompt),
            _ => {
                let (digits, scale) = match s.strip_suffix('k') {
                    Some(digits) => (digits, 1000),
                    None => (s.as_str(), 1),
                };
                let n = digits
                    .parse::<u64>()
                    .map_err(|_| format!("expected max, min, prompt or a bitrate like 1200k, got '{}'", s))?;
                let bitrate = n
                    .checked_mul(scale)
                    .ok_or_else(|| format!("bitrate '{}' is too large", s))?;
                Ok(BitrateChoice::Target(bitrate))
            }
        }
    }
}

/// Index into `ladder` of the chosen bitrate, `None` if the prompt was cancelled.
pub fn select_bitrate(ladder: &[u64], choice: &BitrateChoice, chooser: &mut dyn Chooser) -> Result<Option<usize>> {
    let indexed = ladder.iter().enumerate();
    let index = match choice {
        BitrateChoice::Max => indexed.max_by_key(|(_, b)| **b).map(|(i, _)| i),
        BitrateChoice::Min => indexed.min_by_key(|(_, b)| **b).map(|(i, _)| i),
        // min_by_key keeps the first of equal distances
        BitrateChoice::Target(target) => indexed.min_by_key(|(_, b)| b.abs_diff(*target)).map(|(i, _)| i),
        BitrateChoice::Prompt => {
            let options: Vec<String> = ladder.iter().map(|b| format!("{}k", b / 1000)).collect();
            chooser.choose("Bitrate", &options)?.filter(|i| *i < ladder.len())
        }
    };
    Ok(index)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub affiliate: String,
    pub swid: String,
}

impl Identity {
    pub fn parse(document: &str) -> Result<Identity> {
        let root = Element::parse(document).map_err(|e| Error::Config(format!("bad identity file: {}", e)))?;
        let affiliate = root
            .path("affiliate/name")
            .map(|e| e.text())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Config("identity file has no affiliate/name".into()))?;
        let swid = root
            .child("personalization")
            .and_then(|e| e.attr("swid"))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("identity file has no personalization swid".into()))?;
        Ok(Identity {
            affiliate,
            swid: swid.to_string(),
        })
    }

    pub async fn load(path: &Path) -> Result<Identity> {
        let document = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("can't read identity file {:?}: {}", path, e)))?;
        Identity::parse(&document)
    }

    pub fn identity_point_id(&self) -> String {
        format!("{}:{}", self.affiliate, self.swid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub player_id: String,
    pub cdn_name: String,
    pub channel: String,
}

impl NetworkInfo {
    /// Looks `channel` up by name or id in the player config document.
    pub fn from_config(document: &str, channel: &str) -> Result<NetworkInfo> {
        let root = Element::parse(document).map_err(|e| Error::FeedParse(format!("player config: {}", e)))?;
        let network = root
            .descendants()
            .into_iter()
            .find(|e| e.name == "network" && (e.attr("name") == Some(channel) || e.attr("id") == Some(channel)))
            .ok_or_else(|| Error::UnsupportedStream(format!("channel '{}' is not in the player config", channel)))?;
        let required = |key: &str| {
            network
                .attr(key)
                .map(str::to_string)
                .ok_or_else(|| Error::FeedParse(format!("player config network '{}' has no {}", channel, key)))
        };
        Ok(NetworkInfo {
            player_id: required("playerId")?,
            cdn_name: required("defaultCdn")?,
            channel: network.attr("name").unwrap_or(channel).to_string(),
        })
    }
}

/// `key=value` pairs in schema order. Values go out as-is, the provider wants them unescaped.
pub fn ordered_query(schema: &[&str], values: &HashMap<&str, String>) -> Result<String> {
    let pairs = schema
        .iter()
        .map(|key| {
            values
                .get(key)
                .map(|value| format!("{}={}", key, value))
                .ok_or_else(|| Error::Authorization(format!("auth parameter {} is missing", key)))
        })
        .collect::<Result<Vec<String>>>()?;
    Ok(pairs.join("&"))
}

fn cache_buster<R: Rng + ?Sized>(source: &StreamSource, rng: &mut R) -> String {
    match source {
        StreamSource::Hls => rng.random_range(100_000..1_000_000u32).to_string(),
        _ => format!("{:.16}", rng.random::<f64>()),
    }
}

#[derive(Debug, Clone)]
pub struct AuthRequest {
    source: StreamSource,
    schema: &'static [&'static str],
    values: HashMap<&'static str, String>,
}

impl AuthRequest {
    pub fn build<R: Rng + ?Sized>(
        event: &Event,
        network: &NetworkInfo,
        identity: &Identity,
        rng: &mut R,
    ) -> Result<AuthRequest> {
        let mut values: HashMap<&'static str, String> = HashMap::new();
        values.insert("channel", network.channel.clone());
        values.insert("partnerContentId", event.id.clone());
        values.insert("eventId", event.event_id.clone());
        values.insert("contentId", event.content_id.clone());
        values.insert("cdnName", network.cdn_name.clone());
        values.insert("identityPointId", identity.identity_point_id());
        values.insert("playerId", network.player_id.clone());
        values.insert("rand", cache_buster(&event.stream_source, rng));

        let schema = match &event.stream_source {
            StreamSource::Hls => {
                values.insert("playbackScenario", "HTTP_CLOUD_MOBILE".into());
                values.insert("simulcastAiringId", event.simulcast_airing_id.clone().unwrap_or_default());
                values.insert("token", format!("{}%3D", Alphanumeric.sample_string(rng, 51)));
                values.insert("tokenType", "GATEKEEPER".into());
                HLS_SCHEMA
            }
            StreamSource::Hds => {
                values.insert("playbackScenario", "FMS_CLOUD".into());
                HDS_SCHEMA
            }
            StreamSource::Other(other) => {
                return Err(Error::UnsupportedStream(format!("stream source '{}'", other)));
            }
        };

        Ok(AuthRequest {
            source: event.stream_source.clone(),
            schema,
            values,
        })
    }

    pub fn query(&self) -> Result<String> {
        ordered_query(self.schema, &self.values)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn refresh_cache_buster<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.values.insert("rand", cache_buster(&self.source, rng));
    }
}

pub fn parse_media_url(document: &str) -> Result<String> {
    let root = Element::parse(document).map_err(|e| Error::Authorization(format!("unreadable auth response: {}", e)))?;
    let url = match MEDIA_URL_PATH.split_once('/') {
        Some((first, rest)) if root.name == first => root.path(rest),
        _ => root.path(MEDIA_URL_PATH),
    }
    .map(|e| e.text())
    .filter(|url| !url.is_empty());

    if let Some(url) = url {
        return Ok(url);
    }
    let status = root
        .descendants()
        .into_iter()
        .find(|e| e.name == "status-message")
        .map(|e| e.text())
        .filter(|m| !m.is_empty());
    Err(Error::Authorization(
        status.unwrap_or_else(|| "auth response has no media url".to_string()),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub bitrate: u64,
    pub src: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmilManifest {
    pub base: String,
    /// Lowest bitrate first.
    pub variants: Vec<Variant>,
}

impl SmilManifest {
    pub fn parse(document: &str) -> Result<SmilManifest> {
        let root = Element::parse(document).map_err(|e| Error::FeedParse(format!("manifest: {}", e)))?;
        let base = root
            .child("head")
            .and_then(|head| head.elements().filter(|e| e.name == "meta").find_map(|m| m.attr("base")))
            .ok_or_else(|| Error::FeedParse("manifest has no head/meta base".into()))?
            .to_string();

        let mut variants = Vec::new();
        if let Some(switch) = root.path("body/switch") {
            for video in switch.elements().filter(|e| e.name == "video") {
                let (Some(bitrate), Some(src)) = (video.attr("system-bitrate"), video.attr("src")) else {
                    continue;
                };
                let Ok(bitrate) = bitrate.trim().parse::<u64>() else {
                    debug!("skipping variant with bitrate '{}'", bitrate);
                    continue;
                };
                variants.push(Variant {
                    bitrate,
                    src: src.to_string(),
                });
            }
        }
        if variants.is_empty() {
            return Err(Error::FeedParse("manifest lists no video variants".into()));
        }
        variants.sort_by_key(|v| v.bitrate);
        Ok(SmilManifest { base, variants })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDescriptor {
    Hls {
        playlist_url: String,
    },
    Rtmp {
        base_url: String,
        play_path: String,
        auth: Option<String>,
        bitrate: u64,
    },
}

fn with_query(url: &str, query: &str) -> String {
    if url.contains('?') {
        format!("{}&{}", url, query)
    } else {
        format!("{}?{}", url, query)
    }
}

pub struct Resolver<'a, H> {
    http: &'a H,
    auth_url: &'a str,
    player_config_url: &'a str,
    identity: &'a Identity,
}

impl<'a, H: TextFetcher> Resolver<'a, H> {
    pub fn new(http: &'a H, auth_url: &'a str, player_config_url: &'a str, identity: &'a Identity) -> Self {
        Resolver {
            http,
            auth_url,
            player_config_url,
            identity,
        }
    }

    /// `Ok(None)` when the user cancels the bitrate prompt.
    pub async fn resolve(
        &self,
        event: &Event,
        bitrate: &BitrateChoice,
        chooser: &mut dyn Chooser,
    ) -> Result<Option<StreamDescriptor>> {
        if let StreamSource::Other(other) = &event.stream_source {
            return Err(Error::UnsupportedStream(format!("stream source '{}'", other)));
        }
        let channel = event.channel.as_deref().ok_or_else(|| {
            Error::UnsupportedStream(format!("unknown network id '{}'", event.network_id))
        })?;

        let config = self.http.get_text(self.player_config_url).await?;
        let network = NetworkInfo::from_config(&config, channel)?;
        debug!("network info: {:?}", network);

        let mut request = AuthRequest::build(event, &network, self.identity, &mut rand::rng())?;
        let auth_call = with_query(self.auth_url, &request.query()?);
        info!(
            "requesting authorization for event {} (rand {})",
            event.id,
            request.value("rand").unwrap_or_default()
        );
        let media_url = parse_media_url(&self.http.get_text(&auth_call).await?)?;
        debug!("media url: {}", media_url);

        request.refresh_cache_buster(&mut rand::rng());
        let manifest_url = with_query(&media_url, &request.query()?);
        let manifest = self.http.get_text(&manifest_url).await?;

        match event.stream_source {
            StreamSource::Hls => {
                if !manifest.trim_start().starts_with("#EXTM3U") {
                    return Err(Error::FeedParse("HLS manifest is not an m3u8 playlist".into()));
                }
                // TODO: pick a variant out of the master playlist so --bitrate applies to hls too,
                // right now ffmpeg just takes whatever it picks first
                Ok(Some(StreamDescriptor::Hls {
                    playlist_url: manifest_url,
                }))
            }
            _ => {
                let smil = SmilManifest::parse(&manifest)?;
                let ladder: Vec<u64> = smil.variants.iter().map(|v| v.bitrate).collect();
                if ladder.iter().any(|b| !BITRATE_LADDER.contains(b)) {
                    debug!("manifest bitrates {:?} differ from the usual ladder", ladder);
                }
                let Some(index) = select_bitrate(&ladder, bitrate, chooser)? else {
                    return Ok(None);
                };
                let variant = &smil.variants[index];
                info!("selected {}k variant", variant.bitrate / 1000);
                Ok(Some(StreamDescriptor::Rtmp {
                    base_url: smil.base.clone(),
                    play_path: variant.src.clone(),
                    auth: media_url.split_once('?').map(|(_, q)| q.to_string()),
                    bitrate: variant.bitrate,
                }))
            }
        }
    }
}
