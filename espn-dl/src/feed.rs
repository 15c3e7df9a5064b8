use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::helpers;
use crate::xml::Element;

// codes the feed uses in <networkId>, mapped to the channel names the player config knows
const NETWORK_IDS: &[(&str, &str)] = &[
    ("n360", "espn3"),
    ("n501", "espn1"),
    ("n502", "espn2"),
    ("n599", "espnu"),
    ("goalline", "goalline"),
    ("buzzerbeater", "buzzerbeater"),
];

#[derive(Debug, Clone, Default)]
pub struct NetworkTable {
    overrides: HashMap<String, String>,
}

impl NetworkTable {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        NetworkTable { overrides }
    }

    pub fn channel(&self, network_id: &str) -> Result<&str> {
        if let Some(channel) = self.overrides.get(network_id) {
            return Ok(channel);
        }
        NETWORK_IDS
            .iter()
            .find(|(code, _)| *code == network_id)
            .map(|(_, channel)| *channel)
            .ok_or_else(|| Error::UnsupportedStream(format!("unknown network id '{}'", network_id)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    Hls,
    /// HDS and RTMP share one auth scheme and one fetcher.
    Hds,
    Other(String),
}

impl StreamSource {
    pub fn from_feed(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_uppercase()) {
            None => StreamSource::Hds,
            Some(v) if v.is_empty() || v == "HDS" || v == "RTMP" => StreamSource::Hds,
            Some(v) if v == "HLS" => StreamSource::Hls,
            Some(v) => StreamSource::Other(v),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub content_id: String,
    pub event_id: String,
    pub name: String,
    pub sport: String,
    pub start_time: DateTime<Utc>,
    pub network_id: String,
    pub channel: Option<String>,
    pub stream_source: StreamSource,
    pub simulcast_airing_id: Option<String>,
    pub filename: String,
    /// The element exactly as the feed sent it.
    pub raw: Element,
}

impl Event {
    pub fn from_element(element: &Element, networks: &NetworkTable) -> Result<Event> {
        // attributes first, child text overrides
        let mut fields: HashMap<&str, String> = HashMap::new();
        for (key, value) in &element.attributes {
            fields.insert(key.as_str(), value.clone());
        }
        for child in element.elements() {
            fields.insert(child.name.as_str(), child.text());
        }
        let field = |names: &[&str]| -> Option<String> {
            names
                .iter()
                .find_map(|n| fields.get(n).filter(|v| !v.is_empty()).cloned())
        };

        let id = field(&["id"]).ok_or_else(|| Error::FeedParse("event without an id".into()))?;
        let start_ms = field(&["startTimeGmtMs"])
            .ok_or_else(|| Error::FeedParse(format!("event {} has no startTimeGmtMs", id)))?;
        let start_ms: i64 = start_ms.trim().parse().map_err(|_| {
            Error::FeedParse(format!("event {} has a bad startTimeGmtMs '{}'", id, start_ms))
        })?;
        let start_time = DateTime::from_timestamp_millis(start_ms).ok_or_else(|| {
            Error::FeedParse(format!("event {} start time {} is out of range", id, start_ms))
        })?;

        let name = field(&["name"]).unwrap_or_default();
        let network_id = field(&["networkId"]).unwrap_or_default();
        let channel = match networks.channel(&network_id) {
            Ok(channel) => Some(channel.to_string()),
            Err(e) => {
                warn!("event {}: {}", id, e);
                None
            }
        };
        let filename = helpers::sanitize_filename(&format!(
            "{} {}",
            name,
            start_time.format("%Y-%m-%d")
        ));

        Ok(Event {
            content_id: field(&["bamContentId", "contentId"]).unwrap_or_default(),
            event_id: field(&["bamEventId", "eventId"]).unwrap_or_default(),
            sport: field(&["sportDisplayValue", "sport"]).unwrap_or_default(),
            stream_source: StreamSource::from_feed(field(&["desktopStreamSource"]).as_deref()),
            simulcast_airing_id: field(&["simulcastAiringId"]),
            id,
            name,
            start_time,
            network_id,
            channel,
            filename,
            raw: element.clone(),
        })
    }
}

/// Events of a feed document, newest first.
pub fn parse_feed(document: &str, networks: &NetworkTable) -> Result<Vec<Event>> {
    let root = Element::parse(document).map_err(|e| Error::FeedParse(e.to_string()))?;
    let mut events = root
        .elements()
        .filter(|e| e.name == "event")
        .map(|e| Event::from_element(e, networks))
        .collect::<Result<Vec<Event>>>()?;
    events.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    debug!("parsed {} events from feed", events.len());
    Ok(events)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedAction {
    Replay,
    Live,
}

impl FeedAction {
    fn as_str(&self) -> &'static str {
        match self {
            FeedAction::Replay => "replay",
            FeedAction::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub fn feed_url(base: &str, action: FeedAction, channels: &[String], window: Option<FeedWindow>) -> String {
    let mut url = format!("{}?action={}&channel={}", base, action.as_str(), channels.join(","));
    if let Some(window) = window {
        url.push_str(&format!(
            "&endDate={}&startDate={}",
            window.end.format("%Y%m%d"),
            window.start.format("%Y%m%d")
        ));
    }
    url
}

pub trait FeedSource {
    /// Raw feed document for `channels`, restricted to `window` when given.
    async fn fetch(&self, action: FeedAction, channels: &[String], window: Option<FeedWindow>) -> Result<String>;
}

pub struct HttpFeed {
    client: Client,
    base_url: String,
}

impl HttpFeed {
    pub fn new(client: Client, base_url: &str) -> Self {
        HttpFeed {
            client,
            base_url: base_url.to_string(),
        }
    }
}

impl FeedSource for HttpFeed {
    async fn fetch(&self, action: FeedAction, channels: &[String], window: Option<FeedWindow>) -> Result<String> {
        let url = feed_url(&self.base_url, action, channels, window);
        helpers::fetch_text(&self.client, &url).await
    }
}
