use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::feed::{self, Event, FeedAction, FeedSource, FeedWindow, NetworkTable};
use crate::helpers;
use crate::xml::{Element, Node};

pub const RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, Default)]
pub struct ChannelCache {
    pub updated: Option<DateTime<Utc>>,
    /// Newest first, unique by id.
    pub events: Vec<Event>,
}

impl ChannelCache {
    pub fn parse(document: &str, networks: &NetworkTable) -> Result<ChannelCache> {
        let root = Element::parse(document).map_err(|e| Error::Config(format!("bad cache file: {}", e)))?;
        if root.name != "events" {
            return Err(Error::Config(format!(
                "bad cache file: root element is <{}>, expected <events>",
                root.name
            )));
        }
        let updated = match root.attr("updated") {
            Some(value) => {
                let secs: i64 = value
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("bad cache file: updated='{}'", value)))?;
                Some(
                    DateTime::from_timestamp(secs, 0)
                        .ok_or_else(|| Error::Config(format!("bad cache file: updated={}", secs)))?,
                )
            }
            None => None,
        };
        let events = root
            .elements()
            .filter(|e| e.name == "event")
            .map(|e| Event::from_element(e, networks))
            .collect::<Result<Vec<Event>>>()
            .map_err(|e| Error::Config(format!("bad cache file: {}", e)))?;
        Ok(ChannelCache { updated, events })
    }

    pub fn to_document(&self) -> Result<String> {
        let mut root = Element::new("events");
        if let Some(updated) = self.updated {
            root.set_attr("updated", &updated.timestamp().to_string());
        }
        root.children = self.events.iter().map(|e| Node::Element(e.raw.clone())).collect();
        root.to_document()
    }

    fn oldest(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(|e| e.start_time).min()
    }

    fn newest(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(|e| e.start_time).max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPlan {
    /// No cache yet.
    Full(FeedWindow),
    /// The cache does not reach back far enough.
    FillWindow(FeedWindow),
    /// The cache covers the window but is older than the refresh interval.
    Incremental(FeedWindow),
    UseCache,
}

impl FetchPlan {
    pub fn window(&self) -> Option<FeedWindow> {
        match self {
            FetchPlan::Full(w) | FetchPlan::FillWindow(w) | FetchPlan::Incremental(w) => Some(*w),
            FetchPlan::UseCache => None,
        }
    }
}

pub fn plan_fetch(
    cache: Option<&ChannelCache>,
    now: DateTime<Utc>,
    lookback: Duration,
    force_refresh: Duration,
) -> FetchPlan {
    let window_start = now - lookback;
    let whole_window = FeedWindow {
        start: window_start,
        end: now,
    };
    let Some(cache) = cache else {
        return FetchPlan::Full(whole_window);
    };
    let Some(oldest) = cache.oldest() else {
        return FetchPlan::FillWindow(whole_window);
    };
    if oldest > window_start {
        return FetchPlan::FillWindow(whole_window);
    }

    // events were checked above so newest() is always present here
    let last_updated = cache.updated.or_else(|| cache.newest()).unwrap_or(oldest);
    if now - last_updated > force_refresh {
        return FetchPlan::Incremental(FeedWindow {
            start: last_updated,
            end: now,
        });
    }
    FetchPlan::UseCache
}

/// Fetched events not already cached go in front, the result is newest first.
pub fn merge(cached: Vec<Event>, fetched: Vec<Event>) -> Vec<Event> {
    let known: HashSet<String> = cached.iter().map(|e| e.id.clone()).collect();
    let mut seen = HashSet::new();
    let mut merged: Vec<Event> = fetched
        .into_iter()
        .filter(|e| !known.contains(&e.id) && seen.insert(e.id.clone()))
        .collect();
    merged.extend(cached);
    merged.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    merged
}

pub fn drop_expired(events: Vec<Event>, updated: DateTime<Utc>) -> Vec<Event> {
    let horizon = updated - Duration::days(RETENTION_DAYS);
    events.into_iter().filter(|e| e.start_time >= horizon).collect()
}

pub struct EventCache<F> {
    dir: PathBuf,
    source: F,
    networks: NetworkTable,
}

impl<F: FeedSource> EventCache<F> {
    pub fn new(dir: &Path, source: F, networks: NetworkTable) -> Self {
        EventCache {
            dir: dir.to_path_buf(),
            source,
            networks,
        }
    }

    pub fn cache_path(&self, channel: &str) -> PathBuf {
        self.dir.join(format!("{}.xml", channel))
    }

    pub async fn load(&self, channel: &str) -> Result<Option<ChannelCache>> {
        let path = self.cache_path(channel);
        if !path.exists() {
            return Ok(None);
        }
        let document = fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Config(format!("can't read cache {:?}: {}", path, e)))?;
        ChannelCache::parse(&document, &self.networks).map(Some)
    }

    async fn store(&self, channel: &str, cache: &ChannelCache) -> Result<()> {
        helpers::ensure_directory(&self.dir).await?;
        let path = self.cache_path(channel);
        let tmp = path.with_extension("xml.tmp");
        fs::write(&tmp, cache.to_document()?).await?;
        fs::rename(&tmp, &path).await?;
        debug!("wrote {} events to {:?}", cache.events.len(), path);
        Ok(())
    }

    /// Replay events of `channel` that started within the last `lookback_days`, newest first.
    pub async fn get_events(
        &self,
        channel: &str,
        lookback_days: i64,
        force_refresh_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let lookback = Duration::try_days(lookback_days)
            .filter(|d| *d > Duration::zero())
            .ok_or_else(|| Error::Config(format!("invalid lookback of {} days", lookback_days)))?;
        let window_start = now
            .checked_sub_signed(lookback)
            .ok_or_else(|| Error::Config(format!("lookback of {} days is out of range", lookback_days)))?;
        let force_refresh = Duration::try_minutes(force_refresh_minutes)
            .filter(|d| *d >= Duration::zero())
            .ok_or_else(|| Error::Config(format!("invalid refresh interval of {} minutes", force_refresh_minutes)))?;

        let cached = self.load(channel).await?;
        let plan = plan_fetch(cached.as_ref(), now, lookback, force_refresh);

        let events = match plan.window() {
            None => {
                info!("using cached events for {}", channel);
                cached.map(|c| c.events).unwrap_or_default()
            }
            Some(window) => {
                info!("fetching {} events ({:?})", channel, plan);
                let document = self
                    .source
                    .fetch(FeedAction::Replay, &[channel.to_string()], Some(window))
                    .await?;
                let fetched = feed::parse_feed(&document, &self.networks)?;
                let fetched_count = fetched.len();
                let merged = merge(cached.map(|c| c.events).unwrap_or_default(), fetched);
                let cache = ChannelCache {
                    updated: Some(now),
                    events: drop_expired(merged, now),
                };
                info!(
                    "{}: {} fetched, {} cached after merge",
                    channel,
                    fetched_count,
                    cache.events.len()
                );
                self.store(channel, &cache).await?;
                cache.events
            }
        };

        Ok(events.into_iter().filter(|e| e.start_time >= window_start).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::tests::{event_xml, feed_xml};
    use std::cell::RefCell;

    struct FakeFeed {
        document: String,
        calls: RefCell<Vec<Option<FeedWindow>>>,
    }

    impl FakeFeed {
        fn new(document: String) -> Self {
            FakeFeed {
                document,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl FeedSource for &FakeFeed {
        async fn fetch(&self, _action: FeedAction, _channels: &[String], window: Option<FeedWindow>) -> Result<String> {
            self.calls.borrow_mut().push(window);
            Ok(self.document.clone())
        }
    }

    fn event(id: &str, start: DateTime<Utc>) -> Event {
        let xml = event_xml(id, start, &format!("event {}", id), "Football");
        Event::from_element(&Element::parse(&xml).unwrap(), &NetworkTable::default()).unwrap()
    }

    fn cache_of(updated: Option<DateTime<Utc>>, events: Vec<Event>) -> ChannelCache {
        ChannelCache { updated, events }
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn plan_without_cache_fetches_everything() {
        let now = Utc::now();
        let plan = plan_fetch(None, now, Duration::days(3), Duration::minutes(60));
        assert_eq!(
            plan,
            FetchPlan::Full(FeedWindow {
                start: now - Duration::days(3),
                end: now
            })
        );
    }

    #[test]
    fn plan_fills_window_when_cache_is_too_short() {
        let now = Utc::now();
        let cache = cache_of(
            Some(now - Duration::minutes(5)),
            vec![event("a", now - Duration::days(2))],
        );
        let plan = plan_fetch(Some(&cache), now, Duration::days(3), Duration::minutes(60));
        assert!(matches!(plan, FetchPlan::FillWindow(w) if w.start == now - Duration::days(3)));
    }

    #[test]
    fn plan_refreshes_incrementally_when_stale() {
        let now = Utc::now();
        let updated = now - Duration::minutes(90);
        let cache = cache_of(Some(updated), vec![event("a", now - Duration::days(4))]);
        let plan = plan_fetch(Some(&cache), now, Duration::days(3), Duration::minutes(60));
        assert_eq!(plan, FetchPlan::Incremental(FeedWindow { start: updated, end: now }));
    }

    #[test]
    fn plan_uses_fresh_cache() {
        let now = Utc::now();
        let cache = cache_of(
            Some(now - Duration::minutes(10)),
            vec![event("a", now - Duration::days(4))],
        );
        let plan = plan_fetch(Some(&cache), now, Duration::days(3), Duration::minutes(60));
        assert_eq!(plan, FetchPlan::UseCache);
    }

    #[test]
    fn plan_falls_back_to_newest_event_without_updated() {
        let now = Utc::now();
        let cache = cache_of(
            None,
            vec![event("b", now - Duration::hours(5)), event("a", now - Duration::days(4))],
        );
        // feed times only carry milliseconds
        let newest = cache.events[0].start_time;
        assert_eq!(newest.timestamp_millis(), (now - Duration::hours(5)).timestamp_millis());
        let plan = plan_fetch(Some(&cache), now, Duration::days(3), Duration::minutes(60));
        assert_eq!(plan, FetchPlan::Incremental(FeedWindow { start: newest, end: now }));
    }

    #[test]
    fn merge_keeps_cached_copy_and_orders_newest_first() {
        let now = Utc::now();
        let cached = vec![event("b", now - Duration::days(1)), event("a", now - Duration::days(3))];
        let mut duplicate = event("b", now - Duration::days(1));
        duplicate.name = "fetched copy".into();
        let fetched = vec![
            event("d", now),
            duplicate,
            event("c", now - Duration::days(2)),
            event("d", now),
        ];

        let merged = merge(cached, fetched);
        assert_eq!(ids(&merged), vec!["d", "b", "c", "a"]);
        assert_eq!(merged[1].name, "event b");
    }

    #[test]
    fn retention_drops_events_past_the_horizon() {
        let now = Utc::now();
        let events = vec![
            event("new", now - Duration::days(1)),
            event("edge", now - Duration::days(RETENTION_DAYS) + Duration::minutes(1)),
            event("old", now - Duration::days(RETENTION_DAYS + 1)),
        ];
        assert_eq!(ids(&drop_expired(events, now)), vec!["new", "edge"]);
    }

    #[test]
    fn cache_document_round_trips() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let cache = cache_of(Some(now), vec![event("a", now - Duration::days(1))]);
        let document = cache.to_document().unwrap();
        assert!(document.contains(r#"updated="1700000000""#));

        let parsed = ChannelCache::parse(&document, &NetworkTable::default()).unwrap();
        assert_eq!(parsed.updated, Some(now));
        assert_eq!(ids(&parsed.events), vec!["a"]);
        assert_eq!(parsed.events[0].raw, cache.events[0].raw);
    }

    #[test]
    fn malformed_cache_is_a_config_error() {
        let table = NetworkTable::default();
        assert!(matches!(ChannelCache::parse("<events>", &table), Err(Error::Config(_))));
        assert!(matches!(
            ChannelCache::parse(r#"<events updated="soon"/>"#, &table),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ChannelCache::parse(r#"<events><event id="x"/></events>"#, &table),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn first_run_fetches_and_trims_to_lookback() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let feed = FakeFeed::new(feed_xml(&[
            event_xml("recent", now - Duration::days(1), "Recent", "Football"),
            event_xml("older", now - Duration::days(40), "Older", "Football"),
        ]));
        let cache = EventCache::new(dir.path(), &feed, NetworkTable::default());

        let events = cache.get_events("espn3", 3, 60, now).await.unwrap();
        assert_eq!(ids(&events), vec!["recent"]);
        assert_eq!(feed.calls.borrow().len(), 1);

        // both stay on disk, only the view is trimmed
        let stored = cache.load("espn3").await.unwrap().unwrap();
        assert_eq!(ids(&stored.events), vec!["recent", "older"]);
        assert_eq!(stored.updated.map(|u| u.timestamp()), Some(now.timestamp()));
    }

    #[tokio::test]
    async fn fresh_cache_is_served_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let feed = FakeFeed::new(feed_xml(&[]));
        let cache = EventCache::new(dir.path(), &feed, NetworkTable::default());
        let stored = cache_of(
            Some(now - Duration::minutes(10)),
            vec![event("b", now - Duration::days(1)), event("a", now - Duration::days(5))],
        );
        cache.store("espn3", &stored).await.unwrap();
        let before = std::fs::read_to_string(cache.cache_path("espn3")).unwrap();

        let events = cache.get_events("espn3", 3, 60, now).await.unwrap();
        assert_eq!(ids(&events), vec!["b"]);
        assert!(feed.calls.borrow().is_empty());
        assert_eq!(std::fs::read_to_string(cache.cache_path("espn3")).unwrap(), before);
    }

    #[tokio::test]
    async fn stale_cache_merges_incremental_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let updated = now - Duration::hours(2);
        let feed = FakeFeed::new(feed_xml(&[
            event_xml("new", now - Duration::minutes(30), "New", "Hockey"),
            event_xml("b", now - Duration::days(1), "B again", "Football"),
        ]));
        let cache = EventCache::new(dir.path(), &feed, NetworkTable::default());
        cache
            .store(
                "espn3",
                &cache_of(
                    Some(updated),
                    vec![event("b", now - Duration::days(1)), event("a", now - Duration::days(5))],
                ),
            )
            .await
            .unwrap();

        let events = cache.get_events("espn3", 3, 60, now).await.unwrap();
        assert_eq!(ids(&events), vec!["new", "b"]);
        assert_eq!(events[1].name, "event b");
        assert_eq!(
            *feed.calls.borrow(),
            vec![Some(FeedWindow {
                start: DateTime::from_timestamp(updated.timestamp(), 0).unwrap(),
                end: now
            })]
        );
    }

    #[tokio::test]
    async fn refetch_drops_events_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let feed = FakeFeed::new(feed_xml(&[event_xml(
            "new",
            now - Duration::minutes(30),
            "New",
            "Hockey",
        )]));
        let cache = EventCache::new(dir.path(), &feed, NetworkTable::default());
        cache
            .store(
                "espn3",
                &cache_of(
                    Some(now - Duration::hours(2)),
                    vec![
                        event("b", now - Duration::days(1)),
                        event("ancient", now - Duration::days(RETENTION_DAYS + 5)),
                    ],
                ),
            )
            .await
            .unwrap();

        let events = cache.get_events("espn3", 3, 60, now).await.unwrap();
        assert_eq!(ids(&events), vec!["new", "b"]);
        assert_eq!(feed.calls.borrow().len(), 1);

        let stored = cache.load("espn3").await.unwrap().unwrap();
        assert_eq!(ids(&stored.events), vec!["new", "b"]);
        let document = std::fs::read_to_string(cache.cache_path("espn3")).unwrap();
        assert!(!document.contains("ancient"));
    }

    #[tokio::test]
    async fn short_cache_fetches_the_whole_window() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let feed = FakeFeed::new(feed_xml(&[
            event_xml("old", now - Duration::days(6), "Old", "Football"),
            event_xml("b", now - Duration::days(1), "B again", "Football"),
        ]));
        let cache = EventCache::new(dir.path(), &feed, NetworkTable::default());
        // fresh, but only reaches one day back
        cache
            .store(
                "espn3",
                &cache_of(Some(now - Duration::minutes(5)), vec![event("b", now - Duration::days(1))]),
            )
            .await
            .unwrap();

        let events = cache.get_events("espn3", 7, 60, now).await.unwrap();
        assert_eq!(ids(&events), vec!["b", "old"]);
        assert_eq!(events[0].name, "event b");
        assert_eq!(
            *feed.calls.borrow(),
            vec![Some(FeedWindow {
                start: now - Duration::days(7),
                end: now
            })]
        );

        let stored = cache.load("espn3").await.unwrap().unwrap();
        assert_eq!(ids(&stored.events), vec!["b", "old"]);
        assert_eq!(stored.updated.map(|u| u.timestamp()), Some(now.timestamp()));
    }

    #[tokio::test]
    async fn out_of_range_intervals_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(feed_xml(&[]));
        let cache = EventCache::new(dir.path(), &feed, NetworkTable::default());
        let now = Utc::now();

        for (days, minutes) in [(100_000_000, 60), (i64::MAX, 60), (0, 60), (3, -1), (3, i64::MAX)] {
            let result = cache.get_events("espn3", days, minutes, now).await;
            assert!(matches!(result, Err(Error::Config(_))), "{} days, {} minutes", days, minutes);
        }
        assert!(feed.calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_leaves_cache_untouched() {
        struct Offline;
        impl FeedSource for Offline {
            async fn fetch(&self, _: FeedAction, _: &[String], _: Option<FeedWindow>) -> Result<String> {
                Err(Error::Io(std::io::Error::other("offline")))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cache = EventCache::new(dir.path(), Offline, NetworkTable::default());
        assert!(cache.get_events("espn3", 3, 60, Utc::now()).await.is_err());
        assert!(!cache.cache_path("espn3").exists());
    }
}
