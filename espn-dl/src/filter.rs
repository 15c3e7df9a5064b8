use chrono::{DateTime, Duration, Utc};
use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};
use crate::feed::Event;
use crate::helpers::Chooser;

pub const ALL_SPORTS: &str = "All";

pub fn within_days(events: Vec<Event>, now: DateTime<Utc>, days: i64) -> Vec<Event> {
    let start = Duration::try_days(days)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    events.into_iter().filter(|e| e.start_time >= start).collect()
}

/// Distinct sports sorted, with the "All" entry first.
pub fn sport_options(events: &[Event]) -> Vec<String> {
    let mut sports: Vec<String> = events
        .iter()
        .map(|e| e.sport.clone())
        .filter(|s| !s.is_empty())
        .collect();
    sports.sort();
    sports.dedup();
    sports.insert(0, ALL_SPORTS.to_string());
    sports
}

pub fn by_sport(events: Vec<Event>, sport: &str) -> Vec<Event> {
    if sport == ALL_SPORTS {
        return events;
    }
    let wanted = sport.to_lowercase();
    events
        .into_iter()
        .filter(|e| e.sport.to_lowercase() == wanted)
        .collect()
}

pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| Error::Config(format!("bad search pattern '{}': {}", p, e)))
        })
        .collect()
}

/// Events whose feed entry matches any of the patterns, order kept.
pub fn search(events: Vec<Event>, patterns: &[Regex]) -> Vec<Event> {
    if patterns.is_empty() {
        return events;
    }
    events
        .into_iter()
        .filter(|e| {
            let text = e.raw.text_content();
            patterns.iter().any(|p| p.is_match(&text))
        })
        .collect()
}

/// `None` means the user backed out of the menu.
pub fn choose_sport(events: Vec<Event>, chooser: &mut dyn Chooser) -> Result<Option<Vec<Event>>> {
    let options = sport_options(&events);
    let Some(index) = chooser.choose("Sport", &options)? else {
        return Ok(None);
    };
    Ok(options.get(index).map(|sport| by_sport(events, sport)))
}

pub fn menu_line(event: &Event) -> String {
    format!(
        "{} | {} | {} [{}]",
        event.start_time.format("%Y-%m-%d %H:%M"),
        event.sport,
        event.name,
        event.channel.as_deref().unwrap_or(&event.network_id)
    )
}

pub fn choose_event(events: Vec<Event>, chooser: &mut dyn Chooser) -> Result<Option<Event>> {
    let options: Vec<String> = events.iter().map(menu_line).collect();
    let Some(index) = chooser.choose("Event", &options)? else {
        return Ok(None);
    };
    Ok(events.into_iter().nth(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::tests::{event_xml, feed_xml};
    use crate::feed::{NetworkTable, parse_feed};
    use crate::helpers::tests::ScriptedChooser;

    fn events(now: DateTime<Utc>) -> Vec<Event> {
        let xml = feed_xml(&[
            event_xml("a", now - Duration::hours(1), "College Football: Ohio St vs Michigan", "Football"),
            event_xml("b", now - Duration::hours(2), "Duke at Kentucky", "Basketball"),
            event_xml("c", now - Duration::days(2), "Wimbledon Day 3", "tennis"),
        ]);
        parse_feed(&xml, &NetworkTable::default()).unwrap()
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn time_filter_keeps_recent_events() {
        let now = Utc::now();
        assert_eq!(ids(&within_days(events(now), now, 1)), vec!["a", "b"]);
        assert_eq!(ids(&within_days(events(now), now, 3)), vec!["a", "b", "c"]);
        // past the calendar range means no lower bound
        assert_eq!(ids(&within_days(events(now), now, i64::MAX)), vec!["a", "b", "c"]);
    }

    #[test]
    fn search_is_a_union_in_original_order() {
        let now = Utc::now();
        let patterns = compile_patterns(&["football".to_string(), "basket".to_string()]).unwrap();
        assert_eq!(ids(&search(events(now), &patterns)), vec!["a", "b"]);
    }

    #[test]
    fn search_is_case_insensitive_and_sees_attributes() {
        let now = Utc::now();
        let patterns = compile_patterns(&["WIMBLEDON".to_string(), r"\bcb\b".to_string()]).unwrap();
        assert_eq!(ids(&search(events(now), &patterns)), vec!["b", "c"]);
    }

    #[test]
    fn bad_pattern_is_rejected() {
        assert!(compile_patterns(&["(".to_string()]).is_err());
    }

    #[test]
    fn sport_options_are_sorted_and_distinct() {
        let now = Utc::now();
        let mut list = events(now);
        list.extend(events(now));
        assert_eq!(sport_options(&list), vec!["All", "Basketball", "Football", "tennis"]);
    }

    #[test]
    fn sport_match_ignores_case() {
        let now = Utc::now();
        assert_eq!(ids(&by_sport(events(now), "TENNIS")), vec!["c"]);
        assert_eq!(ids(&by_sport(events(now), ALL_SPORTS)), vec!["a", "b", "c"]);
    }

    #[test]
    fn choosing_through_the_menu() {
        let now = Utc::now();
        let mut chooser = ScriptedChooser::new(vec![Some(1), Some(0)]);
        let basketball = choose_sport(events(now), &mut chooser).unwrap().unwrap();
        let picked = choose_event(basketball, &mut chooser).unwrap().unwrap();
        assert_eq!(picked.id, "b");
        assert_eq!(chooser.prompts[0].1[0], ALL_SPORTS);
    }

    #[test]
    fn cancelling_the_menu_returns_none() {
        let now = Utc::now();
        let mut chooser = ScriptedChooser::new(vec![None]);
        assert!(choose_event(events(now), &mut chooser).unwrap().is_none());
    }
}
