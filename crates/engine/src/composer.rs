//! Message composer — renders a channel-ready message for one change
//! event and one recipient.
//!
//! Template selection is by (change kind, topic kind). Per-recipient
//! variables: a distance-and-direction line when both the topic and the
//! subscriber carry coordinates, and the region name when the subscriber
//! watches more than one region. Long texts are truncated to a fixed
//! budget preserving a head and a tail.

use beacon_common::geo::distance_and_direction;
use beacon_common::types::{
    ChangeEvent, ChangeKind, ChangePayload, Coords, Subscriber, Topic, TopicKind,
};

/// Character budget for one message. Telegram caps messages at 4096;
/// the margin leaves room for the HTML entities escaping adds.
const MAX_MESSAGE_CHARS: usize = 3600;

const TRUNCATION_MARKER: &str = "\n[…]\n";

/// A rendered message ready to be queued: HTML text plus an optional
/// companion location payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedMessage {
    pub text: String,
    pub parse_mode: &'static str,
    pub location: Option<Coords>,
}

/// Render the message variant for `(event, subscriber)`, or `None` when
/// the combination produces no user-visible text.
pub fn compose(
    event: &ChangeEvent,
    subscriber: &Subscriber,
    topic_url_prefix: &str,
) -> Option<ComposedMessage> {
    let link = topic_link(&event.topic, topic_url_prefix);

    let (body, location) = match (&event.payload, event.kind) {
        (ChangePayload::None, ChangeKind::TopicNew) => {
            let noun = match event.topic.kind {
                TopicKind::Search => "search",
                TopicKind::Event => "event",
                TopicKind::Info => "information post",
            };
            (format!("🆕 New {}: {}", noun, link), event.topic.coords())
        }
        (ChangePayload::StatusChange { old, new }, _) => {
            let mut line = format!("🚩 Status update for {}: <b>{}</b>", link, escape_html(new));
            if let Some(old) = old
                && !old.is_empty()
            {
                line.push_str(&format!(" (was: {})", escape_html(old)));
            }
            (line, None)
        }
        // Title changes are a diagnostics stream for testers and admins;
        // regular members get no user-visible text for them.
        (ChangePayload::TitleChange { old, new }, _) => {
            if !subscriber.is_privileged() {
                return None;
            }
            let mut line = format!("✏️ Title changed for {}: {}", link, escape_html(new));
            if let Some(old) = old {
                line.push_str(&format!("\nWas: {}", escape_html(old)));
            }
            (line, None)
        }
        (ChangePayload::CommentNew { count }, _) => {
            let line = if *count > 1 {
                format!("💬 {} new comments in {}", count, link)
            } else {
                format!("💬 New comment in {}", link)
            };
            (line, None)
        }
        (ChangePayload::InforgComment { author, excerpt }, _) => {
            let mut line = match author {
                Some(author) => format!(
                    "⚡ Inforg comment from {} in {}",
                    escape_html(author),
                    link
                ),
                None => format!("⚡ Inforg comment in {}", link),
            };
            if let Some(excerpt) = excerpt
                && !excerpt.is_empty()
            {
                line.push_str(&format!("\n<i>{}</i>", escape_html(excerpt)));
            }
            (line, None)
        }
        (
            ChangePayload::FirstPostChange {
                deletions,
                additions,
                freeform_message,
                old_coords,
                new_coords,
            },
            _,
        ) => {
            let text = render_first_post_diff(
                &link,
                deletions,
                additions,
                freeform_message.as_deref(),
                *old_coords,
                *new_coords,
            );
            (text, *new_coords)
        }
        (ChangePayload::CoordsChange { old, new }, _) => {
            let mut line = format!(
                "📍 Coordinates updated for {}: {:.5}, {:.5}",
                link, new.lat, new.lon
            );
            if let Some(old) = old {
                line.push_str(&format!("\n{}", coords_shift_line(*old, *new)));
            }
            (line, Some(*new))
        }
        (ChangePayload::FieldTrip { summary }, kind) => {
            let verb = if kind == ChangeKind::FieldTripNew {
                "announced"
            } else {
                "updated"
            };
            (
                format!("🚐 Field trip {} for {}: {}", verb, link, escape_html(summary)),
                None,
            )
        }
        // Payload/kind mismatch cannot reach here: the payload is parsed
        // from the kind at ingestion.
        _ => return None,
    };

    let mut lines = vec![body];

    if let (Some(topic_coords), Some(home)) = (event.topic.coords(), subscriber.home_coords()) {
        lines.push(format!(
            "📏 {} from you",
            distance_and_direction(home, topic_coords)
        ));
    }

    if subscriber.regions.len() > 1 && !event.topic.region.is_empty() {
        lines.push(format!("Region: {}", escape_html(&event.topic.region)));
    }

    Some(ComposedMessage {
        text: truncate_middle(&lines.join("\n"), MAX_MESSAGE_CHARS),
        parse_mode: "HTML",
        location,
    })
}

/// Clickable topic reference: stored display name, then a name parsed
/// from the title, then the raw title.
pub fn topic_link(topic: &Topic, url_prefix: &str) -> String {
    let name = topic
        .display_name
        .clone()
        .or_else(|| parse_title_name(&topic.title))
        .unwrap_or_else(|| topic.title.clone());

    format!(
        "<a href=\"{}{}\">{}</a>",
        url_prefix,
        topic.topic_id,
        escape_html(&name)
    )
}

/// Status words forum titles start with; stripped when deriving a display
/// name from a raw title like "Пропал Иванов Иван, 34 года, Москва".
const TITLE_STATUS_PREFIXES: [&str; 8] = [
    "Пропал", "Пропала", "Пропали", "Жив", "Жива", "Живы", "Погиб", "Погибла",
];

/// Derive a person/topic name from a raw forum title: strip a leading
/// status word, take everything up to the first comma.
pub fn parse_title_name(title: &str) -> Option<String> {
    let head = title.split(',').next()?.trim();

    let mut words: Vec<&str> = head.split_whitespace().collect();
    if let Some(first) = words.first()
        && TITLE_STATUS_PREFIXES.iter().any(|p| first == p)
    {
        words.remove(0);
    }

    if words.is_empty() {
        return None;
    }
    Some(words.join(" "))
}

fn render_first_post_diff(
    link: &str,
    deletions: &[String],
    additions: &[String],
    freeform: Option<&str>,
    old_coords: Option<Coords>,
    new_coords: Option<Coords>,
) -> String {
    let mut out = format!("📝 First post changed in {}", link);

    for deletion in deletions {
        out.push_str(&format!("\n➖ <s>{}</s>", escape_html(deletion)));
    }
    for addition in additions {
        out.push_str(&format!("\n➕ {}", escape_html(addition)));
    }
    if let Some(freeform) = freeform
        && !freeform.is_empty()
    {
        out.push_str(&format!("\n{}", escape_html(freeform)));
    }
    if let (Some(old), Some(new)) = (old_coords, new_coords) {
        out.push_str(&format!("\n{}", coords_shift_line(old, new)));
    }

    out
}

fn coords_shift_line(old: Coords, new: Coords) -> String {
    format!(
        "📍 Coordinates moved {}: {:.5}, {:.5} → {:.5}, {:.5}",
        distance_and_direction(old, new),
        old.lat,
        old.lon,
        new.lat,
        new.lon
    )
}

/// Truncate to `max_chars` characters keeping a head and a tail around a
/// truncation marker. Operates on characters, never splits a code point.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total: usize = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    let keep = max_chars.saturating_sub(marker_len);
    let head_len = keep * 2 / 3;
    let tail_len = keep - head_len;

    let head: String = text.chars().take(head_len).collect();
    let tail: String = text
        .chars()
        .skip(total - tail_len)
        .collect();

    format!("{}{}{}", head, TRUNCATION_MARKER, tail)
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_common::types::SubscriberRole;
    use chrono::Utc;

    const URL_PREFIX: &str = "https://forum.example.org/viewtopic.php?t=";

    fn make_topic() -> Topic {
        Topic {
            topic_id: 42,
            kind: TopicKind::Search,
            title: "Пропал Иванов Иван, 34 года, г. Дмитров".to_string(),
            display_name: None,
            status: Some("Ищем".to_string()),
            lat: Some(56.35),
            lon: Some(37.52),
            age_min: Some(30),
            age_max: Some(40),
            region: "Московская область".to_string(),
        }
    }

    fn make_event(kind: ChangeKind, payload: ChangePayload) -> ChangeEvent {
        ChangeEvent {
            id: 1,
            topic_id: 42,
            kind,
            payload,
            detected_at: Utc::now(),
            topic: make_topic(),
        }
    }

    fn make_subscriber() -> Subscriber {
        Subscriber {
            user_id: 100,
            home_lat: None,
            home_lon: None,
            radius_km: None,
            regions: vec!["Московская область".to_string()],
            topic_kinds: Vec::new(),
            age_bands: serde_json::json!([]),
            categories: vec!["all".to_string()],
            follow_whitelist: false,
            role: SubscriberRole::Member,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_change_renders_phrase_and_link() {
        let event = make_event(
            ChangeKind::StatusChange,
            ChangePayload::StatusChange {
                old: Some("Ищем".to_string()),
                new: "Завершен".to_string(),
            },
        );
        let message = compose(&event, &make_subscriber(), URL_PREFIX).unwrap();
        assert!(message.text.contains("Завершен"));
        assert!(message.text.contains("href=\"https://forum.example.org/viewtopic.php?t=42\""));
        assert!(message.text.contains("Иванов Иван"));
        assert_eq!(message.parse_mode, "HTML");
        assert!(message.location.is_none());
    }

    #[test]
    fn test_new_topic_carries_location() {
        let event = make_event(ChangeKind::TopicNew, ChangePayload::None);
        let message = compose(&event, &make_subscriber(), URL_PREFIX).unwrap();
        assert!(message.text.contains("New search"));
        let loc = message.location.unwrap();
        assert!((loc.lat - 56.35).abs() < 1e-9);
    }

    #[test]
    fn test_distance_line_when_both_sides_have_coords() {
        let event = make_event(ChangeKind::TopicNew, ChangePayload::None);
        let mut sub = make_subscriber();
        sub.home_lat = Some(55.7558);
        sub.home_lon = Some(37.6173);
        let message = compose(&event, &sub, URL_PREFIX).unwrap();
        assert!(message.text.contains("km"));
        assert!(message.text.contains("from you"));
    }

    #[test]
    fn test_no_distance_line_without_home_coords() {
        let event = make_event(ChangeKind::TopicNew, ChangePayload::None);
        let message = compose(&event, &make_subscriber(), URL_PREFIX).unwrap();
        assert!(!message.text.contains("from you"));
    }

    #[test]
    fn test_region_line_only_for_multi_region_watchers() {
        let event = make_event(ChangeKind::TopicNew, ChangePayload::None);

        let single = compose(&event, &make_subscriber(), URL_PREFIX).unwrap();
        assert!(!single.text.contains("Region:"));

        let mut multi = make_subscriber();
        multi.regions.push("Тверская область".to_string());
        let message = compose(&event, &multi, URL_PREFIX).unwrap();
        assert!(message.text.contains("Region: Московская область"));
    }

    #[test]
    fn test_title_change_hidden_from_members() {
        let event = make_event(
            ChangeKind::TitleChange,
            ChangePayload::TitleChange {
                old: Some("Old".to_string()),
                new: "New".to_string(),
            },
        );
        assert!(compose(&event, &make_subscriber(), URL_PREFIX).is_none());

        let mut tester = make_subscriber();
        tester.role = SubscriberRole::Tester;
        assert!(compose(&event, &tester, URL_PREFIX).is_some());
    }

    #[test]
    fn test_first_post_diff_rendering() {
        let event = make_event(
            ChangeKind::FirstPostChange,
            ChangePayload::FirstPostChange {
                deletions: vec!["old phone number".to_string()],
                additions: vec!["new gathering point".to_string()],
                freeform_message: Some("Briefing moved to 18:00".to_string()),
                old_coords: Some(Coords { lat: 56.0, lon: 37.0 }),
                new_coords: Some(Coords { lat: 56.1, lon: 37.0 }),
            },
        );
        let message = compose(&event, &make_subscriber(), URL_PREFIX).unwrap();
        assert!(message.text.contains("➖ <s>old phone number</s>"));
        assert!(message.text.contains("➕ new gathering point"));
        assert!(message.text.contains("Briefing moved to 18:00"));
        assert!(message.text.contains("Coordinates moved"));
        let loc = message.location.unwrap();
        assert!((loc.lat - 56.1).abs() < 1e-9);
    }

    #[test]
    fn test_coords_change_attaches_location() {
        let event = make_event(
            ChangeKind::CoordsChange,
            ChangePayload::CoordsChange {
                old: None,
                new: Coords { lat: 56.2, lon: 37.3 },
            },
        );
        let message = compose(&event, &make_subscriber(), URL_PREFIX).unwrap();
        assert!(message.text.contains("Coordinates updated"));
        assert!(message.location.is_some());
    }

    #[test]
    fn test_topic_link_fallback_chain() {
        let mut topic = make_topic();
        topic.display_name = Some("Иванов И. И.".to_string());
        assert!(topic_link(&topic, URL_PREFIX).contains("Иванов И. И."));

        topic.display_name = None;
        // Falls back to name parsed from the title (status prefix stripped)
        let link = topic_link(&topic, URL_PREFIX);
        assert!(link.contains("Иванов Иван"));
        assert!(!link.contains("Пропал"));

        topic.title = ",,,".to_string();
        let link = topic_link(&topic, URL_PREFIX);
        assert!(link.contains(",,,"));
    }

    #[test]
    fn test_parse_title_name() {
        assert_eq!(
            parse_title_name("Жив Петров Пётр, 60 лет").as_deref(),
            Some("Петров Пётр")
        );
        assert_eq!(parse_title_name("Сбор откликнувшихся").as_deref(), Some("Сбор откликнувшихся"));
        assert_eq!(parse_title_name("  ,x"), None);
    }

    #[test]
    fn test_truncate_middle_preserves_head_and_tail() {
        let text = format!("HEAD{}TAIL", "x".repeat(5000));
        let truncated = truncate_middle(&text, 100);
        assert!(truncated.starts_with("HEAD"));
        assert!(truncated.ends_with("TAIL"));
        assert!(truncated.contains("[…]"));
        assert!(truncated.chars().count() <= 100);
    }

    #[test]
    fn test_truncate_short_text_untouched() {
        assert_eq!(truncate_middle("short", 100), "short");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
