//! Audience resolver — evaluates one change event against subscriber
//! preferences.
//!
//! The algorithm is a chain of independent filters, each a pure function
//! over (event, candidate list). Order does not affect correctness, only
//! cost, so the cheap in-memory filters run before the ones that needed a
//! database round-trip to prepare. A malformed per-subscriber value never
//! aborts the run: it logs a warning and acts as "no restriction" for that
//! subscriber.

use std::collections::HashSet;

use sqlx::PgPool;

use beacon_common::geo::haversine_km;
use beacon_common::types::{ChangeEvent, ChangeKind, NotificationKind, Subscriber};

/// Database-derived context the pure filters need: per-topic follow state
/// and the authoritative already-notified set.
#[derive(Debug, Default)]
pub struct FilterContext {
    /// Users explicitly following this event's topic.
    pub follows_topic: HashSet<i64>,
    /// Users in whitelist mode who follow at least one topic anywhere.
    pub users_with_follows: HashSet<i64>,
    /// Users with a completed text notification for this change event.
    pub already_notified: HashSet<i64>,
}

impl FilterContext {
    pub async fn load(event: &ChangeEvent, pool: &PgPool) -> anyhow::Result<FilterContext> {
        let follows_topic: Vec<(i64,)> =
            sqlx::query_as("SELECT user_id FROM topic_follows WHERE topic_id = $1 AND following = true")
                .bind(event.topic_id)
                .fetch_all(pool)
                .await?;

        let users_with_follows: Vec<(i64,)> =
            sqlx::query_as("SELECT DISTINCT user_id FROM topic_follows WHERE following = true")
                .fetch_all(pool)
                .await?;

        let already_notified: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT user_id
            FROM pending_notifications
            WHERE change_event_id = $1 AND kind = $2 AND completed_at IS NOT NULL
            "#,
        )
        .bind(event.id)
        .bind(NotificationKind::Text)
        .fetch_all(pool)
        .await?;

        Ok(FilterContext {
            follows_topic: follows_topic.into_iter().map(|(id,)| id).collect(),
            users_with_follows: users_with_follows.into_iter().map(|(id,)| id).collect(),
            already_notified: already_notified.into_iter().map(|(id,)| id).collect(),
        })
    }
}

/// Resolves the recipient list for one enriched change event.
pub struct AudienceResolver;

impl AudienceResolver {
    pub fn new() -> Self {
        Self
    }

    /// Load active subscribers and run the full filter chain.
    pub async fn resolve(
        &self,
        event: &ChangeEvent,
        pool: &PgPool,
    ) -> anyhow::Result<Vec<Subscriber>> {
        let candidates: Vec<Subscriber> =
            sqlx::query_as("SELECT * FROM subscribers WHERE active = true")
                .fetch_all(pool)
                .await?;

        let context = FilterContext::load(event, pool).await?;
        let audience = apply_filters(event, candidates, &context);

        tracing::info!(
            change_event_id = event.id,
            topic_id = event.topic_id,
            kind = %event.kind,
            audience = audience.len(),
            "Audience resolved"
        );

        Ok(audience)
    }
}

impl Default for AudienceResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// The full filter chain over an already-loaded candidate set.
pub fn apply_filters(
    event: &ChangeEvent,
    candidates: Vec<Subscriber>,
    context: &FilterContext,
) -> Vec<Subscriber> {
    let subs = filter_category(event, candidates);
    let subs = filter_region(event, subs);
    let subs = filter_topic_kind(event, subs);
    let subs = filter_radius(event, subs);
    let subs = filter_age_bands(event, subs);
    let subs = filter_follow_mode(event, subs, context);
    let subs = filter_double_notification(event, subs);
    filter_already_notified(subs, context)
}

/// Keep subscribers whose categories include the event's category or the
/// wildcard. Diagnostics categories additionally require tester/admin role.
pub fn filter_category(event: &ChangeEvent, candidates: Vec<Subscriber>) -> Vec<Subscriber> {
    let category = event.category();
    candidates
        .into_iter()
        .filter(|s| s.wants_category(category))
        .filter(|s| !category.is_diagnostic() || s.is_privileged())
        .collect()
}

/// Keep subscribers watching the topic's region folder.
pub fn filter_region(event: &ChangeEvent, candidates: Vec<Subscriber>) -> Vec<Subscriber> {
    candidates
        .into_iter()
        .filter(|s| s.regions.iter().any(|r| *r == event.topic.region))
        .collect()
}

/// Keep subscribers whose topic-kind filters include the topic's kind.
/// No declared filters means all kinds.
pub fn filter_topic_kind(event: &ChangeEvent, candidates: Vec<Subscriber>) -> Vec<Subscriber> {
    let kind = event.topic.kind.to_string();
    candidates
        .into_iter()
        .filter(|s| s.topic_kinds.is_empty() || s.topic_kinds.iter().any(|k| *k == kind))
        .collect()
}

/// Radius is opt-in narrowing: only subscribers with home coordinates and
/// a usable positive radius can be excluded, and only when the topic
/// carries coordinates.
pub fn filter_radius(event: &ChangeEvent, candidates: Vec<Subscriber>) -> Vec<Subscriber> {
    let Some(topic_coords) = event.topic.coords() else {
        return candidates;
    };

    candidates
        .into_iter()
        .filter(|s| match (s.home_coords(), s.effective_radius_km()) {
            (Some(home), Some(radius)) => haversine_km(home, topic_coords) <= radius,
            _ => true,
        })
        .collect()
}

/// Keep subscribers with no declared age bands, or at least one band
/// overlapping the topic's declared range. A topic without an age range
/// restricts nobody.
pub fn filter_age_bands(event: &ChangeEvent, candidates: Vec<Subscriber>) -> Vec<Subscriber> {
    if event.topic.age_min.is_none() && event.topic.age_max.is_none() {
        return candidates;
    }

    candidates
        .into_iter()
        .filter(|s| {
            let bands = s.parsed_age_bands();
            bands.is_empty()
                || bands
                    .iter()
                    .any(|b| b.overlaps(event.topic.age_min, event.topic.age_max))
        })
        .collect()
}

/// Whitelist-follow subscribers are dropped on terminal status transitions
/// unless they explicitly follow this topic. A whitelist subscriber with
/// zero followed topics fails open rather than silently going dark.
pub fn filter_follow_mode(
    event: &ChangeEvent,
    candidates: Vec<Subscriber>,
    context: &FilterContext,
) -> Vec<Subscriber> {
    if !event.is_terminal_status_change() {
        return candidates;
    }

    candidates
        .into_iter()
        .filter(|s| {
            if !s.follow_whitelist {
                return true;
            }
            context.follows_topic.contains(&s.user_id)
                || !context.users_with_follows.contains(&s.user_id)
        })
        .collect()
}

/// An inforg comment is also fanned out under the plain comments category,
/// so wildcard subscribers would receive it twice. Drop them here.
pub fn filter_double_notification(
    event: &ChangeEvent,
    candidates: Vec<Subscriber>,
) -> Vec<Subscriber> {
    if event.kind != ChangeKind::InforgCommentNew {
        return candidates;
    }

    candidates
        .into_iter()
        .filter(|s| !s.wants_all())
        .collect()
}

/// Authoritative idempotency backstop for re-invocation: drop anyone with
/// a completed notification for this change event already on record.
pub fn filter_already_notified(
    candidates: Vec<Subscriber>,
    context: &FilterContext,
) -> Vec<Subscriber> {
    candidates
        .into_iter()
        .filter(|s| !context.already_notified.contains(&s.user_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_common::types::{
        ChangePayload, SubscriberRole, Topic, TopicKind,
    };
    use chrono::Utc;

    fn make_topic() -> Topic {
        Topic {
            topic_id: 42,
            kind: TopicKind::Search,
            title: "Пропал Иванов Иван, 34 года".to_string(),
            display_name: None,
            status: Some("Ищем".to_string()),
            lat: Some(55.0),
            lon: Some(37.0),
            age_min: None,
            age_max: None,
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

    fn make_subscriber(user_id: i64) -> Subscriber {
        Subscriber {
            user_id,
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

    fn comment_event() -> ChangeEvent {
        make_event(ChangeKind::CommentNew, ChangePayload::CommentNew { count: 1 })
    }

    #[test]
    fn test_category_wildcard_matches() {
        let event = comment_event();
        let kept = filter_category(&event, vec![make_subscriber(1)]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_category_specific_match() {
        let event = comment_event();
        let mut sub = make_subscriber(1);
        sub.categories = vec!["comments".to_string()];
        let mut other = make_subscriber(2);
        other.categories = vec!["status_changes".to_string()];
        let kept = filter_category(&event, vec![sub, other]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].user_id, 1);
    }

    #[test]
    fn test_diagnostic_category_requires_privilege() {
        let event = make_event(
            ChangeKind::TitleChange,
            ChangePayload::TitleChange {
                old: None,
                new: "Новое название".to_string(),
            },
        );
        let member = make_subscriber(1);
        let mut tester = make_subscriber(2);
        tester.role = SubscriberRole::Tester;
        let kept = filter_category(&event, vec![member, tester]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].user_id, 2);
    }

    #[test]
    fn test_region_mismatch_drops() {
        let event = comment_event();
        let mut sub = make_subscriber(1);
        sub.regions = vec!["Тверская область".to_string()];
        assert!(filter_region(&event, vec![sub]).is_empty());
    }

    #[test]
    fn test_radius_boundary() {
        // Topic at (55.0, 37.0); a point one degree of latitude north is
        // ~111.2 km away.
        let event = comment_event();

        let mut inside = make_subscriber(1);
        inside.home_lat = Some(56.0);
        inside.home_lon = Some(37.0);
        inside.radius_km = Some(112.0);

        let mut outside = make_subscriber(2);
        outside.home_lat = Some(56.0);
        outside.home_lon = Some(37.0);
        outside.radius_km = Some(111.0);

        let kept = filter_radius(&event, vec![inside, outside]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].user_id, 1);
    }

    #[test]
    fn test_radius_without_home_coords_keeps() {
        let event = comment_event();
        let mut sub = make_subscriber(1);
        sub.radius_km = Some(1.0);
        // No home coords — radius cannot exclude
        assert_eq!(filter_radius(&event, vec![sub]).len(), 1);
    }

    #[test]
    fn test_radius_zero_is_unrestricted() {
        let event = comment_event();
        let mut sub = make_subscriber(1);
        sub.home_lat = Some(10.0);
        sub.home_lon = Some(10.0);
        sub.radius_km = Some(0.0);
        assert_eq!(filter_radius(&event, vec![sub]).len(), 1);
    }

    #[test]
    fn test_malformed_radius_is_unrestricted() {
        let event = comment_event();
        let mut sub = make_subscriber(1);
        sub.home_lat = Some(10.0);
        sub.home_lon = Some(10.0);
        sub.radius_km = Some(f64::NAN);
        assert_eq!(filter_radius(&event, vec![sub]).len(), 1);
    }

    #[test]
    fn test_topic_without_coords_skips_radius() {
        let mut event = comment_event();
        event.topic.lat = None;
        event.topic.lon = None;
        let mut sub = make_subscriber(1);
        sub.home_lat = Some(10.0);
        sub.home_lon = Some(10.0);
        sub.radius_km = Some(1.0);
        assert_eq!(filter_radius(&event, vec![sub]).len(), 1);
    }

    #[test]
    fn test_age_band_overlap_kept() {
        let mut event = comment_event();
        event.topic.age_min = Some(15);
        event.topic.age_max = Some(30);

        let mut overlapping = make_subscriber(1);
        overlapping.age_bands = serde_json::json!([{"min": 10, "max": 20}]);
        let mut disjoint = make_subscriber(2);
        disjoint.age_bands = serde_json::json!([{"min": 1, "max": 5}]);

        let kept = filter_age_bands(&event, vec![overlapping, disjoint]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].user_id, 1);
    }

    #[test]
    fn test_topic_without_age_range_keeps_all() {
        let event = comment_event();
        let mut sub = make_subscriber(1);
        sub.age_bands = serde_json::json!([{"min": 1, "max": 5}]);
        assert_eq!(filter_age_bands(&event, vec![sub]).len(), 1);
    }

    #[test]
    fn test_malformed_age_bands_keep() {
        let mut event = comment_event();
        event.topic.age_min = Some(15);
        event.topic.age_max = Some(30);
        let mut sub = make_subscriber(1);
        sub.age_bands = serde_json::json!({"bogus": true});
        assert_eq!(filter_age_bands(&event, vec![sub]).len(), 1);
    }

    fn terminal_event() -> ChangeEvent {
        make_event(
            ChangeKind::StatusChange,
            ChangePayload::StatusChange {
                old: Some("Ищем".to_string()),
                new: "Завершен".to_string(),
            },
        )
    }

    #[test]
    fn test_follow_mode_drops_non_follower_on_terminal() {
        let event = terminal_event();
        let mut sub = make_subscriber(1);
        sub.follow_whitelist = true;

        let mut context = FilterContext::default();
        context.users_with_follows.insert(1);
        // follows another topic, not this one
        assert!(filter_follow_mode(&event, vec![sub], &context).is_empty());
    }

    #[test]
    fn test_follow_mode_keeps_follower() {
        let event = terminal_event();
        let mut sub = make_subscriber(1);
        sub.follow_whitelist = true;

        let mut context = FilterContext::default();
        context.users_with_follows.insert(1);
        context.follows_topic.insert(1);
        assert_eq!(filter_follow_mode(&event, vec![sub], &context).len(), 1);
    }

    #[test]
    fn test_follow_mode_fails_open_with_zero_follows() {
        let event = terminal_event();
        let mut sub = make_subscriber(1);
        sub.follow_whitelist = true;

        let context = FilterContext::default();
        assert_eq!(filter_follow_mode(&event, vec![sub], &context).len(), 1);
    }

    #[test]
    fn test_follow_mode_ignores_non_terminal() {
        let event = make_event(
            ChangeKind::StatusChange,
            ChangePayload::StatusChange {
                old: None,
                new: "Внимание, сбор!".to_string(),
            },
        );
        let mut sub = make_subscriber(1);
        sub.follow_whitelist = true;
        let mut context = FilterContext::default();
        context.users_with_follows.insert(1);
        assert_eq!(filter_follow_mode(&event, vec![sub], &context).len(), 1);
    }

    #[test]
    fn test_inforg_double_notification_drops_wildcard() {
        let event = make_event(
            ChangeKind::InforgCommentNew,
            ChangePayload::InforgComment {
                author: None,
                excerpt: None,
            },
        );
        let wildcard = make_subscriber(1);
        let mut specific = make_subscriber(2);
        specific.categories = vec!["inforg_comments".to_string()];

        let kept = filter_double_notification(&event, vec![wildcard, specific]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].user_id, 2);
    }

    #[test]
    fn test_already_notified_dropped() {
        let mut context = FilterContext::default();
        context.already_notified.insert(1);
        let kept = filter_already_notified(vec![make_subscriber(1), make_subscriber(2)], &context);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].user_id, 2);
    }

    #[test]
    fn test_full_chain_concrete_scenario() {
        // Region-matched subscriber with only the wildcard preference
        // survives the whole chain for a terminal status change.
        let event = terminal_event();
        let context = FilterContext::default();
        let kept = apply_filters(&event, vec![make_subscriber(777)], &context);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].user_id, 777);
    }
}
