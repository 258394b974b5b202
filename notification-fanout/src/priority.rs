/// Priority classification and suppression decisions (§4.5 steps 6-7),
/// adapted from `original_source/sqs_listener.py`'s `determine_priority`
/// and the quiet-hours check in `send_sms_notif.py`.
use crate::models::{EventType, EventWirePayload, Priority, UserPreferences, UserType};
use chrono::{NaiveTime, Utc};

/// `event_type ∈ {MENTION, COMMENT, REPLY}` OR `payload.priority == "high"`
/// OR `user_type ∈ {ADMIN, PREMIUM}` (§4.5 step 6).
pub fn classify(payload: &EventWirePayload, user_type: Option<&str>) -> Priority {
    let event_type = EventType::parse_lenient(&payload.event_type);
    let is_critical_event_type = matches!(
        event_type,
        EventType::Mention | EventType::Comment | EventType::Reply
    );
    let is_high_priority_payload = payload
        .priority
        .as_deref()
        .map(|p| p.eq_ignore_ascii_case("high"))
        .unwrap_or(false);
    let is_critical_user = user_type
        .map(|u| UserType::parse_lenient(u).is_critical())
        .unwrap_or(false);

    if is_critical_event_type || is_high_priority_payload || is_critical_user {
        Priority::Critical
    } else {
        Priority::NonCritical
    }
}

/// Decides whether a notification should be suppressed for a user (§4.5
/// step 7). Critical events are never suppressed, regardless of
/// preferences. `priority_only` suppresses every non-critical event.
/// `quiet_hours` suppresses non-critical events whose current time falls
/// inside the configured window, which may cross midnight.
pub fn should_suppress(priority: Priority, prefs: &UserPreferences) -> bool {
    if matches!(priority, Priority::Critical) {
        return false;
    }

    if prefs.priority_only {
        return true;
    }

    if prefs.quiet_hours.enabled {
        // UTC stands in for "local" time here: UserPreferences carries no
        // timezone field to convert against (open question, see DESIGN.md).
        return in_quiet_hours(&prefs.quiet_hours.start, &prefs.quiet_hours.end, Utc::now().time());
    }

    false
}

fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    let mut parts = raw.splitn(2, ':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next()?.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Evaluates whether `now` falls inside `[start, end)`, handling the case
/// where `start > end` (the window wraps past midnight, e.g. 22:00-08:00).
fn in_quiet_hours(start: &str, end: &str, now: NaiveTime) -> bool {
    let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return false;
    };

    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuietHours;

    fn payload(event_type: &str, priority: Option<&str>) -> EventWirePayload {
        EventWirePayload {
            event_id: None,
            event_type: event_type.to_string(),
            user_id: "u1".to_string(),
            priority: priority.map(|p| p.to_string()),
            parent_id: None,
            parent_type: None,
            timestamp: None,
            retry_count_sms: 0,
            retry_count_email: 0,
            retry_count_push: 0,
            notifications: Default::default(),
            target_clients: Vec::new(),
            user_type: None,
        }
    }

    #[test]
    fn mention_comment_reply_are_always_critical() {
        for t in ["MENTION", "COMMENT", "REPLY"] {
            let p = payload(t, None);
            assert_eq!(classify(&p, None), Priority::Critical);
        }
    }

    #[test]
    fn high_priority_payload_overrides_event_type() {
        let p = payload("LIKE", Some("high"));
        assert_eq!(classify(&p, None), Priority::Critical);
    }

    #[test]
    fn admin_and_premium_users_are_always_critical() {
        let p = payload("LIKE", None);
        assert_eq!(classify(&p, Some("ADMIN")), Priority::Critical);
        assert_eq!(classify(&p, Some("PREMIUM")), Priority::Critical);
        assert_eq!(classify(&p, Some("BASIC")), Priority::NonCritical);
    }

    #[test]
    fn plain_like_from_free_user_is_non_critical() {
        let p = payload("LIKE", None);
        assert_eq!(classify(&p, Some("FREE")), Priority::NonCritical);
    }

    #[test]
    fn critical_events_are_never_suppressed() {
        let mut prefs = UserPreferences::default();
        prefs.priority_only = true;
        assert!(!should_suppress(Priority::Critical, &prefs));
    }

    #[test]
    fn priority_only_suppresses_non_critical() {
        let mut prefs = UserPreferences::default();
        prefs.priority_only = true;
        assert!(should_suppress(Priority::NonCritical, &prefs));
    }

    #[test]
    fn quiet_hours_window_crossing_midnight() {
        assert!(in_quiet_hours("22:00", "08:00", NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
        assert!(in_quiet_hours("22:00", "08:00", NaiveTime::from_hms_opt(2, 0, 0).unwrap()));
        assert!(!in_quiet_hours("22:00", "08:00", NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn quiet_hours_window_same_day() {
        assert!(in_quiet_hours("09:00", "17:00", NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
        assert!(!in_quiet_hours("09:00", "17:00", NaiveTime::from_hms_opt(20, 0, 0).unwrap()));
    }

    #[test]
    fn disabled_quiet_hours_never_suppress() {
        let prefs = UserPreferences {
            quiet_hours: QuietHours {
                enabled: false,
                start: "00:00".to_string(),
                end: "23:59".to_string(),
            },
            ..UserPreferences::default()
        };
        assert!(!should_suppress(Priority::NonCritical, &prefs));
    }
}
