//! Decay Classification
//!
//! Pure inference of a memory's temporal-validity profile from its content,
//! category, and level. Rules run top-down; first match wins:
//!
//! 1. parseable event date        -> event-based, expires 24h after the event
//! 2. identity hints              -> permanent
//! 3. working level / volatility  -> volatile, expires in 24h
//! 4. skills/projects / stack     -> semi-stable, review in 60d
//! 5. default                     -> stable (semantic), semi-stable (episodic)

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{DecayProfile, MemoryCategory, MemoryLevel};

const PERMANENT_HINTS: &[&str] = &["name is", "born", "citizen", "identity", "email", "phone"];

const VOLATILE_HINTS: &[&str] = &[
    "today",
    "tomorrow",
    "asap",
    "urgent",
    "for now",
    "temporary",
    "remind",
    "todo",
    "to do",
    "this afternoon",
    "this evening",
    "tonight",
];

const SEMI_STABLE_HINTS: &[&str] = &[
    "framework", "library", "stack", "tooling", "sdk", "api", "language", "database",
];

/// Inferred decay decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayDecision {
    pub decay_profile: DecayProfile,
    pub expires_at: Option<DateTime<Utc>>,
    pub review_due_at: Option<DateTime<Utc>>,
    pub event_date: Option<DateTime<Utc>>,
    pub needs_review: bool,
}

/// Classify a memory's decay profile.
pub fn infer_decay(
    content: &str,
    category: MemoryCategory,
    level: MemoryLevel,
    now: DateTime<Utc>,
) -> DecayDecision {
    let lowered = content.to_lowercase();

    if let Some(event_date) = parse_event_date(content, now) {
        return DecayDecision {
            decay_profile: DecayProfile::EventBased,
            expires_at: Some(event_date + Duration::days(1)),
            review_due_at: None,
            event_date: Some(event_date),
            needs_review: false,
        };
    }

    if PERMANENT_HINTS.iter().any(|hint| lowered.contains(hint)) {
        return DecayDecision {
            decay_profile: DecayProfile::Permanent,
            expires_at: None,
            review_due_at: None,
            event_date: None,
            needs_review: false,
        };
    }

    if level == MemoryLevel::Working || VOLATILE_HINTS.iter().any(|hint| lowered.contains(hint)) {
        return DecayDecision {
            decay_profile: DecayProfile::Volatile,
            expires_at: Some(now + Duration::hours(24)),
            review_due_at: None,
            event_date: None,
            needs_review: false,
        };
    }

    let semi_stable_category =
        matches!(category, MemoryCategory::Skills | MemoryCategory::Projects);
    if semi_stable_category || SEMI_STABLE_HINTS.iter().any(|hint| lowered.contains(hint)) {
        return DecayDecision {
            decay_profile: DecayProfile::SemiStable,
            expires_at: None,
            review_due_at: Some(now + Duration::days(60)),
            event_date: None,
            needs_review: false,
        };
    }

    let profile = match level {
        MemoryLevel::Episodic => DecayProfile::SemiStable,
        _ => DecayProfile::Stable,
    };
    DecayDecision {
        decay_profile: profile,
        expires_at: None,
        review_due_at: if profile == DecayProfile::SemiStable {
            Some(now + Duration::days(60))
        } else {
            None
        },
        event_date: None,
        needs_review: false,
    }
}

// ============================================================================
// EVENT DATE PARSING
// ============================================================================

const MONTHS: &[(&str, u32)] = &[
    ("january", 1),
    ("jan", 1),
    ("february", 2),
    ("feb", 2),
    ("march", 3),
    ("mar", 3),
    ("april", 4),
    ("apr", 4),
    ("may", 5),
    ("june", 6),
    ("jun", 6),
    ("july", 7),
    ("jul", 7),
    ("august", 8),
    ("aug", 8),
    ("september", 9),
    ("sept", 9),
    ("sep", 9),
    ("october", 10),
    ("oct", 10),
    ("november", 11),
    ("nov", 11),
    ("december", 12),
    ("dec", 12),
];

/// Midnight-ish anchor for event dates: 09:00 UTC on the given day.
fn at_default_time(date: chrono::NaiveDate) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), 9, 0, 0)
        .single()
}

/// Parse an event date mentioned in the content.
///
/// Accepts ISO (`2026-03-15`), US-style (`03/15/2026`), month names
/// (`March 15, 2026`, `Mar 15`), and the relative phrases `today`,
/// `tomorrow`, `next week`. A month-name date without an explicit year that
/// falls in the past rolls forward one year.
pub fn parse_event_date(content: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = content.trim();
    let lowered = text.to_lowercase();

    if lowered.contains("tomorrow") {
        return at_default_time((now + Duration::days(1)).date_naive());
    }
    if lowered.contains("today") {
        return at_default_time(now.date_naive());
    }
    if lowered.contains("next week") {
        return at_default_time((now + Duration::days(7)).date_naive());
    }

    static ISO: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());
    if let Some(caps) = ISO.captures(text) {
        let (year, month, day) = (
            caps[1].parse::<i32>().ok()?,
            caps[2].parse::<u32>().ok()?,
            caps[3].parse::<u32>().ok()?,
        );
        if let Some(date) = chrono::NaiveDate::from_ymd_opt(year, month, day) {
            return at_default_time(date);
        }
    }

    static US: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").unwrap()
    });
    if let Some(caps) = US.captures(text) {
        let (month, day, year) = (
            caps[1].parse::<u32>().ok()?,
            caps[2].parse::<u32>().ok()?,
            caps[3].parse::<i32>().ok()?,
        );
        if let Some(date) = chrono::NaiveDate::from_ymd_opt(year, month, day) {
            return at_default_time(date);
        }
    }

    static MONTH_NAME: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"\b([A-Za-z]{3,9})\s+(\d{1,2})(?:,?\s+(\d{4}))?\b").unwrap()
    });
    if let Some(caps) = MONTH_NAME.captures(text) {
        let month_txt = caps[1].to_lowercase();
        if let Some((_, month)) = MONTHS.iter().find(|(name, _)| *name == month_txt) {
            let day = caps[2].parse::<u32>().ok()?;
            let explicit_year = caps.get(3).and_then(|m| m.as_str().parse::<i32>().ok());
            let year = explicit_year.unwrap_or(now.year());
            if let Some(date) = chrono::NaiveDate::from_ymd_opt(year, *month, day) {
                let mut resolved = at_default_time(date)?;
                // Past date without an explicit year rolls forward one year.
                if resolved < now && explicit_year.is_none() {
                    let next = chrono::NaiveDate::from_ymd_opt(year + 1, *month, day)?;
                    resolved = at_default_time(next)?;
                }
                return Some(resolved);
            }
        }
    }

    None
}

// ============================================================================
// TESTS
// ============================================================================
