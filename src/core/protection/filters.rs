// Content checks behind `EventFilter`.

use super::protection_models::{AbuseEvent, EventFilter};
use once_cell::sync::Lazy;
use regex::Regex;

static INVITE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(https?://)?(www\.)?(discord\.(gg|io|me|li)|discordapp\.com/invite)/[a-z0-9]+")
        .expect("invite pattern is valid")
});

static EXECUTABLE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?://\S*\.(exe|bat|cmd|scr|js|vbs|jar|zip)\b")
        .expect("executable link pattern is valid")
});

static STAFF_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(moderator|admin|staff|owner|ceo|manager|support|🔒|🛡️)")
        .expect("staff name pattern is valid")
});

pub fn contains_blocked_link(content: &str) -> bool {
    INVITE_LINK.is_match(content) || EXECUTABLE_LINK.is_match(content)
}

pub fn looks_like_staff(name: &str) -> bool {
    STAFF_NAME.is_match(name)
}

/// First keyword found in the content, case-insensitive.
pub fn matched_keyword<'a>(content: &str, keywords: &'a [String]) -> Option<&'a str> {
    let lower = content.to_lowercase();
    keywords
        .iter()
        .filter(|kw| !kw.trim().is_empty())
        .find(|kw| lower.contains(&kw.to_lowercase()))
        .map(String::as_str)
}

impl EventFilter {
    /// Whether the event should count toward a rule with this filter.
    pub fn matches(&self, event: &AbuseEvent) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::ContainsLink => event
                .meta_str("content")
                .map(contains_blocked_link)
                .unwrap_or(false),
            EventFilter::ContainsKeyword(keywords) => event
                .meta_str("content")
                .and_then(|content| matched_keyword(content, keywords))
                .is_some(),
            EventFilter::StaffLikeName => event
                .meta_str("new_name")
                .map(looks_like_staff)
                .unwrap_or(false),
            EventFilter::MinMentions(min) => {
                event.meta_u64("mention_count").unwrap_or(0) >= u64::from(*min)
            }
        }
    }
}
