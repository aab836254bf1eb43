//! Subscription-time topic pattern matching.
//!
//! Subscriptions use the broker's wildcard grammar: `+` matches exactly one
//! level, a trailing `#` matches the remainder of the topic (zero or more
//! levels). This is deliberately separate from the [`TopicClassifier`]'s
//! Exact/Prefix routing: classification picks a handler, this decides what
//! the broker delivers at all.
//!
//! [`TopicClassifier`]: ../../pourlink_processor/classifier/index.html

/// Return `true` when `topic` is covered by the subscription `pattern`.
///
/// Rules, matching the usual MQTT semantics:
///
/// * Levels are separated by `/`.
/// * `+` matches any single level.
/// * `#` is only valid as the final level and matches the rest of the topic,
///   including the parent itself (`scale/#` matches `scale`).
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (Some(_), _) => return false,
            // Pattern exhausted: match only if the topic is too, or the next
            // pattern level would have been a lone "#" (handled above).
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}

/// Return `true` when any pattern in `patterns` covers `topic`.
pub fn any_pattern_matches<'a, I>(patterns: I, topic: &str) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    patterns.into_iter().any(|p| pattern_matches(p, topic))
}
