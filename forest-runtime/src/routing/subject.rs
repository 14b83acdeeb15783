//! Dot-delimited subject algebra: validation and wildcard matching.

use crate::status::{ErrorKind, ForestError};

/// Heartbeat subject published by the conductor and counted by ceremonies.
pub const BEAT_SUBJECT: &str = "dance.beat";

/// Prefix under which human replies re-enter the forest, suffixed by the
/// correlation id of the outbound message.
pub const HUMAN_RESPONSE_PREFIX: &str = "human.response";

/// Subject prefixes owned by the substrate. Components may subscribe to
/// them but must not claim them as output subjects.
const RESERVED_PREFIXES: [&str; 4] = ["river", "humus", "soil", HUMAN_RESPONSE_PREFIX];

fn valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii() && b != b'.' && b != b' ' && b != b'*' && b != b'>')
}

/// Validates a concrete (publishable) subject: non-empty ASCII dot tokens,
/// no wildcards.
pub fn validate_subject(subject: &str) -> Result<(), ForestError> {
    if subject.is_empty() {
        return Err(ForestError::fail_with_kind(
            ErrorKind::ConfigInvalid,
            "subject must not be empty",
        ));
    }
    for token in subject.split('.') {
        if !valid_token(token) {
            return Err(ForestError::fail_with_kind(
                ErrorKind::ConfigInvalid,
                format!("invalid subject token in {subject:?}"),
            ));
        }
    }
    Ok(())
}

/// Validates a subscription pattern: concrete tokens, `*` for one token,
/// `>` only in the trailing position.
pub fn validate_pattern(pattern: &str) -> Result<(), ForestError> {
    if pattern.is_empty() {
        return Err(ForestError::fail_with_kind(
            ErrorKind::ConfigInvalid,
            "pattern must not be empty",
        ));
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (index, token) in tokens.iter().enumerate() {
        match *token {
            "*" => {}
            ">" => {
                if index + 1 != tokens.len() {
                    return Err(ForestError::fail_with_kind(
                        ErrorKind::ConfigInvalid,
                        format!("'>' must be the trailing token in {pattern:?}"),
                    ));
                }
            }
            other => {
                if !valid_token(other) {
                    return Err(ForestError::fail_with_kind(
                        ErrorKind::ConfigInvalid,
                        format!("invalid pattern token in {pattern:?}"),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// True when `subject` falls under a substrate-owned prefix or is the
/// conductor's beat subject.
pub fn is_reserved_subject(subject: &str) -> bool {
    if subject == BEAT_SUBJECT {
        return true;
    }
    RESERVED_PREFIXES.iter().any(|prefix| {
        subject == *prefix
            || (subject.len() > prefix.len()
                && subject.starts_with(prefix)
                && subject.as_bytes()[prefix.len()] == b'.')
    })
}

/// Token-wise wildcard match of a concrete subject against a pattern.
///
/// `*` consumes exactly one token; `>` consumes one or more trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    tokens_match(pattern.split('.'), subject.split('.'))
}

/// Wildcard match over `/`-separated state keys, same token algebra as
/// subjects. Used by Soil watches.
pub fn key_matches(pattern: &str, key: &str) -> bool {
    tokens_match(pattern.split('/'), key.split('/'))
}

fn tokens_match<'a>(
    mut pattern_tokens: impl Iterator<Item = &'a str>,
    mut subject_tokens: impl Iterator<Item = &'a str>,
) -> bool {
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        is_reserved_subject, subject_matches, validate_pattern, validate_subject, BEAT_SUBJECT,
    };
    use crate::status::ErrorKind;

    #[test]
    fn literal_patterns_match_only_themselves() {
        assert!(subject_matches("payment.completed", "payment.completed"));
        assert!(!subject_matches("payment.completed", "payment.failed"));
        assert!(!subject_matches("payment.completed", "payment.completed.eu"));
        assert!(!subject_matches("payment.completed.eu", "payment.completed"));
    }

    #[test]
    fn star_matches_exactly_one_token() {
        assert!(subject_matches("river.*.webhook", "river.stripe.webhook"));
        assert!(!subject_matches("river.*.webhook", "river.webhook"));
        assert!(!subject_matches("river.*", "river.stripe.webhook"));
    }

    #[test]
    fn gt_matches_one_or_more_trailing_tokens() {
        assert!(subject_matches("river.>", "river.stripe"));
        assert!(subject_matches("river.>", "river.stripe.webhook.eu"));
        assert!(!subject_matches("river.>", "river"));
        assert!(!subject_matches("river.>", "humus.tasks"));
    }

    #[test]
    fn validate_subject_rejects_wildcards_and_empty_tokens() {
        assert!(validate_subject("payment.completed").is_ok());
        let err = validate_subject("payment.*").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(validate_subject("payment..completed").is_err());
        assert!(validate_subject("").is_err());
    }

    #[test]
    fn validate_pattern_requires_trailing_gt() {
        assert!(validate_pattern("river.>").is_ok());
        assert!(validate_pattern("river.*.webhook").is_ok());
        assert!(validate_pattern("river.>.webhook").is_err());
        assert!(validate_pattern("").is_err());
    }

    #[test]
    fn reserved_prefixes_cover_substrate_subjects() {
        assert!(is_reserved_subject("river.stripe.webhook"));
        assert!(is_reserved_subject("humus.tasks.followup"));
        assert!(is_reserved_subject("soil.counter"));
        assert!(is_reserved_subject("human.response.abc"));
        assert!(is_reserved_subject(BEAT_SUBJECT));
        assert!(!is_reserved_subject("payment.completed"));
        assert!(!is_reserved_subject("riverbed.level"));
    }
}
