//! Topic naming and wildcard matching.
//!
//! Topics have the shape `<integrationId>.<stage>.<entityType>`. Subscription
//! patterns may use `*`, which matches one or more characters (including
//! dots), and `?`, which matches exactly one.

use super::BusError;
use super::envelope::Stage;

pub fn build_topic(integration_id: &str, stage: Stage, entity_type: &str) -> String {
    format!("{integration_id}.{}.{entity_type}", stage.as_str())
}

/// Pattern matching every topic of one stage across integrations and types.
pub fn stage_pattern(stage: Stage) -> String {
    format!("*.{}.*", stage.as_str())
}

/// Splits a topic into its parts. The integration id may itself contain dots;
/// stage and entity type are always the last two segments.
pub fn parse_topic(topic: &str) -> Option<(&str, Stage, &str)> {
    let mut parts = topic.rsplitn(3, '.');
    let entity_type = parts.next()?;
    let stage = Stage::parse(parts.next()?)?;
    let integration_id = parts.next()?;
    if integration_id.is_empty() || entity_type.is_empty() {
        return None;
    }
    Some((integration_id, stage, entity_type))
}

pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.contains(['*', '?']) || parse_topic(topic).is_none() {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    if pattern.trim().is_empty() || pattern.split('.').any(str::is_empty) {
        return Err(BusError::InvalidPattern(pattern.to_string()));
    }
    Ok(())
}

pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    glob_match(pattern.as_bytes(), topic.as_bytes())
}

fn glob_match(pat: &[u8], text: &[u8]) -> bool {
    // Iterative matcher; backtracks by growing the span of the last '*'.
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star_pi: Option<usize> = None;
    let mut star_ti: Option<usize> = None;

    while ti < text.len() {
        if pi < pat.len() && (pat[pi] == b'?' || (pat[pi] != b'*' && pat[pi] == text[ti])) {
            pi += 1;
            ti += 1;
            continue;
        }

        if pi < pat.len() && pat[pi] == b'*' {
            // '*' never matches the empty string.
            star_pi = Some(pi);
            pi += 1;
            ti += 1;
            star_ti = Some(ti);
            continue;
        }

        if let (Some(sp), Some(st)) = (star_pi, star_ti) {
            pi = sp + 1;
            ti = st + 1;
            star_ti = Some(ti);
            continue;
        }

        return false;
    }

    pi == pat.len()
}
