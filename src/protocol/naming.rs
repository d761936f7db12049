//! Agent name normalization and queue/routing-key derivation
//!
//! Normalization lowercases the name, trims it, and collapses every run of
//! whitespace into a single underscore. It is idempotent. Names that differ
//! only in case or whitespace normalize to the same form; the registry treats
//! two distinct names with the same normalized form as a collision.

use thiserror::Error;

/// AMQP short-string limit for queue names
pub const MAX_QUEUE_NAME_LEN: usize = 255;

pub fn normalize_agent_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut pending_separator = false;

    for ch in name.trim().chars() {
        if ch.is_whitespace() {
            pending_separator = true;
            continue;
        }
        if pending_separator {
            normalized.push('_');
            pending_separator = false;
        }
        normalized.extend(ch.to_lowercase());
    }

    normalized
}

/// `agent_{normalized}_queue`
pub fn queue_name(agent_name: &str) -> String {
    format!("agent_{}_queue", normalize_agent_name(agent_name))
}

/// `agent.{normalized}`
pub fn routing_key(agent_name: &str) -> String {
    format!("agent.{}", normalize_agent_name(agent_name))
}

/// Dead-letter queue paired with an agent queue
pub fn dead_letter_queue_name(agent_name: &str) -> String {
    format!("{}.dead_letter", queue_name(agent_name))
}

/// Check that a name produces a usable queue name and an exact-match routing key
pub fn validate_agent_name(agent_name: &str) -> Result<(), NameError> {
    let normalized = normalize_agent_name(agent_name);
    if normalized.is_empty() {
        return Err(NameError::Empty);
    }

    if let Some(ch) = normalized.chars().find(|c| matches!(c, '*' | '#')) {
        return Err(NameError::WildcardChar(ch));
    }

    if let Some(ch) = normalized.chars().find(|c| c.is_control()) {
        return Err(NameError::ControlChar(ch));
    }

    let derived = dead_letter_queue_name(agent_name);
    if derived.len() > MAX_QUEUE_NAME_LEN {
        return Err(NameError::TooLong(derived.len()));
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum NameError {
    #[error("Agent name cannot be empty")]
    Empty,
    #[error("Agent name contains routing wildcard '{0}'")]
    WildcardChar(char),
    #[error("Agent name contains control character {0:?}")]
    ControlChar(char),
    #[error("Derived queue name is {0} bytes, above the 255 byte limit")]
    TooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalization_is_idempotent(name in ".*") {
            let first = normalize_agent_name(&name);
            let second = normalize_agent_name(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn normalized_names_have_no_whitespace(name in ".*") {
            let normalized = normalize_agent_name(&name);
            prop_assert!(!normalized.chars().any(char::is_whitespace), "{}", normalized);
        }

        #[test]
        fn distinct_normalized_forms_give_distinct_queues(a in "[a-z0-9 _-]{1,16}", b in "[a-z0-9 _-]{1,16}") {
            prop_assume!(normalize_agent_name(&a) != normalize_agent_name(&b));
            prop_assert_ne!(queue_name(&a), queue_name(&b));
            prop_assert_ne!(routing_key(&a), routing_key(&b));
        }
    }

    #[test]
    fn test_reference_names() {
        assert_eq!(normalize_agent_name("Agent A"), "agent_a");
        assert_eq!(queue_name("Agent A"), "agent_agent_a_queue");
        assert_eq!(routing_key("Agent A"), "agent.agent_a");
        assert_eq!(queue_name("NewsDirector"), "agent_newsdirector_queue");
    }

    #[test]
    fn test_whitespace_runs_collapse() {
        assert_eq!(normalize_agent_name("  News \t Director  "), "news_director");
        assert_eq!(normalize_agent_name("a\nb"), "a_b");
    }

    #[test]
    fn test_documented_collisions() {
        // Case and whitespace variants share one queue.
        assert_eq!(queue_name("Agent A"), queue_name("agent  a"));
        // An explicit underscore is indistinguishable from whitespace.
        assert_eq!(queue_name("Agent A"), queue_name("agent_a"));
        assert_ne!(queue_name("Agent A"), queue_name("Agent B"));
    }

    #[test]
    fn test_dead_letter_queue_name() {
        assert_eq!(
            dead_letter_queue_name("Agent A"),
            "agent_agent_a_queue.dead_letter"
        );
    }

    #[test]
    fn test_validate_agent_name() {
        assert!(validate_agent_name("Agent A").is_ok());
        assert!(validate_agent_name("news.director").is_ok());
        assert_eq!(validate_agent_name("   "), Err(NameError::Empty));
        assert_eq!(validate_agent_name("agent*"), Err(NameError::WildcardChar('*')));
        assert_eq!(validate_agent_name("#all"), Err(NameError::WildcardChar('#')));
        assert!(matches!(
            validate_agent_name(&"x".repeat(300)),
            Err(NameError::TooLong(_))
        ));
    }
}
