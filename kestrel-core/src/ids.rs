//! Agent-scoped correlation identifiers.
//!
//! Correlation ids let one agent recognize its own orders on a shared
//! account. The id is a 128-bit hex token: the first eight hex characters
//! are a stable prefix derived from the agent's uuid, the remainder is
//! fresh entropy per order.

use uuid::Uuid;

/// Length of the agent-specific prefix, in hex characters.
const PREFIX_HEX_LEN: usize = 8;

/// Stable per-agent prefix used in every correlation id the agent emits.
#[must_use]
pub fn agent_prefix(agent_id: Uuid) -> String {
    let hex = agent_id.simple().to_string();
    hex[..PREFIX_HEX_LEN].to_string()
}

/// Generates a fresh correlation id for an order placed by `agent_id`.
///
/// The format is `0x` followed by 32 hex characters, matching the venue's
/// client-order-id shape.
#[must_use]
pub fn new_correlation_id(agent_id: Uuid) -> String {
    let entropy = Uuid::new_v4().simple().to_string();
    format!("0x{}{}", agent_prefix(agent_id), &entropy[PREFIX_HEX_LEN..])
}

/// Whether `correlation_id` was generated by the agent with `agent_id`.
#[must_use]
pub fn owns_correlation_id(agent_id: Uuid, correlation_id: &str) -> bool {
    correlation_id
        .strip_prefix("0x")
        .is_some_and(|hex| hex.starts_with(&agent_prefix(agent_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_shape_is_0x_plus_32_hex() {
        let id = new_correlation_id(Uuid::new_v4());
        assert!(id.starts_with("0x"));
        assert_eq!(id.len(), 34);
        assert!(id[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ownership_is_prefix_scoped() {
        let mine = Uuid::new_v4();
        let theirs = Uuid::new_v4();
        let id = new_correlation_id(mine);
        assert!(owns_correlation_id(mine, &id));
        assert!(!owns_correlation_id(theirs, &id));
    }

    #[test]
    fn malformed_ids_are_never_owned() {
        let agent = Uuid::new_v4();
        assert!(!owns_correlation_id(agent, "deadbeef"));
        assert!(!owns_correlation_id(agent, ""));
    }

    #[test]
    fn ids_are_unique_per_call() {
        let agent = Uuid::new_v4();
        assert_ne!(new_correlation_id(agent), new_correlation_id(agent));
    }
}
