// Session Keys
// Stable keys for persisting agent session ids across movement runs

/// Session key for an ordinary movement
pub fn session_key(piece: &str, movement: &str) -> String {
    format!("{piece}/{movement}")
}

/// Session key for a named branch of a fan-out (parallel sub-movement)
pub fn branch_session_key(piece: &str, movement: &str, branch: &str) -> String {
    format!("{piece}/{movement}/{branch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(session_key("suite", "plan"), "suite/plan");
        assert_eq!(
            branch_session_key("suite", "audit", "security"),
            "suite/audit/security"
        );
    }

    #[test]
    fn test_branch_keys_are_disjoint_from_movement_keys() {
        assert_ne!(
            session_key("suite", "audit"),
            branch_session_key("suite", "audit", "security")
        );
    }
}
