use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use uuid::Uuid;

const TUNNEL_ID_PREFIX: &str = "th-";
const TUNNEL_ID_SUFFIX_LEN: usize = 6;

/// Generate a random tunnel ID for hosts that don't pick one
/// Format: "th-" followed by 6 lowercase alphanumeric characters
pub fn generate_tunnel_id() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TUNNEL_ID_SUFFIX_LEN)
        .map(|c| c.to_ascii_lowercase())
        .map(char::from)
        .collect();
    format!("{}{}", TUNNEL_ID_PREFIX, suffix)
}

/// Generate a unique request identifier using UUID v4
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate an identifier for one accepted transport connection
pub fn generate_connection_id() -> String {
    format!("conn_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_tunnel_id;
    use std::collections::HashSet;

    #[test]
    fn test_generate_tunnel_id_format() {
        let id = generate_tunnel_id();

        assert_eq!(id.len(), 9);
        assert!(id.starts_with("th-"));
        assert!(
            id[3..]
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        );
        assert!(validate_tunnel_id(&id).is_ok());
    }

    #[test]
    fn test_generate_request_id_is_v4() {
        let request_id = generate_request_id();
        let uuid = Uuid::parse_str(&request_id).unwrap();

        assert_eq!(request_id.len(), 36);
        assert_eq!(uuid.get_version_num(), 4);
    }

    #[test]
    fn test_generate_request_id_uniqueness() {
        let mut ids = HashSet::new();

        for _ in 0..1000 {
            let id = generate_request_id();
            assert!(ids.insert(id), "Generated duplicate request ID");
        }
    }

    #[test]
    fn test_generate_connection_id() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert!(a.starts_with("conn_"));
        assert_eq!(a.len(), 5 + 32);
        assert_ne!(a, b);
    }
}
