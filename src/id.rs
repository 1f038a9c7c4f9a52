use std::time::{SystemTime, UNIX_EPOCH};

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::constants::HOST_NAME_PREFIX;

/// Short opaque id for connection-scoped log lines.
pub fn connection_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// `<prefix>-<unix-epoch-seconds>`.
pub fn host_name() -> String {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{HOST_NAME_PREFIX}{epoch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_short_and_distinct() {
        let a = connection_id();
        let b = connection_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn host_name_has_fixed_prefix() {
        let name = host_name();
        assert!(name.starts_with(HOST_NAME_PREFIX));
        let suffix = &name[HOST_NAME_PREFIX.len()..];
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }
}
