//! Key layout on the shared key-value store.
//!
//! ```text
//! lock: <pid>          presence flag, TTL = lock ceiling
//! hashes: <pid>        JSON known-hash table, no TTL
//! <pid> -> <node id>   tombstone ("written" / "deleted"), short TTL
//! error <pid>          last fatal error, short TTL
//! jobs | <queue> jobs  FIFO of JSON job payloads
//! ```

/// Queue used when a job names no queue.
pub const DEFAULT_QUEUE_KEY: &str = "jobs";

#[must_use]
pub fn lock_key(persistent_id: &str) -> String {
    format!("lock: {persistent_id}")
}

#[must_use]
pub fn known_hashes_key(persistent_id: &str) -> String {
    format!("hashes: {persistent_id}")
}

#[must_use]
pub fn tombstone_key(persistent_id: &str, node_id: &str) -> String {
    format!("{persistent_id} -> {node_id}")
}

#[must_use]
pub fn error_key(persistent_id: &str) -> String {
    format!("error {persistent_id}")
}

#[must_use]
pub fn queue_key(queue: &str) -> String {
    if queue.is_empty() {
        DEFAULT_QUEUE_KEY.to_string()
    } else {
        format!("{queue} jobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(lock_key("doi:10.5072/FK2"), "lock: doi:10.5072/FK2");
        assert_eq!(known_hashes_key("doi:1"), "hashes: doi:1");
        assert_eq!(tombstone_key("doi:1", "data/a.csv"), "doi:1 -> data/a.csv");
        assert_eq!(error_key("doi:1"), "error doi:1");
    }

    #[test]
    fn test_queue_key() {
        assert_eq!(queue_key(""), "jobs");
        assert_eq!(queue_key("gpu"), "gpu jobs");
    }
}
