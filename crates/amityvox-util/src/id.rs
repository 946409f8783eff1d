use ulid::Ulid;

/// Generate a new 26-char lexicographic instance/event/entity ID.
pub fn generate() -> String {
    Ulid::new().to_string()
}

/// Validate that a string is a well-formed ULID.
pub fn is_valid(id: &str) -> bool {
    Ulid::from_string(id).is_ok()
}

/// Extract the embedded Unix timestamp (ms) from an ID.
pub fn timestamp_millis(id: &str) -> Option<u64> {
    Ulid::from_string(id).ok().map(|u| u.timestamp_ms())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_26_chars() {
        let id = generate();
        assert_eq!(id.len(), 26);
        assert!(is_valid(&id));
    }

    #[test]
    fn ids_sort_lexicographically_by_time() {
        let a = generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate();
        assert!(a < b);
    }

    #[test]
    fn rejects_garbage() {
        assert!(!is_valid("not-a-ulid"));
        assert!(!is_valid(""));
    }
}
