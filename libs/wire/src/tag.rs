//! Write Tags

use uuid::Uuid;

/// Opaque correlation id for one optimistic write batch
pub type WriteTag = String;

/// Generate a fresh, collision-resistant write tag
pub fn generate_write_tag() -> WriteTag {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_unique() {
        let tags: std::collections::HashSet<_> = (0..1000).map(|_| generate_write_tag()).collect();
        assert_eq!(tags.len(), 1000);
    }
}
