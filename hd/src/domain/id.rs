//! ID generation
//!
//! IDs are opaque strings: a kind prefix, a slug derived from human content,
//! and a time-ordered uuid suffix so lexical sort within a kind roughly
//! follows creation order.

use uuid::Uuid;

/// Maximum slug length kept in an id
const SLUG_MAX: usize = 40;

/// Generate an id like `task-fix-login-redirect-0192f3a81c2d`
pub fn generate_id(kind: &str, seed: &str) -> String {
    let slug = slugify(seed);
    let suffix = Uuid::now_v7().simple().to_string();
    if slug.is_empty() {
        format!("{}-{}", kind, &suffix[..12])
    } else {
        format!("{}-{}-{}", kind, slug, &suffix[..12])
    }
}

/// Lowercase alphanumeric words joined by single dashes, truncated
fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(SLUG_MAX);
    let mut last_dash = true;
    for ch in text.chars() {
        if slug.len() >= SLUG_MAX {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id("task", "Fix login redirect");
        assert!(id.starts_with("task-fix-login-redirect-"));
        assert_eq!(id.len(), "task-fix-login-redirect-".len() + 12);
    }

    #[test]
    fn test_generate_id_empty_seed() {
        let id = generate_id("run", "");
        assert!(id.starts_with("run-"));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = generate_id("task", "same seed");
        let b = generate_id("task", "same seed");
        assert_ne!(a, b);
    }

    #[test]
    fn test_slugify_collapses_punctuation() {
        assert_eq!(slugify("Add /api/v2 routes!!"), "add-api-v2-routes");
        assert_eq!(slugify("___"), "");
    }

    #[test]
    fn test_slug_truncated() {
        let long = "x".repeat(200);
        assert!(slugify(&long).len() <= SLUG_MAX);
    }
}
