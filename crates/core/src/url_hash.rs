use sha2::{Digest, Sha256};

/// Deterministic identity for a URL within a crawl's lock table.
///
/// Trailing slashes and fragment identifiers are stripped before hashing
/// so `https://a.com/p` and `https://a.com/p#section` collide to the same
/// lock, matching how link extraction treats in-page anchors as the same
/// page.
pub fn hash_url(url: &str) -> String {
    let normalized = normalize(url);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("url:{:x}", hasher.finalize())[..20].to_string()
}

fn normalize(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let trimmed = without_fragment.trim_end_matches('/');
    trimmed.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fragment_and_trailing_slash() {
        assert_eq!(hash_url("https://a.com/p/"), hash_url("https://a.com/p#section"));
    }

    #[test]
    fn is_case_insensitive_on_host() {
        assert_eq!(hash_url("https://A.com/p"), hash_url("https://a.com/p"));
    }

    #[test]
    fn distinct_paths_hash_differently() {
        assert_ne!(hash_url("https://a.com/p"), hash_url("https://a.com/q"));
    }
}
