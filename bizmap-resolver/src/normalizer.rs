//! Text canonicalisation for name and phone comparison
//!
//! Pure functions, no I/O. `normalize_name` is idempotent: feeding its output
//! back in yields the same string.

/// Generic business/type words and conjunctions dropped before comparison
pub const FILLER_TOKENS: &[&str] = &["restaurant", "chinese", "buffet", "and", "inc", "llc"];

/// Canonical form of a business name.
///
/// Lowercases, drops apostrophes (so "Ming's" stays one token), turns all
/// other punctuation into separators, removes [`FILLER_TOKENS`] and collapses
/// whitespace.
pub fn normalize_name(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .filter(|c| *c != '\'' && *c != '\u{2019}')
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|token| !FILLER_TOKENS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Digits only; empty when the input carries none
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Name used for similarity scoring.
///
/// A name made entirely of filler ("Chinese Buffet") would normalise to the
/// empty string and match every other all-filler name; fall back to the
/// plain lowercase form instead.
pub fn comparison_name(name: &str) -> String {
    let normalized = normalize_name(name);
    if normalized.is_empty() {
        name.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name_strips_filler() {
        assert_eq!(normalize_name("ABC Buffet & Grill"), "abc grill");
        assert_eq!(normalize_name("Golden Dragon Chinese Restaurant, Inc."), "golden dragon");
        assert_eq!(normalize_name("  Panda   and  Tiger  "), "panda tiger");
    }

    #[test]
    fn test_normalize_name_keeps_words_containing_filler() {
        // Token-level removal: "Brandon" must not lose its "and"
        assert_eq!(normalize_name("Brandon Buffet"), "brandon");
        assert_eq!(normalize_name("Incredible Wok"), "incredible wok");
    }

    #[test]
    fn test_normalize_name_apostrophes() {
        assert_eq!(normalize_name("Ming's Palace"), "mings palace");
        assert_eq!(normalize_name("Ming\u{2019}s Palace"), "mings palace");
    }

    #[test]
    fn test_normalize_name_idempotent() {
        let inputs = [
            "ABC Buffet & Grill",
            "Hibachi Grill & Supreme Buffet",
            "China King (Main St.)",
            "Ming's",
            "",
            "   ",
            "Buffet and Restaurant",
            "Café Lotus #2",
        ];
        for input in inputs {
            let once = normalize_name(input);
            assert_eq!(normalize_name(&once), once, "not idempotent for {:?}", input);
        }
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("(512) 555-0199"), "5125550199");
        assert_eq!(normalize_phone("+1 512.555.0199"), "15125550199");
        assert_eq!(normalize_phone("n/a"), "");
    }

    #[test]
    fn test_comparison_name_fallback() {
        assert_eq!(comparison_name("Chinese Buffet"), "chinese buffet");
        assert_eq!(comparison_name("Golden Buffet"), "golden");
    }
}
