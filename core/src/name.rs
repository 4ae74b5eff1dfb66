use sha1::{Digest, Sha1};

const SHORT_HASH: usize = 6;

/// Joins `parts` with `/`, shortening components from the right until the
/// result fits within `limit` characters. Shortened components keep a
/// prefix of their text plus a suffix derived from a hash of the *entire*
/// joined name, so distinct long names stay distinct after shortening.
pub fn hashname(limit: usize, parts: &[&str]) -> String {
    let joined = parts.join("/");
    if limit > joined.len() {
        return joined;
    }

    let hash = hex(&Sha1::digest(joined.as_bytes()));
    let suffix = &hash[..SHORT_HASH];
    let budget = limit / parts.len();

    let mut parts: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
    let mut joined = String::new();
    for n in (0..parts.len()).rev() {
        parts[n] = truncate(budget, &parts[n], suffix);
        joined = parts.join("/");
        if limit > joined.len() {
            break;
        }
    }
    joined
}

/// Shortens `s` to at most `limit` characters by replacing its tail with
/// `-suffix`.
fn truncate(limit: usize, s: &str, suffix: &str) -> String {
    if limit >= s.len() {
        return s.to_string();
    }
    let keep = limit.saturating_sub(suffix.len() + 1);
    format!("{}-{}", &s[..keep], suffix)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        out.push_str(&format!("{b:02x}"));
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_pass_through() {
        assert_eq!(
            hashname(60, &["default", "kuard", "443"]),
            "default/kuard/443"
        );
    }

    #[test]
    fn long_names_fit_the_limit_and_stay_distinct() {
        let a = hashname(
            60,
            &[
                "beurocratic-company-test-domain-1",
                "tiny-cog-department-test-instance",
                "443",
                "da39a3ee5e",
            ],
        );
        let b = hashname(
            60,
            &[
                "beurocratic-company-test-domain-2",
                "tiny-cog-department-test-instance",
                "443",
                "da39a3ee5e",
            ],
        );
        assert!(a.len() <= 60, "{a}");
        assert!(b.len() <= 60, "{b}");
        assert_ne!(a, b);

        // The port and configuration hash survive untouched; only the
        // verbose components are shortened.
        assert!(a.ends_with("/443/da39a3ee5e"), "{a}");
        assert!(a.starts_with("beurocra-"), "{a}");
    }

    #[test]
    fn shortening_is_deterministic() {
        let long = "a-very-long-fully-qualified-domain-name.engineering.example.com.internal";
        assert_eq!(hashname(60, &[long]), hashname(60, &[long]));
        assert!(hashname(60, &[long]).len() <= 60);
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex(&[0xda, 0x39, 0xa3]), "da39a3");
        assert_eq!(hex(&[]), "");
    }
}
