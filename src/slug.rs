// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use sha2::{Digest, Sha256};

const SLUG_LEN: usize = 32;

/// Derive a deterministic, URL-safe, collision-resistant destination href
/// for a source event UID: `sha256(uid)` hex-encoded and truncated, joined
/// under the calendar href as `<slug>.ics`.
pub fn destination_href(calendar_href: &str, uid: &str) -> String {
    let slug = uid_slug(uid);
    let base = calendar_href.trim_end_matches('/');
    format!("{base}/{slug}.ics")
}

fn uid_slug(uid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uid.as_bytes());
    let digest = hasher.finalize();
    let mut hex = hex::encode(digest);
    hex.truncate(SLUG_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_deterministic() {
        assert_eq!(uid_slug("A@x"), uid_slug("A@x"));
    }

    #[test]
    fn differs_across_uids() {
        assert_ne!(uid_slug("A@x"), uid_slug("B@x"));
    }

    #[test]
    fn is_url_safe_hex() {
        let slug = uid_slug("weird uid with spaces/and/slashes");
        assert!(slug.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(slug.len(), SLUG_LEN);
    }

    #[test]
    fn joins_under_calendar_href_without_double_slash() {
        let href = destination_href("/calendars/user/personal/", "A@x");
        assert_eq!(href, format!("/calendars/user/personal/{}.ics", uid_slug("A@x")));
    }
}
