use easy_ext::ext;
use url::Url;

#[ext(UrlExt)]
pub(crate) impl Url {
    /// See [`host_matches_domain`]
    fn matches_domain(&self, domain: &str) -> bool {
        self.host_str()
            .is_some_and(|host| host_matches_domain(host, domain))
    }
}

/// Returns `true` if `host` is the `domain` itself or any of its subdomains.
///
/// `www.youtube.com` matches `youtube.com`, but `evilyoutube.com` doesn't.
pub(crate) fn host_matches_domain(host: &str, domain: &str) -> bool {
    let host = normalize_host(host);
    let domain = normalize_host(domain);

    if domain.is_empty() {
        return false;
    }

    if host.eq_ignore_ascii_case(domain) {
        return true;
    }

    let Some(prefix_len) = host.len().checked_sub(domain.len() + 1) else {
        return false;
    };

    if !host.is_char_boundary(prefix_len) {
        return false;
    }

    let (prefix, suffix) = host.split_at(prefix_len);

    !prefix.is_empty()
        && suffix.as_bytes()[0] == b'.'
        && suffix[1..].eq_ignore_ascii_case(domain)
}

/// Fully-qualified hosts may end with a dot
fn normalize_host(host: &str) -> &str {
    host.trim_end_matches('.')
}

/// Finds all `http(s)` links in the free-form text in the order of their
/// appearance. Trailing punctuation that is likely not a part of the link
/// is stripped.
pub(crate) fn extract_urls(text: &str) -> Vec<Url> {
    lazy_regex::regex!(r"(?i)\bhttps?://[^\s<>]+")
        .find_iter(text)
        .filter_map(|candidate| {
            let candidate = candidate
                .as_str()
                .trim_end_matches(|char: char| ".,;:!?)]}'\"»".contains(char));
            Url::parse(candidate).ok()
        })
        .filter(|url| url.host_str().is_some())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::{expect, Expect};

    #[test]
    fn domain_matching() {
        let cases = [
            ("youtube.com", "youtube.com", true),
            ("www.youtube.com", "youtube.com", true),
            ("m.youtube.com", "youtube.com", true),
            ("WWW.YouTube.com", "youtube.com", true),
            ("www.youtube.com.", "youtube.com", true),
            ("evilyoutube.com", "youtube.com", false),
            ("youtube.com.evil.net", "youtube.com", false),
            ("x.com", "x.com", true),
            ("mobile.x.com", "x.com", true),
            ("fox.com", "x.com", false),
            ("netflix.com", "x.com", false),
            (".x.com", "x.com", false),
            ("com", "x.com", false),
            ("x.com", "", false),
        ];

        for (host, domain, expected) in cases {
            assert_eq!(
                host_matches_domain(host, domain),
                expected,
                "host: {host}, domain: {domain}"
            );
        }
    }

    #[track_caller]
    fn assert_extract(text: &str, expected: Expect) {
        let actual: Vec<_> = extract_urls(text).iter().map(Url::to_string).collect();
        expected.assert_debug_eq(&actual);
    }

    #[test]
    fn url_extraction() {
        assert_extract(
            "look (https://www.youtube.com/watch?v=dQw4w9WgXcQ), and http://x.com/a/status/1.",
            expect![[r#"
                [
                    "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                    "http://x.com/a/status/1",
                ]
            "#]],
        );
        assert_extract("no links here, just youtube.com", expect![[r#"
            []
        "#]]);
        assert_extract("HTTPS://Example.COM/Path", expect![[r#"
            [
                "https://example.com/Path",
            ]
        "#]]);
    }
}
