//! URL classifier: maps a raw story URL to a `site` identifier.
//!
//! Grounded in `root/app/auto_url_parsers.py`. The original generates regex
//! patterns at runtime by introspecting FanFicFare's adapter table; runtime
//! pattern generation is out of scope here, so this module ships a fixed
//! table covering the major sites plus the mandatory `other` fallback, and
//! stays a pure function over `&str`.

use regex::Regex;
use std::sync::LazyLock;

/// One recognizable site pattern.
struct SitePattern {
    site: &'static str,
    pattern: &'static str,
}

const PATTERNS: &[SitePattern] = &[
    SitePattern {
        site: "fanfiction",
        pattern: r"(?i)^https?://(?:www\.|m\.)?fanfiction\.net/s/(\d+)(?:/(\d+))?",
    },
    SitePattern {
        site: "ao3",
        pattern: r"(?i)^https?://(?:www\.)?archiveofourown\.org/works/(\d+)",
    },
    SitePattern {
        site: "royalroad",
        pattern: r"(?i)^https?://(?:www\.)?royalroad\.com/fiction/(\d+)",
    },
    SitePattern {
        site: "spacebattles",
        pattern: r"(?i)^https?://forums\.spacebattles\.com/threads/[^/]*\.(\d+)",
    },
    SitePattern {
        site: "sufficientvelocity",
        pattern: r"(?i)^https?://forums\.sufficientvelocity\.com/threads/[^/]*\.(\d+)",
    },
    SitePattern {
        site: "questionablequesting",
        pattern: r"(?i)^https?://forum\.questionablequesting\.com/threads/[^/]*\.(\d+)",
    },
];

struct CompiledPattern {
    site: &'static str,
    regex: Regex,
}

static COMPILED: LazyLock<Vec<CompiledPattern>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .map(|p| CompiledPattern {
            site: p.site,
            regex: Regex::new(p.pattern).expect("static classifier pattern must compile"),
        })
        .collect()
});

/// Result of classifying a URL: the recognized site, or `other` with the URL
/// normalized for storage/dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub site: String,
    pub normalized_url: String,
}

/// Classifies `url` against the static site table.
///
/// `fanfiction`-site URLs are normalized to chapter `/1/` (so chapter-specific
/// links in notification emails collapse to the same story identity) and
/// re-prefixed with `www.` if missing. Forum URLs have any trailing
/// page/post-suffix path segments stripped. Unrecognized URLs fall back to
/// `other`, with the `http(s)://` prefix stripped but the rest of the path
/// unchanged.
#[must_use]
pub fn classify(url: &str) -> Classification {
    for compiled in COMPILED.iter() {
        if compiled.regex.is_match(url) {
            let normalized = match compiled.site {
                "fanfiction" => normalize_fanfiction(url),
                "spacebattles" | "sufficientvelocity" | "questionablequesting" => {
                    strip_forum_suffix(url)
                }
                _ => url.to_string(),
            };
            return Classification {
                site: compiled.site.to_string(),
                normalized_url: normalized,
            };
        }
    }
    Classification {
        site: "other".to_string(),
        normalized_url: strip_protocol(url),
    }
}

fn strip_protocol(url: &str) -> String {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
        .to_string()
}

fn normalize_fanfiction(url: &str) -> String {
    static STORY_ID: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)^https?://(?:www\.|m\.)?fanfiction\.net/s/(\d+)").unwrap());
    let Some(caps) = STORY_ID.captures(url) else {
        return url.to_string();
    };
    let story_id = &caps[1];
    format!("https://www.fanfiction.net/s/{story_id}/1/")
}

fn strip_forum_suffix(url: &str) -> String {
    static THREAD: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)^(https?://[^/]+/threads/[^/]*\.\d+)").unwrap());
    THREAD
        .captures(url)
        .map_or_else(|| url.to_string(), |caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fanfiction_and_normalizes_chapter() {
        let c = classify("https://www.fanfiction.net/s/123456/7/Some-Title");
        assert_eq!(c.site, "fanfiction");
        assert_eq!(c.normalized_url, "https://www.fanfiction.net/s/123456/1/");
    }

    #[test]
    fn classifies_fanfiction_without_www_prefix() {
        let c = classify("https://fanfiction.net/s/42/3/Title");
        assert_eq!(c.site, "fanfiction");
        assert_eq!(c.normalized_url, "https://www.fanfiction.net/s/42/1/");
    }

    #[test]
    fn classifies_ao3() {
        let c = classify("https://archiveofourown.org/works/987654");
        assert_eq!(c.site, "ao3");
        assert_eq!(c.normalized_url, "https://archiveofourown.org/works/987654");
    }

    #[test]
    fn classifies_royalroad() {
        let c = classify("https://www.royalroad.com/fiction/12345/some-title");
        assert_eq!(c.site, "royalroad");
    }

    #[test]
    fn strips_forum_thread_suffix() {
        let c = classify("https://forums.spacebattles.com/threads/some-story.55555/page-9");
        assert_eq!(c.site, "spacebattles");
        assert_eq!(
            c.normalized_url,
            "https://forums.spacebattles.com/threads/some-story.55555"
        );
    }

    #[test]
    fn unrecognized_url_falls_back_to_other_with_protocol_stripped() {
        let c = classify("https://example.com/story/1");
        assert_eq!(c.site, "other");
        assert_eq!(c.normalized_url, "example.com/story/1");
    }

    #[test]
    fn unrecognized_plain_http_url_has_protocol_stripped_too() {
        let c = classify("http://example.com/story/1");
        assert_eq!(c.normalized_url, "example.com/story/1");
    }
}
