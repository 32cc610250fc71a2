use http::{HeaderMap, header};
use regex::Regex;
use std::sync::LazyLock;

static DEFAULT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^text/",
        r"^application/json",
        r"^application/javascript",
        r"\+(xml|json)$",
        r"^image/svg",
    ]
    .into_iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// The content types eligible for compression.
///
/// Patterns are matched, in order, against the media type of the
/// `Content-Type` header with its parameters stripped and lowercased, so
/// `Text/HTML; charset=utf-8` is checked as `text/html`.
#[derive(Debug, Clone)]
pub struct AllowList {
    patterns: Vec<Regex>,
}

impl AllowList {
    /// Creates an allow-list from `patterns`.
    pub fn new(patterns: impl IntoIterator<Item = Regex>) -> Self {
        Self {
            patterns: patterns.into_iter().collect(),
        }
    }

    /// Returns true if `content_type` matches at least one pattern.
    pub fn allows(&self, content_type: &str) -> bool {
        let media_type = media_type(content_type);
        self.patterns.iter().any(|re| re.is_match(&media_type))
    }

    /// Returns true if the headers declare a readable content type that
    /// matches at least one pattern.
    pub fn allows_headers(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| self.allows(ct))
    }

    /// The patterns, in matching order.
    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }
}

/// `text/*`, `application/json`, `application/javascript`, anything ending in
/// `+xml` or `+json`, and `image/svg*`.
impl Default for AllowList {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.clone(),
        }
    }
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}
