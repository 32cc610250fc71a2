/// Picks the response encoding from a request's `Accept-Encoding` header.
pub trait Negotiator: Send + Sync {
    /// Chooses one of `candidates`, which are ordered most preferred first.
    ///
    /// `accept_encoding` is `None` when the request carries no (or an
    /// unreadable) `Accept-Encoding` header. The returned name must be one of
    /// the candidates.
    fn choose<'a>(
        &self,
        accept_encoding: Option<&str>,
        candidates: &'a [String],
    ) -> Option<&'a str>;
}

/// Standard quality-value negotiation.
///
/// The header value is expected to be comma-separated encodings with optional
/// quality values (e.g., "gzip, br;q=1.0, zstd;q=0.8"). `*` stands for every
/// encoding not listed explicitly and `q=0` rules an encoding out. When the
/// client weighs several candidates equally, candidate order decides.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityNegotiator;

impl Negotiator for QualityNegotiator {
    fn choose<'a>(
        &self,
        accept_encoding: Option<&str>,
        candidates: &'a [String],
    ) -> Option<&'a str> {
        let header = accept_encoding?;
        let prefs: Vec<(&str, f32)> = header
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(parse_encoding_with_quality)
            .collect();

        let wildcard = prefs
            .iter()
            .find(|(encoding, _)| *encoding == "*")
            .map(|(_, quality)| *quality);

        let mut best: Option<(&'a str, f32)> = None;
        for candidate in candidates {
            let explicit = prefs
                .iter()
                .find(|(encoding, _)| same_coding(encoding, candidate))
                .map(|(_, quality)| *quality);
            let Some(quality) = explicit.or(wildcard) else {
                continue;
            };

            // Skip if quality is 0
            if quality <= 0.0 {
                continue;
            }

            match best {
                Some((_, best_quality)) if quality <= best_quality => {}
                _ => best = Some((candidate.as_str(), quality)),
            }
        }

        best.map(|(encoding, _)| encoding)
    }
}

fn same_coding(requested: &str, candidate: &str) -> bool {
    unalias(requested).eq_ignore_ascii_case(unalias(candidate))
}

fn unalias(coding: &str) -> &str {
    if coding.eq_ignore_ascii_case("x-gzip") {
        "gzip"
    } else {
        coding
    }
}

/// Parses an encoding entry like "gzip" or "br;q=0.8" into (encoding, quality).
fn parse_encoding_with_quality(s: &str) -> (&str, f32) {
    let mut parts = s.split(';');
    let encoding = parts.next().unwrap_or("").trim();

    // an unreadable q-value counts as q=0
    let quality = parts
        .find_map(|param| {
            let param = param.trim();
            param.strip_prefix("q=").or_else(|| param.strip_prefix("Q="))
        })
        .map(|value| match value.trim().parse::<f32>() {
            Ok(q) if q.is_finite() => q.clamp(0.0, 1.0),
            _ => 0.0,
        })
        .unwrap_or(1.0);

    (encoding, quality)
}
