/// URL extraction for the add-task box.
///
/// The GUI accepts pasted text with one or more media URLs; everything
/// http(s)-shaped is pulled out, deduplicated in order, and tagged with a
/// playlist hint. Which sites are actually downloadable is the engine's
/// business, not ours.
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// One URL pulled out of the submit text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedUrl {
    pub url: String,
    /// The URL looks like a playlist; the GUI preselects the playlist
    /// toggle for it.
    pub playlist_hint: bool,
}

/// Any http/https link embedded in free text.
static GENERIC_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>\[\](){},"']+"#).unwrap());

/// A whole line that is a bare domain with optional path, no scheme.
static BARE_DOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][\w.-]*\.[a-zA-Z]{2,}(?:/\S*)?$").unwrap());

/// Playlist-looking URLs: a list query parameter or a playlist path segment.
static PLAYLIST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?&]list=|/playlist\b|/album/|/favlist\b").unwrap());

/// Extract every distinct URL from pasted text, in order of appearance.
/// Lines that are a bare domain get an https scheme prepended.
pub fn extract_urls(text: &str) -> Vec<SubmittedUrl> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for line in text.lines() {
        let mut matched = false;
        for m in GENERIC_URL_RE.find_iter(line) {
            matched = true;
            push_unique(&mut urls, &mut seen, m.as_str().to_string());
        }

        if !matched {
            let trimmed = line.trim();
            if BARE_DOMAIN_RE.is_match(trimmed) {
                push_unique(&mut urls, &mut seen, format!("https://{}", trimmed));
            }
        }
    }

    urls
}

fn push_unique(urls: &mut Vec<SubmittedUrl>, seen: &mut HashSet<String>, url: String) {
    if seen.insert(url.clone()) {
        let playlist_hint = playlist_hint(&url);
        urls.push(SubmittedUrl { url, playlist_hint });
    }
}

/// Whether a URL looks like a playlist rather than a single item.
pub fn playlist_hint(url: &str) -> bool {
    PLAYLIST_RE.is_match(url)
}
