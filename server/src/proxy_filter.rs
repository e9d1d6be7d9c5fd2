/// unblock-youku style extractor proxy selection.
///
/// Two upstream files drive the filter: `urls.js` carries shell-style URL
/// patterns (blacklist plus whitelist), `proxy.pac` carries the proxy
/// endpoint. Both are cached in the data dir for a week. A submitted URL
/// that matches the blacklist but not the whitelist gets the PAC proxy as
/// its extractor proxy.
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Cached rule files go stale after one week.
const RULES_EXPIRE_SECS: u64 = 60 * 60 * 24 * 7;
/// Per-request timeout for upstream fetches.
const FETCH_TIMEOUT_SECS: u64 = 30;

const URLS_FILENAME: &str = "urls.js";
const PAC_FILENAME: &str = "proxy.pac";

const UPSTREAM_URLS: &str =
    "https://raw.githubusercontent.com/zhuzhuor/Unblock-Youku/master/shared/urls.js";
const UPSTREAM_PAC: &str = "http://dns.umbridges2014.com/proxy.pac";

static PAC_PROXY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"_proxy_str\s*=\s*"PROXY ([^"]*)""#).unwrap());
static SECTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.(\w+_urls)\s*=").unwrap());
static QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"'([^']*)'|"([^"]*)""#).unwrap());

/// Compiled rule set. Whitelist wins over blacklist.
pub struct ProxyRules {
    blacklist: Regex,
    whitelist: Regex,
    proxy: Option<String>,
    pattern_count: usize,
}

impl ProxyRules {
    /// Nothing but http/https is ever proxied.
    fn should_proxy(&self, url: &str) -> bool {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return false;
        }
        if self.whitelist.is_match(url) {
            return false;
        }
        self.blacklist.is_match(url)
    }
}

/// Rule store shared between the refresh loop and task submission.
pub struct ProxyFilter {
    data_dir: PathBuf,
    http: reqwest::Client,
    rules: Mutex<Option<ProxyRules>>,
}

impl ProxyFilter {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            http: reqwest::Client::new(),
            rules: Mutex::new(None),
        }
    }

    /// Load rules from cache or upstream and install them. On failure the
    /// previously installed rules (if any) stay active.
    pub async fn refresh(&self) -> Result<String> {
        let urls_text = self
            .rule_text(UPSTREAM_URLS, URLS_FILENAME)
            .await
            .context("no URL rule data available")?;
        let pac_text = self.rule_text(UPSTREAM_PAC, PAC_FILENAME).await;

        let rules = build_rules(&urls_text, pac_text.as_deref())?;
        let summary = format!(
            "{} URL patterns, proxy {}",
            rules.pattern_count,
            rules.proxy.as_deref().unwrap_or("none")
        );
        info!("Proxy rules ready: {}", summary);
        *self.rules.lock().await = Some(rules);
        Ok(summary)
    }

    /// Proxy endpoint for a URL, or None when the filter is disabled, the
    /// URL is whitelisted, or nothing matches.
    pub async fn proxy_for(&self, url: &str) -> Option<String> {
        let guard = self.rules.lock().await;
        let rules = guard.as_ref()?;
        let proxy = rules.proxy.as_ref()?;
        if rules.should_proxy(url) {
            Some(proxy.clone())
        } else {
            None
        }
    }

    /// Cached file when fresh, otherwise a fetch with the cache as stale
    /// fallback. Returns None only when both fail.
    async fn rule_text(&self, upstream: &str, filename: &str) -> Option<String> {
        let path = self.data_dir.join(filename);
        if let Some(text) = read_fresh(&path) {
            debug!("Using cached {}", path.display());
            return Some(text);
        }
        match self.fetch(upstream).await {
            Ok(text) => {
                if let Err(e) = std::fs::write(&path, &text) {
                    warn!("Could not cache {}: {}", path.display(), e);
                }
                Some(text)
            }
            Err(e) => {
                warn!("Rule fetch from {} failed: {}", upstream, e);
                read_any(&path)
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let text = self
            .http
            .get(url)
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        if text.is_empty() {
            anyhow::bail!("empty response");
        }
        Ok(text)
    }
}

fn read_fresh(path: &Path) -> Option<String> {
    let meta = std::fs::metadata(path).ok()?;
    if meta.len() == 0 {
        return None;
    }
    let modified = meta.modified().ok()?;
    if !is_fresh(modified, SystemTime::now()) {
        return None;
    }
    std::fs::read_to_string(path).ok()
}

/// Stale fallback: any non-empty cached copy, age ignored.
fn read_any(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .filter(|text| !text.is_empty())
}

fn is_fresh(modified: SystemTime, now: SystemTime) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age < Duration::from_secs(RULES_EXPIRE_SECS),
        // mtime in the future, treat as fresh
        Err(_) => true,
    }
}

fn build_rules(urls_js: &str, pac: Option<&str>) -> Result<ProxyRules> {
    let lists = parse_urls_js(urls_js);
    if lists.black.is_empty() {
        anyhow::bail!("rule file held no URL patterns");
    }
    Ok(ProxyRules {
        pattern_count: lists.black.len() + lists.white.len(),
        blacklist: join_shell_patterns(&lists.black)?,
        whitelist: join_shell_patterns(&lists.white)?,
        proxy: pac.and_then(parse_pac_proxy),
    })
}

fn parse_pac_proxy(pac: &str) -> Option<String> {
    PAC_PROXY_RE
        .captures(pac)
        .map(|caps| caps[1].trim().to_string())
        .filter(|proxy| !proxy.is_empty())
}

#[derive(Debug, Default, PartialEq)]
struct RuleLists {
    black: Vec<String>,
    white: Vec<String>,
}

/// Pull the pattern arrays out of upstream's `urls.js`. The file assigns
/// string arrays to `unblock_youku.<name>_urls`; everything from the first
/// function definition on is script code and is ignored.
fn parse_urls_js(text: &str) -> RuleLists {
    let mut lists = RuleLists::default();
    let mut section: Option<String> = None;

    for raw in text.lines() {
        if raw.starts_with("function ") {
            break;
        }
        if raw.starts_with("/*")
            || raw.starts_with("//")
            || raw.starts_with(" *")
            || raw.starts_with("var ")
        {
            continue;
        }
        let line = strip_line_comment(raw);
        if let Some(caps) = SECTION_RE.captures(line) {
            section = Some(caps[1].to_string());
        }
        let bucket = match section.as_deref() {
            Some("common_urls") | Some("server_extra_urls") => &mut lists.black,
            Some("server_whitelist_urls") => &mut lists.white,
            _ => continue,
        };
        for caps in QUOTED_RE.captures_iter(line) {
            let pattern = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str());
            if let Some(pattern) = pattern {
                if !pattern.is_empty() {
                    bucket.push(pattern.to_string());
                }
            }
        }
    }
    lists
}

/// Cut a trailing `//` comment. A `//` right after `:` is a URL scheme
/// separator inside a pattern, not a comment.
fn strip_line_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut from = 0;
    while let Some(pos) = line[from..].find("//") {
        let at = from + pos;
        if at == 0 || bytes[at - 1] != b':' {
            return &line[..at];
        }
        from = at + 2;
    }
    line
}

/// Compile shell-style patterns into one alternation of anchored regexes.
fn join_shell_patterns(patterns: &[String]) -> Result<Regex> {
    if patterns.is_empty() {
        // matches nothing
        return Regex::new(r"[^\s\S]").context("empty pattern set");
    }
    let joined = patterns
        .iter()
        .map(|p| format!("^(?:{})$", shell_pattern_to_regex(p)))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&joined).context("compiling URL patterns")
}

/// fnmatch-style translation: `*` spans anything, `?` is one character,
/// everything else matches literally.
fn shell_pattern_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            ch if "\\.+()[]{}|^$".contains(ch) => {
                out.push('\\');
                out.push(ch);
            }
            ch => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_URLS_JS: &str = r#"/*
 * Sample rule data in the upstream layout.
 */

var unblock_youku = unblock_youku || {};

unblock_youku.common_urls = [
    '*://*.example.cn/*', // inline note survives stripping
    '*://v.video-site.com/serv*',
];
unblock_youku.server_whitelist_urls = [
    '*://www.example.cn/open/*'
];
unblock_youku.server_extra_urls = [
    '*://extra.example.cn/?'
];
function ignore_me() { return '*://never.example.cn/*'; }
"#;

    const SAMPLE_PAC: &str =
        r#"function FindProxyForURL(url, host) { var _proxy_str="PROXY 203.0.113.7:8888"; }"#;

    fn sample_rules() -> ProxyRules {
        build_rules(SAMPLE_URLS_JS, Some(SAMPLE_PAC)).unwrap()
    }

    #[test]
    fn test_parse_sections_and_comments() {
        let lists = parse_urls_js(SAMPLE_URLS_JS);
        assert_eq!(
            lists.black,
            vec![
                "*://*.example.cn/*",
                "*://v.video-site.com/serv*",
                "*://extra.example.cn/?",
            ]
        );
        assert_eq!(lists.white, vec!["*://www.example.cn/open/*"]);
    }

    #[test]
    fn test_strip_line_comment_keeps_schemes() {
        assert_eq!(strip_line_comment("'*://x.cn/*', // note"), "'*://x.cn/*', ");
        assert_eq!(strip_line_comment("'*://x.cn/*',"), "'*://x.cn/*',");
        assert_eq!(strip_line_comment("// whole line"), "");
    }

    #[test]
    fn test_glob_translation_is_anchored() {
        let rules = sample_rules();
        assert!(rules.should_proxy("http://v.example.cn/video/1"));
        assert!(rules.should_proxy("https://v.video-site.com/services/x"));
        // host suffix spoof must not match
        assert!(!rules.should_proxy("http://v.example.cn.evil.org/video/1"));
        assert!(!rules.should_proxy("http://unrelated.com/"));
    }

    #[test]
    fn test_question_mark_is_one_char() {
        let rules = sample_rules();
        assert!(rules.should_proxy("http://extra.example.cn/a"));
        assert!(!rules.should_proxy("http://extra.example.cn/ab"));
        assert!(!rules.should_proxy("http://extra.example.cn/"));
    }

    #[test]
    fn test_whitelist_wins() {
        let rules = sample_rules();
        // matches the blacklist wildcard too, whitelist takes it out
        assert!(!rules.should_proxy("https://www.example.cn/open/page"));
        assert!(rules.should_proxy("https://www.example.cn/closed/page"));
    }

    #[test]
    fn test_non_http_never_proxied() {
        let rules = sample_rules();
        assert!(!rules.should_proxy("ftp://v.example.cn/video"));
        assert!(!rules.should_proxy("magnet:?xt=urn:btih:abc"));
    }

    #[test]
    fn test_pac_extraction() {
        assert_eq!(
            parse_pac_proxy(SAMPLE_PAC).as_deref(),
            Some("203.0.113.7:8888")
        );
        assert_eq!(parse_pac_proxy("function FindProxyForURL() {}"), None);
    }

    #[test]
    fn test_empty_pattern_set_matches_nothing() {
        let re = join_shell_patterns(&[]).unwrap();
        assert!(!re.is_match(""));
        assert!(!re.is_match("http://example.com/"));
    }

    #[test]
    fn test_freshness_window() {
        let now = SystemTime::now();
        let fresh = now - Duration::from_secs(RULES_EXPIRE_SECS - 10);
        let stale = now - Duration::from_secs(RULES_EXPIRE_SECS + 10);
        assert!(is_fresh(fresh, now));
        assert!(!is_fresh(stale, now));
    }

    #[tokio::test]
    async fn test_filter_disabled_without_rules() {
        let dir = tempfile::tempdir().unwrap();
        let filter = ProxyFilter::new(dir.path().to_path_buf());
        assert_eq!(filter.proxy_for("http://v.example.cn/video").await, None);
    }

    #[tokio::test]
    async fn test_refresh_from_warm_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(URLS_FILENAME), SAMPLE_URLS_JS).unwrap();
        std::fs::write(dir.path().join(PAC_FILENAME), SAMPLE_PAC).unwrap();

        let filter = ProxyFilter::new(dir.path().to_path_buf());
        filter.refresh().await.unwrap();

        assert_eq!(
            filter.proxy_for("http://v.example.cn/video").await.as_deref(),
            Some("203.0.113.7:8888")
        );
        assert_eq!(
            filter.proxy_for("https://www.example.cn/open/page").await,
            None
        );
    }
}
