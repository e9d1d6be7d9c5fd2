/// Command-line protocol for the external you-get process.
///
/// The engine is driven through its argv and observed through its console
/// output: stdout lines are parsed into typed events as they stream in, and
/// `--json` probes decode into media info for the format picker.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::{MediaInfo, StreamInfo, TaskOptions};

/// Name of the engine executable looked up on PATH when no explicit path is
/// configured.
pub const ENGINE_BIN: &str = "you-get";

/// Progress lines print mebibyte counters.
const MB: f64 = 1_048_576.0;

// ====== INVOCATION ======

/// Per-server invocation context shared by every run.
#[derive(Debug, Clone)]
pub struct EngineContext {
    /// Default destination when the task options carry none.
    pub output_dir: String,
    /// Netscape cookie jar handed through when the file exists.
    pub cookies_file: Option<String>,
    /// Run the engine with --debug.
    pub debug: bool,
}

/// Build the argv for downloading a task, options first, URL last.
pub fn download_args(ctx: &EngineContext, origin: &str, opts: &TaskOptions) -> Vec<String> {
    let mut args = Vec::new();

    let output_dir = opts.output_dir.as_deref().unwrap_or(&ctx.output_dir);
    args.push("-o".to_string());
    args.push(output_dir.to_string());

    if let Some(stream_id) = &opts.stream_id {
        args.push(format!("--format={}", stream_id));
    }
    if opts.playlist {
        args.push("-l".to_string());
    }
    if let Some(proxy) = &opts.extractor_proxy {
        args.push("-y".to_string());
        args.push(proxy.clone());
    }
    if let Some(cookies) = &ctx.cookies_file {
        args.push("-c".to_string());
        args.push(cookies.clone());
    }
    if !opts.merge {
        args.push("--no-merge".to_string());
    }
    if ctx.debug {
        args.push("--debug".to_string());
    }

    args.push(origin.to_string());
    args
}

/// Build the argv for a media-info probe (`--json`).
pub fn probe_args(ctx: &EngineContext, origin: &str, opts: &TaskOptions) -> Vec<String> {
    let mut args = vec!["--json".to_string()];

    if let Some(proxy) = &opts.extractor_proxy {
        args.push("-y".to_string());
        args.push(proxy.clone());
    }
    if let Some(cookies) = &ctx.cookies_file {
        args.push("-c".to_string());
        args.push(cookies.clone());
    }

    args.push(origin.to_string());
    args
}

// ====== CONSOLE OUTPUT ======

/// One parsed line of engine console output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    /// `site:                YouTube`
    Site { name: String },
    /// `title:               Me at the zoo`
    Title { title: String },
    /// `Downloading Me at the zoo.webm ...`
    Downloading { filename: String },
    /// Progress bar line with byte counters and optional speed.
    Progress {
        received: i64,
        total_size: i64,
        percent: f64,
        speed_bps: Option<f64>,
    },
    /// `Skipping dash-137.mp4: file already exists`
    Skipped { filename: String },
    /// `Merging video parts... Merged into Me at the zoo.mp4`
    Merged { filename: String },
    /// Anything the grammar does not recognize.
    Raw { line: String },
}

impl EngineEvent {
    /// Check if this is a progress event.
    pub fn is_progress(&self) -> bool {
        matches!(self, EngineEvent::Progress { .. })
    }

    /// The artifact filename, for events that name one.
    pub fn filename(&self) -> Option<&str> {
        match self {
            EngineEvent::Downloading { filename }
            | EngineEvent::Skipped { filename }
            | EngineEvent::Merged { filename } => Some(filename),
            _ => None,
        }
    }
}

static SITE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^site:\s+(.+?)\s*$").unwrap());
static TITLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^title:\s+(.+?)\s*$").unwrap());
static DOWNLOADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:Downloading|Saving) (.+?) \.\.\.").unwrap());
static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([\d.]+)%\s*\(\s*([\d.]+)\s*/\s*([\d.]+)\s*MB\)").unwrap());
static SPEED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([\d.]+)\s*([kKMG]?)B/s\s*$").unwrap());
static SKIP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Skipping (.+?): file already exists").unwrap());
static MERGED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Merged into (.+?)\s*$").unwrap());

/// Parse one console line into an event. Unrecognized input comes back as
/// `Raw` so callers can still surface it.
pub fn parse_line(line: &str) -> EngineEvent {
    if let Some(caps) = PROGRESS_RE.captures(line) {
        let percent = caps[1].parse::<f64>().unwrap_or(0.0);
        let received_mb = caps[2].parse::<f64>().unwrap_or(0.0);
        let total_mb = caps[3].parse::<f64>().unwrap_or(0.0);
        let speed_bps = SPEED_RE.captures(line).and_then(|s| {
            let value = s[1].parse::<f64>().ok()?;
            let mult = match &s[2] {
                "k" | "K" => 1_000.0,
                "M" => 1_000_000.0,
                "G" => 1_000_000_000.0,
                _ => 1.0,
            };
            Some(value * mult)
        });
        return EngineEvent::Progress {
            received: (received_mb * MB) as i64,
            total_size: (total_mb * MB) as i64,
            percent: percent.min(100.0),
            speed_bps,
        };
    }
    if let Some(caps) = SITE_RE.captures(line) {
        return EngineEvent::Site {
            name: caps[1].to_string(),
        };
    }
    if let Some(caps) = TITLE_RE.captures(line) {
        return EngineEvent::Title {
            title: caps[1].to_string(),
        };
    }
    if let Some(caps) = SKIP_RE.captures(line) {
        return EngineEvent::Skipped {
            filename: caps[1].to_string(),
        };
    }
    if let Some(caps) = MERGED_RE.captures(line) {
        return EngineEvent::Merged {
            filename: caps[1].to_string(),
        };
    }
    if let Some(caps) = DOWNLOADING_RE.captures(line) {
        return EngineEvent::Downloading {
            filename: caps[1].to_string(),
        };
    }
    EngineEvent::Raw {
        line: line.to_string(),
    }
}

// ====== MEDIA INFO PROBE ======

/// Decode the payload printed by `you-get --json` into media info. The
/// streams map becomes a list sorted largest first, mirroring the order the
/// engine itself prefers.
pub fn parse_media_info(url: &str, payload: &str) -> Result<MediaInfo, EngineError> {
    let trimmed = payload.trim();
    let value: serde_json::Value = serde_json::from_str(trimmed)
        .or_else(|_| {
            // some extractors chat before the payload; retry on the
            // outermost object
            let start = trimmed.find('{');
            let end = trimmed.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if e > s => serde_json::from_str(&trimmed[s..=e]),
                _ => serde_json::from_str(trimmed),
            }
        })
        .map_err(|e| EngineError::InvalidJson(e.to_string()))?;

    let title = value
        .get("title")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or(EngineError::EmptyProbe)?;
    let site = value
        .get("site")
        .and_then(|v| v.as_str())
        .map(String::from);

    let mut streams = Vec::new();
    if let Some(map) = value.get("streams").and_then(|v| v.as_object()) {
        for (id, stream) in map {
            streams.push(StreamInfo {
                id: id.clone(),
                container: stream
                    .get("container")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                quality: stream
                    .get("quality")
                    .or_else(|| stream.get("video_profile"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
                size: stream.get("size").and_then(|v| v.as_i64()),
            });
        }
    }
    streams.sort_by(|a, b| b.size.unwrap_or(0).cmp(&a.size.unwrap_or(0)));

    Ok(MediaInfo {
        url: url.to_string(),
        title,
        site,
        streams,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EngineContext {
        EngineContext {
            output_dir: "/downloads".to_string(),
            cookies_file: None,
            debug: false,
        }
    }

    #[test]
    fn test_download_args_minimal() {
        let args = download_args(&ctx(), "https://example.com/v/1", &TaskOptions::default());
        assert_eq!(args, vec!["-o", "/downloads", "https://example.com/v/1"]);
    }

    #[test]
    fn test_download_args_full_options() {
        let mut context = ctx();
        context.cookies_file = Some("/data/cookies.txt".to_string());
        context.debug = true;
        let opts = TaskOptions {
            output_dir: Some("/media".to_string()),
            playlist: true,
            stream_id: Some("137".to_string()),
            extractor_proxy: Some("127.0.0.1:8888".to_string()),
            merge: false,
        };

        let args = download_args(&context, "https://example.com/v/2", &opts);
        assert_eq!(
            args,
            vec![
                "-o",
                "/media",
                "--format=137",
                "-l",
                "-y",
                "127.0.0.1:8888",
                "-c",
                "/data/cookies.txt",
                "--no-merge",
                "--debug",
                "https://example.com/v/2",
            ]
        );
    }

    #[test]
    fn test_probe_args() {
        let args = probe_args(&ctx(), "https://example.com/v/3", &TaskOptions::default());
        assert_eq!(args, vec!["--json", "https://example.com/v/3"]);
    }

    #[test]
    fn test_parse_progress_line() {
        let line = " 75.6% ( 8.2/10.8 MB) ├████████████████──────┤[1/2]    4 MB/s";
        match parse_line(line) {
            EngineEvent::Progress {
                received,
                total_size,
                percent,
                speed_bps,
            } => {
                assert_eq!(received, (8.2 * MB) as i64);
                assert_eq!(total_size, (10.8 * MB) as i64);
                assert!((percent - 75.6).abs() < f64::EPSILON);
                assert_eq!(speed_bps, Some(4_000_000.0));
            }
            other => panic!("expected progress, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_progress_without_speed() {
        let line = "100.0% (10.8/10.8 MB) ├██────────┤[2/2]";
        match parse_line(line) {
            EngineEvent::Progress {
                percent, speed_bps, ..
            } => {
                assert_eq!(percent, 100.0);
                assert_eq!(speed_bps, None);
            }
            other => panic!("expected progress, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_site_and_title() {
        assert_eq!(
            parse_line("site:                YouTube"),
            EngineEvent::Site {
                name: "YouTube".to_string()
            }
        );
        assert_eq!(
            parse_line("title:               Me at the zoo"),
            EngineEvent::Title {
                title: "Me at the zoo".to_string()
            }
        );
    }

    #[test]
    fn test_parse_downloading_skip_merge() {
        assert_eq!(
            parse_line("Downloading Me at the zoo.webm ..."),
            EngineEvent::Downloading {
                filename: "Me at the zoo.webm".to_string()
            }
        );
        assert_eq!(
            parse_line("Skipping dash-137.mp4: file already exists"),
            EngineEvent::Skipped {
                filename: "dash-137.mp4".to_string()
            }
        );
        assert_eq!(
            parse_line("Merging video parts... Merged into Me at the zoo.mp4"),
            EngineEvent::Merged {
                filename: "Me at the zoo.mp4".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_line_is_raw() {
        let event = parse_line("warning: something odd happened");
        assert_eq!(
            event,
            EngineEvent::Raw {
                line: "warning: something odd happened".to_string()
            }
        );
        assert!(!event.is_progress());
    }

    #[test]
    fn test_parse_media_info() {
        let payload = r#"
        {
            "site": "YouTube",
            "title": "Me at the zoo",
            "url": "https://www.youtube.com/watch?v=jNQXAC9IVRw",
            "streams": {
                "43": {"container": "webm", "quality": "medium", "size": 564215},
                "137": {"container": "mp4", "video_profile": "1080p", "size": 9000000}
            }
        }"#;
        let info = parse_media_info("https://www.youtube.com/watch?v=jNQXAC9IVRw", payload)
            .expect("payload should parse");
        assert_eq!(info.title, "Me at the zoo");
        assert_eq!(info.site.as_deref(), Some("YouTube"));
        assert_eq!(info.streams.len(), 2);
        // largest first
        assert_eq!(info.streams[0].id, "137");
        assert_eq!(info.streams[0].quality.as_deref(), Some("1080p"));
        assert_eq!(info.streams[1].id, "43");
    }

    #[test]
    fn test_parse_media_info_with_leading_chatter() {
        let payload = "you-get: some notice\n{\"title\": \"clip\", \"streams\": {}}";
        let info = parse_media_info("https://example.com/v", payload).unwrap();
        assert_eq!(info.title, "clip");
        assert!(info.streams.is_empty());
    }

    #[test]
    fn test_parse_media_info_rejects_garbage() {
        assert!(matches!(
            parse_media_info("https://example.com/v", "not json at all"),
            Err(EngineError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_media_info("https://example.com/v", "{\"streams\": {}}"),
            Err(EngineError::EmptyProbe)
        ));
    }
}
