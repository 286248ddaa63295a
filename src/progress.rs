#![forbid(unsafe_code)]

//! Line-oriented parsing of download tool output.
//!
//! The job worker feeds every output line through a [`ProgressParser`] and
//! applies whatever partial update comes back. Only this module knows what
//! yt-dlp's console output looks like.

/// Partial job update extracted from one output line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub percent: Option<f64>,
    pub message: Option<String>,
}

pub trait ProgressParser: Send + Sync {
    /// Returns `None` for lines that carry nothing useful, including lines
    /// whose percentage token cannot be parsed.
    fn parse_line(&self, line: &str) -> Option<ProgressUpdate>;
}

/// Understands the `--newline` output of yt-dlp, e.g.
/// `[download]  42.1% of ~ 12.34MiB at  1.20MiB/s ETA 00:09`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YtDlpProgressParser;

impl ProgressParser for YtDlpProgressParser {
    fn parse_line(&self, line: &str) -> Option<ProgressUpdate> {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("[download]") {
            let rest = rest.trim();
            if rest.contains('%') {
                let percent = rest
                    .split_whitespace()
                    .find(|token| token.contains('%'))
                    .and_then(parse_percent)?;
                return Some(ProgressUpdate {
                    percent: Some(percent),
                    message: Some(format!("Downloading {rest}")),
                });
            }
            if rest.starts_with("Destination:") {
                return Some(message_only("Downloading"));
            }
            return None;
        }

        let (tag, _) = line.strip_prefix('[')?.split_once(']')?;
        match tag {
            "Merger" => Some(message_only("Merging audio and video")),
            "ExtractAudio" => Some(message_only("Extracting audio")),
            "VideoRemuxer" | "VideoConvertor" => Some(message_only("Converting video")),
            tag if tag.starts_with("Fixup") => Some(message_only("Post-processing")),
            _ => None,
        }
    }
}

fn message_only(message: &str) -> ProgressUpdate {
    ProgressUpdate {
        percent: None,
        message: Some(message.to_string()),
    }
}

fn parse_percent(token: &str) -> Option<f64> {
    let value: f64 = token.trim_end_matches('%').parse().ok()?;
    value.is_finite().then(|| value.clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Option<ProgressUpdate> {
        YtDlpProgressParser.parse_line(line)
    }

    #[test]
    fn reads_percentage_lines() {
        let update =
            parse("[download]  42.1% of ~ 12.34MiB at  1.20MiB/s ETA 00:09 (frag 3/40)").unwrap();
        assert_eq!(update.percent, Some(42.1));
        assert!(update.message.unwrap().starts_with("Downloading 42.1%"));

        let done = parse("[download] 100% of   3.93MiB in 00:00:01 at 2.61MiB/s").unwrap();
        assert_eq!(done.percent, Some(100.0));
    }

    #[test]
    fn ignores_malformed_percent_tokens() {
        assert_eq!(parse("[download] NaN% of 10MiB"), None);
        assert_eq!(parse("[download] abc% of 10MiB"), None);
        assert_eq!(parse("[download] Unknown%"), None);
    }

    #[test]
    fn clamps_out_of_range_values() {
        assert_eq!(parse("[download] 180.0% of 1MiB").unwrap().percent, Some(100.0));
        assert_eq!(parse("[download] -3% of 1MiB").unwrap().percent, Some(0.0));
    }

    #[test]
    fn post_processing_lines_update_message() {
        let merge = parse("[Merger] Merging formats into \"downloads/x.mp4\"").unwrap();
        assert_eq!(merge.percent, None);
        assert_eq!(merge.message.as_deref(), Some("Merging audio and video"));

        let extract = parse("[ExtractAudio] Destination: downloads/x.mp3").unwrap();
        assert_eq!(extract.message.as_deref(), Some("Extracting audio"));

        let fixup = parse("[FixupM3u8] Fixing MPEG-TS in MP4 container").unwrap();
        assert_eq!(fixup.message.as_deref(), Some("Post-processing"));

        let destination = parse("[download] Destination: downloads/x.f137.mp4").unwrap();
        assert_eq!(destination.message.as_deref(), Some("Downloading"));
    }

    #[test]
    fn unrelated_lines_are_skipped() {
        assert_eq!(parse("[youtube] abc: Downloading webpage"), None);
        assert_eq!(parse("WARNING: 50% of the internet is cats"), None);
        assert_eq!(parse(""), None);
        assert_eq!(parse("[download] abc has already been downloaded"), None);
    }
}
