#![forbid(unsafe_code)]

//! Turns the raw `formats` array reported by yt-dlp into the short, ranked
//! lists offered to users.
//!
//! Audio-only streams are ranked by bitrate. Video streams are grouped by
//! height and only the best stream per height survives: a stream that carries
//! its own audio beats one that does not, otherwise the larger file wins.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use serde::{Deserialize, Serialize};

pub const MAX_AUDIO_FORMATS: usize = 10;
pub const MAX_VIDEO_FORMATS: usize = 15;

/// One entry of yt-dlp's `formats` array. Every field is optional because
/// extractors disagree wildly on what they report; numbers are read as `f64`
/// since some sites emit floats where others emit integers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FormatDescriptor {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<f64>,
    pub fps: Option<f64>,
    pub abr: Option<f64>,
    pub tbr: Option<f64>,
    pub asr: Option<f64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
    pub resolution: Option<String>,
    pub format_note: Option<String>,
}

impl FormatDescriptor {
    pub fn has_video(&self) -> bool {
        codec_present(self.vcodec.as_deref())
    }

    pub fn has_audio(&self) -> bool {
        codec_present(self.acodec.as_deref())
    }

    /// Exact size when known, otherwise the estimate.
    pub fn byte_size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx).map(non_negative_u64)
    }

    /// Audio bitrate in kbit/s with the usual fallbacks; zero when nothing
    /// usable is reported.
    pub fn audio_bitrate(&self) -> f64 {
        self.abr
            .or(self.tbr)
            .or(self.asr.map(|rate| rate / 1000.0))
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(0.0)
    }

    pub fn height_px(&self) -> u32 {
        self.height
            .filter(|value| value.is_finite() && *value > 0.0)
            .map(|value| value.min(u32::MAX as f64) as u32)
            .unwrap_or(0)
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    codec
        .map(str::trim)
        .is_some_and(|codec| !codec.is_empty() && !codec.eq_ignore_ascii_case("none"))
}

fn non_negative_u64(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.min(u64::MAX as f64) as u64
    } else {
        0
    }
}

/// What the user asked to download.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioFormat {
    pub id: String,
    pub ext: String,
    #[serde(rename = "abr")]
    pub bitrate: f64,
    pub filesize: Option<u64>,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoFormat {
    pub id: String,
    pub ext: String,
    pub resolution: String,
    pub height: u32,
    pub fps: f64,
    pub has_audio: bool,
    pub filesize: u64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedFormat {
    Audio(AudioFormat),
    Video(VideoFormat),
}

/// Ranked, capped output of [`classify`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormatLists {
    #[serde(rename = "audio_formats")]
    pub audio: Vec<AudioFormat>,
    #[serde(rename = "video_formats")]
    pub video: Vec<VideoFormat>,
}

impl FormatLists {
    /// Looks a selectable format up by id, returning its kind and whether it
    /// already carries audio.
    pub fn lookup(&self, format_id: &str) -> Option<(MediaKind, bool)> {
        if self.audio.iter().any(|format| format.id == format_id) {
            return Some((MediaKind::Audio, true));
        }
        self.video
            .iter()
            .find(|format| format.id == format_id)
            .map(|format| (MediaKind::Video, format.has_audio))
    }
}

/// Places a single descriptor into the audio or video bucket, or discards it.
pub fn classify_one(descriptor: &FormatDescriptor) -> Option<ClassifiedFormat> {
    let id = descriptor.format_id.clone().unwrap_or_default();
    let ext = descriptor.ext.clone().unwrap_or_default();
    let note = descriptor.format_note.clone().unwrap_or_default();

    if descriptor.has_video() {
        let height = descriptor.height_px();
        let resolution = descriptor
            .resolution
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| {
                if height > 0 {
                    format!("{height}p")
                } else {
                    "Unknown".to_string()
                }
            });
        return Some(ClassifiedFormat::Video(VideoFormat {
            id,
            ext,
            resolution,
            height,
            fps: descriptor.fps.filter(|fps| fps.is_finite()).unwrap_or(0.0),
            has_audio: descriptor.has_audio(),
            filesize: descriptor.byte_size().unwrap_or(0),
            note,
        }));
    }

    if descriptor.has_audio() {
        return Some(ClassifiedFormat::Audio(AudioFormat {
            id,
            ext,
            bitrate: descriptor.audio_bitrate(),
            filesize: descriptor.byte_size(),
            note,
        }));
    }

    None
}

pub fn classify(descriptors: &[FormatDescriptor]) -> FormatLists {
    let mut audio = Vec::new();
    let mut buckets: BTreeMap<u32, VideoFormat> = BTreeMap::new();

    for descriptor in descriptors {
        match classify_one(descriptor) {
            Some(ClassifiedFormat::Audio(format)) => audio.push(format),
            Some(ClassifiedFormat::Video(format)) => {
                if format.height == 0 {
                    continue;
                }
                match buckets.entry(format.height) {
                    Entry::Vacant(slot) => {
                        slot.insert(format);
                    }
                    Entry::Occupied(mut slot) => {
                        if replaces(slot.get(), &format) {
                            slot.insert(format);
                        }
                    }
                }
            }
            None => {}
        }
    }

    // Stable sort: equal bitrates keep their input order.
    audio.sort_by(|a, b| b.bitrate.total_cmp(&a.bitrate));
    audio.truncate(MAX_AUDIO_FORMATS);

    let mut video: Vec<VideoFormat> = buckets.into_values().rev().collect();
    video.truncate(MAX_VIDEO_FORMATS);

    FormatLists { audio, video }
}

fn replaces(incumbent: &VideoFormat, candidate: &VideoFormat) -> bool {
    match (candidate.has_audio, incumbent.has_audio) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.filesize > incumbent.filesize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn video(id: &str, height: f64, audio: bool, size: f64) -> FormatDescriptor {
        FormatDescriptor {
            format_id: Some(id.into()),
            ext: Some("mp4".into()),
            vcodec: Some("avc1".into()),
            acodec: Some(if audio { "mp4a.40.2" } else { "none" }.into()),
            height: Some(height),
            fps: Some(30.0),
            filesize: Some(size),
            ..FormatDescriptor::default()
        }
    }

    fn audio(id: &str, abr: Option<f64>) -> FormatDescriptor {
        FormatDescriptor {
            format_id: Some(id.into()),
            ext: Some("m4a".into()),
            vcodec: Some("none".into()),
            acodec: Some("mp4a.40.2".into()),
            abr,
            ..FormatDescriptor::default()
        }
    }

    #[test]
    fn audio_bucket_wins_over_larger_silent_stream() {
        let lists = classify(&[
            video("136", 720.0, false, 500.0),
            video("22", 720.0, true, 300.0),
            video("37", 1080.0, true, 900.0),
        ]);
        let summary: Vec<_> = lists
            .video
            .iter()
            .map(|format| (format.id.as_str(), format.height, format.has_audio, format.filesize))
            .collect();
        assert_eq!(summary, vec![("37", 1080, true, 900), ("22", 720, true, 300)]);
    }

    #[test]
    fn audio_sorted_by_bitrate_with_missing_last() {
        let lists = classify(&[
            audio("a", None),
            audio("b", Some(128.0)),
            audio("c", Some(320.0)),
        ]);
        let bitrates: Vec<_> = lists.audio.iter().map(|format| format.bitrate).collect();
        assert_eq!(bitrates, vec![320.0, 128.0, 0.0]);
        assert_eq!(lists.audio[2].id, "a");
    }

    #[test]
    fn audio_bitrate_falls_back_to_total_then_sample_rate() {
        let mut total = audio("t", None);
        total.tbr = Some(96.0);
        let mut sampled = audio("s", None);
        sampled.asr = Some(44100.0);
        assert_eq!(total.audio_bitrate(), 96.0);
        assert!((sampled.audio_bitrate() - 44.1).abs() < f64::EPSILON);
    }

    #[test]
    fn silent_stream_never_replaces_one_with_audio() {
        let lists = classify(&[
            video("small", 480.0, true, 10.0),
            video("huge", 480.0, false, 10_000.0),
        ]);
        assert_eq!(lists.video.len(), 1);
        assert_eq!(lists.video[0].id, "small");
    }

    #[test]
    fn larger_stream_replaces_when_audio_matches() {
        let lists = classify(&[
            video("first", 360.0, false, 100.0),
            video("second", 360.0, false, 200.0),
            video("third", 360.0, false, 200.0),
        ]);
        assert_eq!(lists.video[0].id, "second");
    }

    #[test]
    fn approximate_size_used_when_exact_missing() {
        let mut approx = video("approx", 360.0, false, 0.0);
        approx.filesize = None;
        approx.filesize_approx = Some(5_000.0);
        let lists = classify(&[video("exact", 360.0, false, 1_000.0), approx]);
        assert_eq!(lists.video[0].id, "approx");
        assert_eq!(lists.video[0].filesize, 5_000);
    }

    #[test]
    fn unknown_height_excluded() {
        let mut unknown = video("x", 0.0, true, 50.0);
        unknown.height = None;
        let lists = classify(&[unknown, video("y", 0.0, true, 60.0)]);
        assert!(lists.video.is_empty());
    }

    #[test]
    fn classification_is_a_partition() {
        let storyboard = FormatDescriptor {
            format_id: Some("sb0".into()),
            ext: Some("mhtml".into()),
            vcodec: Some("none".into()),
            acodec: Some("none".into()),
            ..FormatDescriptor::default()
        };
        let bare = FormatDescriptor::default();
        let mut empty_codec = audio("e", Some(64.0));
        empty_codec.vcodec = Some(String::new());
        let inputs = [
            storyboard,
            bare,
            empty_codec,
            audio("140", Some(128.0)),
            video("18", 360.0, true, 1.0),
        ];
        let kinds: Vec<_> = inputs
            .iter()
            .map(|descriptor| match classify_one(descriptor) {
                Some(ClassifiedFormat::Audio(_)) => "audio",
                Some(ClassifiedFormat::Video(_)) => "video",
                None => "discarded",
            })
            .collect();
        assert_eq!(kinds, vec!["discarded", "discarded", "audio", "audio", "video"]);
    }

    #[test]
    fn heights_unique_and_descending_with_caps() {
        let mut descriptors = Vec::new();
        for height in 1..=40 {
            descriptors.push(video(&format!("v{height}"), (height * 10) as f64, false, 1.0));
            descriptors.push(video(&format!("w{height}"), (height * 10) as f64, true, 1.0));
        }
        for index in 0..25 {
            descriptors.push(audio(&format!("a{index}"), Some(index as f64)));
        }
        let lists = classify(&descriptors);
        assert_eq!(lists.video.len(), MAX_VIDEO_FORMATS);
        assert_eq!(lists.audio.len(), MAX_AUDIO_FORMATS);

        let heights: HashSet<_> = lists.video.iter().map(|format| format.height).collect();
        assert_eq!(heights.len(), lists.video.len());
        assert!(lists.video.windows(2).all(|pair| pair[0].height > pair[1].height));
        assert_eq!(lists.video[0].height, 400);
        assert!(lists.video.iter().all(|format| format.has_audio));
        assert_eq!(lists.audio[0].bitrate, 24.0);
    }

    #[test]
    fn parses_nulls_and_floats_from_json() {
        let raw = r#"[
            {"format_id": "251", "ext": "webm", "vcodec": "none", "acodec": "opus",
             "abr": null, "tbr": 140.5, "filesize": null, "filesize_approx": 3100000.0},
            {"format_id": "18", "ext": "mp4", "vcodec": "avc1.42001E", "acodec": "mp4a.40.2",
             "height": 360, "fps": null, "resolution": "640x360", "format_note": "360p"}
        ]"#;
        let descriptors: Vec<FormatDescriptor> = serde_json::from_str(raw).unwrap();
        let lists = classify(&descriptors);
        assert_eq!(lists.audio[0].bitrate, 140.5);
        assert_eq!(lists.audio[0].filesize, Some(3_100_000));
        assert_eq!(lists.video[0].resolution, "640x360");
        assert_eq!(lists.video[0].fps, 0.0);
        assert_eq!(lists.video[0].filesize, 0);
        assert_eq!(lists.lookup("18"), Some((MediaKind::Video, true)));
        assert_eq!(lists.lookup("251"), Some((MediaKind::Audio, true)));
        assert_eq!(lists.lookup("nope"), None);
    }
}
