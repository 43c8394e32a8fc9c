//! Stream probing via `ffprobe`.

use std::path::Path;
use std::time::Duration;

use convoy_compose::CommandRunner;
use serde_json::Value;
use tracing::debug;

/// Deadline for one probe invocation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Stream classes relevant to remuxing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Video stream.
    Video,
    /// Audio stream.
    Audio,
    /// Subtitle stream.
    Subtitle,
    /// Anything else (attachments, data).
    Other,
}

/// One stream discovered in a media file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Global stream index as ffmpeg addresses it.
    pub index: i64,
    /// Stream class.
    pub kind: StreamKind,
    /// Lowercased language tag; `und` when untagged.
    pub language: String,
    /// Whether the forced disposition flag is set.
    pub forced: bool,
}

/// Probe result for one media file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaProbe {
    /// Every stream in container order.
    pub streams: Vec<StreamInfo>,
    /// Language of the first audio stream, treated as the source's native
    /// language.
    pub original_language: Option<String>,
}

impl MediaProbe {
    /// Streams of one class, in order.
    pub fn of_kind(&self, kind: StreamKind) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(move |stream| stream.kind == kind)
    }

    /// Parse the JSON document `ffprobe -show_streams` emits.
    #[must_use]
    pub fn from_ffprobe_json(document: &Value) -> Self {
        let mut streams = Vec::new();
        let mut original_language = None;

        for stream in document
            .get("streams")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let kind = match stream.get("codec_type").and_then(Value::as_str) {
                Some("video") => StreamKind::Video,
                Some("audio") => StreamKind::Audio,
                Some("subtitle") => StreamKind::Subtitle,
                _ => StreamKind::Other,
            };
            let language = stream
                .get("tags")
                .and_then(|tags| tags.get("language"))
                .and_then(Value::as_str)
                .unwrap_or("und")
                .to_lowercase();
            let forced = stream
                .get("disposition")
                .and_then(|disposition| disposition.get("forced"))
                .and_then(Value::as_i64)
                == Some(1);
            let index = stream.get("index").and_then(Value::as_i64).unwrap_or(-1);

            if kind == StreamKind::Audio && original_language.is_none() {
                original_language = Some(language.clone());
            }
            streams.push(StreamInfo {
                index,
                kind,
                language,
                forced,
            });
        }

        Self {
            streams,
            original_language,
        }
    }
}

/// Probe a media file. Returns `None` when ffprobe is unavailable, times
/// out, exits nonzero, or produces unparseable output — the remux falls back
/// to copying every stream.
pub async fn probe_streams(source: &Path) -> Option<MediaProbe> {
    let runner = CommandRunner::new(PROBE_TIMEOUT);
    let source_str = source.display().to_string();
    let output = match runner
        .run(
            "ffprobe",
            &[
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                &source_str,
            ],
        )
        .await
    {
        Ok(output) if output.success() => output,
        Ok(output) => {
            debug!(source = %source.display(), status = output.status, "ffprobe failed");
            return None;
        }
        Err(err) => {
            debug!(source = %source.display(), error = %err, "ffprobe unavailable");
            return None;
        }
    };

    let document: Value = serde_json::from_str(&output.stdout).ok()?;
    Some(MediaProbe::from_ffprobe_json(&document))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_streams_with_languages_and_dispositions() {
        let document = json!({
            "streams": [
                {"index": 0, "codec_type": "video"},
                {"index": 1, "codec_type": "audio", "tags": {"language": "JPN"}},
                {"index": 2, "codec_type": "audio", "tags": {"language": "eng"}},
                {"index": 3, "codec_type": "subtitle", "tags": {"language": "eng"}},
                {"index": 4, "codec_type": "subtitle", "disposition": {"forced": 1}},
                {"index": 5, "codec_type": "attachment"}
            ]
        });
        let probe = MediaProbe::from_ffprobe_json(&document);
        assert_eq!(probe.streams.len(), 6);
        assert_eq!(probe.original_language.as_deref(), Some("jpn"));
        assert_eq!(probe.of_kind(StreamKind::Audio).count(), 2);

        let forced_sub = probe
            .of_kind(StreamKind::Subtitle)
            .find(|stream| stream.forced)
            .expect("forced subtitle present");
        assert_eq!(forced_sub.index, 4);
        assert_eq!(forced_sub.language, "und");
    }

    #[test]
    fn empty_document_yields_empty_probe() {
        let probe = MediaProbe::from_ffprobe_json(&json!({}));
        assert!(probe.streams.is_empty());
        assert!(probe.original_language.is_none());
    }
}
