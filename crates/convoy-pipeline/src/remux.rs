//! Remux command construction with language guardrails.
//!
//! The remux copies codecs (`-c copy`, never transcoding) while mapping only
//! the tracks the media policy keeps: video stream zero always, audio whose
//! language is listed or matches the source's original language, subtitles
//! whose language is listed or whose forced flag is set when the policy
//! carries the `forced` token.

use std::collections::BTreeSet;
use std::path::Path;

use crate::probe::{MediaProbe, StreamKind};

/// Track-retention lists for one remux.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSelection {
    /// Audio language codes to keep.
    pub audio: Vec<String>,
    /// Subtitle language codes to keep; may contain the `forced` token.
    pub subtitles: Vec<String>,
}

/// Build the full ffmpeg argument list for one remux.
///
/// When `probe` is `None` the mapping falls back to copying every audio and
/// subtitle stream, so a probe failure never drops tracks.
#[must_use]
pub fn build_remux_args(
    source: &Path,
    destination: &Path,
    selection: &TrackSelection,
    probe: Option<&MediaProbe>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "ffmpeg".into(),
        "-hide_banner".into(),
        "-y".into(),
        "-i".into(),
        source.display().to_string(),
        "-map".into(),
        "0:v:0?".into(),
    ];

    let mut keep_audio = normalized(&selection.audio);
    let mut keep_subs = normalized(&selection.subtitles);
    let include_forced = keep_subs.remove("forced");

    match probe {
        Some(probe) => {
            if let Some(original) = &probe.original_language {
                keep_audio.insert(original.to_lowercase());
            }

            for stream in probe.of_kind(StreamKind::Audio) {
                if keep_audio.contains(&stream.language) || stream.language == "und" {
                    args.push("-map".into());
                    args.push(format!("0:{}", stream.index));
                }
            }
            for stream in probe.of_kind(StreamKind::Subtitle) {
                if keep_subs.contains(&stream.language) || (stream.forced && include_forced) {
                    args.push("-map".into());
                    args.push(format!("0:{}", stream.index));
                }
            }
        }
        None => {
            args.push("-map".into());
            args.push("0:a?".into());
            args.push("-map".into());
            args.push("0:s?".into());
        }
    }

    args.push("-c".into());
    args.push("copy".into());
    args.push(destination.display().to_string());
    args
}

fn normalized(languages: &[String]) -> BTreeSet<String> {
    languages
        .iter()
        .map(|code| code.trim().to_lowercase())
        .filter(|code| !code.is_empty())
        .collect()
}
