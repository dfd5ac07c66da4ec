// FormatSelector - strict yt-dlp format selection
//
// Only native streams in fixed containers are requested so that no
// re-encoding step is ever needed:
// - audio: m4a audio-only stream
// - video: mp4 video stream merged with an m4a audio stream
//
// When no stream matches, yt-dlp exits with code 1 instead of converting.

use super::models::MediaKind;

/// Parsed quality request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Best,
    Worst,
    /// Upper bound on video height in pixels
    MaxHeight(u32),
}

impl Quality {
    /// "best", "worst", "720p" or "720"; anything else falls back to best
    pub fn parse(value: &str) -> Self {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "worst" => Self::Worst,
            "best" | "" => Self::Best,
            other => other
                .strip_suffix('p')
                .unwrap_or(other)
                .parse::<u32>()
                .ok()
                .filter(|h| *h > 0)
                .map(Self::MaxHeight)
                .unwrap_or(Self::Best),
        }
    }
}

pub struct FormatSelector;

impl FormatSelector {
    /// `-f` argument for the requested kind and quality
    pub fn selector(kind: MediaKind, quality: &str) -> String {
        let quality = Quality::parse(quality);
        match kind {
            MediaKind::Audio => match quality {
                Quality::Worst => "worstaudio[ext=m4a]".to_string(),
                _ => "bestaudio[ext=m4a]".to_string(),
            },
            MediaKind::Video => match quality {
                Quality::Best => "bestvideo[ext=mp4]+bestaudio[ext=m4a]".to_string(),
                Quality::Worst => "worstvideo[ext=mp4]+worstaudio[ext=m4a]".to_string(),
                Quality::MaxHeight(h) => {
                    format!("bestvideo[ext=mp4][height<={}]+bestaudio[ext=m4a]", h)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_parse() {
        assert_eq!(Quality::parse("best"), Quality::Best);
        assert_eq!(Quality::parse("WORST"), Quality::Worst);
        assert_eq!(Quality::parse("720p"), Quality::MaxHeight(720));
        assert_eq!(Quality::parse("1080"), Quality::MaxHeight(1080));
        assert_eq!(Quality::parse("0p"), Quality::Best);
        assert_eq!(Quality::parse("ultra"), Quality::Best);
    }

    #[test]
    fn test_audio_selectors_stay_m4a() {
        assert_eq!(FormatSelector::selector(MediaKind::Audio, "best"), "bestaudio[ext=m4a]");
        assert_eq!(FormatSelector::selector(MediaKind::Audio, "worst"), "worstaudio[ext=m4a]");
        // Height caps do not apply to audio-only streams.
        assert_eq!(FormatSelector::selector(MediaKind::Audio, "480p"), "bestaudio[ext=m4a]");
    }

    #[test]
    fn test_video_selectors_merge_mp4_and_m4a() {
        assert_eq!(
            FormatSelector::selector(MediaKind::Video, "best"),
            "bestvideo[ext=mp4]+bestaudio[ext=m4a]"
        );
        assert_eq!(
            FormatSelector::selector(MediaKind::Video, "720p"),
            "bestvideo[ext=mp4][height<=720]+bestaudio[ext=m4a]"
        );
    }
}
