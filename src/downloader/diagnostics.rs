// Failure diagnostics - turns an exit status plus captured stderr into a
// job failure message

use serde::{Deserialize, Serialize};

/// Message for exit code 1 under the strict format selector
pub const FORMAT_UNAVAILABLE: &str =
    "Requested format is not available without conversion (no native stream matched)";

/// Causes recognizable from yt-dlp stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// HTTP 403 Forbidden
    Http403Forbidden,
    /// 429 or similar throttling
    RateLimited,
    GeoBlocked,
    AgeRestricted,
    PrivateVideo,
    /// Deleted or otherwise gone
    VideoUnavailable,
    /// DRM, premium or paid content
    DrmProtected,
    NetworkTimeout,
}

impl FailureReason {
    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Http403Forbidden => "access denied (HTTP 403)",
            Self::RateLimited => "rate limited by the remote site",
            Self::GeoBlocked => "not available in this region",
            Self::AgeRestricted => "age-restricted content",
            Self::PrivateVideo => "private video",
            Self::VideoUnavailable => "media unavailable",
            Self::DrmProtected => "DRM-protected content",
            Self::NetworkTimeout => "network timeout",
        }
    }
}

/// Analyze stderr and return the most specific recognizable cause
pub fn diagnose_error(stderr: &str) -> Option<FailureReason> {
    let lower = stderr.to_lowercase();

    // Order matters: specific restrictions before generic HTTP codes.
    if lower.contains("drm")
        || lower.contains("widevine")
        || lower.contains("requires purchase")
        || lower.contains("youtube premium")
    {
        return Some(FailureReason::DrmProtected);
    }

    if lower.contains("sign in to confirm your age") || lower.contains("age-restricted") {
        return Some(FailureReason::AgeRestricted);
    }

    if lower.contains("private video") || lower.contains("video is private") {
        return Some(FailureReason::PrivateVideo);
    }

    if lower.contains("video unavailable")
        || lower.contains("video has been removed")
        || lower.contains("is no longer available")
    {
        return Some(FailureReason::VideoUnavailable);
    }

    if lower.contains("available in your country") || lower.contains("geo restrict") {
        return Some(FailureReason::GeoBlocked);
    }

    if lower.contains("http error 429") || lower.contains("too many requests") {
        return Some(FailureReason::RateLimited);
    }

    if lower.contains("http error 403") || lower.contains("forbidden") {
        return Some(FailureReason::Http403Forbidden);
    }

    if lower.contains("timed out") || lower.contains("timeout") {
        return Some(FailureReason::NetworkTimeout);
    }

    None
}

/// Failure message for a nonzero (or signal) exit. Never empty.
pub fn exit_failure_message(code: Option<i32>, stderr: &str) -> String {
    match code {
        Some(1) => FORMAT_UNAVAILABLE.to_string(),
        Some(code) => match diagnose_error(stderr) {
            Some(reason) => format!("Process exited with code {} ({})", code, reason.description()),
            None => format!("Process exited with code {}", code),
        },
        None => "Process was terminated by a signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_403_detection() {
        let error = "ERROR: unable to download video data: HTTP Error 403: Forbidden";
        assert_eq!(diagnose_error(error), Some(FailureReason::Http403Forbidden));
    }

    #[test]
    fn test_rate_limit_detection() {
        let error = "ERROR: HTTP Error 429: Too Many Requests";
        assert_eq!(diagnose_error(error), Some(FailureReason::RateLimited));
    }

    #[test]
    fn test_geo_detection() {
        let error = "ERROR: The uploader has not made this video available in your country";
        assert_eq!(diagnose_error(error), Some(FailureReason::GeoBlocked));
        let error = "ERROR: [youtube] x: This video is not available in your country";
        assert_eq!(diagnose_error(error), Some(FailureReason::GeoBlocked));
    }

    #[test]
    fn test_private_detection() {
        let reason = diagnose_error("ERROR: [youtube] x: Private video").unwrap();
        assert_eq!(reason, FailureReason::PrivateVideo);
        assert_eq!(reason.description(), "private video");
    }

    #[test]
    fn test_unrecognized_stderr() {
        assert_eq!(diagnose_error(""), None);
        assert_eq!(diagnose_error("WARNING: something odd"), None);
    }

    #[test]
    fn test_exit_code_one_maps_to_format_unavailable() {
        assert_eq!(exit_failure_message(Some(1), "HTTP Error 403"), FORMAT_UNAVAILABLE);
    }

    #[test]
    fn test_other_codes_are_generic_with_hint() {
        assert_eq!(exit_failure_message(Some(2), ""), "Process exited with code 2");
        assert_eq!(
            exit_failure_message(Some(101), "Read timed out."),
            "Process exited with code 101 (network timeout)"
        );
        assert!(!exit_failure_message(None, "").is_empty());
    }
}
