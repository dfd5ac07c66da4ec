// Line parser for yt-dlp `--newline` output
//
// Recognized lines:
//   [download]  45.5% of 10.00MiB at 2.50MiB/s ETA 00:05
//   [download] Destination: /out/Title.m4a
//   [Merger] Merging formats into "/out/Title.mp4"
//   [download] /out/Title.m4a has already been downloaded

use regex::Regex;
use std::path::PathBuf;

/// What a single stdout line tells us
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Progress(f32),
    Destination(PathBuf),
    Other,
}

pub fn parse_line(line: &str) -> OutputLine {
    lazy_static::lazy_static! {
        static ref PROGRESS_RE: Regex = Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%").unwrap();
        static ref DEST_RE: Regex = Regex::new(r"^\[download\]\s+Destination:\s+(.+)$").unwrap();
        static ref MERGE_RE: Regex = Regex::new(r#"^\[Merger\]\s+Merging formats into "(.+)"$"#).unwrap();
        static ref ALREADY_RE: Regex = Regex::new(r"^\[download\]\s+(.+) has already been downloaded").unwrap();
    }

    let line = line.trim_end();

    if let Some(caps) = PROGRESS_RE.captures(line) {
        if let Ok(percent) = caps[1].parse::<f32>() {
            return OutputLine::Progress(percent);
        }
    }

    for re in [&*DEST_RE, &*MERGE_RE, &*ALREADY_RE] {
        if let Some(caps) = re.captures(line) {
            return OutputLine::Destination(PathBuf::from(caps[1].trim()));
        }
    }

    OutputLine::Other
}

/// Keeps reported progress within [0, 100] and never lower than before
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<f32>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamped percent if it should be reported, `None` if it would go backwards
    /// or repeat the previous value.
    pub fn accept(&mut self, raw: f32) -> Option<f32> {
        if raw.is_nan() {
            return None;
        }
        let percent = raw.clamp(0.0, 100.0);
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }
}
