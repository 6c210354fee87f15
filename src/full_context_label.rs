use crate::error::PipelineError;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;
use std::path::Path;

static TIMED_LABEL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[ \t]*([0-9]+)[ \t]+([0-9]+)[ \t]+(.*)$").unwrap());
static STATE_DURATION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(.*)\.state\[[0-9]*\].*duration=([0-9]*) .*").unwrap());

/// Context label carried by one line of a `.lab` file.
///
/// `start end label` lines yield `label`; anything else is taken whole, which
/// keeps untimed label files usable.
pub fn context_label(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match TIMED_LABEL_REGEX.captures(line) {
        Some(caps) => caps.get(3).map(|m| m.as_str()),
        None => Some(line),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSegment {
    pub label: String,
    /// 2-based, as HTK numbers emitting states.
    pub state: usize,
    pub start_frame: u64,
    pub frames: u64,
}

impl StateSegment {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frames
    }
}

/// Walks a `.dur` file written by HMGenS.
///
/// Each phone contributes `nb_emitting_states` state lines followed by one
/// summary line, which is skipped.
pub fn parse_state_durations(
    text: &str,
    nb_emitting_states: usize,
    path: &Path,
) -> Result<Vec<StateSegment>> {
    let mut segments = Vec::new();
    let mut id_state = 1;
    let mut t = 0;

    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if id_state > nb_emitting_states {
            id_state = 1;
            continue;
        }

        let malformed = || PipelineError::MalformedDuration {
            path: path.to_path_buf(),
            line: i + 1,
            content: line.to_string(),
        };
        let caps = STATE_DURATION_REGEX.captures(line).ok_or_else(malformed)?;
        let label = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let frames: u64 = caps
            .get(2)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .parse()
            .map_err(|_| malformed())?;

        segments.push(StateSegment {
            label: label.to_string(),
            state: id_state + 1,
            start_frame: t,
            frames,
        });
        t += frames;
        id_state += 1;
    }

    Ok(segments)
}

/// Renders state segments as a time-aligned label, in 100 ns units.
pub fn segments_to_label(segments: &[StateSegment], frameshift: u64) -> String {
    let mut result = String::new();
    for segment in segments {
        let _ = write!(
            result,
            "{} {} {}[{}]",
            segment.start_frame * frameshift,
            segment.end_frame() * frameshift,
            segment.label,
            segment.state
        );
        // the phone label is only repeated on its first state
        if segment.state == 2 {
            let _ = write!(result, " {}", segment.label);
        }
        result.push('\n');
    }
    result
}

pub fn convert_duration_file(
    dur_path: &Path,
    lab_path: &Path,
    nb_emitting_states: usize,
    frameshift: u64,
) -> Result<u64> {
    let text = std::fs::read_to_string(dur_path)?;
    let segments = parse_state_durations(&text, nb_emitting_states, dur_path)?;
    std::fs::write(lab_path, segments_to_label(&segments, frameshift))?;
    Ok(segments.last().map(StateSegment::end_frame).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: &str = "x^x-sil+h=e/A:xx+xx+xx";

    #[test]
    fn timed_and_untimed_lines() {
        assert_eq!(context_label("0 50000 a^b-c+d=e"), Some("a^b-c+d=e"));
        assert_eq!(context_label("  \t 100\t200   sil"), Some("sil"));
        assert_eq!(context_label("a^b-c+d=e"), Some("a^b-c+d=e"));
        assert_eq!(context_label("12 sil"), Some("12 sil"));
        assert_eq!(context_label("   "), None);
    }

    #[test]
    fn two_state_phone() {
        let text = format!(
            "{CTX}.state[2]: duration=5 (frame), mean=5.0\n\
             {CTX}.state[3]: duration=5 (frame), mean=5.0\n\
             {CTX}: duration=10 (frame)\n"
        );
        let segments = parse_state_durations(&text, 2, Path::new("a.dur")).unwrap();
        let label = segments_to_label(&segments, 50000);
        assert_eq!(
            label,
            format!("0 250000 {CTX}[2] {CTX}\n250000 500000 {CTX}[3]\n")
        );
    }

    #[test]
    fn state_index_resets_between_phones() {
        let text = "a.state[2]: duration=3 (frame)\n\
                    a.state[3]: duration=0 (frame)\n\
                    a: duration=3 (frame)\n\
                    b.state[2]: duration=4 (frame)\n\
                    b.state[3]: duration=2 (frame)\n\
                    b: duration=6 (frame)\n";
        let segments = parse_state_durations(text, 2, Path::new("x.dur")).unwrap();
        let states: Vec<_> = segments.iter().map(|s| (s.label.as_str(), s.state)).collect();
        assert_eq!(states, vec![("a", 2), ("a", 3), ("b", 2), ("b", 3)]);

        let mut previous_end = 0;
        for segment in &segments {
            assert!(segment.start_frame >= previous_end);
            assert_eq!(segment.start_frame == segment.end_frame(), segment.frames == 0);
            previous_end = segment.end_frame();
        }
        let total: u64 = segments.iter().map(|s| s.frames).sum();
        assert_eq!(previous_end, total);
    }

    #[test]
    fn malformed_state_line_is_reported() {
        let err = parse_state_durations("garbage\n", 5, Path::new("bad.dur")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MalformedDuration { line: 1, .. })
        ));
    }

    #[test]
    fn converts_file() {
        let dir = tempfile::tempdir().unwrap();
        let dur = dir.path().join("u.dur");
        let lab = dir.path().join("u.lab");
        std::fs::write(&dur, "p.state[2]: duration=2 (frame)\np.state[3]: duration=1 (frame)\n")
            .unwrap();
        let frames = convert_duration_file(&dur, &lab, 2, 50000).unwrap();
        assert_eq!(frames, 3);
        assert_eq!(
            std::fs::read_to_string(&lab).unwrap(),
            "0 100000 p[2] p\n100000 150000 p[3]\n"
        );
    }
}
