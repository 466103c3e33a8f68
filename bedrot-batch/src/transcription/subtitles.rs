//! Word grouping and SRT output.

use std::fmt::Write as _;
use std::path::Path;

use super::TranscribedWord;
use crate::Result;

/// Default upper bound on a segment's length in seconds.
pub const MAX_SEGMENT_SECS: f64 = 5.0;

/// One subtitle cue.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Group transcribed words into cues.
///
/// Non-word tokens (spacing, audio events) are skipped. A cue is closed once
/// it holds `max_words` words or spans at least `max_secs`.
pub fn words_to_segments(
    words: &[TranscribedWord],
    max_words: usize,
    max_secs: f64,
) -> Vec<SubtitleSegment> {
    let max_words = max_words.max(1);
    let mut segments = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut start = 0.0;
    let mut end = 0.0;

    for word in words.iter().filter(|w| w.is_word()) {
        if current.is_empty() {
            start = word.start;
        }
        current.push(word.text.trim());
        end = word.end;

        if current.len() >= max_words || end - start >= max_secs {
            segments.push(SubtitleSegment {
                start,
                end,
                text: current.join(" "),
            });
            current.clear();
        }
    }

    if !current.is_empty() {
        segments.push(SubtitleSegment {
            start,
            end,
            text: current.join(" "),
        });
    }

    segments
}

/// Format seconds as an SRT timestamp (`HH:MM:SS,mmm`).
pub fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

/// Render cues as an SRT document.
pub fn to_srt(segments: &[SubtitleSegment]) -> String {
    let mut out = String::new();
    for (idx, segment) in segments.iter().enumerate() {
        let _ = write!(
            out,
            "{}\n{} --> {}\n{}\n\n",
            idx + 1,
            format_srt_time(segment.start),
            format_srt_time(segment.end),
            segment.text
        );
    }
    out
}

/// Write cues to `path`, creating the parent directory.
pub async fn write_srt(path: &Path, segments: &[SubtitleSegment]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, to_srt(segments)).await?;
    Ok(())
}

const STRIPPED_PUNCTUATION: &[char] = &[
    '.', ',', '-', '!', '?', ';', ':', '\'', '"', '(', ')', '[', ']', '{', '}',
];

fn transform_text_line(line: &str, all_caps: bool, strip_punctuation: bool) -> String {
    let mut text = line.to_string();
    if strip_punctuation {
        text = text
            .chars()
            .filter(|c| !STRIPPED_PUNCTUATION.contains(c))
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
    }
    if all_caps {
        text = text.to_uppercase();
    }
    text
}

/// Apply caption text transforms to an SRT document.
///
/// Cue numbers, timing lines and blank lines are left untouched.
pub fn transform_srt(content: &str, all_caps: bool, strip_punctuation: bool) -> String {
    content
        .split('\n')
        .map(|line| {
            let trimmed = line.trim();
            if line.contains("-->") || trimmed.is_empty() || trimmed.chars().all(|c| c.is_ascii_digit())
            {
                line.to_string()
            } else {
                transform_text_line(line, all_caps, strip_punctuation)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, start: f64, end: f64) -> TranscribedWord {
        TranscribedWord {
            text: text.to_string(),
            start,
            end,
            kind: Some("word".to_string()),
        }
    }

    fn spacing(start: f64) -> TranscribedWord {
        TranscribedWord {
            text: " ".to_string(),
            start,
            end: start,
            kind: Some("spacing".to_string()),
        }
    }

    #[test]
    fn test_segments_split_on_word_count() {
        let words = vec![
            word("one", 0.0, 0.4),
            spacing(0.4),
            word("two", 0.5, 0.9),
            word("three", 1.0, 1.4),
            word("four", 1.5, 1.9),
        ];
        let segments = words_to_segments(&words, 3, MAX_SEGMENT_SECS);
        assert_eq!(
            segments,
            vec![
                SubtitleSegment {
                    start: 0.0,
                    end: 1.4,
                    text: "one two three".to_string()
                },
                SubtitleSegment {
                    start: 1.5,
                    end: 1.9,
                    text: "four".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_segments_split_on_duration() {
        let words = vec![word("long", 0.0, 5.2), word("next", 5.3, 5.6)];
        let segments = words_to_segments(&words, 8, MAX_SEGMENT_SECS);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "long");
    }

    #[test]
    fn test_untyped_words_are_kept() {
        let mut w = word("hey", 0.0, 0.2);
        w.kind = None;
        let audio_event = TranscribedWord {
            text: "(laughs)".to_string(),
            start: 0.3,
            end: 0.8,
            kind: Some("audio_event".to_string()),
        };
        let segments = words_to_segments(&[w, audio_event], 8, MAX_SEGMENT_SECS);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hey");
    }

    #[test]
    fn test_format_srt_time() {
        assert_eq!(format_srt_time(0.0), "00:00:00,000");
        assert_eq!(format_srt_time(1.1), "00:00:01,100");
        assert_eq!(format_srt_time(3723.456), "01:02:03,456");
        assert_eq!(format_srt_time(-2.0), "00:00:00,000");
    }

    #[test]
    fn test_to_srt() {
        let srt = to_srt(&[
            SubtitleSegment {
                start: 0.0,
                end: 1.25,
                text: "hello world".to_string(),
            },
            SubtitleSegment {
                start: 1.5,
                end: 2.0,
                text: "again".to_string(),
            },
        ]);
        assert_eq!(
            srt,
            "1\n00:00:00,000 --> 00:00:01,250\nhello world\n\n2\n00:00:01,500 --> 00:00:02,000\nagain\n\n"
        );
    }

    #[test]
    fn test_transform_srt() {
        let input = "1\n00:00:00,000 --> 00:00:01,250\nDon't stop, now!\n\n2\n00:00:01,500 --> 00:00:02,000\n(ok) then\n";
        let output = transform_srt(input, true, true);
        assert_eq!(
            output,
            "1\n00:00:00,000 --> 00:00:01,250\nDONT STOP NOW\n\n2\n00:00:01,500 --> 00:00:02,000\nOK THEN\n"
        );

        let caps_only = transform_srt("1\n00:00:00,000 --> 00:00:01,000\nhi, you\n", true, false);
        assert!(caps_only.ends_with("HI, YOU\n"));
    }

    #[tokio::test]
    async fn test_write_srt_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("song.srt");
        write_srt(
            &path,
            &[SubtitleSegment {
                start: 0.0,
                end: 1.0,
                text: "hi".to_string(),
            }],
        )
        .await
        .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("1\n00:00:00,000 --> 00:00:01,000\nhi"));
    }
}
