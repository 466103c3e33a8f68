//! FFmpeg output parsing utilities.
//!
//! Parses the progress lines ffmpeg writes to stderr while encoding.

/// Progress reported by one ffmpeg status line.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeProgress {
    /// Output timestamp reached so far, in seconds.
    pub time_secs: f64,
    pub frame: Option<u64>,
    pub speed: Option<f64>,
}

impl EncodeProgress {
    /// Fraction of `total_secs` encoded so far, clamped to [0, 1].
    pub fn fraction_of(&self, total_secs: f64) -> Option<f64> {
        (total_secs > 0.0).then(|| (self.time_secs / total_secs).clamp(0.0, 1.0))
    }
}

/// Parse time string in HH:MM:SS.ms format to seconds.
///
/// # Examples
/// ```ignore
/// assert_eq!(parse_time("00:00:10.50"), Some(10.5));
/// assert_eq!(parse_time("invalid"), None);
/// ```
pub fn parse_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse speed multiplier (e.g., "speed=1.00x").
pub fn parse_speed(line: &str) -> Option<f64> {
    let speed_start = line.find("speed=")?;
    let speed_str = &line[speed_start + 6..];
    let end = speed_str.find('x')?;
    speed_str[..end].trim().parse().ok()
}

/// Parse frame counter (e.g., "frame=  120").
pub fn parse_frame(line: &str) -> Option<u64> {
    let frame_start = line.find("frame=")?;
    let frame_str = line[frame_start + 6..].trim_start();
    let end = frame_str
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(frame_str.len());
    frame_str[..end].parse().ok()
}

/// Parse time field (e.g., "time=00:01:30.50").
///
/// Returns `None` for ffmpeg's `time=N/A` placeholder.
pub fn parse_time_field(line: &str) -> Option<f64> {
    let time_start = line.find("time=")?;
    let time_str = &line[time_start + 5..];
    let end = time_str.find(' ').unwrap_or(time_str.len());
    parse_time(&time_str[..end])
}

/// Parse the input duration header (e.g., "  Duration: 00:03:12.40, start: 0.000000").
pub fn parse_duration_header(line: &str) -> Option<f64> {
    let start = line.find("Duration:")?;
    let rest = line[start + 9..].trim_start();
    let end = rest.find(',').unwrap_or(rest.len());
    parse_time(rest[..end].trim())
}

/// Parse an ffmpeg progress line.
///
/// Format: `frame=X fps=X q=X size=XkB time=HH:MM:SS.ms bitrate=Xkbits/s speed=Xx`
///
/// Requires `time=` plus `frame=` or `size=` so unrelated lines that happen to
/// contain "time=" are ignored.
pub fn parse_progress(line: &str) -> Option<EncodeProgress> {
    if !line.contains("time=") || !(line.contains("frame=") || line.contains("size=")) {
        return None;
    }

    Some(EncodeProgress {
        time_secs: parse_time_field(line)?,
        frame: parse_frame(line),
        speed: parse_speed(line),
    })
}
