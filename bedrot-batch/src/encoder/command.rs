//! Argument builders for the encoder invocations.
//!
//! Builders return only the job-specific arguments; the encoder adds the
//! global flags (`-hide_banner -nostdin -y`).

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Output frame shape of a slideshow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    /// 1920x1080, images letterboxed.
    #[default]
    #[serde(rename = "16:9")]
    Landscape,
    /// 1080x1920, images scaled and cropped to fill.
    #[serde(rename = "9:16")]
    Portrait,
}

impl AspectRatio {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            AspectRatio::Landscape => (1920, 1080),
            AspectRatio::Portrait => (1080, 1920),
        }
    }

    /// Form used in file names, e.g. `16x9`.
    pub fn file_tag(self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16x9",
            AspectRatio::Portrait => "9x16",
        }
    }

    fn scale_filter(self) -> String {
        let (w, h) = self.dimensions();
        match self {
            AspectRatio::Landscape => format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black,setsar=1"
            ),
            AspectRatio::Portrait => format!(
                "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},setsar=1"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl VideoQuality {
    pub fn bitrate(self) -> &'static str {
        match self {
            VideoQuality::Low => "1M",
            VideoQuality::Medium => "5M",
            VideoQuality::High => "10M",
        }
    }
}

/// Vertical placement of captions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Top,
    #[default]
    Center,
    Bottom,
}

impl Alignment {
    /// libass `Alignment` value for `force_style`.
    ///
    /// Center uses the legacy SSA value 10, which libass accepts in
    /// `force_style` where the numpad value 5 is not honored.
    pub fn ass_value(self) -> u8 {
        match self {
            Alignment::Top => 8,
            Alignment::Center => 10,
            Alignment::Bottom => 2,
        }
    }
}

/// Visual settings of a caption video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionStyle {
    pub font_name: String,
    pub font_size: u32,
    /// `#RRGGBB`.
    pub font_color: String,
    /// `#RRGGBB`; ignored when `transparent` is set.
    pub background_color: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub alignment: Alignment,
    pub outline_size: u32,
    /// Add margins and shrink text on portrait frames.
    pub safe_area: bool,
    /// Render WebM/VP9 with an alpha channel instead of MP4.
    pub transparent: bool,
    pub all_caps: bool,
    pub strip_punctuation: bool,
}

impl Default for CaptionStyle {
    fn default() -> Self {
        Self {
            font_name: "Arial Narrow".to_string(),
            font_size: 56,
            font_color: "#ffffff".to_string(),
            background_color: "#000000".to_string(),
            width: 1920,
            height: 1080,
            fps: 30,
            alignment: Alignment::Center,
            outline_size: 2,
            safe_area: false,
            transparent: false,
            all_caps: false,
            strip_punctuation: false,
        }
    }
}

impl CaptionStyle {
    pub fn output_extension(&self) -> &'static str {
        if self.transparent { "webm" } else { "mp4" }
    }

    pub fn needs_text_transform(&self) -> bool {
        self.all_caps || self.strip_punctuation
    }
}

/// Convert `#RRGGBB` to the `BBGGRR` order libass expects. Invalid input maps to white.
pub fn hex_to_bgr(hex_color: &str) -> String {
    let hex = hex_color.trim_start_matches('#');
    if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        format!("{}{}{}", &hex[4..6], &hex[2..4], &hex[0..2])
    } else {
        "ffffff".to_string()
    }
}

/// Escape a path for the `subtitles` filter.
pub fn escape_subtitle_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .replace(':', "\\:")
}

/// Margins and effective font size of a caption frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeArea {
    pub margin_l: u32,
    pub margin_r: u32,
    pub margin_v: u32,
    pub font_size: u32,
}

pub fn safe_area(style: &CaptionStyle) -> SafeArea {
    if !style.safe_area {
        return SafeArea {
            margin_l: 0,
            margin_r: 0,
            margin_v: 0,
            font_size: style.font_size,
        };
    }

    let portrait = style.height > style.width;
    let (h_pct, v_pct, font_scale) = if portrait {
        (0.08, 0.05, 0.75)
    } else {
        (0.05, 0.03, 1.0)
    };

    let margin_h = (style.width as f64 * h_pct) as u32;
    SafeArea {
        margin_l: margin_h,
        margin_r: margin_h,
        margin_v: (style.height as f64 * v_pct) as u32,
        font_size: (style.font_size as f64 * font_scale) as u32,
    }
}

/// libass `force_style` value for the subtitles filter.
pub fn force_style(style: &CaptionStyle) -> String {
    let area = safe_area(style);
    let mut out = format!(
        "FontName={},FontSize={},PrimaryColour=&H{},Alignment={},BorderStyle=1,Outline={},Shadow=0",
        style.font_name,
        area.font_size,
        hex_to_bgr(&style.font_color),
        style.alignment.ass_value(),
        style.outline_size,
    );
    if style.safe_area {
        let _ = write!(
            out,
            ",MarginL={},MarginR={},MarginV={},WrapStyle=2",
            area.margin_l, area.margin_r, area.margin_v
        );
    }
    out
}

/// Arguments rendering `subtitle` over a solid (or transparent) background with `audio`.
pub fn caption_args(
    subtitle: &Path,
    audio: &Path,
    output: &Path,
    style: &CaptionStyle,
) -> Vec<String> {
    let size = format!("{}x{}", style.width, style.height);
    let filter = format!(
        "subtitles='{}':force_style='{}'",
        escape_subtitle_path(subtitle),
        force_style(style)
    );

    let color_input = if style.transparent {
        format!("color=c=black@0.0:s={}:r={},format=yuva420p", size, style.fps)
    } else {
        format!(
            "color=c={}:s={}:r={}",
            style.background_color.trim_start_matches('#'),
            size,
            style.fps
        )
    };

    let mut args = vec![
        "-f".to_string(),
        "lavfi".to_string(),
        "-i".to_string(),
        color_input,
        "-i".to_string(),
        audio.to_string_lossy().into_owned(),
        "-vf".to_string(),
        filter,
    ];

    let codec: &[&str] = if style.transparent {
        &[
            "-c:v", "libvpx-vp9", "-pix_fmt", "yuva420p", "-crf", "20", "-b:v", "0", "-c:a",
            "libopus", "-b:a", "128k",
        ]
    } else {
        &[
            "-c:v", "libx264", "-preset", "fast", "-c:a", "aac", "-b:a", "192k",
        ]
    };
    args.extend(codec.iter().map(|s| s.to_string()));
    args.push("-shortest".to_string());
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Arguments converting any audio input to MP3.
pub fn audio_to_mp3_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-vn".to_string(),
        "-c:a".to_string(),
        "libmp3lame".to_string(),
        "-q:a".to_string(),
        "2".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Concat demuxer script showing each image for `per_image` seconds.
///
/// The last image is listed twice because the demuxer ignores the duration of
/// the final entry.
pub fn concat_list(images: &[PathBuf], per_image: f64) -> String {
    let mut out = String::from("ffconcat version 1.0\n");
    for image in images {
        let _ = writeln!(out, "file '{}'", quote_concat_path(image));
        let _ = writeln!(out, "duration {:.3}", per_image);
    }
    if let Some(last) = images.last() {
        let _ = writeln!(out, "file '{}'", quote_concat_path(last));
    }
    out
}

fn quote_concat_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .replace('\'', "'\\''")
}

/// Arguments encoding a concat script into a slideshow video.
pub fn slideshow_args(
    concat_script: &Path,
    output: &Path,
    aspect: AspectRatio,
    fps: u32,
    quality: VideoQuality,
    total_secs: f64,
) -> Vec<String> {
    let filter = format!("{},fps={},format=yuv420p", aspect.scale_filter(), fps);
    vec![
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        concat_script.to_string_lossy().into_owned(),
        "-vf".to_string(),
        filter,
        "-r".to_string(),
        fps.to_string(),
        "-t".to_string(),
        format!("{:.3}", total_secs),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "medium".to_string(),
        "-b:v".to_string(),
        quality.bitrate().to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-an".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}
