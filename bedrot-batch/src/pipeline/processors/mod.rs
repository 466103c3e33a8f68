//! Job processors, one per job type.

mod caption;
mod slideshow;
mod traits;
pub mod utils;

pub use caption::{AUDIO_EXTENSIONS, CaptionProcessor, CaptionSpec, MAX_WORDS_PER_SEGMENT};
pub use slideshow::{MAX_VIDEO_SECS, SlideshowProcessor, SlideshowSpec};
pub use traits::{JobContext, Processor, ProcessorOutput};
