//! Short clip generation.
//!
//! Clips are rendered as a sequence of still generations that share one
//! prompt while the seed advances by one per frame, then assembled into a
//! looping GIF. No temporal model is involved, so neighboring frames are
//! related only through the prompt.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, RgbImage};
use tracing::info;

use crate::pipeline::{GenOptions, Pipeline};

/// Default output file for clips.
pub const DEFAULT_OUTPUT: &str = "generated_video.gif";

/// Step count clips default to, lighter than the still image defaults.
pub const DEFAULT_STEPS: usize = 25;

/// Clip settings independent of the per-frame generation options.
#[derive(Debug, Clone, Copy)]
pub struct VideoOptions {
    pub frames: usize,
    pub fps: u32,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self { frames: 24, fps: 8 }
    }
}

impl VideoOptions {
    pub fn validate(&self) -> Result<()> {
        if self.frames == 0 {
            bail!("A clip needs at least one frame");
        }
        if self.fps == 0 {
            bail!("fps must be at least 1");
        }
        Ok(())
    }
}

/// Render `frame_count` stills, advancing the seed by one per frame.
pub fn generate_frames(
    pipeline: &mut Pipeline,
    prompt: &str,
    base: &GenOptions,
    frame_count: usize,
) -> Result<Vec<RgbImage>> {
    let mut frames = Vec::with_capacity(frame_count);
    for index in 0..frame_count {
        info!(frame = index + 1, total = frame_count, "Rendering frame");
        let mut opts = base.clone();
        opts.seed = base.seed.wrapping_add(index as u64);
        frames.push(pipeline.generate(prompt, &opts)?);
    }
    Ok(frames)
}

/// Assemble frames into an infinitely looping GIF.
pub fn encode_gif(frames: &[RgbImage], fps: u32, output: &Path) -> Result<()> {
    if frames.is_empty() {
        bail!("No frames to encode");
    }
    if fps == 0 {
        bail!("fps must be at least 1");
    }

    let file = File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut encoder = GifEncoder::new_with_speed(BufWriter::new(file), 10);
    encoder.set_repeat(Repeat::Infinite)?;

    let delay = Delay::from_numer_denom_ms(1000, fps);
    for frame in frames {
        let rgba = DynamicImage::ImageRgb8(frame.clone()).into_rgba8();
        encoder.encode_frame(Frame::from_parts(rgba, 0, 0, delay))?;
    }
    Ok(())
}

/// Render a clip and write it to disk, timing the whole run.
pub fn generate_to_file(
    pipeline: &mut Pipeline,
    model_name: &str,
    prompt: &str,
    base: &GenOptions,
    video: &VideoOptions,
    output: &Path,
) -> Result<()> {
    video.validate()?;

    let start = Instant::now();
    let frames = generate_frames(pipeline, prompt, base, video.frames)?;
    encode_gif(&frames, video.fps, output)?;
    let elapsed = start.elapsed().as_secs_f64();

    println!("--- {model_name}: {elapsed:.2} seconds ---");
    info!(
        path = %output.display(),
        frames = video.frames,
        fps = video.fps,
        "✓ Clip saved"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifDecoder;
    use image::AnimationDecoder;
    use std::io::BufReader;

    fn solid_frame(size: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(size, size, image::Rgb(rgb))
    }

    #[test]
    fn gif_round_trips_frame_count_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.gif");
        let frames = vec![
            solid_frame(4, [255, 0, 0]),
            solid_frame(4, [0, 255, 0]),
            solid_frame(4, [0, 0, 255]),
        ];

        encode_gif(&frames, 8, &path).unwrap();

        let decoder = GifDecoder::new(BufReader::new(File::open(&path).unwrap())).unwrap();
        let decoded = decoder.into_frames().collect_frames().unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].buffer().dimensions(), (4, 4));
    }

    #[test]
    fn empty_clip_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.gif");
        assert!(encode_gif(&[], 8, &path).is_err());
    }

    #[test]
    fn zero_fps_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.gif");
        let frames = vec![solid_frame(2, [1, 2, 3])];
        assert!(encode_gif(&frames, 0, &path).is_err());

        let opts = VideoOptions { frames: 1, fps: 0 };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn defaults_match_the_clip_profile() {
        let opts = VideoOptions::default();
        assert_eq!(opts.frames, 24);
        assert_eq!(opts.fps, 8);
        assert!(opts.validate().is_ok());
    }
}
