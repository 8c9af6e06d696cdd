//! Per-frame annotation stage.
//!
//! An `Annotator` sits between the decoder and the latest-frame slot. It takes a
//! decoded frame and either returns a copy of the same dimensions with overlays
//! drawn on it, or reports that it left the frame alone so the camera's own
//! JPEG can be served. Annotation is best-effort: a failing annotator never
//! costs a frame.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::frame::Frame;

/// Frame transform applied before storage.
///
/// Implementations run on the decoder thread and should finish well within the
/// camera's frame interval.
pub trait Annotator: Send {
    /// Annotator identifier.
    fn name(&self) -> &'static str;

    /// Produce an annotated copy of `frame`, or `None` when nothing was drawn.
    /// An annotated frame must keep the input's dimensions.
    fn annotate(&mut self, frame: &Frame) -> Result<Option<Frame>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Run `annotator`, falling back to the input frame when nothing was drawn, on
/// error, or on a dimension change. The flag is true only when the returned
/// frame differs from the input.
pub fn annotate_or_passthrough(annotator: &mut dyn Annotator, frame: Frame) -> (Frame, bool) {
    match annotator.annotate(&frame) {
        Ok(None) => (frame, false),
        Ok(Some(annotated)) if annotated.dimensions() == frame.dimensions() => (annotated, true),
        Ok(Some(annotated)) => {
            log::warn!(
                "annotator '{}' changed frame size {:?} -> {:?}; passing frame through",
                annotator.name(),
                frame.dimensions(),
                annotated.dimensions()
            );
            (frame, false)
        }
        Err(err) => {
            log::warn!(
                "annotator '{}' failed: {:#}; passing frame through",
                annotator.name(),
                err
            );
            (frame, false)
        }
    }
}

/// Annotators selectable from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AnnotatorKind {
    #[default]
    None,
    Motion,
}

impl FromStr for AnnotatorKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(AnnotatorKind::None),
            "motion" => Ok(AnnotatorKind::Motion),
            other => Err(anyhow!(
                "unknown annotator '{}'; expected 'none' or 'motion'",
                other
            )),
        }
    }
}

pub fn build_annotator(kind: AnnotatorKind) -> Option<Box<dyn Annotator>> {
    match kind {
        AnnotatorKind::None => None,
        AnnotatorKind::Motion => Some(Box::new(MotionAnnotator::default())),
    }
}

// ----------------------------------------------------------------------------
// MotionAnnotator
// ----------------------------------------------------------------------------

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

/// Boxes the region that changed since the previous frame.
pub struct MotionAnnotator {
    /// Minimum luma difference for a pixel to count as changed.
    pub threshold: u8,
    /// Minimum changed pixels before a box is drawn.
    pub min_pixels: usize,
    previous: Option<PreviousFrame>,
}

struct PreviousFrame {
    digest: [u8; 32],
    width: u32,
    height: u32,
    luma: Vec<u8>,
}

/// Inclusive pixel bounds of a changed region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionRegion {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub changed_pixels: usize,
}

impl MotionAnnotator {
    pub fn new(threshold: u8, min_pixels: usize) -> Self {
        Self {
            threshold,
            min_pixels,
            previous: None,
        }
    }

    /// Compare `image` with the previous frame and remember it for next time.
    pub fn detect(&mut self, image: &RgbImage) -> Option<MotionRegion> {
        let digest: [u8; 32] = Sha256::digest(image.as_raw()).into();
        let (width, height) = image.dimensions();

        let unchanged = self.previous.as_ref().is_some_and(|prev| {
            prev.digest == digest && prev.width == width && prev.height == height
        });
        if unchanged {
            return None;
        }

        let luma = to_luma(image);
        let region = match &self.previous {
            Some(prev) if prev.width == width && prev.height == height => {
                changed_region(&prev.luma, &luma, width, self.threshold)
                    .filter(|region| region.changed_pixels >= self.min_pixels)
            }
            _ => None,
        };

        self.previous = Some(PreviousFrame {
            digest,
            width,
            height,
            luma,
        });
        region
    }
}

impl Default for MotionAnnotator {
    fn default() -> Self {
        Self::new(24, 16)
    }
}

impl Annotator for MotionAnnotator {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn annotate(&mut self, frame: &Frame) -> Result<Option<Frame>> {
        let Some(region) = self.detect(frame.image()) else {
            return Ok(None);
        };
        let mut image = frame.image().clone();
        draw_box(&mut image, region);
        Ok(Some(Frame::from_image(image)))
    }
}

fn to_luma(image: &RgbImage) -> Vec<u8> {
    image
        .pixels()
        .map(|Rgb([r, g, b])| {
            ((u32::from(*r) * 299 + u32::from(*g) * 587 + u32::from(*b) * 114) / 1000) as u8
        })
        .collect()
}

fn changed_region(previous: &[u8], current: &[u8], width: u32, threshold: u8) -> Option<MotionRegion> {
    let mut region: Option<MotionRegion> = None;
    for (index, (a, b)) in previous.iter().zip(current).enumerate() {
        if a.abs_diff(*b) < threshold {
            continue;
        }
        let x = (index as u32) % width;
        let y = (index as u32) / width;
        match region.as_mut() {
            Some(r) => {
                r.left = r.left.min(x);
                r.right = r.right.max(x);
                r.top = r.top.min(y);
                r.bottom = r.bottom.max(y);
                r.changed_pixels += 1;
            }
            None => {
                region = Some(MotionRegion {
                    left: x,
                    top: y,
                    right: x,
                    bottom: y,
                    changed_pixels: 1,
                })
            }
        }
    }
    region
}

fn draw_box(image: &mut RgbImage, region: MotionRegion) {
    let (width, height) = image.dimensions();
    let right = region.right.min(width.saturating_sub(1));
    let bottom = region.bottom.min(height.saturating_sub(1));
    for t in 0..BOX_THICKNESS {
        for x in region.left..=right {
            put(image, x, region.top.saturating_add(t));
            put(image, x, bottom.saturating_sub(t));
        }
        for y in region.top..=bottom {
            put(image, region.left.saturating_add(t), y);
            put(image, right.saturating_sub(t), y);
        }
    }
}

fn put(image: &mut RgbImage, x: u32, y: u32) {
    if x < image.width() && y < image.height() {
        image.put_pixel(x, y, BOX_COLOR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([40, 40, 40]))
    }

    struct Failing;

    impl Annotator for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn annotate(&mut self, _frame: &Frame) -> Result<Option<Frame>> {
            Err(anyhow!("model not loaded"))
        }
    }

    struct Resizing;

    impl Annotator for Resizing {
        fn name(&self) -> &'static str {
            "resizing"
        }

        fn annotate(&mut self, _frame: &Frame) -> Result<Option<Frame>> {
            Ok(Some(Frame::from_image(gray(1, 1))))
        }
    }

    #[test]
    fn failing_annotator_passes_frame_through() {
        let frame = Frame::from_image(gray(4, 4));
        let (out, annotated) = annotate_or_passthrough(&mut Failing, frame.clone());
        assert!(!annotated);
        assert_eq!(out, frame);
    }

    #[test]
    fn resizing_annotator_is_rejected() {
        let frame = Frame::from_image(gray(4, 4));
        let (out, annotated) = annotate_or_passthrough(&mut Resizing, frame.clone());
        assert!(!annotated);
        assert_eq!(out.dimensions(), (4, 4));
    }

    #[test]
    fn kind_parses_from_config_strings() {
        assert_eq!("motion".parse::<AnnotatorKind>().unwrap(), AnnotatorKind::Motion);
        assert_eq!(" NONE ".parse::<AnnotatorKind>().unwrap(), AnnotatorKind::None);
        assert!("yolo".parse::<AnnotatorKind>().is_err());
        assert!(build_annotator(AnnotatorKind::None).is_none());
        assert_eq!(
            build_annotator(AnnotatorKind::Motion).map(|a| a.name()),
            Some("motion")
        );
    }

    #[test]
    fn motion_detects_changed_block() {
        let mut annotator = MotionAnnotator::new(20, 4);
        let base = gray(16, 16);
        assert_eq!(annotator.detect(&base), None);

        let mut moved = base.clone();
        for y in 5..8 {
            for x in 10..13 {
                moved.put_pixel(x, y, Rgb([250, 250, 250]));
            }
        }
        let region = annotator.detect(&moved).expect("motion region");
        assert_eq!((region.left, region.top, region.right, region.bottom), (10, 5, 12, 7));
        assert_eq!(region.changed_pixels, 9);

        // Same frame again: nothing moved.
        assert_eq!(annotator.detect(&moved), None);
    }

    #[test]
    fn motion_annotation_draws_box_and_keeps_size() {
        let mut annotator = MotionAnnotator::new(20, 1);
        assert!(annotator
            .annotate(&Frame::from_image(gray(8, 8)))
            .unwrap()
            .is_none());

        let mut moved = gray(8, 8);
        moved.put_pixel(4, 4, Rgb([255, 255, 255]));
        let out = annotator
            .annotate(&Frame::from_image(moved))
            .unwrap()
            .expect("box drawn");
        assert_eq!(out.dimensions(), (8, 8));
        assert_eq!(*out.image().get_pixel(4, 4), BOX_COLOR);
    }

    #[test]
    fn still_scene_is_reported_untouched() {
        let mut annotator = MotionAnnotator::default();
        let frame = Frame::from_image(gray(8, 8));
        for _ in 0..2 {
            let (out, annotated) = annotate_or_passthrough(&mut annotator, frame.clone());
            assert!(!annotated);
            assert_eq!(out, frame);
        }
    }

    #[test]
    fn size_change_resets_motion_baseline() {
        let mut annotator = MotionAnnotator::new(10, 1);
        annotator.detect(&gray(4, 4));
        assert_eq!(annotator.detect(&gray(8, 8)), None);
    }
}
