use crate::model_service::{ModelError, Prompt, RawMask, SegmentationModel};
use image::{GrayImage, ImageFormat, Luma, RgbImage};
use ndarray::Array2;
use segmentation_proto::{Point, SegmentationRequest};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn gray_png(width: u32, height: u32) -> Vec<u8> {
    let image = GrayImage::from_fn(width, height, |x, y| Luma([((x + y) % 256) as u8]));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// Builds a request over a grayscale PNG of the declared size.
/// Points are `(x, y, label)`.
pub fn request(
    width: i32,
    height: i32,
    points: &[(i32, i32, i32)],
    multimask: bool,
) -> SegmentationRequest {
    SegmentationRequest {
        image_data: gray_png(width.max(1) as u32, height.max(1) as u32),
        width,
        height,
        coordinates: points.iter().map(|&(x, y, _)| Point { x, y }).collect(),
        labels: points.iter().map(|&(_, _, label)| label).collect(),
        multimask_output: multimask,
    }
}

/// A `width x height` mask with a `size x size` block at `(x0, y0)`, clipped.
pub fn square(width: usize, height: usize, x0: usize, y0: usize, size: usize) -> Array2<bool> {
    Array2::from_shape_fn((height, width), |(y, x)| {
        (x0..x0 + size).contains(&x) && (y0..y0 + size).contains(&y)
    })
}

/// Returns the same masks for every call.
pub struct ScriptedModel {
    masks: Vec<RawMask>,
}

impl ScriptedModel {
    pub fn new(masks: Vec<RawMask>) -> Self {
        Self { masks }
    }
}

impl SegmentationModel for ScriptedModel {
    fn infer(
        &self,
        _image: &RgbImage,
        _prompts: &[Prompt],
        _multimask: bool,
    ) -> Result<Vec<RawMask>, ModelError> {
        Ok(self.masks.clone())
    }

    fn max_concurrency(&self) -> usize {
        usize::MAX
    }
}

/// Draws squares centred on the first prompt, so every response can be traced
/// back to its request. Multimask calls return three sizes whose scores rank
/// the middle one first.
pub struct SquareModel {
    delay: Duration,
    fail_at: Option<(i32, i32)>,
    limit: usize,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    last_dimensions: Mutex<Option<(u32, u32)>>,
}

impl Default for SquareModel {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_at: None,
            limit: 64,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            last_dimensions: Mutex::new(None),
        }
    }
}

impl SquareModel {
    pub const HALF_SIZES: [usize; 3] = [1, 2, 3];
    pub const SCORES: [f32; 3] = [0.6, 0.95, 0.8];

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_at(mut self, x: i32, y: i32) -> Self {
        self.fail_at = Some((x, y));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn last_dimensions(&self) -> Option<(u32, u32)> {
        *self.last_dimensions.lock().unwrap()
    }

    fn draw(&self, image: &RgbImage, prompts: &[Prompt], multimask: bool) -> Vec<RawMask> {
        let (width, height) = image.dimensions();
        let centre = prompts[0];
        let candidates: &[usize] = if multimask {
            &Self::HALF_SIZES
        } else {
            &Self::HALF_SIZES[1..2]
        };
        candidates
            .iter()
            .enumerate()
            .map(|(i, &half)| {
                let x0 = (centre.x as usize).saturating_sub(half);
                let y0 = (centre.y as usize).saturating_sub(half);
                let score = if multimask { Self::SCORES[i] } else { 0.9 };
                RawMask {
                    mask: square(width as usize, height as usize, x0, y0, 2 * half + 1),
                    score,
                }
            })
            .collect()
    }
}

impl SegmentationModel for SquareModel {
    fn infer(
        &self,
        image: &RgbImage,
        prompts: &[Prompt],
        multimask: bool,
    ) -> Result<Vec<RawMask>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_dimensions.lock().unwrap() = Some(image.dimensions());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        std::thread::sleep(self.delay);
        let result = match self.fail_at {
            Some((x, y)) if prompts.iter().any(|p| p.x == x && p.y == y) => {
                Err(ModelError::Inference("simulated engine fault".to_string()))
            }
            _ => Ok(self.draw(image, prompts, multimask)),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn max_concurrency(&self) -> usize {
        self.limit
    }
}
