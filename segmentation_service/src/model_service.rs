use image::RgbImage;
use ndarray::Array2;
use thiserror::Error;

/// A prompt point in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prompt {
    pub x: i32,
    pub y: i32,
    pub foreground: bool,
}

/// One candidate segment as emitted by the model, indexed `[[row, col]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMask {
    pub mask: Array2<bool>,
    pub score: f32,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("failed to build input tensor: {0}")]
    Input(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output: {0}")]
    Output(String),
}

/// Boundary to the segmentation engine.
///
/// `infer` is synchronous and may take seconds; callers must run it on a
/// blocking worker. The model is shared across requests and never mutated
/// per call, but it may not be reentrant: `max_concurrency` is the number of
/// `infer` calls it tolerates at once, and callers must not exceed it.
pub trait SegmentationModel: Send + Sync + 'static {
    fn infer(
        &self,
        image: &RgbImage,
        prompts: &[Prompt],
        multimask: bool,
    ) -> Result<Vec<RawMask>, ModelError>;

    fn max_concurrency(&self) -> usize;
}
