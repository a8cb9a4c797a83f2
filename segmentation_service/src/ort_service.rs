use crate::{
    config::{ModelConfig, Validatable},
    model_service::{ModelError, Prompt, RawMask, SegmentationModel},
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayD, Ix2, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session, SessionOutputs},
    value::Tensor,
};
use std::ops::Range;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use thiserror::Error;

const MODEL_INPUT_SIZE: u32 = 1024;
const LOW_RES_MASK_SIZE: usize = 256;
const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];
const PADDING_LABEL: f32 = -1.0;

#[derive(Error, Debug)]
pub enum EngineInitError {
    #[error("invalid model configuration: {0}")]
    Config(String),
    #[error("failed to create ONNX session: {0}")]
    Ort(#[from] ort::Error),
}

/// Image tensor in model space plus the per-axis factors that map original
/// pixel coordinates into it.
struct ModelInput {
    pixels: Array4<f32>,
    scale_x: f32,
    scale_y: f32,
}

/// Resizes so the longest side is 1024, normalises, and zero-pads to 1024x1024.
fn transform_image(image: &RgbImage) -> ModelInput {
    let (width, height) = image.dimensions();
    let scale = MODEL_INPUT_SIZE as f32 / width.max(height) as f32;
    let resized_width = ((width as f32 * scale).round() as u32).clamp(1, MODEL_INPUT_SIZE);
    let resized_height = ((height as f32 * scale).round() as u32).clamp(1, MODEL_INPUT_SIZE);
    let resized = image::imageops::resize(image, resized_width, resized_height, FilterType::Triangle);

    let side = MODEL_INPUT_SIZE as usize;
    let mut pixels = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            pixels[[0, channel, y as usize, x as usize]] =
                (pixel.0[channel] as f32 - PIXEL_MEAN[channel]) / PIXEL_STD[channel];
        }
    }

    ModelInput {
        pixels,
        scale_x: resized_width as f32 / width as f32,
        scale_y: resized_height as f32 / height as f32,
    }
}

/// Point tensors for the decoder, with the trailing padding point the decoder
/// expects when no box prompt is given.
fn prompt_tensors(prompts: &[Prompt], scale_x: f32, scale_y: f32) -> (Array3<f32>, Array2<f32>) {
    let count = prompts.len() + 1;
    let mut coords = Array3::<f32>::zeros((1, count, 2));
    let mut labels = Array2::<f32>::from_elem((1, count), PADDING_LABEL);
    for (i, prompt) in prompts.iter().enumerate() {
        coords[[0, i, 0]] = prompt.x as f32 * scale_x;
        coords[[0, i, 1]] = prompt.y as f32 * scale_y;
        labels[[0, i]] = if prompt.foreground { 1.0 } else { 0.0 };
    }
    (coords, labels)
}

/// Decoders with four outputs reserve slot 0 for the single-mask answer and
/// slots 1..4 for the multimask candidates.
fn candidate_range(outputs: usize, multimask: bool) -> Range<usize> {
    match (outputs, multimask) {
        (4, true) => 1..4,
        (4, false) => 0..1,
        (n, _) => 0..n,
    }
}

fn masks_from_logits(
    masks: ArrayD<f32>,
    iou: ArrayD<f32>,
    multimask: bool,
    threshold: f32,
    expected: (usize, usize),
) -> Result<Vec<RawMask>, ModelError> {
    let masks = masks
        .into_dimensionality::<Ix4>()
        .map_err(|e| ModelError::Output(format!("masks: {}", e)))?;
    let iou = iou
        .into_dimensionality::<Ix2>()
        .map_err(|e| ModelError::Output(format!("iou_predictions: {}", e)))?;

    let (_, outputs, rows, cols) = masks.dim();
    if (rows, cols) != expected {
        return Err(ModelError::Output(format!(
            "mask is {}x{}, expected {}x{}",
            cols, rows, expected.1, expected.0
        )));
    }
    if iou.dim().1 < outputs {
        return Err(ModelError::Output(format!(
            "{} masks but {} scores",
            outputs,
            iou.dim().1
        )));
    }

    Ok(candidate_range(outputs, multimask)
        .map(|k| RawMask {
            mask: masks.slice(s![0, k, .., ..]).mapv(|logit| logit > threshold),
            score: iou[[0, k]],
        })
        .collect())
}

fn extract(outputs: &SessionOutputs, name: &str) -> Result<ArrayD<f32>, ModelError> {
    let (shape, data) = outputs[name]
        .try_extract_tensor::<f32>()
        .map_err(|e| ModelError::Output(format!("failed to extract {}: {}", name, e)))?;
    ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
        .map_err(|e| ModelError::Output(format!("invalid {} shape: {}", name, e)))
}

struct SessionPair {
    encoder: Session,
    decoder: Session,
}

/// SAM-style engine: an image encoder followed by a prompt decoder.
///
/// Holds `num_instances` encoder/decoder pairs, each behind a mutex and picked
/// round-robin, so at most `num_instances` inferences run at once.
#[derive(Clone)]
pub struct OrtSamEngine {
    sessions: Arc<Vec<Arc<Mutex<SessionPair>>>>,
    counter: Arc<AtomicUsize>,
    mask_threshold: f32,
}

impl OrtSamEngine {
    pub fn new(model_config: &ModelConfig) -> Result<Self, EngineInitError> {
        model_config.validate().map_err(EngineInitError::Config)?;

        let num_instances = model_config.num_instances;
        let sessions = (0..num_instances)
            .map(|_| {
                let encoder = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_encoder_path())?;
                let decoder = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_decoder_path())?;
                Ok(Arc::new(Mutex::new(SessionPair { encoder, decoder })))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!("Created {} encoder/decoder session pairs", num_instances);

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            mask_threshold: model_config.mask_threshold,
        })
    }

    fn run_inference(
        &self,
        input: ModelInput,
        prompts: &[Prompt],
        original_size: (u32, u32),
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut guard = self.sessions[index]
            .lock()
            .map_err(|e| ModelError::SessionUnavailable(format!("session mutex poisoned: {}", e)))?;
        let pair = &mut *guard;

        tracing::debug!("Handling request with session pair {}", index);

        let image_tensor =
            Tensor::from_array(input.pixels).map_err(|e| ModelError::Input(e.to_string()))?;
        let embeddings = {
            let outputs = pair
                .encoder
                .run(ort::inputs!["image" => image_tensor])
                .map_err(|e| ModelError::Inference(format!("encoder: {}", e)))?;
            extract(&outputs, "image_embeddings")?
        };

        let (coords, labels) = prompt_tensors(prompts, input.scale_x, input.scale_y);
        let (width, height) = original_size;
        let decoder_inputs = ort::inputs![
            "image_embeddings" => Tensor::from_array(embeddings).map_err(|e| ModelError::Input(e.to_string()))?,
            "point_coords" => Tensor::from_array(coords).map_err(|e| ModelError::Input(e.to_string()))?,
            "point_labels" => Tensor::from_array(labels).map_err(|e| ModelError::Input(e.to_string()))?,
            "mask_input" => Tensor::from_array(Array4::<f32>::zeros((1, 1, LOW_RES_MASK_SIZE, LOW_RES_MASK_SIZE)))
                .map_err(|e| ModelError::Input(e.to_string()))?,
            "has_mask_input" => Tensor::from_array(Array1::<f32>::zeros(1)).map_err(|e| ModelError::Input(e.to_string()))?,
            "orig_im_size" => Tensor::from_array(Array1::from(vec![height as f32, width as f32]))
                .map_err(|e| ModelError::Input(e.to_string()))?
        ];

        let outputs = pair
            .decoder
            .run(decoder_inputs)
            .map_err(|e| ModelError::Inference(format!("decoder: {}", e)))?;

        Ok((extract(&outputs, "masks")?, extract(&outputs, "iou_predictions")?))
    }
}

impl SegmentationModel for OrtSamEngine {
    fn infer(
        &self,
        image: &RgbImage,
        prompts: &[Prompt],
        multimask: bool,
    ) -> Result<Vec<RawMask>, ModelError> {
        let (width, height) = image.dimensions();
        let input = transform_image(image);
        let (masks, iou) = self.run_inference(input, prompts, (width, height))?;

        masks_from_logits(
            masks,
            iou,
            multimask,
            self.mask_threshold,
            (height as usize, width as usize),
        )
    }

    fn max_concurrency(&self) -> usize {
        self.sessions.len()
    }
}
