use crate::{
    config::PostprocessConfig,
    contours::{extract_polygons, Outline},
    error::SegmentationError,
    imaging::{compose_labels, decode_rgb, encode_labels_png, encode_mask_png, LabelImage},
    model_service::{Prompt, RawMask, SegmentationModel},
    ranking::rank,
    worker_pool::WorkerPool,
};
use segmentation_proto::{Point, Polygon, SegmentResult, SegmentationRequest, SegmentationResponse};
use std::sync::Arc;
use tracing::instrument;

/// Runs one segmentation call: validate, then hand decoding, inference and
/// post-processing to the worker pool as a single job.
pub struct SegmentationHandler<M: SegmentationModel> {
    model: Arc<M>,
    pool: WorkerPool,
    compose_labeled_image: bool,
    max_image_pixels: u64,
}

impl<M: SegmentationModel> Clone for SegmentationHandler<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            pool: self.pool.clone(),
            compose_labeled_image: self.compose_labeled_image,
            max_image_pixels: self.max_image_pixels,
        }
    }
}

impl<M: SegmentationModel> SegmentationHandler<M> {
    /// The pool never exceeds what the model can run at once.
    pub fn new(model: Arc<M>, workers: usize, postprocess: &PostprocessConfig) -> Self {
        let size = workers.min(model.max_concurrency());
        let pool = WorkerPool::new(size);
        tracing::info!(
            "Worker pool sized {} (requested {}, model allows {})",
            pool.size(),
            workers,
            model.max_concurrency()
        );

        Self {
            model,
            pool,
            compose_labeled_image: postprocess.compose_labeled_image,
            max_image_pixels: postprocess.max_image_pixels,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[instrument(
        skip_all,
        fields(
            width = request.width,
            height = request.height,
            prompts = request.coordinates.len(),
            multimask = request.multimask_output
        )
    )]
    pub async fn handle(
        &self,
        request: SegmentationRequest,
    ) -> Result<SegmentationResponse, SegmentationError> {
        let (width, height) =
            validate_dimensions(request.width, request.height, self.max_image_pixels)?;
        let prompts = parse_prompts(&request.coordinates, &request.labels, width, height)?;
        if request.image_data.is_empty() {
            return Err(SegmentationError::invalid("image_data is empty"));
        }

        tracing::debug!(
            "{} of {} worker slots free",
            self.pool.available(),
            self.pool.size()
        );

        let model = self.model.clone();
        let image_data = request.image_data;
        let multimask = request.multimask_output;
        let compose = self.compose_labeled_image;
        let (segments, labeled_image) = self
            .pool
            .run(move || -> Result<_, SegmentationError> {
                let image = decode_rgb(&image_data).map_err(SegmentationError::ImageDecoding)?;
                let raw_masks = model.infer(&image, &prompts, multimask)?;
                postprocess(rank(raw_masks), width, height, compose)
            })
            .await??;

        tracing::debug!("Returning {} segments", segments.len());
        for segment in &segments {
            tracing::debug!(
                "Segment {}: score={:.3}, polygons={}",
                segment.index,
                segment.score,
                segment.polygons.len()
            );
        }

        Ok(SegmentationResponse {
            labeled_image,
            width: request.width,
            height: request.height,
            segments,
        })
    }
}

/// Encodes ranked masks as segments plus the labeled image.
fn postprocess(
    ranked: Vec<RawMask>,
    width: u32,
    height: u32,
    compose: bool,
) -> Result<(Vec<SegmentResult>, Vec<u8>), SegmentationError> {
    let segments = ranked
        .iter()
        .enumerate()
        .map(|(rank, raw)| build_segment(rank + 1, raw))
        .collect::<Result<Vec<_>, _>>()?;

    let labels = if compose {
        compose_labels(width, height, &ranked)
    } else {
        LabelImage::new(width, height)
    };
    let labeled_image =
        encode_labels_png(&labels).map_err(|source| SegmentationError::Encoding {
            what: "labeled image",
            source,
        })?;

    Ok((segments, labeled_image))
}

fn validate_dimensions(
    width: i32,
    height: i32,
    max_pixels: u64,
) -> Result<(u32, u32), SegmentationError> {
    let (w, h) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(SegmentationError::invalid(format!(
                "width and height must be positive, got {}x{}",
                width, height
            )))
        }
    };
    if u64::from(w) * u64::from(h) > max_pixels {
        return Err(SegmentationError::invalid(format!(
            "image of {}x{} exceeds the limit of {} pixels",
            w, h, max_pixels
        )));
    }
    Ok((w, h))
}

fn parse_prompts(
    coordinates: &[Point],
    labels: &[i32],
    width: u32,
    height: u32,
) -> Result<Vec<Prompt>, SegmentationError> {
    if coordinates.len() != labels.len() {
        return Err(SegmentationError::invalid(format!(
            "coordinates and labels must have the same length, got {} coordinates and {} labels",
            coordinates.len(),
            labels.len()
        )));
    }
    if coordinates.is_empty() {
        return Err(SegmentationError::invalid("at least one prompt point is required"));
    }

    coordinates
        .iter()
        .zip(labels)
        .enumerate()
        .map(|(i, (point, &label))| {
            let inside = (0..width as i64).contains(&i64::from(point.x))
                && (0..height as i64).contains(&i64::from(point.y));
            if !inside {
                return Err(SegmentationError::invalid(format!(
                    "coordinate {} ({}, {}) is outside the {}x{} image",
                    i, point.x, point.y, width, height
                )));
            }
            let foreground = match label {
                1 => true,
                0 => false,
                other => {
                    return Err(SegmentationError::invalid(format!(
                        "label {} is {}, expected 1 (foreground) or 0 (background)",
                        i, other
                    )))
                }
            };
            Ok(Prompt {
                x: point.x,
                y: point.y,
                foreground,
            })
        })
        .collect()
}

fn to_polygon(outline: Outline) -> Polygon {
    Polygon {
        points: outline
            .into_iter()
            .map(|p| Point { x: p.x, y: p.y })
            .collect(),
    }
}

fn build_segment(index: usize, raw: &RawMask) -> Result<SegmentResult, SegmentationError> {
    let mask = encode_mask_png(&raw.mask).map_err(|source| SegmentationError::Encoding {
        what: "segment mask",
        source,
    })?;
    let polygons = extract_polygons(&raw.mask)
        .into_iter()
        .map(to_polygon)
        .collect();

    Ok(SegmentResult {
        index: i32::try_from(index).unwrap_or(i32::MAX),
        score: raw.score,
        mask,
        polygons,
    })
}
