use crate::model_service::Prompt;
use image::{ImageError, ImageReader};
use segmentation_proto::{
    segmentation_service_client::SegmentationServiceClient, Point, SegmentationRequest,
    SegmentationResponse,
};
use std::io::Cursor;
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tonic::{
    transport::{Channel, Error},
    Code, Request, Status,
};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to gRPC server: {0}")]
    ConnectionFailed(#[from] Error),
    #[error("Maximum connection retries exceeded.")]
    MaxRetriesExceeded,
    #[error("gRPC request failed: {0}")]
    GrpcRequestFailed(#[from] Status),
    #[error("Could not read image: {0}")]
    Image(#[from] ImageError),
    #[error("Image is too large: {0}x{1}")]
    ImageTooLarge(u32, u32),
}

impl ClientError {
    pub fn code(&self) -> Option<Code> {
        match self {
            ClientError::GrpcRequestFailed(status) => Some(status.code()),
            _ => None,
        }
    }
}

pub struct SegmentationClient {
    client: SegmentationServiceClient<Channel>,
}

impl SegmentationClient {
    /// Connects with exponential backoff and jitter.
    pub async fn connect(address: String, max_message_size: usize) -> Result<Self, ClientError> {
        let mut retry_delay = Duration::from_millis(50);
        let max_retry_delay = Duration::from_secs(1);
        let max_retries = 10;
        let mut retry_count = 0;

        while retry_count < max_retries {
            match timeout(
                Duration::from_secs(1),
                SegmentationServiceClient::connect(address.clone()),
            )
            .await
            {
                Ok(Ok(client)) => {
                    let client = client
                        .max_decoding_message_size(max_message_size)
                        .max_encoding_message_size(max_message_size);
                    return Ok(Self { client });
                }
                Ok(Err(e)) => {
                    tracing::error!("Failed to connect to gRPC server: {:?}", e);
                }
                Err(_) => {
                    tracing::error!("Connection timeout");
                }
            }

            retry_count += 1;
            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter)).await;
            retry_delay = (retry_delay * 2).min(max_retry_delay);
        }

        Err(ClientError::MaxRetriesExceeded)
    }

    #[instrument(skip(self, image_data, prompts), fields(prompts = prompts.len()))]
    pub async fn segment(
        &mut self,
        image_data: Vec<u8>,
        prompts: &[Prompt],
        multimask: bool,
    ) -> Result<SegmentationResponse, ClientError> {
        let (width, height) = ImageReader::new(Cursor::new(&image_data))
            .with_guessed_format()
            .map_err(ImageError::IoError)?
            .into_dimensions()?;
        let (Ok(width), Ok(height)) = (i32::try_from(width), i32::try_from(height)) else {
            return Err(ClientError::ImageTooLarge(width, height));
        };

        let request = Request::new(SegmentationRequest {
            image_data,
            width,
            height,
            coordinates: prompts.iter().map(|p| Point { x: p.x, y: p.y }).collect(),
            labels: prompts.iter().map(|p| i32::from(p.foreground)).collect(),
            multimask_output: multimask,
        });

        let response = self.client.segment_image(request).await?;
        Ok(response.into_inner())
    }
}

/// Parses `x,y,label` where label is 1 (foreground) or 0 (background).
pub fn parse_prompt(s: &str) -> Result<Prompt, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [x, y, label] = parts.as_slice() else {
        return Err(format!("Invalid point `{}`, expected x,y,label", s));
    };
    let x: i32 = x.parse().map_err(|_| format!("Invalid x value in `{}`", s))?;
    let y: i32 = y.parse().map_err(|_| format!("Invalid y value in `{}`", s))?;
    let foreground = match *label {
        "1" => true,
        "0" => false,
        other => return Err(format!("Invalid label `{}`, use 1 or 0", other)),
    };
    Ok(Prompt { x, y, foreground })
}
