use crate::{model_service::ModelError, worker_pool::PoolError};
use image::ImageError;
use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("Image decoding error: {0}")]
    ImageDecoding(#[source] ImageError),
    #[error("inference failed: {0}")]
    Model(#[from] ModelError),
    #[error("failed to encode {what}: {source}")]
    Encoding {
        what: &'static str,
        #[source]
        source: ImageError,
    },
    #[error("worker pool failure: {0}")]
    Pool(#[from] PoolError),
}

impl SegmentationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::ImageDecoding(_))
    }

    /// Short diagnostic for the client; the full error only goes to the logs.
    fn public_message(&self) -> String {
        match self {
            Self::InvalidArgument(_) | Self::ImageDecoding(_) => self.to_string(),
            Self::Model(_) => "inference failed".to_string(),
            Self::Encoding { what, .. } => format!("failed to encode {}", what),
            Self::Pool(_) => "worker unavailable".to_string(),
        }
    }
}

impl From<SegmentationError> for Status {
    fn from(err: SegmentationError) -> Self {
        if err.is_client_error() {
            Status::invalid_argument(err.public_message())
        } else {
            Status::internal(err.public_message())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_validation_maps_to_invalid_argument() {
        let status: Status = SegmentationError::invalid("2 coordinates but 1 labels").into();

        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "2 coordinates but 1 labels");
    }

    #[test]
    fn test_internal_detail_is_not_leaked() {
        let err = SegmentationError::Model(ModelError::Inference(
            "CUDA error at /opt/onnxruntime/session.cc:42".to_string(),
        ));
        assert!(err.to_string().contains("session.cc"));

        let status: Status = err.into();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "inference failed");
    }

    #[test]
    fn test_pool_failure_is_internal() {
        let status: Status = SegmentationError::from(PoolError::Closed).into();
        assert_eq!(status.code(), Code::Internal);
    }
}
