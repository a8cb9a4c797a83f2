use crate::{handler::SegmentationHandler, model_service::SegmentationModel};
use segmentation_proto::{
    segmentation_service_server::SegmentationService, SegmentationRequest, SegmentationResponse,
};
use std::sync::Arc;
use tonic::{async_trait, Request, Response, Status};

pub struct InferenceService<M: SegmentationModel> {
    handler: Arc<SegmentationHandler<M>>,
}

impl<M: SegmentationModel> Clone for InferenceService<M> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<M: SegmentationModel> InferenceService<M> {
    pub fn new(handler: SegmentationHandler<M>) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl<M: SegmentationModel> SegmentationService for InferenceService<M> {
    async fn segment_image(
        &self,
        request: Request<SegmentationRequest>,
    ) -> Result<Response<SegmentationResponse>, Status> {
        let remote = request.remote_addr();
        let segmentation_request = request.into_inner();

        match self.handler.handle(segmentation_request).await {
            Ok(response) => Ok(Response::new(response)),
            Err(err) if err.is_client_error() => {
                tracing::warn!("Rejected request from {:?}: {}", remote, err);
                Err(err.into())
            }
            Err(err) => {
                tracing::error!("Segmentation failed for {:?}: {:?}", remote, err);
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PostprocessConfig;
    use crate::test_support::{request, SquareModel};
    use std::time::Duration;
    use tonic::Code;

    fn service(model: Arc<SquareModel>, workers: usize) -> InferenceService<SquareModel> {
        InferenceService::new(SegmentationHandler::new(
            model,
            workers,
            &PostprocessConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_segment_image() -> Result<(), Box<dyn std::error::Error>> {
        let model = Arc::new(SquareModel::default());
        let inference_service = service(model, 2);

        let response = inference_service
            .segment_image(Request::new(request(40, 30, &[(20, 15, 1)], true)))
            .await?;

        let response = response.into_inner();
        assert_eq!(response.segments.len(), 3);
        let indices: Vec<i32> = response.segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        let scores: Vec<f32> = response.segments.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![0.95, 0.8, 0.6]);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_requests_stay_isolated() {
        let model = Arc::new(SquareModel::default().with_delay(Duration::from_millis(20)));
        let inference_service = service(model.clone(), 4);

        let calls = (0..50).map(|i| {
            let inference_service = inference_service.clone();
            async move {
                let (x, y) = (5 + i, 3 + (i % 7) * 4);
                let response = inference_service
                    .segment_image(Request::new(request(64, 40, &[(x, y, 1)], false)))
                    .await;
                (x, y, response)
            }
        });
        let results = futures::future::join_all(calls).await;

        for (x, y, response) in results {
            let response = response.expect("request failed").into_inner();
            assert_eq!(response.segments.len(), 1);
            let points = &response.segments[0].polygons[0].points;
            let min_x = points.iter().map(|p| p.x).min().unwrap();
            let max_x = points.iter().map(|p| p.x).max().unwrap();
            let min_y = points.iter().map(|p| p.y).min().unwrap();
            let max_y = points.iter().map(|p| p.y).max().unwrap();
            assert_eq!((min_x + max_x) / 2, x);
            assert_eq!((min_y + max_y) / 2, y);
        }
        assert_eq!(model.calls(), 50);
        assert!(model.peak() <= 4, "peak concurrency {}", model.peak());
        assert_eq!(inference_service.handler.pool().available(), 4);
    }

    #[tokio::test]
    async fn test_model_failure_does_not_poison_service() {
        let model = Arc::new(SquareModel::default().failing_at(9, 9));
        let inference_service = service(model, 2);

        let status = inference_service
            .segment_image(Request::new(request(20, 20, &[(9, 9, 1)], false)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert!(!status.message().contains("simulated"));

        let response = inference_service
            .segment_image(Request::new(request(20, 20, &[(4, 4, 1)], false)))
            .await
            .unwrap();
        assert_eq!(response.into_inner().segments.len(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_lengths_status() {
        let inference_service = service(Arc::new(SquareModel::default()), 2);
        let mut req = request(20, 20, &[(1, 1, 1), (2, 2, 1)], false);
        req.labels = vec![1];

        let status = inference_service
            .segment_image(Request::new(req))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("2 coordinates and 1 labels"));
    }
}
