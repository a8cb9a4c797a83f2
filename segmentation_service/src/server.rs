use crate::{
    config::{Config, ServerConfig},
    handler::SegmentationHandler,
    inference_service::InferenceService,
    model_service::SegmentationModel,
    ort_service::OrtSamEngine,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tonic::transport::server::Router;
use tonic::transport::Server;
use segmentation_proto::segmentation_service_server::SegmentationServiceServer;

/// Assembles the transport: segmentation service with raised message limits,
/// health and reflection services, and an optional per-request deadline.
pub async fn build_router<M: SegmentationModel>(
    handler: SegmentationHandler<M>,
    server_config: &ServerConfig,
) -> Result<Router, Box<dyn std::error::Error>> {
    let max_message_size = server_config.max_message_size();
    let segmentation_service = SegmentationServiceServer::new(InferenceService::new(handler))
        .max_decoding_message_size(max_message_size)
        .max_encoding_message_size(max_message_size);

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<SegmentationServiceServer<InferenceService<M>>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(segmentation_proto::FILE_DESCRIPTOR_SET)
        .build_v1alpha()?;

    let mut builder = Server::builder();
    if let Some(secs) = server_config.request_timeout_secs {
        tracing::info!("Requests time out after {}s", secs);
        builder = builder.timeout(Duration::from_secs(secs));
    }

    Ok(builder
        .add_service(health_service)
        .add_service(reflection_service)
        .add_service(segmentation_service))
}

pub struct GrpcServer {
    router: Router,
    addr: String,
}

impl GrpcServer {
    pub async fn new<M: SegmentationModel>(
        handler: SegmentationHandler<M>,
        server_config: &ServerConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let router = build_router(handler, server_config).await?;
        Ok(Self {
            router,
            addr: server_config.get_address(),
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = self.addr.parse()?;

        tracing::info!("Segmentation service listening on {}", self.addr);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        self.router.serve_with_shutdown(addr, shutdown).await?;
        Ok(())
    }
}

pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let engine = match OrtSamEngine::new(&config.model) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!("Failed to initialize segmentation engine: {}", e);
            return Err(Box::new(e));
        }
    };
    let handler = SegmentationHandler::new(engine, config.pool.workers, &config.postprocess);

    let grpc_server = GrpcServer::new(handler, &config.server).await?;
    grpc_server.run().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
