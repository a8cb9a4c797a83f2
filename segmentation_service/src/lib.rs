mod contours;
mod error;
mod handler;
mod imaging;
mod inference_service;
mod model_service;
mod ort_service;
mod ranking;
mod server;
mod worker_pool;

pub mod client;
pub mod config;

#[cfg(test)]
mod test_support;

pub use client::{parse_prompt, ClientError, SegmentationClient};
pub use error::SegmentationError;
pub use handler::SegmentationHandler;
pub use model_service::{ModelError, Prompt, RawMask, SegmentationModel};
pub use ort_service::OrtSamEngine;
pub use server::{build_router, start_server, GrpcServer};
