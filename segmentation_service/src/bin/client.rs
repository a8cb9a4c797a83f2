use clap::Parser;
use segmentation_service::{parse_prompt, Prompt, SegmentationClient};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version, about = "Send an image and prompt points to the segmentation service")]
struct Args {
    /// Server address
    #[arg(long, default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Image to segment
    #[arg(short, long)]
    image: PathBuf,

    /// Prompt point as `x,y,label`, label 1 for foreground and 0 for background
    #[arg(short, long = "point", value_parser = parse_prompt, required = true)]
    points: Vec<Prompt>,

    /// Ask for several candidate masks
    #[arg(short, long)]
    multimask: bool,

    /// Directory receiving `mask_<index>.png` and `labeled.png`
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, default_value_t = 64)]
    max_message_size_mb: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    let image_data = tokio::fs::read(&args.image).await?;

    let mut client =
        SegmentationClient::connect(args.addr, args.max_message_size_mb * 1024 * 1024).await?;
    let response = client
        .segment(image_data, &args.points, args.multimask)
        .await?;

    tracing::info!(
        "Received {} segments for a {}x{} image",
        response.segments.len(),
        response.width,
        response.height
    );

    for segment in &response.segments {
        let vertices: usize = segment.polygons.iter().map(|p| p.points.len()).sum();
        tracing::info!(
            "Segment {}: score {:.3}, {} polygons, {} vertices",
            segment.index,
            segment.score,
            segment.polygons.len(),
            vertices
        );
    }

    if let Some(output) = &args.output {
        tokio::fs::create_dir_all(output).await?;
        for segment in &response.segments {
            let path = output.join(format!("mask_{}.png", segment.index));
            tokio::fs::write(&path, &segment.mask).await?;
        }
        tokio::fs::write(output.join("labeled.png"), &response.labeled_image).await?;
        tracing::info!("Wrote masks to {}", output.display());
    }

    Ok(())
}
