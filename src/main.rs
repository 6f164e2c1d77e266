use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use storybook::illustration_config::{PipelineConfig, ProviderOrder};
use storybook::illustration_model::{AspectRatio, GenerationRequest, PipelineOutcome, ProviderKind};
use storybook::pipeline::IllustrationPipeline;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "storybook", about = "Storybook illustration generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a single illustration
    Illustrate {
        /// Scene prompt
        #[arg(long)]
        prompt: String,
        /// Where to write the image
        #[arg(long)]
        output: PathBuf,
        /// tall (9:16) or portrait (2:3)
        #[arg(long)]
        aspect: Option<AspectRatio>,
        /// Skip the primary model
        #[arg(long)]
        fallback_only: bool,
        /// Photo of the child for identity-preserving generation
        #[arg(long)]
        reference_photo: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;

    match cli.command {
        Command::Illustrate {
            prompt,
            output,
            aspect,
            fallback_only,
            reference_photo,
        } => {
            if fallback_only {
                config.provider_order = ProviderOrder::FallbackOnly;
            }
            if reference_photo.is_some() {
                config.use_reference_photo = true;
            }
            let aspect_ratio = aspect.unwrap_or(config.default_aspect_ratio);

            let mut request = GenerationRequest::new(prompt, output).with_aspect_ratio(aspect_ratio);
            if fallback_only {
                request = request.with_provider_hint(ProviderKind::Fallback);
            }
            if let Some(path) = reference_photo {
                let photo = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read reference photo {}", path.display()))?;
                request = request.with_reference_photo(photo);
            }

            let pipeline = IllustrationPipeline::replicate(config)?;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, cancelling generation");
                    let _ = cancel_tx.send(true);
                }
            });

            info!(aspect = %aspect_ratio, target = %request.target_path().display(), "Starting illustration");
            let report = pipeline.run_with_cancel(&request, cancel_rx).await;

            match report.outcome {
                PipelineOutcome::Succeeded(image, provider) => {
                    println!(
                        "{} ({}x{}, {} bytes) via {} provider after {} attempt(s)",
                        image.path.display(),
                        image.width,
                        image.height,
                        image.byte_size,
                        provider,
                        report.attempts.len()
                    );
                    Ok(())
                }
                PipelineOutcome::ExhaustedRetries(err) | PipelineOutcome::FatalError(err) => {
                    error!(error = %err, "Illustration failed");
                    Err(anyhow::Error::new(err).context("Illustration failed"))
                }
            }
        }
    }
}
