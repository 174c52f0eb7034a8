//! Node operations and the command dispatcher wiring them to disk I/O.

use tracing::{info, instrument};

use crate::{
    InpaintError,
    config::{AppConfig, Operation},
    telemetry::TelemetrySink,
};

pub mod alpha;
pub mod blur;
pub mod compositing;
pub mod decode;
pub mod encode;
pub mod fill;
pub mod filters;
pub mod geometry;
pub mod head;
pub mod inpaint;
pub mod model;
pub mod patch;

/// Executes the configured operation: decode inputs, run the node on a
/// blocking worker, encode the result.
#[instrument(skip_all)]
pub async fn execute_command(
    config: AppConfig,
    telemetry: TelemetrySink,
) -> Result<(), InpaintError> {
    match config.operation {
        Operation::Fill {
            image,
            mask,
            output,
            fill: mode,
            falloff,
        } => {
            let pixels = decode::load_image(&image).await?;
            let mask = decode::load_mask(&mask).await?;
            telemetry.record_stage("decode");
            let filled = tokio::task::spawn_blocking(move || {
                fill::masked_fill(&pixels, &mask, mode, falloff, &fill::FastMarchInpainter::default())
            })
            .await??;
            telemetry.record_stage("fill");
            encode::save_image(&filled, &output).await?;
            telemetry.record_stage("encode");
        }
        Operation::Blur {
            image,
            mask,
            output,
            blur: radius,
            falloff,
        } => {
            let pixels = decode::load_image(&image).await?;
            let mask = decode::load_mask(&mask).await?;
            telemetry.record_stage("decode");
            let blurred =
                tokio::task::spawn_blocking(move || blur::masked_blur(&pixels, &mask, radius, falloff))
                    .await??;
            telemetry.record_stage("blur");
            encode::save_image(&blurred, &output).await?;
            telemetry.record_stage("encode");
        }
        Operation::ConvertMask {
            mask,
            output,
            offset,
            threshold,
        } => {
            let mask = decode::load_mask(&mask).await?;
            telemetry.record_stage("decode");
            let converted = compositing::denoise_to_compositing_mask(&mask, offset, threshold)?;
            telemetry.record_stage("convert");
            encode::save_mask(&converted, &output).await?;
            telemetry.record_stage("encode");
        }
        Operation::InspectPatch { head, patch } => {
            let dir = config.model_dir.clone();
            let loaded = tokio::task::spawn_blocking(move || {
                model::load_inpaint_patch(&dir, &head, &patch, None)
            })
            .await??;
            telemetry.record_stage("load_patch");
            info!(
                head_shape = ?loaded.head.weight().shape(),
                diffs = loaded.diffs.len(),
                "inpaint patch inspected"
            );
        }
    }
    telemetry.record_completed();
    Ok(())
}
