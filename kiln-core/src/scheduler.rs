use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::engine::{EngineError, EngineParams};
use crate::error::{Error, Result};
use crate::lifecycle::ModelManager;
use crate::registry::{ModelFamily, ModelRegistry};
use crate::util::image_to_png;
use crate::{GenerationRequest, GenerationResult};

const DEFAULT_SIZE: usize = 512;
const DEFAULT_STEPS: usize = 25;
const DEFAULT_GUIDANCE: f64 = 7.5;

/// Validates requests, pins the model they target, and runs generations
/// against it one at a time in arrival order.
pub struct GenerationScheduler {
    manager: Arc<ModelManager>,
    registry: Arc<ModelRegistry>,
}

impl GenerationScheduler {
    pub fn new(manager: Arc<ModelManager>, registry: Arc<ModelRegistry>) -> Self {
        Self { manager, registry }
    }

    /// Runs one generation to completion. The model stays pinned from the
    /// moment the request is admitted until its image is produced, so a
    /// queued request never sees its model evicted underneath it.
    pub async fn submit(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let descriptor = self.registry.lookup(&request.model_id)?;
        let params = resolve(&request, descriptor.family)?;

        let handle = self.manager.acquire(&request.model_id).await?;
        debug!(id = %request.model_id, seed = params.seed, "generation queued");

        let gen_lock = handle.shared().gen_lock.clone();
        let turn = gen_lock.lock_owned().await;
        let model = handle.shared().model.clone();

        let id = request.model_id.clone();
        let worker_params = params.clone();
        let started = Instant::now();
        // The guard and the handle ride along into the worker: the model
        // stays pinned and the queue position stays held until the
        // generation finishes, even if this future is dropped.
        let outcome = tokio::task::spawn_blocking(move || {
            let _turn = turn;
            let _claim = handle;
            model.generate(&worker_params)
        })
        .await;

        let image = match outcome {
            Ok(Ok(image)) => image,
            Ok(Err(EngineError::OutOfMemory)) => {
                self.manager.mark_degraded(&id, "an out-of-memory failure");
                return Err(Error::OutOfMemory(id));
            }
            Ok(Err(EngineError::Failure(reason))) => return Err(Error::EngineFailure(reason)),
            Err(err) => {
                return Err(Error::EngineFailure(format!(
                    "generation task panicked: {err}"
                )))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let image_png = image_to_png(&image)?;
        info!(id = %id, seed = params.seed, elapsed_ms, "generated image");
        Ok(GenerationResult {
            image_png,
            seed: params.seed,
            elapsed_ms,
        })
    }
}

fn resolve(request: &GenerationRequest, family: ModelFamily) -> Result<EngineParams> {
    let width = request.width.unwrap_or(DEFAULT_SIZE);
    let height = request.height.unwrap_or(DEFAULT_SIZE);
    let steps = request.steps.unwrap_or(DEFAULT_STEPS);
    let guidance_scale = request.guidance_scale.unwrap_or(DEFAULT_GUIDANCE);

    if width == 0 || height == 0 {
        return Err(Error::Validation(format!(
            "image dimensions must be positive, got {width}x{height}"
        )));
    }
    let stride = family.latent_stride();
    if width % stride != 0 || height % stride != 0 {
        return Err(Error::Validation(format!(
            "image dimensions must be multiples of {stride}, got {width}x{height}"
        )));
    }
    if steps == 0 {
        return Err(Error::Validation("steps must be positive".to_string()));
    }
    if !guidance_scale.is_finite() || guidance_scale < 0.0 {
        return Err(Error::Validation(format!(
            "guidance scale must be a non-negative number, got {guidance_scale}"
        )));
    }

    Ok(EngineParams {
        prompt: request.prompt.clone(),
        negative_prompt: request.negative_prompt.clone(),
        width,
        height,
        steps,
        guidance_scale,
        seed: request.seed.resolve(),
    })
}
