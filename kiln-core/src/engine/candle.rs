use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use image::DynamicImage;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use safetensors::tensor::{SafeTensors, TensorView};
use tempfile::TempDir;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::registry::ModelFamily;
use crate::util::{select_device, tensor_to_image};

use super::{EngineError, EngineParams, InferenceEngine, LoadSpec, LoadedModel};

struct DeviceContext {
    device: Device,
    dtype: DType,
    // The RNG seed is device-global, so generations on one device must
    // not interleave.
    gen_lock: Mutex<()>,
}

/// Engine binding over the candle stable-diffusion stack. One instance
/// owns the device; every model it loads shares it.
pub struct CandleEngine {
    ctx: Arc<DeviceContext>,
    use_flash_attn: bool,
}

impl CandleEngine {
    /// Picks an accelerator when one is available unless `force_cpu` is
    /// set. Weights run in f16 on accelerators and f32 on the CPU.
    pub fn new(force_cpu: bool) -> std::result::Result<Self, EngineError> {
        let device = select_device(force_cpu).map_err(map_candle_err)?;
        let dtype = if matches!(device, Device::Cpu) {
            DType::F32
        } else {
            DType::F16
        };
        info!(device = ?device, dtype = ?dtype, "engine ready");
        Ok(Self {
            ctx: Arc::new(DeviceContext {
                device,
                dtype,
                gen_lock: Mutex::new(()),
            }),
            use_flash_attn: cfg!(feature = "flash-attn"),
        })
    }

    fn load_pipeline_directory(
        &self,
        dir: &Path,
        family: ModelFamily,
    ) -> candle_core::Result<SdModel> {
        let device = &self.ctx.device;
        let config = pipeline_config(family);

        let tokenizer_path = existing_file(dir, &["tokenizer/tokenizer.json"])?;
        let tokenizer = load_tokenizer(&tokenizer_path)?;

        let text_encoder_path = existing_file(
            dir,
            &[
                "text_encoder/model.safetensors",
                "text_encoder/model.fp16.safetensors",
            ],
        )?;
        debug!(weights = %text_encoder_path.display(), "building text encoder");
        let text_encoder = stable_diffusion::build_clip_transformer(
            &config.clip,
            &text_encoder_path,
            device,
            DType::F32,
        )?;

        let (tokenizer_2, text_encoder_2, encoder_2_path) = if family == ModelFamily::Sdxl {
            let clip2 = config.clip2.as_ref().ok_or_else(|| {
                candle_core::Error::Msg("pipeline configuration lacks a second text encoder".to_string())
            })?;
            let tokenizer_2_path = existing_file(dir, &["tokenizer_2/tokenizer.json"])?;
            let weights = existing_file(
                dir,
                &[
                    "text_encoder_2/model.safetensors",
                    "text_encoder_2/model.fp16.safetensors",
                ],
            )?;
            debug!(weights = %weights.display(), "building second text encoder");
            let encoder =
                stable_diffusion::build_clip_transformer(clip2, &weights, device, DType::F32)?;
            let tokenizer_2 = load_tokenizer(&tokenizer_2_path)?;
            (Some(tokenizer_2), Some(encoder), Some(weights))
        } else {
            (None, None, None)
        };

        let vae_path = existing_file(
            dir,
            &[
                "vae/diffusion_pytorch_model.safetensors",
                "vae/diffusion_pytorch_model.fp16.safetensors",
            ],
        )?;
        debug!(weights = %vae_path.display(), "building vae");
        let vae = config.build_vae(&vae_path, device, self.ctx.dtype)?;

        let unet_path = existing_file(
            dir,
            &[
                "unet/diffusion_pytorch_model.safetensors",
                "unet/diffusion_pytorch_model.fp16.safetensors",
            ],
        )?;
        debug!(weights = %unet_path.display(), "building unet");
        let unet = config.build_unet(&unet_path, device, 4, self.use_flash_attn, self.ctx.dtype)?;

        let mut weight_files = vec![&text_encoder_path, &vae_path, &unet_path];
        if let Some(path) = &encoder_2_path {
            weight_files.push(path);
        }
        let memory_bytes = files_size(&weight_files);

        Ok(SdModel {
            ctx: self.ctx.clone(),
            components: SdComponents {
                config,
                tokenizer,
                text_encoder,
                tokenizer_2,
                text_encoder_2,
                unet,
                vae,
                vae_scale: vae_scale(family),
            },
            memory_bytes,
            _staging: None,
        })
    }

    fn load_single_file(&self, file: &Path, family: ModelFamily) -> candle_core::Result<SdModel> {
        if family == ModelFamily::Sdxl {
            candle_core::bail!(
                "single-file sdxl checkpoints are not supported, provide a pipeline directory"
            );
        }
        let device = &self.ctx.device;
        let config = pipeline_config(family);

        let staging = TempDir::new()?;
        let staged = stage_components(file, staging.path())?;
        debug!(checkpoint = %file.display(), staged = %staging.path().display(), "staged checkpoint components");

        let tokenizer = load_tokenizer(&sibling_tokenizer(file)?)?;

        let text_encoder = stable_diffusion::build_clip_transformer(
            &config.clip,
            &staged.text_encoder,
            device,
            DType::F32,
        )?;
        let vae = config.build_vae(&staged.vae, device, self.ctx.dtype)?;
        let unet =
            config.build_unet(&staged.unet, device, 4, self.use_flash_attn, self.ctx.dtype)?;

        let memory_bytes = files_size(&[&staged.unet, &staged.vae, &staged.text_encoder]);

        Ok(SdModel {
            ctx: self.ctx.clone(),
            components: SdComponents {
                config,
                tokenizer,
                text_encoder,
                tokenizer_2: None,
                text_encoder_2: None,
                unet,
                vae,
                vae_scale: vae_scale(family),
            },
            memory_bytes,
            _staging: Some(staging),
        })
    }
}

impl InferenceEngine for CandleEngine {
    fn load(
        &self,
        spec: &LoadSpec,
    ) -> std::result::Result<Arc<dyn LoadedModel>, EngineError> {
        let model = match spec {
            LoadSpec::PipelineDirectory { path, family } => {
                self.load_pipeline_directory(path, *family)
            }
            LoadSpec::SingleFileCheckpoint { path, family } => {
                self.load_single_file(path, *family)
            }
        }
        .map_err(map_candle_err)?;
        Ok(Arc::new(model))
    }
}

struct SdComponents {
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    text_encoder: clip::ClipTextTransformer,
    tokenizer_2: Option<Tokenizer>,
    text_encoder_2: Option<clip::ClipTextTransformer>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    vae_scale: f64,
}

struct SdModel {
    ctx: Arc<DeviceContext>,
    components: SdComponents,
    memory_bytes: u64,
    // Staged files back the mmapped weights; they live as long as the model.
    _staging: Option<TempDir>,
}

impl SdModel {
    fn denoise(&self, params: &EngineParams) -> candle_core::Result<DynamicImage> {
        let comp = &self.components;
        let device = &self.ctx.device;
        let dtype = self.ctx.dtype;

        if !matches!(device, Device::Cpu) {
            device.set_seed(params.seed)?;
        }

        let use_guidance = params.guidance_scale > 1.0;
        let text_embeddings = self.text_embeddings(params, use_guidance)?;
        let mut scheduler = comp.config.build_scheduler(params.steps)?;

        let latents = normal_latents(
            params.seed,
            (1, 4, params.height / 8, params.width / 8),
            device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(dtype)?;

        debug!(
            steps = params.steps,
            width = params.width,
            height = params.height,
            seed = params.seed,
            "denoising"
        );
        let timesteps = scheduler.timesteps().to_vec();
        for &timestep in &timesteps {
            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = comp
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let parts = noise_pred.chunk(2, 0)?;
                (&parts[0] + ((&parts[1] - &parts[0])? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let image = comp.vae.decode(&(latents / comp.vae_scale)?)?;
        let image = ((image / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }

    fn text_embeddings(
        &self,
        params: &EngineParams,
        use_guidance: bool,
    ) -> candle_core::Result<Tensor> {
        let comp = &self.components;
        let mut embeddings = vec![self.encoder_embedding(
            &comp.config.clip,
            &comp.tokenizer,
            &comp.text_encoder,
            params,
            use_guidance,
        )?];
        if let (Some(tokenizer_2), Some(text_encoder_2), Some(clip2)) = (
            &comp.tokenizer_2,
            &comp.text_encoder_2,
            comp.config.clip2.as_ref(),
        ) {
            embeddings.push(self.encoder_embedding(
                clip2,
                tokenizer_2,
                text_encoder_2,
                params,
                use_guidance,
            )?);
        }
        let embedding = if embeddings.len() > 1 {
            Tensor::cat(&embeddings, D::Minus1)?
        } else {
            embeddings.remove(0)
        };
        embedding.to_dtype(self.ctx.dtype)
    }

    fn encoder_embedding(
        &self,
        config: &clip::Config,
        tokenizer: &Tokenizer,
        encoder: &clip::ClipTextTransformer,
        params: &EngineParams,
        use_guidance: bool,
    ) -> candle_core::Result<Tensor> {
        let cond = encode_prompt(tokenizer, config, &params.prompt, &self.ctx.device)?;
        let cond = encoder.forward(&cond)?;
        if !use_guidance {
            return Ok(cond);
        }
        let negative = params.negative_prompt.as_deref().unwrap_or("");
        let uncond = encode_prompt(tokenizer, config, negative, &self.ctx.device)?;
        let uncond = encoder.forward(&uncond)?;
        // Unconditioned half first; the guidance step splits on this order.
        Tensor::cat(&[uncond, cond], 0)
    }
}

impl LoadedModel for SdModel {
    fn generate(
        &self,
        params: &EngineParams,
    ) -> std::result::Result<DynamicImage, EngineError> {
        let _device_turn = self.ctx.gen_lock.lock();
        self.denoise(params).map_err(map_candle_err)
    }

    fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }
}

fn pipeline_config(family: ModelFamily) -> StableDiffusionConfig {
    match family {
        ModelFamily::Sd15 | ModelFamily::Custom => StableDiffusionConfig::v1_5(None, None, None),
        ModelFamily::Sd21 => StableDiffusionConfig::v2_1(None, None, None),
        ModelFamily::Sdxl => StableDiffusionConfig::sdxl(None, None, None),
    }
}

fn vae_scale(family: ModelFamily) -> f64 {
    match family {
        ModelFamily::Sdxl => 0.13025,
        _ => 0.18215,
    }
}

fn load_tokenizer(path: &Path) -> candle_core::Result<Tokenizer> {
    Tokenizer::from_file(path).map_err(|err| candle_core::Error::Msg(err.to_string()))
}

fn encode_prompt(
    tokenizer: &Tokenizer,
    config: &clip::Config,
    prompt: &str,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let vocab = tokenizer.get_vocab(true);
    let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
    let pad_id = *vocab.get(pad_token).ok_or_else(|| {
        candle_core::Error::Msg(format!("tokenizer has no `{pad_token}` token"))
    })?;
    let mut tokens = tokenizer
        .encode(prompt, true)
        .map_err(|err| candle_core::Error::Msg(err.to_string()))?
        .get_ids()
        .to_vec();
    if tokens.len() > config.max_position_embeddings {
        candle_core::bail!(
            "prompt is {} tokens long, the limit is {}",
            tokens.len(),
            config.max_position_embeddings
        );
    }
    tokens.resize(config.max_position_embeddings, pad_id);
    Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)
}

/// Initial latent noise from a seeded generator, so one seed maps to the
/// same latents on every device.
fn normal_latents(
    seed: u64,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> candle_core::Result<Tensor> {
    let (b, c, h, w) = shape;
    let count = b * c * h * w;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(count);
    while values.len() < count {
        // Box-Muller transform.
        let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        let u2: f64 = rng.gen();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f64::consts::PI * u2;
        values.push((radius * angle.cos()) as f32);
        if values.len() < count {
            values.push((radius * angle.sin()) as f32);
        }
    }
    Tensor::from_vec(values, shape, device)
}

#[derive(Debug)]
struct StagedCheckpoint {
    unet: PathBuf,
    vae: PathBuf,
    text_encoder: PathBuf,
}

/// Split a component-prefixed checkpoint into the per-component weight
/// files the pipeline builders expect, stripping the prefixes.
fn stage_components(checkpoint: &Path, out_dir: &Path) -> candle_core::Result<StagedCheckpoint> {
    let bytes = fs::read(checkpoint)?;
    let archive = SafeTensors::deserialize(&bytes).map_err(candle_core::Error::wrap)?;

    let stage = |component: &str, prefix: &str| -> candle_core::Result<PathBuf> {
        let group: Vec<(String, TensorView)> = archive
            .tensors()
            .into_iter()
            .filter_map(|(name, view)| {
                name.strip_prefix(prefix)
                    .map(|stripped| (stripped.to_string(), view))
            })
            .collect();
        if group.is_empty() {
            candle_core::bail!(
                "{} holds no `{}`-prefixed tensors; only component-prefixed checkpoints can be split into a pipeline",
                checkpoint.display(),
                prefix
            );
        }
        let path = out_dir.join(format!("{component}.safetensors"));
        safetensors::tensor::serialize_to_file(group, &None, &path)
            .map_err(candle_core::Error::wrap)?;
        Ok(path)
    };

    Ok(StagedCheckpoint {
        unet: stage("unet", "unet.")?,
        vae: stage("vae", "vae.")?,
        text_encoder: stage("text_encoder", "text_encoder.")?,
    })
}

fn sibling_tokenizer(checkpoint: &Path) -> candle_core::Result<PathBuf> {
    let mut candidates = Vec::new();
    if let (Some(stem), Some(parent)) = (
        checkpoint.file_stem().and_then(|s| s.to_str()),
        checkpoint.parent(),
    ) {
        candidates.push(parent.join(format!("{stem}.tokenizer.json")));
        candidates.push(parent.join("tokenizer.json"));
    }
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    candle_core::bail!("no tokenizer.json found beside {}", checkpoint.display())
}

fn existing_file(dir: &Path, candidates: &[&str]) -> candle_core::Result<PathBuf> {
    for candidate in candidates {
        let path = dir.join(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }
    candle_core::bail!("missing {} under {}", candidates[0], dir.display())
}

fn files_size(paths: &[&PathBuf]) -> u64 {
    paths
        .iter()
        .filter_map(|p| fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

fn map_candle_err(err: candle_core::Error) -> EngineError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("out of memory")
        || lower.contains("out_of_memory")
        || lower.contains("insufficient memory")
    {
        EngineError::OutOfMemory
    } else {
        EngineError::Failure(message)
    }
}
