//! Text-to-video model seam.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use ndarray::{Array1, Array5, Ix5};
use ort::{session::Session, value::Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{build_session, InferenceBackend, SessionConfig};

pub const MAX_INFERENCE_STEPS: u32 = 1000;

const PROMPT_INPUT: &str = "prompt";
const STEPS_INPUT: &str = "num_inference_steps";
const GUIDANCE_INPUT: &str = "guidance_scale";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, num_inference_steps: u32, guidance_scale: f32) -> Self {
        Self {
            prompt: prompt.into(),
            num_inference_steps,
            guidance_scale,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.prompt.trim().is_empty(), "prompt must not be empty");
        ensure!(
            (1..=MAX_INFERENCE_STEPS).contains(&self.num_inference_steps),
            "num_inference_steps must be between 1 and {MAX_INFERENCE_STEPS}, got {}",
            self.num_inference_steps
        );
        ensure!(
            self.guidance_scale.is_finite() && self.guidance_scale >= 0.0,
            "guidance_scale must be a finite non-negative number, got {}",
            self.guidance_scale
        );
        Ok(())
    }
}

/// Produces `[batch, frame, channel, height, width]` frames in `[0, 1]`.
pub trait VideoGenerator: Send {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Array5<f32>>;

    fn describe(&self) -> String;
}

/// A single exported graph covering text encoding, denoising and decoding.
///
/// Inputs: `prompt` (UTF-8 bytes, `u8[len]`), `num_inference_steps`
/// (`i64[1]`), `guidance_scale` (`f32[1]`). The first output holds the frames.
pub struct OnnxVideoGenerator {
    session: Session,
    model_path: PathBuf,
    output_name: String,
}

impl OnnxVideoGenerator {
    pub fn load(
        model_path: &Path,
        backend: InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Self> {
        let session = build_session(&SessionConfig {
            model_path,
            backend,
            trt_cache_dir,
        })?;

        let declared: Vec<String> = session
            .inputs()
            .iter()
            .map(|input| input.name().to_string())
            .collect();
        for required in [PROMPT_INPUT, STEPS_INPUT, GUIDANCE_INPUT] {
            if !declared.iter().any(|name| name == required) {
                bail!(
                    "video model {} has no `{required}` input (found: {})",
                    model_path.display(),
                    declared.join(", ")
                );
            }
        }

        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .context("video model declares no outputs")?;

        info!(model = %model_path.display(), %output_name, "Video model loaded");
        Ok(Self {
            session,
            model_path: model_path.to_path_buf(),
            output_name,
        })
    }
}

impl VideoGenerator for OnnxVideoGenerator {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Array5<f32>> {
        request.validate()?;
        debug!(
            steps = request.num_inference_steps,
            guidance = request.guidance_scale,
            prompt_len = request.prompt.len(),
            "Running video model"
        );

        let prompt = Tensor::from_array(Array1::from(request.prompt.as_bytes().to_vec()))?;
        let steps = Tensor::from_array(Array1::from(vec![i64::from(request.num_inference_steps)]))?;
        let guidance = Tensor::from_array(Array1::from(vec![request.guidance_scale]))?;

        let outputs = self.session.run(ort::inputs![
            PROMPT_INPUT => &prompt,
            STEPS_INPUT => &steps,
            GUIDANCE_INPUT => &guidance,
        ])?;
        let frames = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .to_owned();

        let frames = frames
            .into_dimensionality::<Ix5>()
            .context("video model output is not [batch, frame, channel, height, width]")?;
        ensure!(
            frames.dim().2 == 3,
            "video model produced {} channels, expected RGB",
            frames.dim().2
        );
        Ok(frames)
    }

    fn describe(&self) -> String {
        format!("onnx:{}", self.model_path.display())
    }
}
