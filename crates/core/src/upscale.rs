//! Super-resolution over whole generation batches.
//!
//! [`upscale_batch`] is model-agnostic: it walks `[B, F, C, H, W]` item by
//! item through [`tiled_scale`] and stacks the results. [`UpscaleModel`] is
//! the ONNX transform plugged into it by the generation service.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, ensure, Context, Result};
use half::f16;
use ndarray::{stack, Array4, Array5, ArrayView4, ArrayView5, Axis, Ix4};
use ort::{session::Session, value::Tensor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{build_session, input_is_fp16, InferenceBackend, SessionConfig};
use crate::progress::ProgressReporter;
use crate::tiling::{estimate_memory_bytes, tiled_scale, tiled_scale_steps, TileParams};

const PROBE_SIZE: usize = 16;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Total tile invocations for a `[B, F, C, H, W]` batch.
pub fn upscale_steps(shape: &[usize], params: &TileParams) -> Result<u64> {
    ensure!(
        shape.len() == 5,
        "expected a [batch, frame, channel, height, width] shape, got {shape:?}"
    );
    let per_frame = tiled_scale_steps(shape[4], shape[3], params)?;
    Ok((shape[0] * shape[1]) as u64 * per_frame)
}

/// Apply the tiled executor to each batch item in order and stack the results.
pub fn upscale_batch<F>(
    input: ArrayView5<'_, f32>,
    params: &TileParams,
    mut transform: F,
    progress: &mut ProgressReporter,
) -> Result<Array5<f32>>
where
    F: FnMut(ArrayView4<'_, f32>) -> Result<Array4<f32>>,
{
    ensure!(input.dim().0 > 0, "cannot upscale an empty batch");

    let mut items = Vec::with_capacity(input.dim().0);
    for (index, item) in input.outer_iter().enumerate() {
        let scaled = tiled_scale(item, params, &mut transform, progress)
            .with_context(|| format!("failed to upscale batch item {index}"))?;
        items.push(scaled);
    }

    let views: Vec<_> = items.iter().map(|item| item.view()).collect();
    stack(Axis(0), &views).context("upscaled batch items disagree in shape")
}

pub struct UpscaleModelConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
    /// Skip probing when the factor is known.
    pub scale: Option<usize>,
    /// Multiplier mapping `[0, 1]` pixels into the model's input range.
    pub value_scale: f32,
}

pub struct UpscaleModel {
    session: Mutex<Session>,
    model_path: PathBuf,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    scale: usize,
    param_bytes: u64,
    value_scale: f32,
}

impl UpscaleModel {
    pub fn load(config: &UpscaleModelConfig<'_>) -> Result<Self> {
        ensure!(
            config.value_scale.is_finite() && config.value_scale > 0.0,
            "upscale value_scale must be a positive number, got {}",
            config.value_scale
        );

        let session = build_session(&SessionConfig {
            model_path: config.model_path,
            backend: config.backend,
            trt_cache_dir: config.trt_cache_dir,
        })?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .context("upscale model declares no inputs")?;
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .context("upscale model declares no outputs")?;
        let is_fp16 = input_is_fp16(&session);
        let param_bytes = model_param_bytes(config.model_path);

        debug!(%input_name, %output_name, is_fp16, param_bytes, "Detected upscale model IO");

        let mut model = Self {
            session: Mutex::new(session),
            model_path: config.model_path.to_path_buf(),
            input_name,
            output_name,
            is_fp16,
            scale: config.scale.unwrap_or(1),
            param_bytes,
            value_scale: config.value_scale,
        };

        model.scale = match config.scale {
            Some(scale) => {
                ensure!(scale >= 1, "configured upscale factor must be at least 1");
                scale
            }
            None => model.probe_scale()?,
        };

        info!(
            model = %model.model_path.display(),
            scale = model.scale,
            is_fp16 = model.is_fp16,
            "Upscale model loaded"
        );
        Ok(model)
    }

    fn probe_scale(&self) -> Result<usize> {
        let probe = Array4::<f32>::zeros((1, 3, PROBE_SIZE, PROBE_SIZE));
        let output = self
            .run_tile(probe.view())
            .context("failed to probe upscale factor")?;
        let (_, _, out_h, out_w) = output.dim();
        if out_h != out_w || out_h % PROBE_SIZE != 0 || out_h == 0 {
            bail!(
                "upscale model produced {out_h}x{out_w} for a {PROBE_SIZE}x{PROBE_SIZE} probe; \
                 set upscale.scale explicitly"
            );
        }
        Ok(out_h / PROBE_SIZE)
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    pub fn element_bytes(&self) -> usize {
        if self.is_fp16 {
            2
        } else {
            4
        }
    }

    pub fn param_bytes(&self) -> u64 {
        self.param_bytes
    }

    pub fn tile_params(&self, tile: usize, overlap: usize) -> TileParams {
        TileParams::new(tile, overlap, self.scale)
    }

    /// Run one `[1, C, h, w]` tile through the session.
    pub fn run_tile(&self, tile: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let input = tile.mapv(|v| v * self.value_scale);
        let input_name = self.input_name.as_str();
        let output_name = self.output_name.as_str();

        let output = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| anyhow!("upscale session mutex poisoned"))?;

            if self.is_fp16 {
                let tensor = Tensor::from_array(input.mapv(f16::from_f32))?;
                let outputs = session.run(ort::inputs![input_name => &tensor])?;
                let values = outputs[output_name]
                    .try_extract_array::<f16>()?
                    .mapv(f16::to_f32);
                values
            } else {
                let tensor = Tensor::from_array(input)?;
                let outputs = session.run(ort::inputs![input_name => &tensor])?;
                let values = outputs[output_name].try_extract_array::<f32>()?.to_owned();
                values
            }
        };

        let mut output = output
            .into_dimensionality::<Ix4>()
            .context("upscale model output is not 4-dimensional")?;
        if self.value_scale != 1.0 {
            let inverse = self.value_scale.recip();
            output.mapv_inplace(|v| v * inverse);
        }
        Ok(output)
    }

    /// Upscale a whole batch, checking `cancel` before every tile.
    pub fn upscale(
        &self,
        input: ArrayView5<'_, f32>,
        tile: usize,
        overlap: usize,
        progress: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Array5<f32>> {
        let params = self.tile_params(tile, overlap);
        params.validate()?;

        let item_elements = batch_item_elements(input.shape());
        let estimate = estimate_memory_bytes(
            self.param_bytes,
            params.tile,
            params.scale,
            self.element_bytes(),
            item_elements,
        );
        info!(
            estimated_gib = format!("{:.2}", estimate / GIB),
            shape = ?input.shape(),
            item_elements,
            tile = params.tile,
            overlap = params.overlap,
            scale = params.scale,
            "Estimated upscale memory"
        );

        upscale_batch(
            input,
            &params,
            |tile| {
                if cancel.is_cancelled() {
                    bail!("upscale cancelled");
                }
                self.run_tile(tile)
            },
            progress,
        )
    }
}

/// Model file size, used as the parameter size in the memory estimate.
fn model_param_bytes(path: &Path) -> u64 {
    match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) => {
            debug!(
                model = %path.display(),
                error = %err,
                "Could not read upscale model size, memory estimate omits parameters"
            );
            0
        }
    }
}

/// Elements in one `[F, C, H, W]` item. Items are upscaled one at a time.
fn batch_item_elements(shape: &[usize]) -> usize {
    match shape.split_first() {
        Some((&batch, rest)) if batch > 0 => rest.iter().product(),
        _ => 0,
    }
}

impl std::fmt::Debug for UpscaleModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpscaleModel")
            .field("model_path", &self.model_path)
            .field("scale", &self.scale)
            .field("is_fp16", &self.is_fp16)
            .finish()
    }
}
