//! Execution-provider selection for `ort` sessions.
//!
//! Both the video generator and the upscaler load through [`build_session`].

use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Default is `Cuda`. `Tensorrt` registers CUDA as its fallback, and ORT
/// itself falls back to CPU when CUDA is missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Case-insensitive. Unknown values map to `Cuda`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

fn load_error(model_path: &Path) -> String {
    format!("Failed to load ONNX model: {}", model_path.display())
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    ensure!(
        config.model_path.is_file(),
        "model file not found: {}",
        config.model_path.display()
    );

    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));

            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }
            let cache_path = cache_dir.to_string_lossy().to_string();

            info!(
                model = %config.model_path.display(),
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let started = Instant::now();
            let (stop_tx, stop_rx) = channel::<()>();
            let heartbeat = thread::spawn(move || {
                let tick = Duration::from_secs(15);
                let mut elapsed = 15_u64;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(
                                elapsed_secs = elapsed,
                                "TensorRT session initialization still in progress"
                            );
                            elapsed += 15;
                        }
                    }
                }
            });

            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(|| load_error(config.model_path));

            let _ = stop_tx.send(());
            let _ = heartbeat.join();

            let elapsed_secs = started.elapsed().as_secs_f64();
            match result {
                Ok(session) => {
                    info!(elapsed_secs, "TensorRT session ready");
                    session
                }
                Err(e) => {
                    error!(elapsed_secs, error = %e, "TensorRT session initialization failed");
                    return Err(e);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", model = %config.model_path.display(), "Building session");

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(|| load_error(config.model_path))?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", model = %config.model_path.display(), "Building session");
            builder
                .commit_from_file(config.model_path)
                .with_context(|| load_error(config.model_path))?
        }
    };

    Ok(session)
}

/// True when the first input of `session` expects half-precision floats.
pub fn input_is_fp16(session: &Session) -> bool {
    match session.inputs().first().map(|input| input.dtype()) {
        Some(ort::value::ValueType::Tensor { ty, .. }) => {
            *ty == ort::tensor::TensorElementType::Float16
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!(InferenceBackend::from_str_lossy("CUDA"), InferenceBackend::Cuda);
        assert_eq!(InferenceBackend::from_str_lossy("TensorRT"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy("trt"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy(" cpu "), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy("unknown"), InferenceBackend::Cuda);
        assert_eq!(InferenceBackend::from_str_lossy(""), InferenceBackend::Cuda);
    }

    #[test]
    fn backend_display_round_trips() {
        for backend in [InferenceBackend::Cuda, InferenceBackend::Tensorrt, InferenceBackend::Cpu] {
            assert_eq!(InferenceBackend::from_str_lossy(&backend.to_string()), backend);
        }
    }

    #[test]
    fn missing_model_is_reported_before_ort_loads() {
        let config = SessionConfig {
            model_path: Path::new("/nonexistent/model.onnx"),
            backend: InferenceBackend::Cpu,
            trt_cache_dir: None,
        };
        let err = build_session(&config).unwrap_err();
        assert!(err.to_string().contains("model file not found"));
    }
}
