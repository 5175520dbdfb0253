//! Owns the loaded models and runs the generate → upscale → export pipeline.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array5;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::enhance::{EnhanceOutcome, PromptEnhancer};
use crate::export::{export_video, ExportSettings, ExportedVideo};
use crate::generator::{GenerationRequest, OnnxVideoGenerator, VideoGenerator};
use crate::progress::ProgressReporter;
use crate::upscale::{upscale_steps, UpscaleModel, UpscaleModelConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    Generating,
    Upscaling,
    Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationProgress {
    pub phase: GenerationPhase,
    pub current: u64,
    pub total: u64,
}

pub type ProgressSink = Arc<dyn Fn(GenerationProgress) + Send + Sync>;

pub fn discard_progress() -> ProgressSink {
    Arc::new(|_| {})
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    /// The prompt the model actually saw.
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhancement: Option<EnhanceOutcome>,
    pub video: ExportedVideo,
    pub upscaled: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub output_dir: PathBuf,
    pub export: ExportSettings,
    pub tile: usize,
    pub overlap: usize,
    /// `None` disables the per-request deadline.
    pub timeout: Option<Duration>,
}

impl ServiceOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        let timeout = config.generation.timeout();
        Self {
            output_dir: config.paths.output_dir.clone(),
            export: ExportSettings::new(config.generation.fps, &config.export),
            tile: config.upscale.tile,
            overlap: config.upscale.overlap,
            timeout: (!timeout.is_zero()).then_some(timeout),
        }
    }
}

type SharedGenerator = Arc<Mutex<Box<dyn VideoGenerator>>>;

/// One instance per process, built by the composition root.
///
/// Model calls are serialized by a single GPU permit; each ONNX session is
/// additionally behind its own mutex.
pub struct GenerationService {
    generator: SharedGenerator,
    upscaler: Mutex<Option<Arc<UpscaleModel>>>,
    enhancer: PromptEnhancer,
    gpu: Arc<Semaphore>,
    options: ServiceOptions,
}

impl GenerationService {
    pub fn new(
        generator: Box<dyn VideoGenerator>,
        upscaler: Option<UpscaleModel>,
        enhancer: PromptEnhancer,
        options: ServiceOptions,
    ) -> Self {
        Self {
            generator: Arc::new(Mutex::new(generator)),
            upscaler: Mutex::new(upscaler.map(Arc::new)),
            enhancer,
            gpu: Arc::new(Semaphore::new(1)),
            options,
        }
    }

    /// Loads every configured model eagerly. Any load failure is returned.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let trt_cache = Some(config.paths.trt_cache_dir.as_path());
        let backend = config.generation.backend;

        let generator = OnnxVideoGenerator::load(&config.paths.model_path, backend, trt_cache)
            .context("failed to load the text-to-video model")?;

        let upscaler = match config.paths.upscale_model_path.as_deref() {
            Some(path) => Some(
                UpscaleModel::load(&UpscaleModelConfig {
                    model_path: path,
                    backend,
                    trt_cache_dir: trt_cache,
                    scale: config.upscale.scale,
                    value_scale: config.upscale.value_scale,
                })
                .context("failed to load the upscale model")?,
            ),
            None => {
                info!("No upscale model configured, frames are exported at native resolution");
                None
            }
        };

        let enhancer = PromptEnhancer::new(&config.enhance)?;
        if !enhancer.is_enabled() {
            info!("OPENAI_API_KEY not set, prompt enhancement is a passthrough");
        }

        Ok(Self::new(
            Box::new(generator),
            upscaler,
            enhancer,
            ServiceOptions::from_config(config),
        ))
    }

    pub fn output_dir(&self) -> &Path {
        &self.options.output_dir
    }

    pub fn has_upscaler(&self) -> bool {
        self.current_upscaler().is_some()
    }

    pub fn enhancer_enabled(&self) -> bool {
        self.enhancer.is_enabled()
    }

    pub fn generator_description(&self) -> String {
        match self.generator.lock() {
            Ok(generator) => generator.describe(),
            Err(_) => "unavailable".to_string(),
        }
    }

    pub async fn enhance_prompt(&self, prompt: &str) -> EnhanceOutcome {
        self.enhancer.enhance(prompt).await
    }

    fn current_upscaler(&self) -> Option<Arc<UpscaleModel>> {
        self.upscaler
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(Arc::clone))
    }

    /// Runs one full request: optional enhancement, generation, upscaling and
    /// export. `cancel` is checked between phases and before every upscale
    /// tile; it is also fired when the deadline passes.
    pub async fn generate(
        &self,
        mut request: GenerationRequest,
        enhance: bool,
        cancel: CancellationToken,
        on_progress: ProgressSink,
    ) -> Result<GenerationOutput> {
        request.validate()?;
        let started = Instant::now();

        let enhancement = if enhance {
            let outcome = self.enhancer.enhance(&request.prompt).await;
            request.prompt = outcome.resolve(&request.prompt);
            Some(outcome)
        } else {
            None
        };

        let permit = tokio::select! {
            permit = self.gpu.clone().acquire_owned() => {
                permit.map_err(|_| anyhow!("generation service is shut down"))?
            }
            _ = cancel.cancelled() => bail!("generation cancelled"),
        };

        let pipeline = Pipeline {
            generator: Arc::clone(&self.generator),
            upscaler: self.current_upscaler(),
            options: self.options.clone(),
            cancel: cancel.clone(),
            on_progress,
        };
        let prompt = request.prompt.clone();
        let upscaled = pipeline.upscaler.is_some();

        let handle = tokio::task::spawn_blocking(move || pipeline.run(&request, permit));

        let joined = match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.cancel();
                    warn!(timeout_secs = limit.as_secs(), "Generation timed out");
                    bail!("generation timed out after {}s", limit.as_secs());
                }
            },
            None => handle.await,
        };
        let video = joined.context("generation task panicked")??;

        Ok(GenerationOutput {
            prompt,
            enhancement,
            video,
            upscaled,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Releases the upscale session. In-flight requests keep their own handle.
    pub fn shutdown(&self) {
        let released = self
            .upscaler
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if released.is_some() {
            info!("Upscale model released");
        }
    }
}

struct Pipeline {
    generator: SharedGenerator,
    upscaler: Option<Arc<UpscaleModel>>,
    options: ServiceOptions,
    cancel: CancellationToken,
    on_progress: ProgressSink,
}

impl Pipeline {
    fn emit(&self, phase: GenerationPhase, current: u64, total: u64) {
        (self.on_progress)(GenerationProgress {
            phase,
            current,
            total,
        });
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("generation cancelled");
        }
        Ok(())
    }

    fn run(self, request: &GenerationRequest, _permit: OwnedSemaphorePermit) -> Result<ExportedVideo> {
        self.checkpoint()?;
        self.emit(GenerationPhase::Generating, 0, 1);
        let frames = {
            let mut generator = self
                .generator
                .lock()
                .map_err(|_| anyhow!("video generator lock poisoned"))?;
            generator.generate(request)?
        };
        self.emit(GenerationPhase::Generating, 1, 1);
        info!(shape = ?frames.shape(), "Frames generated");

        self.checkpoint()?;
        let frames = match self.upscaler.as_deref() {
            Some(upscaler) => self.upscale(upscaler, frames)?,
            None => frames,
        };

        self.checkpoint()?;
        self.emit(GenerationPhase::Encoding, 0, 1);
        let video = export_video(frames.view(), &self.options.output_dir, &self.options.export)?;
        self.emit(GenerationPhase::Encoding, 1, 1);
        Ok(video)
    }

    fn upscale(&self, upscaler: &UpscaleModel, frames: Array5<f32>) -> Result<Array5<f32>> {
        let params = upscaler.tile_params(self.options.tile, self.options.overlap);
        let total = upscale_steps(frames.shape(), &params)?;

        let sink = Arc::clone(&self.on_progress);
        let mut progress = ProgressReporter::with_listener(total, move |snapshot| {
            sink(GenerationProgress {
                phase: GenerationPhase::Upscaling,
                current: snapshot.current,
                total: snapshot.total,
            })
        });
        self.emit(GenerationPhase::Upscaling, 0, total);

        upscaler.upscale(
            frames.view(),
            self.options.tile,
            self.options.overlap,
            &mut progress,
            &self.cancel,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::{EnhanceConfig, ExportConfig};

    use super::*;

    #[derive(Default)]
    struct Calls {
        count: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    /// Records the prompt it was given, optionally stalls, then fails so the
    /// pipeline never reaches ffmpeg.
    struct RecordingGenerator {
        calls: Arc<Calls>,
        stall: Duration,
    }

    impl VideoGenerator for RecordingGenerator {
        fn generate(&mut self, request: &GenerationRequest) -> Result<Array5<f32>> {
            self.calls.count.fetch_add(1, Ordering::SeqCst);
            self.calls
                .prompts
                .lock()
                .unwrap()
                .push(request.prompt.clone());
            std::thread::sleep(self.stall);
            bail!("stub generator stops here")
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }

    struct ConstantGenerator;

    impl VideoGenerator for ConstantGenerator {
        fn generate(&mut self, _request: &GenerationRequest) -> Result<Array5<f32>> {
            Ok(Array5::from_elem((1, 4, 3, 32, 48), 0.5))
        }

        fn describe(&self) -> String {
            "constant".to_string()
        }
    }

    fn options(dir: &Path, timeout: Option<Duration>) -> ServiceOptions {
        ServiceOptions {
            output_dir: dir.to_path_buf(),
            export: ExportSettings::new(8, &ExportConfig::default()),
            tile: 512,
            overlap: 32,
            timeout,
        }
    }

    fn service_with(
        generator: Box<dyn VideoGenerator>,
        dir: &Path,
        timeout: Option<Duration>,
    ) -> GenerationService {
        let enhancer = PromptEnhancer::new(&EnhanceConfig::default()).unwrap();
        GenerationService::new(generator, None, enhancer, options(dir, timeout))
    }

    fn recording(stall: Duration) -> (Box<dyn VideoGenerator>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let generator = RecordingGenerator {
            calls: Arc::clone(&calls),
            stall,
        };
        (Box::new(generator), calls)
    }

    fn collecting_sink() -> (ProgressSink, Arc<Mutex<Vec<GenerationProgress>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: ProgressSink = Arc::new(move |event| sink_events.lock().unwrap().push(event));
        (sink, events)
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_model() {
        let temp = tempfile::tempdir().unwrap();
        let (generator, calls) = recording(Duration::ZERO);
        let service = service_with(generator, temp.path(), None);

        let err = service
            .generate(
                GenerationRequest::new("", 50, 6.0),
                false,
                CancellationToken::new(),
                discard_progress(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("prompt"));
        assert_eq!(calls.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_generation() {
        let temp = tempfile::tempdir().unwrap();
        let (generator, calls) = recording(Duration::ZERO);
        let service = service_with(generator, temp.path(), None);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = service
            .generate(
                GenerationRequest::new("waves", 10, 6.0),
                false,
                cancel,
                discard_progress(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(calls.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_enhancer_passes_prompt_unchanged() {
        let temp = tempfile::tempdir().unwrap();
        let (generator, calls) = recording(Duration::ZERO);
        let service = service_with(generator, temp.path(), None);
        let prompt = "  a fox in snow \n";

        let (sink, events) = collecting_sink();
        let err = service
            .generate(
                GenerationRequest::new(prompt, 10, 6.0),
                true,
                CancellationToken::new(),
                sink,
            )
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("stub generator"));
        assert_eq!(calls.prompts.lock().unwrap().as_slice(), &[prompt.to_string()]);

        let events = events.lock().unwrap();
        assert_eq!(
            events.first(),
            Some(&GenerationProgress {
                phase: GenerationPhase::Generating,
                current: 0,
                total: 1
            })
        );
    }

    #[tokio::test]
    async fn timeout_cancels_the_request() {
        let temp = tempfile::tempdir().unwrap();
        let (generator, _calls) = recording(Duration::from_millis(500));
        let service = service_with(generator, temp.path(), Some(Duration::from_millis(50)));

        let cancel = CancellationToken::new();
        let err = service
            .generate(
                GenerationRequest::new("slow", 10, 6.0),
                false,
                cancel.clone(),
                discard_progress(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn shutdown_without_upscaler_is_noop() {
        let temp = tempfile::tempdir().unwrap();
        let service = service_with(Box::new(ConstantGenerator), temp.path(), None);
        assert!(!service.has_upscaler());
        service.shutdown();
        assert_eq!(service.generator_description(), "constant");
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let mut config = AppConfig::default();
        config.generation.timeout_secs = 0;
        assert_eq!(ServiceOptions::from_config(&config).timeout, None);
        config.generation.timeout_secs = 90;
        assert_eq!(
            ServiceOptions::from_config(&config).timeout,
            Some(Duration::from_secs(90))
        );
    }

    #[tokio::test]
    #[ignore = "requires ffmpeg on PATH"]
    async fn exports_mp4_and_gif() {
        let temp = tempfile::tempdir().unwrap();
        let service = service_with(Box::new(ConstantGenerator), temp.path(), None);
        let (sink, events) = collecting_sink();

        let output = service
            .generate(
                GenerationRequest::new("grey", 10, 6.0),
                false,
                CancellationToken::new(),
                sink,
            )
            .await
            .expect("generation succeeds");

        assert!(output.video.mp4.is_file());
        assert!(output.video.gif.is_file());
        assert_eq!(output.video.frames, 4);
        assert!(!output.upscaled);
        let last = *events.lock().unwrap().last().unwrap();
        assert_eq!(last.phase, GenerationPhase::Encoding);
        assert_eq!(last.current, last.total);
    }
}
