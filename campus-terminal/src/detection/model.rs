//! Inference model lifecycle
//!
//! `unloaded → loading → loaded | failed`; a failed model may be loaded again.
//! Loading runs on the blocking pool and concurrent requests share one load.
//! Only one inference runs at a time.

use crate::config::DetectionConfig;
use crate::error::DetectionError;
use campus_protocol::ModelState;
use process_control::{ChildExt, Control};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{error, info};
use uuid::Uuid;

/// A loaded detector: JPEG bytes in, object count out
pub trait InferenceModel: Send + Sync {
    fn detect(&self, jpeg: &[u8]) -> Result<u32, DetectionError>;
}

/// Produces a model; called on the blocking pool
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn InferenceModel>, DetectionError>;
}

pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    model: Arc<Mutex<Option<Box<dyn InferenceModel>>>>,
    state: watch::Sender<ModelState>,
    load_gate: Mutex<()>,
    wait: Duration,
}

impl ModelManager {
    /// `wait` bounds how long an inference request waits for the model
    pub fn new(loader: Arc<dyn ModelLoader>, wait: Duration) -> Self {
        let (state, _) = watch::channel(ModelState::Unloaded);
        Self {
            loader,
            model: Arc::new(Mutex::new(None)),
            state,
            load_gate: Mutex::new(()),
            wait,
        }
    }

    pub fn state(&self) -> ModelState {
        *self.state.borrow()
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == ModelState::Loaded
    }

    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.state.subscribe()
    }

    /// Load the model unless it is already loaded. The load itself runs on its
    /// own task, so dropping this future never leaves the state at `loading`.
    pub async fn load(self: &Arc<Self>) -> Result<(), DetectionError> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.load_once().await })
            .await
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?
    }

    pub fn load_in_background(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _ = manager.load().await;
        });
    }

    async fn load_once(&self) -> Result<(), DetectionError> {
        let _gate = self.load_gate.lock().await;
        if self.is_loaded() {
            return Ok(());
        }

        self.state.send_replace(ModelState::Loading);
        info!("Loading detection model");

        let loader = Arc::clone(&self.loader);
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))
            .and_then(|result| result);

        match loaded {
            Ok(model) => {
                *self.model.lock().await = Some(model);
                self.state.send_replace(ModelState::Loaded);
                info!("Detection model loaded");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ModelState::Failed);
                error!(error = %e, "Detection model failed to load");
                Err(e)
            }
        }
    }

    pub async fn unload(&self) {
        *self.model.lock().await = None;
        self.state.send_replace(ModelState::Unloaded);
        info!("Detection model unloaded");
    }

    /// Count objects in one frame, waiting up to the configured bound for the model
    pub async fn detect(self: &Arc<Self>, jpeg: Vec<u8>) -> Result<u32, DetectionError> {
        if !self.is_loaded() {
            match timeout(self.wait, self.load()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return Err(DetectionError::ModelUnavailable),
            }
        }

        let guard = Arc::clone(&self.model).lock_owned().await;
        tokio::task::spawn_blocking(move || match guard.as_ref() {
            Some(model) => model.detect(&jpeg),
            None => Err(DetectionError::ModelUnavailable),
        })
        .await
        .map_err(|e| DetectionError::Inference(e.to_string()))?
    }
}

/// Loader for a detector program run once per frame
pub struct ExternalModelLoader {
    program: Option<String>,
    args: Vec<String>,
    time_limit: Duration,
}

impl ExternalModelLoader {
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            program: config.detector_program.clone(),
            args: config.detector_args.clone(),
            time_limit: Duration::from_secs(config.detector_timeout_secs.max(1)),
        }
    }
}

impl ModelLoader for ExternalModelLoader {
    fn load(&self) -> Result<Box<dyn InferenceModel>, DetectionError> {
        let program = self
            .program
            .clone()
            .ok_or_else(|| DetectionError::ModelLoad("no detector program configured".into()))?;
        if program.contains(std::path::MAIN_SEPARATOR) && !Path::new(&program).exists() {
            return Err(DetectionError::ModelLoad(format!("detector {program} not found")));
        }
        Ok(Box::new(ExternalModel {
            program,
            args: self.args.clone(),
            time_limit: self.time_limit,
        }))
    }
}

/// Runs `<program> <args…> <frame.jpg>` and reads the count it prints
pub struct ExternalModel {
    program: String,
    args: Vec<String>,
    time_limit: Duration,
}

impl ExternalModel {
    fn run(&self, frame: &Path) -> Result<u32, DetectionError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(frame)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DetectionError::Inference(format!("failed to start detector: {e}")))?;

        let output = child
            .controlled_with_output()
            .time_limit(self.time_limit)
            .terminate_for_timeout()
            .wait()
            .map_err(|e| DetectionError::Inference(e.to_string()))?
            .ok_or_else(|| DetectionError::Inference("detector timed out".into()))?;

        if !output.status.success() {
            return Err(DetectionError::Inference(format!(
                "detector exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_count(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| DetectionError::Inference("no count in detector output".into()))
    }
}

impl InferenceModel for ExternalModel {
    fn detect(&self, jpeg: &[u8]) -> Result<u32, DetectionError> {
        let frame = std::env::temp_dir().join(format!("campus-frame-{}.jpg", Uuid::new_v4()));
        std::fs::write(&frame, jpeg).map_err(|e| DetectionError::Inference(e.to_string()))?;
        let result = self.run(&frame);
        let _ = std::fs::remove_file(&frame);
        result
    }
}

/// Last integer printed by the detector
fn parse_count(output: &str) -> Option<u32> {
    output
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| !token.is_empty())
        .last()
        .and_then(|token| token.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixed(u32);

    impl InferenceModel for Fixed {
        fn detect(&self, _jpeg: &[u8]) -> Result<u32, DetectionError> {
            Ok(self.0)
        }
    }

    struct SlowLoader {
        loads: AtomicU32,
        delay: Duration,
        fail_first: bool,
    }

    impl ModelLoader for SlowLoader {
        fn load(&self) -> Result<Box<dyn InferenceModel>, DetectionError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail_first && n == 0 {
                return Err(DetectionError::ModelLoad("weights missing".into()));
            }
            Ok(Box::new(Fixed(3)))
        }
    }

    fn manager(delay_ms: u64, fail_first: bool, wait_ms: u64) -> (Arc<ModelManager>, Arc<SlowLoader>) {
        let loader = Arc::new(SlowLoader {
            loads: AtomicU32::new(0),
            delay: Duration::from_millis(delay_ms),
            fail_first,
        });
        let manager = ModelManager::new(loader.clone(), Duration::from_millis(wait_ms));
        (Arc::new(manager), loader)
    }

    #[tokio::test]
    async fn test_concurrent_loads_are_coalesced() {
        let (manager, loader) = manager(100, false, 1000);
        let (a, b) = tokio::join!(manager.load(), manager.load());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(manager.detect(vec![0xFF, 0xD8]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_load_is_retryable() {
        let (manager, loader) = manager(0, true, 1000);
        assert!(manager.load().await.is_err());
        assert_eq!(manager.state(), ModelState::Failed);
        assert!(manager.load().await.is_ok());
        assert_eq!(manager.state(), ModelState::Loaded);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

        manager.unload().await;
        assert_eq!(manager.state(), ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_inference_gives_up_while_loading() {
        let (manager, _) = manager(500, false, 50);
        assert!(matches!(
            manager.detect(vec![1]).await,
            Err(DetectionError::ModelUnavailable)
        ));
        // the load keeps going in the background
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(manager.state(), ModelState::Loaded);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("3\n"), Some(3));
        assert_eq!(parse_count("loading weights\ncount: 12\n"), Some(12));
        assert_eq!(parse_count("nothing"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_external_detector() {
        let loader = ExternalModelLoader {
            program: Some("sh".into()),
            args: vec!["-c".into(), "test -s \"$1\" && echo 5".into(), "detector".into()],
            time_limit: Duration::from_secs(10),
        };
        let model = loader.load().unwrap();
        assert_eq!(model.detect(&[0xFF, 0xD8, 0xFF, 0xD9]).unwrap(), 5);

        assert!(ExternalModelLoader::from_config(&DetectionConfig::default()).load().is_err());
    }
}
