use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{InferenceBackend, SessionConfig};
use crate::error::EnhanceError;
use crate::pipeline::ModelProvider;
use crate::processor::{OnnxTileProcessor, TensorLayout, TileProcessor};
use crate::strategy::model_selector;

/// Optional metadata file in the models directory. Entries listed here take
/// precedence over filename-based discovery.
pub const CATALOG_FILENAME: &str = "models.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub filename: String,
    #[serde(default)]
    pub layout: TensorLayout,
    /// Filename hint only; the processor reads the real input type from the session.
    #[serde(default)]
    pub is_fp16: bool,
    #[serde(default)]
    pub description: String,
}

impl ModelEntry {
    fn from_filename(filename: &str, name: &str) -> Self {
        let lower = filename.to_lowercase();
        let layout = if lower.contains("nchw") {
            TensorLayout::Nchw
        } else {
            TensorLayout::Nhwc
        };

        Self {
            name: name.to_string(),
            filename: filename.to_string(),
            layout,
            is_fp16: lower.contains("fp16"),
            description: "Discovered model (metadata unknown)".into(),
        }
    }

    pub fn selector(&self) -> String {
        model_selector(&self.name)
    }
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    /// Build a registry and scan `models_dir` once.
    pub fn discovered(models_dir: PathBuf) -> Result<Self> {
        let mut registry = Self::new(models_dir);
        registry.discover()?;
        Ok(registry)
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Load the optional catalog, then register every `*.onnx` file not
    /// already described by it. A missing directory is not an error.
    pub fn discover(&mut self) -> Result<()> {
        let dir = self.models_dir.clone();
        if !dir.exists() {
            warn!(dir = %dir.display(), "Models directory does not exist");
            return Ok(());
        }

        let catalog = dir.join(CATALOG_FILENAME);
        if catalog.is_file() {
            let json = fs::read_to_string(&catalog)
                .with_context(|| format!("Failed to read {}", catalog.display()))?;
            self.load_json(&json)
                .with_context(|| format!("Invalid model catalog {}", catalog.display()))?;
        }

        let read_dir = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

        for entry in read_dir {
            let path = entry?.path();

            let is_onnx = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("onnx"))
                .unwrap_or(false);
            if !is_onnx || !path.is_file() {
                continue;
            }

            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.entries.iter().any(|e| e.filename == filename) {
                continue;
            }

            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(filename);

            info!(filename = %filename, "Discovered ONNX model");
            self.entries.push(ModelEntry::from_filename(filename, name));
        }

        self.entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }

    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: Vec<ModelEntry> =
            serde_json::from_str(json).context("Failed to parse model catalog JSON")?;
        for entry in loaded {
            if !self.entries.iter().any(|e| e.name == entry.name) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }
}

/// Lazily loads ONNX processors on first use and keeps them for the life of
/// the process.
pub struct ModelCache {
    registry: ModelRegistry,
    backend: InferenceBackend,
    trt_cache_dir: Option<PathBuf>,
    loaded: DashMap<String, Arc<dyn TileProcessor>>,
    /// One lock per model name so a model is built at most once.
    load_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ModelCache {
    pub fn new(registry: ModelRegistry, backend: InferenceBackend) -> Self {
        Self {
            registry,
            backend,
            trt_cache_dir: None,
            loaded: DashMap::new(),
            load_locks: DashMap::new(),
        }
    }

    pub fn with_trt_cache_dir(mut self, dir: PathBuf) -> Self {
        self.trt_cache_dir = Some(dir);
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    /// Register an already-built processor under `name`.
    pub fn insert(&self, name: &str, processor: Arc<dyn TileProcessor>) {
        self.loaded.insert(name.to_string(), processor);
    }

    fn load(&self, entry: &ModelEntry) -> Result<Arc<dyn TileProcessor>> {
        let model_path = self.registry.models_dir().join(&entry.filename);
        info!(
            model = %entry.name,
            path = %model_path.display(),
            backend = %self.backend,
            "Loading model"
        );
        let config = SessionConfig {
            model_path: &model_path,
            backend: self.backend,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
        };
        let processor = OnnxTileProcessor::load(&config, entry.layout)?;
        info!(model = %entry.name, fp16 = processor.is_fp16(), "Model loaded");
        Ok(Arc::new(processor))
    }

    /// Cached lookup; on a miss, `load` runs under the per-name lock and
    /// concurrent callers for the same name wait for its result.
    fn acquire_with<F>(&self, name: &str, load: F) -> crate::error::Result<Arc<dyn TileProcessor>>
    where
        F: FnOnce(&ModelEntry) -> Result<Arc<dyn TileProcessor>>,
    {
        if let Some(processor) = self.loaded.get(name) {
            return Ok(Arc::clone(processor.value()));
        }

        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| EnhanceError::UnknownModel(name.to_string()))?;

        let lock = Arc::clone(self.load_locks.entry(name.to_string()).or_default().value());
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(processor) = self.loaded.get(name) {
            return Ok(Arc::clone(processor.value()));
        }

        let processor = load(entry).map_err(EnhanceError::processing)?;
        self.loaded.insert(name.to_string(), Arc::clone(&processor));
        Ok(processor)
    }
}

impl ModelProvider for ModelCache {
    fn acquire(&self, name: &str) -> crate::error::Result<Arc<dyn TileProcessor>> {
        self.acquire_with(name, |entry| self.load(entry))
    }
}
