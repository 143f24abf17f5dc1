//! Static model catalog and the process-wide cache of loaded model handles.
//!
//! Handles are created lazily on first use, at most once per model name, and
//! live until the registry is dropped (in practice, process exit).

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::error::UpscaleError;
use crate::inference::{ModelLoader, UpscaleModel};

pub const DEFAULT_MODEL: &str = "realesrgan-x4plus";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub name: String,
    /// ONNX weights file, relative to the models directory.
    pub filename: String,
    pub url: Option<String>,
    pub sha256: Option<String>,
    /// Fixed multiplier the network produces.
    pub native_scale: u32,
    /// Tile edge in input pixels; 0 runs the whole image in one pass.
    pub tile_size: u32,
    /// Overlap added on each side of a tile to hide seams.
    pub tile_pad: u32,
    /// Spatial dimensions fed to the network must be multiples of this.
    pub pad_align: u32,
    /// Value range the model expects/produces: `(0.0, 255.0)` or `(0.0, 1.0)`.
    pub normalization_range: (f32, f32),
    pub is_fp16: bool,
    pub description: String,
}

pub(crate) fn builtin_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            name: DEFAULT_MODEL.into(),
            filename: "RealESRGAN_x4plus.onnx".into(),
            url: None,
            sha256: None,
            native_scale: 4,
            tile_size: 400,
            tile_pad: 10,
            pad_align: 4,
            normalization_range: (0.0, 1.0),
            is_fp16: false,
            description: "Best for real photos and general images".into(),
        },
        ModelDescriptor {
            name: "realesrgan-x4plus-anime".into(),
            filename: "RealESRGAN_x4plus_anime_6B.onnx".into(),
            url: Some("https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/RealESRGAN_x4plus_anime_6B.onnx".into()),
            sha256: None,
            native_scale: 4,
            tile_size: 400,
            tile_pad: 10,
            pad_align: 4,
            normalization_range: (0.0, 255.0),
            is_fp16: false,
            description: "Optimized for anime and illustrations".into(),
        },
    ]
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    catalog: Vec<ModelDescriptor>,
    loader: Arc<dyn ModelLoader>,
    handles: RwLock<HashMap<String, Arc<dyn UpscaleModel>>>,
    /// Names whose first load failed; they stay unavailable until restart.
    failures: RwLock<HashMap<String, UpscaleError>>,
    load_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf, loader: Arc<dyn ModelLoader>) -> Self {
        Self::with_catalog(models_dir, builtin_catalog(), loader)
    }

    pub fn with_catalog(
        models_dir: PathBuf,
        catalog: Vec<ModelDescriptor>,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        Self {
            models_dir,
            catalog,
            loader,
            handles: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn catalog(&self) -> &[ModelDescriptor] {
        &self.catalog
    }

    pub fn descriptor(&self, name: &str) -> Option<&ModelDescriptor> {
        self.catalog.iter().find(|d| d.name == name)
    }

    pub fn supported_names(&self) -> Vec<String> {
        self.catalog.iter().map(|d| d.name.clone()).collect()
    }

    /// Look up a descriptor, failing with a message that lists the catalog.
    pub fn validate_model_name(&self, name: &str) -> Result<&ModelDescriptor, UpscaleError> {
        self.descriptor(name).ok_or_else(|| {
            UpscaleError::Validation(format!(
                "Model '{name}' not available. Available models: [{}]",
                self.supported_names().join(", ")
            ))
        })
    }

    /// Names with a live handle, in catalog order.
    pub fn loaded_names(&self) -> Vec<String> {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        self.catalog
            .iter()
            .filter(|d| handles.contains_key(&d.name))
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.descriptor(name)
            .map(|d| self.models_dir.join(&d.filename))
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.model_path(name)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Return the shared handle for `name`, constructing it on first use.
    ///
    /// Steady-state lookups only take the read lock. A miss takes the
    /// construction mutex and checks again before loading, so concurrent
    /// first requests for one name produce a single load.
    pub fn get_or_load(&self, name: &str) -> Result<Arc<dyn UpscaleModel>, UpscaleError> {
        let descriptor = self.validate_model_name(name)?;

        if let Some(cached) = self.cached(name) {
            return cached;
        }

        let _guard = self
            .load_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(cached) = self.cached(name) {
            return cached;
        }

        let path = self.models_dir.join(&descriptor.filename);
        info!(model = %name, path = %path.display(), "Loading model");
        let started = Instant::now();

        match self.loader.load(descriptor, &path) {
            Ok(handle) => {
                self.handles
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), Arc::clone(&handle));
                info!(
                    model = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model loaded"
                );
                Ok(handle)
            }
            Err(err) => {
                let err = match err {
                    UpscaleError::LoadFailure { .. } => err,
                    other => UpscaleError::load_failure(name, other),
                };
                error!(model = %name, error = %err, "Model load failed; unavailable until restart");
                self.failures
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), err.clone());
                Err(err)
            }
        }
    }

    fn cached(&self, name: &str) -> Option<Result<Arc<dyn UpscaleModel>, UpscaleError>> {
        if let Some(handle) = self
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Some(Ok(Arc::clone(handle)));
        }

        self.failures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|err| Err(err.clone()))
    }

    /// Fetch the weights for `name` into the models directory.
    pub fn download(&self, name: &str) -> Result<PathBuf> {
        let entry = self
            .descriptor(name)
            .with_context(|| format!("Unknown model: {name}"))?;

        let url = entry
            .url
            .as_deref()
            .with_context(|| format!("No download URL for model: {name}"))?;

        fs::create_dir_all(&self.models_dir).with_context(|| {
            format!(
                "Failed to create models directory: {}",
                self.models_dir.display()
            )
        })?;

        let final_path = self.models_dir.join(&entry.filename);
        let tmp_path = self.models_dir.join(format!("{}.part", entry.filename));

        info!(model = %name, url = %url, "Downloading model");

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .context("Failed to build HTTP client for model download")?;

        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("Failed to start download for model {name}"))?;

        if !response.status().is_success() {
            bail!(
                "Download request for model {name} returned HTTP {}",
                response.status().as_u16()
            );
        }

        let mut tmp_file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;

        let written = response
            .copy_to(&mut tmp_file)
            .with_context(|| format!("Failed while downloading model {name} from {url}"))
            .and_then(|_| {
                tmp_file
                    .sync_all()
                    .with_context(|| format!("Failed to flush temp file: {}", tmp_path.display()))
            });
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Some(expected_hash) = &entry.sha256 {
            let actual_hash = sha256_file(&tmp_path)?;
            if actual_hash != *expected_hash {
                let _ = fs::remove_file(&tmp_path);
                bail!("SHA256 mismatch for {name}: expected {expected_hash}, got {actual_hash}");
            }
            info!(model = %name, "Hash verified OK");
        } else {
            warn!(model = %name, "No SHA256 hash configured, skipping verification");
        }

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "Failed to move {} to {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        info!(model = %name, path = %final_path.display(), "Download complete");
        Ok(final_path)
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingLoader;
    use std::sync::Barrier;
    use std::thread;

    fn registry(loader: &Arc<CountingLoader>) -> ModelRegistry {
        ModelRegistry::new(std::env::temp_dir().join("models"), loader.clone())
    }

    #[test]
    fn builtin_catalog_has_two_native_x4_models() {
        let catalog = builtin_catalog();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.iter().all(|d| d.native_scale == 4));
        assert_eq!(catalog[0].name, "realesrgan-x4plus");
        assert_eq!(catalog[1].name, "realesrgan-x4plus-anime");
        assert!(catalog.iter().all(|d| d.tile_size == 400 && d.tile_pad == 10));
    }

    #[test]
    fn unknown_model_lists_supported_names_without_loading() {
        let loader = Arc::new(CountingLoader::new());
        let reg = registry(&loader);

        let err = reg.get_or_load("foo").err().expect("unknown model");
        match &err {
            UpscaleError::Validation(msg) => {
                assert!(msg.contains("'foo'"));
                assert!(msg.contains("realesrgan-x4plus"));
                assert!(msg.contains("realesrgan-x4plus-anime"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(loader.loads(), 0);
    }

    #[test]
    fn repeated_get_reuses_handle() {
        let loader = Arc::new(CountingLoader::new());
        let reg = registry(&loader);

        let first = reg.get_or_load("realesrgan-x4plus").expect("first load");
        let second = reg.get_or_load("realesrgan-x4plus").expect("cached");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.loads(), 1);
        assert_eq!(reg.loaded_names(), vec!["realesrgan-x4plus".to_string()]);
    }

    #[test]
    fn concurrent_first_access_loads_once() {
        let loader = Arc::new(CountingLoader::new().with_delay(Duration::from_millis(50)));
        let reg = registry(&loader);
        let threads = 16;
        let barrier = Barrier::new(threads);

        thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    barrier.wait();
                    reg.get_or_load("realesrgan-x4plus")
                        .expect("concurrent load");
                });
            }
        });

        assert_eq!(loader.loads(), 1);
    }

    #[test]
    fn distinct_models_load_independently() {
        let loader = Arc::new(CountingLoader::new());
        let reg = registry(&loader);

        reg.get_or_load("realesrgan-x4plus").expect("general");
        reg.get_or_load("realesrgan-x4plus-anime").expect("anime");
        reg.get_or_load("realesrgan-x4plus-anime").expect("anime cached");

        assert_eq!(loader.loads(), 2);
        assert_eq!(reg.loaded_names().len(), 2);
    }

    #[test]
    fn load_failure_is_sticky() {
        let loader = Arc::new(CountingLoader::new().failing());
        let reg = registry(&loader);

        let first = reg.get_or_load("realesrgan-x4plus").err().expect("fails");
        assert!(matches!(first, UpscaleError::LoadFailure { .. }));

        let second = reg.get_or_load("realesrgan-x4plus").err().expect("still fails");
        assert_eq!(first, second);
        assert_eq!(loader.loads(), 1, "failed model must not be retried");
        assert!(reg.loaded_names().is_empty());
    }

    #[test]
    fn model_path_joins_models_dir() {
        let loader = Arc::new(CountingLoader::new());
        let reg = registry(&loader);
        assert_eq!(
            reg.model_path("realesrgan-x4plus-anime"),
            Some(std::env::temp_dir().join("models/RealESRGAN_x4plus_anime_6B.onnx"))
        );
        assert!(reg.model_path("foo").is_none());
    }

    #[test]
    fn is_downloaded_checks_file_presence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = ModelRegistry::new(dir.path().to_path_buf(), Arc::new(CountingLoader::new()));
        assert!(!reg.is_downloaded("realesrgan-x4plus"));

        fs::write(dir.path().join("RealESRGAN_x4plus.onnx"), b"fake model data").unwrap();
        assert!(reg.is_downloaded("realesrgan-x4plus"));
    }

    #[test]
    fn download_without_url_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = ModelRegistry::new(dir.path().to_path_buf(), Arc::new(CountingLoader::new()));
        let err = reg.download("realesrgan-x4plus").err().unwrap();
        assert!(err.to_string().contains("No download URL"), "got: {err}");
    }

    #[test]
    fn download_unknown_model_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = ModelRegistry::new(dir.path().to_path_buf(), Arc::new(CountingLoader::new()));
        let err = reg.download("NonExistentModel").err().unwrap();
        assert!(err.to_string().contains("Unknown model"), "got: {err}");
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("testfile.bin");
        fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    #[ignore]
    fn download_real_anime_weights() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = ModelRegistry::new(dir.path().to_path_buf(), Arc::new(CountingLoader::new()));
        let path = reg.download("realesrgan-x4plus-anime").unwrap();
        assert!(fs::metadata(&path).unwrap().len() > 1_000_000);
    }
}
