//! Locating ONNX Runtime and the GPU libraries its execution providers need.
//!
//! ORT is loaded dynamically, so the binary can ship without it. At startup
//! we point `ORT_DYLIB_PATH` at a bundled copy when one exists and preload
//! CUDA, cuDNN and TensorRT so the CUDA/TensorRT providers resolve them.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";
/// Extra directory searched before the defaults.
pub const LIB_DIR_ENV: &str = "UPSCALER_LIB_DIR";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Where the ORT library path came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtLocation {
    /// `ORT_DYLIB_PATH` was already set by the user.
    Environment(PathBuf),
    /// Found next to the executable or in a system lib dir.
    Discovered(PathBuf),
    NotFound,
}

/// Outcome of [`setup_runtime_libs`], logged once tracing is up.
#[derive(Debug, Clone)]
pub struct RuntimeLibReport {
    pub searched: Vec<PathBuf>,
    pub ort: OrtLocation,
    pub preloaded: Vec<PathBuf>,
}

/// Directories probed, in order: `$UPSCALER_LIB_DIR`, `<exe_dir>` (Windows),
/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then the system lib dirs
/// on Unix. Duplicates are dropped.
fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(custom) = env::var_os(LIB_DIR_ENV) {
        dirs.push(PathBuf::from(custom));
    }

    if let Some(exe_dir) = env::current_exe()
        .and_then(|exe| exe.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        #[cfg(windows)]
        dirs.push(exe_dir.clone());
        dirs.push(exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            dirs.push(parent.join("lib"));
        }
    }

    if let Ok(cwd) = env::current_dir() {
        dirs.push(cwd.join("lib"));
    }

    #[cfg(unix)]
    dirs.extend([PathBuf::from("/usr/local/lib"), PathBuf::from("/usr/lib")]);

    let mut seen = HashSet::new();
    dirs.retain(|dir| seen.insert(dir.clone()));
    dirs
}

fn find_ort_library(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load tier for GPU runtime libraries: CUDA (0), cuDNN (1), TensorRT (2).
///
/// ORT provider libraries are excluded; they need symbols from the ORT core
/// library, which the `ort` crate opens later.
fn preload_tier(file_name: &str) -> Option<u8> {
    let name = file_name.to_ascii_lowercase();
    #[cfg(windows)]
    let name = name.trim_end_matches(".dll").to_string();
    #[cfg(unix)]
    let name = name.trim_start_matches("lib").to_string();

    const CUDA: [&str; 5] = ["cudart", "cublas", "cublaslt", "cufft", "curand"];
    if CUDA.iter().any(|prefix| name.starts_with(prefix)) {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_shared_library(path: &Path) -> bool {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    // Versioned sonames are usually symlinks to the real file.
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_shared_library(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries to preload, ordered by tier then name. A file name seen in
/// an earlier directory shadows later ones.
fn collect_preload_candidates(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut found: Vec<(u8, String, PathBuf)> = Vec::new();

    for entry in dirs
        .iter()
        .filter_map(|dir| fs::read_dir(dir).ok())
        .flat_map(|entries| entries.flatten())
    {
        let path = entry.path();
        if !is_shared_library(&path) {
            continue;
        }
        let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        let Some(tier) = preload_tier(&name) else {
            continue;
        };
        if seen.insert(name.clone()) {
            found.push((tier, name, path));
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    found.into_iter().map(|(_, _, path)| path).collect()
}

/// Open with RTLD_GLOBAL so later dlopen calls from ORT see the symbols.
/// The handle is leaked on purpose; the library must stay mapped.
#[cfg(unix)]
fn preload(path: &Path) -> bool {
    // SAFETY: these are vendor runtime libraries whose initializers have no
    // preconditions beyond being loaded once.
    let opened = unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    };
    opened.map(std::mem::forget).is_ok()
}

#[cfg(windows)]
fn preload(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    let opened = unsafe { libloading::Library::new(path) };
    opened.map(std::mem::forget).is_ok()
}

/// Resolve ORT and preload GPU libraries. Call first thing in `main`, before
/// any session is built; tracing is not available yet so the findings are
/// returned for [`log_runtime_lib_status`].
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let searched = search_dirs();

    let ort = match env::var_os(ORT_DYLIB_ENV) {
        Some(existing) => OrtLocation::Environment(PathBuf::from(existing)),
        None => match find_ort_library(&searched) {
            Some(path) => {
                env::set_var(ORT_DYLIB_ENV, &path);
                OrtLocation::Discovered(path)
            }
            None => OrtLocation::NotFound,
        },
    };

    let preloaded = collect_preload_candidates(&searched)
        .into_iter()
        .filter(|path| preload(path))
        .collect();

    RuntimeLibReport {
        searched,
        ort,
        preloaded,
    }
}

pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match &report.ort {
        OrtLocation::Environment(path) if path.is_file() => {
            info!(path = %path.display(), "Using ONNX Runtime from {ORT_DYLIB_ENV}")
        }
        OrtLocation::Environment(path) => warn!(
            path = %path.display(),
            "{ORT_DYLIB_ENV} points at a missing file; model loading will fail"
        ),
        OrtLocation::Discovered(path) => {
            info!(path = %path.display(), "Found bundled ONNX Runtime")
        }
        OrtLocation::NotFound => warn!(
            searched = ?report.searched,
            "ONNX Runtime library not found; falling back to the loader's default search path"
        ),
    }

    if report.preloaded.is_empty() {
        debug!("No GPU runtime libraries preloaded");
    } else {
        info!(count = report.preloaded.len(), "Preloaded GPU runtime libraries");
        for path in &report.preloaded {
            debug!(path = %path.display(), "Preloaded");
        }
    }
}
