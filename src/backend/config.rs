//! Backend selection, resolved once when a model is loaded
//!
//! Nothing in the decode loop reads process-global flags: the CPU kernel
//! flavor, thread count and GPU runtime parameters all arrive through this
//! struct.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeResult, ZeForgeError};

const BACKEND_ENV: &str = "ZEFORGE_BACKEND";
const KERNEL_PATH_ENV: &str = "ZEFORGE_KERNEL_PATH";
const DEVICE_INDEX_ENV: &str = "ZEFORGE_DEVICE_INDEX";
const VECTOR_KERNELS_ENV: &str = "ZEFORGE_VECTOR_KERNELS";
const THREADS_ENV: &str = "ZEFORGE_THREADS";
const PROFILE_ENV: &str = "ZEFORGE_PROFILE";

/// Default kernel module shipped next to the binary
pub const DEFAULT_KERNEL_PATH: &str = "kernels.spv";

/// Flags passed to the Level Zero module compiler
pub const DEFAULT_BUILD_FLAGS: &str = "-ze-opt-level 2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Every stage on the host thread pool
    #[default]
    Cpu,
    /// Host stages plus the classifier projection on a Level Zero device
    LevelZero,
}

impl FromStr for BackendKind {
    type Err = ZeForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" | "host" => Ok(BackendKind::Cpu),
            "level-zero" | "levelzero" | "ze" | "gpu" => Ok(BackendKind::LevelZero),
            other => Err(ZeForgeError::InvalidConfiguration(format!(
                "unknown backend '{}' (expected cpu or level-zero)",
                other
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::LevelZero => write!(f, "level-zero"),
        }
    }
}

/// Encoding of the precompiled kernel module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleFormat {
    /// SPIR-V IL, compiled by the driver at load time
    #[default]
    Spirv,
    /// Device-specific native binary
    Native,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub backend: BackendKind,
    /// Use the std::simd kernels when compiled in and supported by the CPU
    pub vector_kernels: bool,
    /// CPU worker threads; `None` lets rayon pick
    pub num_threads: Option<usize>,
    pub kernel_path: PathBuf,
    pub module_format: ModuleFormat,
    pub build_flags: String,
    /// Index into the devices of the first driver
    pub device_index: usize,
    /// Record kernel timestamps for every launch
    pub profile: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Cpu,
            vector_kernels: cfg!(feature = "simd")
                && crate::backend::cpu::CpuFeatures::get().supports_vector_kernels(),
            num_threads: None,
            kernel_path: PathBuf::from(DEFAULT_KERNEL_PATH),
            module_format: ModuleFormat::Spirv,
            build_flags: DEFAULT_BUILD_FLAGS.to_string(),
            device_index: 0,
            profile: false,
        }
    }
}

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn level_zero(kernel_path: impl Into<PathBuf>) -> Self {
        Self::default()
            .with_backend(BackendKind::LevelZero)
            .with_kernel_path(kernel_path)
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_vector_kernels(mut self, enabled: bool) -> Self {
        self.vector_kernels = enabled;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Also picks the module format from the extension (`.spv` is SPIR-V,
    /// anything else is treated as a native binary).
    pub fn with_kernel_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel_path = path.into();
        self.module_format = match self.kernel_path.extension().and_then(|e| e.to_str()) {
            Some("spv") | None => ModuleFormat::Spirv,
            Some(_) => ModuleFormat::Native,
        };
        self
    }

    pub fn with_module_format(mut self, format: ModuleFormat) -> Self {
        self.module_format = format;
        self
    }

    pub fn with_build_flags(mut self, flags: impl Into<String>) -> Self {
        self.build_flags = flags.into();
        self
    }

    pub fn with_device_index(mut self, index: usize) -> Self {
        self.device_index = index;
        self
    }

    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profile = enabled;
        self
    }

    /// Defaults overridden by any `ZEFORGE_*` variables that are set
    pub fn from_env() -> ForgeResult<Self> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> ForgeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            ZeForgeError::InvalidConfiguration(format!("{}: {}", path.display(), e))
        })
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> ForgeResult<Self> {
        if let Some(backend) = lookup(BACKEND_ENV) {
            self.backend = backend.parse()?;
        }
        if let Some(path) = lookup(KERNEL_PATH_ENV) {
            self = self.with_kernel_path(path);
        }
        if let Some(index) = lookup(DEVICE_INDEX_ENV) {
            self.device_index = parse_env(DEVICE_INDEX_ENV, &index)?;
        }
        if let Some(flag) = lookup(VECTOR_KERNELS_ENV) {
            self.vector_kernels = parse_bool(VECTOR_KERNELS_ENV, &flag)?;
        }
        if let Some(threads) = lookup(THREADS_ENV) {
            self.num_threads = Some(parse_env(THREADS_ENV, &threads)?);
        }
        if let Some(flag) = lookup(PROFILE_ENV) {
            self.profile = parse_bool(PROFILE_ENV, &flag)?;
        }
        Ok(self)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> ForgeResult<T> {
    value.trim().parse().map_err(|_| {
        ZeForgeError::InvalidConfiguration(format!("{}={} is not a valid number", key, value))
    })
}

fn parse_bool(key: &str, value: &str) -> ForgeResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ZeForgeError::InvalidConfiguration(format!(
            "{}={} is not a boolean",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.backend, BackendKind::Cpu);
        assert_eq!(config.kernel_path, PathBuf::from("kernels.spv"));
        assert_eq!(config.module_format, ModuleFormat::Spirv);
        assert_eq!(config.build_flags, "-ze-opt-level 2");
        assert_eq!(config.device_index, 0);
        assert!(!config.profile);
    }

    #[test]
    fn test_builder() {
        let config = BackendConfig::level_zero("/opt/kernels/matmul.bin")
            .with_device_index(1)
            .with_num_threads(4)
            .with_profiling(true);
        assert_eq!(config.backend, BackendKind::LevelZero);
        assert_eq!(config.module_format, ModuleFormat::Native);
        assert_eq!(config.num_threads, Some(4));
        assert!(config.profile);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("CPU".parse::<BackendKind>().unwrap(), BackendKind::Cpu);
        assert_eq!("level-zero".parse::<BackendKind>().unwrap(), BackendKind::LevelZero);
        assert_eq!("gpu".parse::<BackendKind>().unwrap(), BackendKind::LevelZero);
        assert!("cuda".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_apply_env_overrides() {
        let config = BackendConfig::default()
            .apply_env(env(&[
                ("ZEFORGE_BACKEND", "level-zero"),
                ("ZEFORGE_KERNEL_PATH", "k.spv"),
                ("ZEFORGE_DEVICE_INDEX", "2"),
                ("ZEFORGE_VECTOR_KERNELS", "off"),
                ("ZEFORGE_THREADS", "3"),
                ("ZEFORGE_PROFILE", "1"),
            ]))
            .unwrap();
        assert_eq!(config.backend, BackendKind::LevelZero);
        assert_eq!(config.kernel_path, PathBuf::from("k.spv"));
        assert_eq!(config.device_index, 2);
        assert!(!config.vector_kernels);
        assert_eq!(config.num_threads, Some(3));
        assert!(config.profile);
    }

    #[test]
    fn test_apply_env_rejects_garbage() {
        let err = BackendConfig::default()
            .apply_env(env(&[("ZEFORGE_THREADS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("ZEFORGE_THREADS"));

        let err = BackendConfig::default()
            .apply_env(env(&[("ZEFORGE_PROFILE", "maybe")]))
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_json_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.json");
        std::fs::write(&path, r#"{ "backend": "level-zero", "device_index": 1 }"#).unwrap();
        let config = BackendConfig::from_json_file(&path).unwrap();
        assert_eq!(config.backend, BackendKind::LevelZero);
        assert_eq!(config.device_index, 1);
        assert_eq!(config.build_flags, DEFAULT_BUILD_FLAGS);
    }
}
