use anyhow::{Context, Result};
use faceless_core::models::{default_model_dir, DetectorSelection, ModelRegistry, RestorerModel, SwapperModel};
use faceless_core::{AnalyserOptions, RestorerOptions, SchedulerOptions, SwapperOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Engine configuration: an optional TOML file, then `FACELESS_*`
/// environment overrides, then command-line flags.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: Option<PathBuf>,
    pub analyser: AnalyserOptions,
    pub swapper: SwapperOptions,
    pub restorer: RestorerOptions,
    pub scheduler: SchedulerOptions,
}

impl Config {
    /// Load `path` (or `$FACELESS_CONFIG`) if given, then apply the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("FACELESS_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                let config: Config =
                    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
                tracing::debug!(path = %path.display(), "loaded config file");
                config
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("FACELESS_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(dir));
        }
        self.scheduler.workers = env_usize("FACELESS_WORKERS", self.scheduler.workers);
        self.analyser.detector = env_parse::<DetectorSelection>("FACELESS_DETECTOR", self.analyser.detector);
        self.swapper.model = env_parse::<SwapperModel>("FACELESS_SWAPPER_MODEL", self.swapper.model);
        self.restorer.model = env_parse::<RestorerModel>("FACELESS_RESTORER_MODEL", self.restorer.model);
        self.analyser.detector_score = env_f32("FACELESS_DETECTOR_SCORE", self.analyser.detector_score);
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(default_model_dir)
    }

    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::new(self.model_dir())
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %value, "ignoring unrecognised value");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceless_core::mask::MaskKind;
    use faceless_core::FaceSelectionMode;

    #[test]
    fn test_defaults_without_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.restorer.blend, 80);
        assert_eq!(config.swapper.model, SwapperModel::Inswapper128);
        assert!(config.model_dir.is_none());
    }

    #[test]
    fn test_parse_full_file() {
        let text = r#"
            model_dir = "/opt/faceless/models"

            [analyser]
            detector = "many"
            detector_size = [320, 320]
            order = "large-small"
            gender = "male"

            [swapper]
            model = "uniface_256"
            selection = "reference"
            reference_face_distance = 0.5

            [swapper.mask]
            kinds = ["box", "occlusion"]
            regions = ["skin", "nose"]

            [swapper.mask.padding]
            top = 10.0

            [restorer]
            model = "codeformer"
            blend = 60

            [scheduler]
            workers = 8
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.model_dir(), PathBuf::from("/opt/faceless/models"));
        assert_eq!(config.analyser.detector, DetectorSelection::Many);
        assert_eq!(config.analyser.detector_size, (320, 320));
        assert!((config.analyser.nms_threshold - 0.4).abs() < 1e-6);
        assert_eq!(config.swapper.model, SwapperModel::Uniface256);
        assert_eq!(config.swapper.selection, FaceSelectionMode::Reference);
        assert!(config.swapper.mask.wants(MaskKind::Occlusion));
        assert_eq!(config.swapper.mask.regions.len(), 2);
        assert!((config.swapper.mask.padding.top - 10.0).abs() < 1e-6);
        assert_eq!(config.restorer.model, RestorerModel::Codeformer);
        assert_eq!(config.restorer.blend, 60);
        assert_eq!(config.scheduler.workers, 8);
        assert_eq!(config.scheduler.queue_per_worker, 1);
    }

    #[test]
    fn test_unknown_model_name_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[swapper]\nmodel = \"nope\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_parse_falls_back() {
        assert_eq!(env_parse("FACELESS_TEST_UNSET_KEY", SwapperModel::Simswap256), SwapperModel::Simswap256);
        assert_eq!(env_usize("FACELESS_TEST_UNSET_KEY", 3), 3);
    }
}
