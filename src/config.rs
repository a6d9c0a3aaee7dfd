use crate::preprocess::{LinePreprocessor, DEFAULT_ESCAPE_PATTERN};
use crate::registry::{PatternRegistry, RegistryError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from trainlog.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TrainlogConfig {
    pub extract: ExtractConfig,
    pub chart: ChartConfig,
    pub metrics: Vec<MetricRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// First iteration number present in the log.
    pub start_iter: i64,
    /// Iteration of the first eval event.
    pub eval_start_iter: i64,
    /// Iterations between evals.
    pub eval_interval: i64,
    /// Regex removed from every line before matching; empty disables it.
    pub color_escape_pattern: String,
    pub include_default_metrics: bool,
    /// Scan runs on worker tasks instead of one after another.
    pub parallel: bool,
    pub debug: bool,
    pub print: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Svg,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Svg => "svg",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    /// Saving is enabled when set; charts go into a timestamped subdirectory.
    pub output_dir: Option<PathBuf>,
    /// Preview charts in the terminal.
    pub show: bool,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub start_y_at: Option<f64>,
    pub x_label: String,
    pub y_label: String,
    pub mark_iteration: Option<i64>,
    /// Fraction of the x range within which a regular tick label would
    /// collide with the marker label.
    pub mark_overlap_threshold: f64,
}

/// A user-defined metric extractor.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricRule {
    pub category: String,
    pub name: String,
    pub pattern: String,
    #[serde(rename = "type", default = "default_rule_type")]
    pub value_type: String,
}

fn default_rule_type() -> String {
    "string".to_string()
}

// --- Default implementations ---

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            start_iter: 0,
            eval_start_iter: -1,
            eval_interval: 5,
            color_escape_pattern: DEFAULT_ESCAPE_PATTERN.to_string(),
            include_default_metrics: true,
            parallel: false,
            debug: false,
            print: false,
        }
    }
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            show: false,
            format: ImageFormat::Png,
            width: 1024,
            height: 768,
            start_y_at: None,
            x_label: "iteration number".to_string(),
            y_label: "values".to_string(),
            mark_iteration: None,
            mark_overlap_threshold: 0.03,
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
    EscapePattern {
        pattern: String,
        source: regex::Error,
    },
    Registry(RegistryError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
            ConfigError::EscapePattern { pattern, source } => {
                write!(f, "invalid color_escape_pattern '{pattern}': {source}")
            }
            ConfigError::Registry(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::EscapePattern { source, .. } => Some(source),
            ConfigError::Registry(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<RegistryError> for ConfigError {
    fn from(e: RegistryError) -> Self {
        ConfigError::Registry(e)
    }
}

/// Load config from `path`.
///
/// A missing file yields defaults only when `required` is false, i.e. the
/// path was not named explicitly by the user.
pub fn load_config(path: &Path, required: bool) -> Result<TrainlogConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(TrainlogConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl TrainlogConfig {
    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extract.eval_interval <= 0 {
            return Err(ConfigError::Invalid(format!(
                "eval_interval must be positive, got {}",
                self.extract.eval_interval
            )));
        }
        if self.chart.width == 0 || self.chart.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "chart size must be non-zero, got {}x{}",
                self.chart.width, self.chart.height
            )));
        }
        if !(0.0..1.0).contains(&self.chart.mark_overlap_threshold) {
            return Err(ConfigError::Invalid(format!(
                "mark_overlap_threshold must be in [0, 1), got {}",
                self.chart.mark_overlap_threshold
            )));
        }
        Ok(())
    }

    /// Compile the default and user-defined metrics into a registry.
    pub fn build_registry(&self) -> Result<PatternRegistry, ConfigError> {
        let mut registry = if self.extract.include_default_metrics {
            PatternRegistry::with_defaults()?
        } else {
            PatternRegistry::new()
        };
        for rule in &self.metrics {
            registry.register_named(&rule.category, &rule.name, &rule.pattern, &rule.value_type)?;
        }
        if registry.is_empty() {
            return Err(ConfigError::Invalid(
                "no metrics registered: enable include_default_metrics or add [[metrics]] entries"
                    .to_string(),
            ));
        }
        Ok(registry)
    }

    pub fn build_preprocessor(&self) -> Result<LinePreprocessor, ConfigError> {
        LinePreprocessor::new(&self.extract.color_escape_pattern).map_err(|e| {
            ConfigError::EscapePattern {
                pattern: self.extract.color_escape_pattern.clone(),
                source: e,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Category;

    #[test]
    fn defaults_match_reference_settings() {
        let cfg = TrainlogConfig::default();
        assert_eq!(cfg.extract.start_iter, 0);
        assert_eq!(cfg.extract.eval_start_iter, -1);
        assert_eq!(cfg.extract.eval_interval, 5);
        assert!(!cfg.extract.debug);
        assert!(!cfg.extract.print);
        assert!(cfg.chart.output_dir.is_none());
        assert_eq!(cfg.chart.format, ImageFormat::Png);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_optional_file_gives_defaults() {
        let cfg = load_config(Path::new("/nonexistent/trainlog.toml"), false).unwrap();
        assert_eq!(cfg.extract.eval_interval, 5);
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let err = load_config(Path::new("/nonexistent/trainlog.toml"), true).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn parses_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainlog.toml");
        std::fs::write(
            &path,
            r#"
[extract]
eval_start_iter = 0
eval_interval = 10

[chart]
format = "svg"
mark_iteration = 40

[[metrics]]
category = "train"
name = "loss"
pattern = '^# Loss: (.*)$'
type = "float"

[[metrics]]
category = "eval"
name = "phase"
pattern = '^# Phase: (.*)$'
"#,
        )
        .unwrap();

        let cfg = load_config(&path, true).unwrap();
        assert_eq!(cfg.extract.eval_start_iter, 0);
        assert_eq!(cfg.extract.eval_interval, 10);
        assert_eq!(cfg.extract.start_iter, 0);
        assert_eq!(cfg.chart.format, ImageFormat::Svg);
        assert_eq!(cfg.chart.mark_iteration, Some(40));
        assert_eq!(cfg.metrics.len(), 2);
        assert_eq!(cfg.metrics[1].value_type, "string");

        let registry = cfg.build_registry().unwrap();
        assert_eq!(registry.len(), 9);
        assert!(registry.get(Category::Train, "loss").is_some());
        assert!(registry.get(Category::Eval, "phase").is_some());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainlog.toml");
        std::fs::write(&path, "[extract\neval_interval = 5").unwrap();
        let err = load_config(&path, true).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn non_positive_interval_is_invalid() {
        let mut cfg = TrainlogConfig::default();
        cfg.extract.eval_interval = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_of_default_metric_is_rejected() {
        let cfg = TrainlogConfig {
            metrics: vec![MetricRule {
                category: "train".into(),
                name: "env_steps".into(),
                pattern: r"^steps=(\d+)$".into(),
                value_type: "int".into(),
            }],
            ..Default::default()
        };
        let err = cfg.build_registry().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Registry(RegistryError::DuplicateMetric { .. })
        ));
    }

    #[test]
    fn defaults_can_be_replaced() {
        let mut cfg = TrainlogConfig::default();
        cfg.extract.include_default_metrics = false;
        assert!(matches!(cfg.build_registry(), Err(ConfigError::Invalid(_))));

        cfg.metrics.push(MetricRule {
            category: "train".into(),
            name: "loss".into(),
            pattern: r"^loss=(.*)$".into(),
            value_type: "float".into(),
        });
        let registry = cfg.build_registry().unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bad_escape_pattern_is_reported() {
        let mut cfg = TrainlogConfig::default();
        cfg.extract.color_escape_pattern = "[".into();
        assert!(matches!(
            cfg.build_preprocessor(),
            Err(ConfigError::EscapePattern { .. })
        ));
        cfg.extract.color_escape_pattern = String::new();
        assert!(cfg.build_preprocessor().is_ok());
    }
}
