/// Pattern registry: named metric extractors grouped by category.
///
/// The registry is an ordinary value handed to the extractor. Metrics are
/// kept in registration order so every line is scanned against patterns
/// in a deterministic order.
use crate::coerce::ValueType;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use tracing::warn;

/// Train or eval grouping of related metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Train,
    Eval,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Train, Category::Eval];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "train" => Some(Category::Train),
            "eval" => Some(Category::Eval),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Train => "train",
            Category::Eval => "eval",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named extractor. Immutable once registered.
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    name: String,
    pattern: Regex,
    value_type: ValueType,
}

impl MetricDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Return the text of the first capture group if the line matches.
    ///
    /// A group that exists but did not take part in the match counts as
    /// no match.
    pub fn capture<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.pattern
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

/// Errors raised while building a registry. Always fatal to setup.
#[derive(Debug)]
pub enum RegistryError {
    DuplicateMetric {
        category: Category,
        name: String,
    },
    InvalidPattern {
        name: String,
        source: regex::Error,
    },
    MissingCaptureGroup {
        name: String,
        pattern: String,
    },
    UnknownValueType {
        name: String,
        type_name: String,
    },
    UnknownCategory {
        name: String,
        category: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateMetric { category, name } => {
                write!(f, "metric '{name}' is already registered for {category}")
            }
            RegistryError::InvalidPattern { name, source } => {
                write!(f, "invalid pattern for metric '{name}': {source}")
            }
            RegistryError::MissingCaptureGroup { name, pattern } => {
                write!(
                    f,
                    "pattern for metric '{name}' has no capture group: {pattern}"
                )
            }
            RegistryError::UnknownValueType { name, type_name } => {
                write!(
                    f,
                    "metric '{name}' has unknown type '{type_name}' (expected int, float, str or string)"
                )
            }
            RegistryError::UnknownCategory { name, category } => {
                write!(
                    f,
                    "metric '{name}' has unknown category '{category}' (expected train or eval)"
                )
            }
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::InvalidPattern { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Reference extraction contract for the default console log format.
pub const DEFAULT_METRICS: &[(Category, &str, &str, ValueType)] = &[
    (Category::Train, "iteration", r"^# Iteration:    (.*)$", ValueType::Int),
    (Category::Train, "env_steps", r"^# Env\. Steps:   (.*)$", ValueType::Int),
    (Category::Train, "train_steps", r"^# Train Steps:  (.*)$", ValueType::Int),
    (
        Category::Train,
        "collect_time",
        r"^# Collect time: \[(.*)\]s$",
        ValueType::Float,
    ),
    (
        Category::Train,
        "train_time",
        r"^# Train time:   \[(.*)\]s$",
        ValueType::Float,
    ),
    (
        Category::Eval,
        "eval_time",
        r"^# Eval time: \[(.*)\]s$",
        ValueType::Float,
    ),
    (
        Category::Eval,
        "eval_avg_return",
        r"^# Eval average return: (.*)$",
        ValueType::Float,
    ),
];

/// Ordered train and eval metric definitions.
#[derive(Debug, Clone, Default)]
pub struct PatternRegistry {
    train: Vec<MetricDefinition>,
    eval: Vec<MetricDefinition>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with [`DEFAULT_METRICS`].
    pub fn with_defaults() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for (category, name, pattern, value_type) in DEFAULT_METRICS {
            registry.register(*category, name, pattern, *value_type)?;
        }
        Ok(registry)
    }

    /// Compile `pattern` and register it under `name` in `category`.
    ///
    /// Fails on a duplicate name within the category, a pattern that does
    /// not compile, or a pattern without any capture group. With more than
    /// one group the first one is used.
    pub fn register(
        &mut self,
        category: Category,
        name: &str,
        pattern: &str,
        value_type: ValueType,
    ) -> Result<(), RegistryError> {
        if self.get(category, name).is_some() {
            return Err(RegistryError::DuplicateMetric {
                category,
                name: name.to_string(),
            });
        }

        let regex = Regex::new(pattern).map_err(|e| RegistryError::InvalidPattern {
            name: name.to_string(),
            source: e,
        })?;

        // captures_len counts the implicit whole-match group.
        match regex.captures_len() - 1 {
            0 => {
                return Err(RegistryError::MissingCaptureGroup {
                    name: name.to_string(),
                    pattern: pattern.to_string(),
                })
            }
            1 => {}
            groups => warn!(
                metric = name,
                groups, "pattern has more than one capture group, using the first"
            ),
        }

        self.definitions_mut(category).push(MetricDefinition {
            name: name.to_string(),
            pattern: regex,
            value_type,
        });
        Ok(())
    }

    /// Like [`register`](Self::register) but with category and type given
    /// by name, as they appear in config files.
    pub fn register_named(
        &mut self,
        category: &str,
        name: &str,
        pattern: &str,
        type_name: &str,
    ) -> Result<(), RegistryError> {
        let cat = Category::from_name(category).ok_or_else(|| RegistryError::UnknownCategory {
            name: name.to_string(),
            category: category.to_string(),
        })?;
        let value_type =
            ValueType::from_name(type_name).ok_or_else(|| RegistryError::UnknownValueType {
                name: name.to_string(),
                type_name: type_name.to_string(),
            })?;
        self.register(cat, name, pattern, value_type)
    }

    /// Definitions for `category`, in registration order.
    pub fn patterns_for(&self, category: Category) -> &[MetricDefinition] {
        match category {
            Category::Train => &self.train,
            Category::Eval => &self.eval,
        }
    }

    pub fn get(&self, category: Category, name: &str) -> Option<&MetricDefinition> {
        self.patterns_for(category).iter().find(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.eval.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn definitions_mut(&mut self, category: Category) -> &mut Vec<MetricDefinition> {
        match category {
            Category::Train => &mut self.train,
            Category::Eval => &mut self.eval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_register_in_order() {
        let registry = PatternRegistry::with_defaults().unwrap();
        let train: Vec<_> = registry
            .patterns_for(Category::Train)
            .iter()
            .map(|d| d.name())
            .collect();
        assert_eq!(
            train,
            vec![
                "iteration",
                "env_steps",
                "train_steps",
                "collect_time",
                "train_time"
            ]
        );
        let eval: Vec<_> = registry
            .patterns_for(Category::Eval)
            .iter()
            .map(|d| d.name())
            .collect();
        assert_eq!(eval, vec!["eval_time", "eval_avg_return"]);
        assert_eq!(registry.len(), 7);
    }

    #[test]
    fn duplicate_name_in_same_category_is_rejected() {
        let mut registry = PatternRegistry::new();
        registry
            .register(Category::Train, "loss", r"^loss: (.*)$", ValueType::Float)
            .unwrap();
        let err = registry
            .register(Category::Train, "loss", r"^Loss=(.*)$", ValueType::Float)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateMetric { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_name_in_other_category_is_allowed() {
        let mut registry = PatternRegistry::new();
        registry
            .register(Category::Train, "loss", r"^loss: (.*)$", ValueType::Float)
            .unwrap();
        registry
            .register(Category::Eval, "loss", r"^eval loss: (.*)$", ValueType::Float)
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn malformed_pattern_is_rejected() {
        let mut registry = PatternRegistry::new();
        let err = registry
            .register(Category::Train, "bad", r"^loss: ((.*)$", ValueType::Float)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPattern { .. }));
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn pattern_without_group_is_rejected() {
        let mut registry = PatternRegistry::new();
        let err = registry
            .register(Category::Eval, "flag", r"^done$", ValueType::String)
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingCaptureGroup { .. }));
    }

    #[test]
    fn first_group_wins_with_many_groups() {
        let mut registry = PatternRegistry::new();
        registry
            .register(
                Category::Train,
                "pair",
                r"^(\d+)/(\d+)$",
                ValueType::Int,
            )
            .unwrap();
        let def = registry.get(Category::Train, "pair").unwrap();
        assert_eq!(def.capture("3/10"), Some("3"));
    }

    #[test]
    fn non_participating_group_is_no_match() {
        let mut registry = PatternRegistry::new();
        registry
            .register(Category::Train, "opt", r"^step(?: (\d+))?$", ValueType::Int)
            .unwrap();
        let def = registry.get(Category::Train, "opt").unwrap();
        assert_eq!(def.capture("step"), None);
        assert_eq!(def.capture("step 4"), Some("4"));
    }

    #[test]
    fn register_named_resolves_category_and_type() {
        let mut registry = PatternRegistry::new();
        registry
            .register_named("eval", "success", r"^success: (.*)$", "float")
            .unwrap();
        let def = registry.get(Category::Eval, "success").unwrap();
        assert_eq!(def.value_type(), ValueType::Float);

        let err = registry
            .register_named("eval", "x", r"^x: (.*)$", "bool")
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownValueType { .. }));

        let err = registry
            .register_named("test", "y", r"^y: (.*)$", "int")
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownCategory { .. }));
    }

    #[test]
    fn default_patterns_match_reference_lines() {
        let registry = PatternRegistry::with_defaults().unwrap();
        let cases = [
            (Category::Train, "iteration", "# Iteration:    12", "12"),
            (Category::Train, "env_steps", "# Env. Steps:   4000", "4000"),
            (Category::Train, "train_steps", "# Train Steps:  250", "250"),
            (Category::Train, "collect_time", "# Collect time: [3.25]s", "3.25"),
            (Category::Train, "train_time", "# Train time:   [1.5]s", "1.5"),
            (Category::Eval, "eval_time", "# Eval time: [9.75]s", "9.75"),
            (
                Category::Eval,
                "eval_avg_return",
                "# Eval average return: -12.5",
                "-12.5",
            ),
        ];
        for (category, name, line, expected) in cases {
            let def = registry.get(category, name).unwrap();
            assert_eq!(def.capture(line), Some(expected), "{name}");
        }
    }

    #[test]
    fn default_patterns_are_anchored() {
        let registry = PatternRegistry::with_defaults().unwrap();
        let def = registry.get(Category::Train, "env_steps").unwrap();
        assert_eq!(def.capture("INFO # Env. Steps:   4000"), None);
    }
}
