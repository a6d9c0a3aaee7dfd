/// Single-pass extraction engine.
///
/// Reads a log once and tests every registered pattern against every
/// cleaned line, in registration order. Hits are coerced to the metric's
/// declared type and appended to that metric's series. A line that matches
/// nothing is normal and only logged at debug level.
use crate::coerce::{self, Coercion, Value, ValueType};
use crate::preprocess::LinePreprocessor;
use crate::registry::{Category, MetricDefinition, PatternRegistry};
use serde::Serialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Ordered values for one metric within one category of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub name: String,
    pub value_type: ValueType,
    pub values: Vec<Value>,
}

impl Series {
    fn new(def: &MetricDefinition) -> Self {
        Self {
            name: def.name().to_string(),
            value_type: def.value_type(),
            values: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Series for every metric of a category, in registration order.
///
/// Metrics that never matched are present with an empty series.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct SeriesMap {
    series: Vec<Series>,
}

impl SeriesMap {
    fn for_definitions(defs: &[MetricDefinition]) -> Self {
        Self {
            series: defs.iter().map(Series::new).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Series> {
        self.series.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Series> {
        self.series.iter()
    }

    /// True when no metric in this category captured anything.
    pub fn has_no_values(&self) -> bool {
        self.series.iter().all(Series::is_empty)
    }
}

/// Train and eval series extracted from one log.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Extraction {
    pub train: SeriesMap,
    pub eval: SeriesMap,
    /// Number of lines read from the source.
    pub lines: usize,
    /// Captures whose text could not be converted to the declared type.
    pub degraded: usize,
}

impl Extraction {
    pub fn category(&self, category: Category) -> &SeriesMap {
        match category {
            Category::Train => &self.train,
            Category::Eval => &self.eval,
        }
    }

    fn category_mut(&mut self, category: Category) -> &mut SeriesMap {
        match category {
            Category::Train => &mut self.train,
            Category::Eval => &mut self.eval,
        }
    }
}

/// Outcome of testing one metric against one line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineMatch {
    NoMatch,
    Hit(Coercion),
}

/// Errors that abort the extraction of a single source.
#[derive(Debug)]
pub enum ExtractError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// `path` is `None` when reading from a stream rather than a file.
    Read {
        path: Option<PathBuf>,
        line: usize,
        source: std::io::Error,
    },
    /// The worker scanning this source stopped before finishing.
    Aborted { path: PathBuf, reason: String },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Open { path, source } => {
                write!(f, "cannot open log file {}: {source}", path.display())
            }
            ExtractError::Read {
                path: Some(path),
                line,
                source,
            } => write!(
                f,
                "failed reading log file {} at line {line}: {source}",
                path.display()
            ),
            ExtractError::Read {
                path: None,
                line,
                source,
            } => write!(f, "failed reading log input at line {line}: {source}"),
            ExtractError::Aborted { path, reason } => {
                write!(f, "scan of {} aborted: {reason}", path.display())
            }
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractError::Open { source, .. } => Some(source),
            ExtractError::Read { source, .. } => Some(source),
            ExtractError::Aborted { .. } => None,
        }
    }
}

/// Test one metric against an already cleaned line.
pub fn scan_metric(def: &MetricDefinition, line: &str) -> LineMatch {
    match def.capture(line) {
        Some(raw) => LineMatch::Hit(coerce::coerce(raw, def.value_type())),
        None => LineMatch::NoMatch,
    }
}

/// Owns a pattern registry and preprocessor and runs them over log text.
#[derive(Debug, Clone)]
pub struct Extractor {
    registry: PatternRegistry,
    preprocessor: LinePreprocessor,
}

impl Extractor {
    pub fn new(registry: PatternRegistry, preprocessor: LinePreprocessor) -> Self {
        Self {
            registry,
            preprocessor,
        }
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    /// Scan the file at `path`. The handle is closed before returning.
    pub fn extract_file(&self, path: &Path) -> Result<Extraction, ExtractError> {
        let file = std::fs::File::open(path).map_err(|e| ExtractError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        info!(path = %path.display(), "reading log file");
        self.scan_reader(std::io::BufReader::new(file), Some(path))
    }

    /// Scan every line of `reader`.
    ///
    /// Invalid UTF-8 is decoded lossily and a trailing `\r` is dropped so
    /// CRLF logs still satisfy `$`-anchored patterns. An I/O error carries
    /// the 1-based number of the line being read.
    pub fn extract<R: BufRead>(&self, reader: R) -> Result<Extraction, ExtractError> {
        self.scan_reader(reader, None)
    }

    fn scan_reader<R: BufRead>(
        &self,
        mut reader: R,
        path: Option<&Path>,
    ) -> Result<Extraction, ExtractError> {
        let mut out = Extraction {
            train: SeriesMap::for_definitions(self.registry.patterns_for(Category::Train)),
            eval: SeriesMap::for_definitions(self.registry.patterns_for(Category::Eval)),
            ..Default::default()
        };

        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| ExtractError::Read {
                    path: path.map(Path::to_path_buf),
                    line: out.lines + 1,
                    source: e,
                })?;
            if n == 0 {
                break;
            }
            out.lines += 1;

            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }
            let raw = String::from_utf8_lossy(&buf);
            let line = self.preprocessor.clean(&raw);
            self.scan_line(&line, out.lines, &mut out);
        }

        debug!(
            lines = out.lines,
            degraded = out.degraded,
            "extraction pass complete"
        );
        Ok(out)
    }

    fn scan_line(&self, line: &str, line_no: usize, out: &mut Extraction) {
        for category in Category::ALL {
            let defs = self.registry.patterns_for(category);
            for (idx, def) in defs.iter().enumerate() {
                match scan_metric(def, line) {
                    LineMatch::Hit(coercion) => {
                        if !coercion.ok() {
                            out.degraded += 1;
                        }
                        debug!(
                            category = %category,
                            metric = def.name(),
                            line = line_no,
                            "pattern matched"
                        );
                        // SeriesMap was built from the same definitions, so
                        // indices line up.
                        out.category_mut(category).series[idx]
                            .values
                            .push(coercion.into_value());
                    }
                    LineMatch::NoMatch => {
                        debug!(
                            category = %category,
                            metric = def.name(),
                            line = line_no,
                            "pattern did not match"
                        );
                    }
                }
            }
        }
    }
}
