/// Multi-run aggregation.
///
/// Each input log becomes one [`RunResult`] that owns its series and its
/// lazily built tables. Runs share nothing, so a failed run (unreadable
/// file, inconsistent tables) never affects the others.
use crate::config::ExtractConfig;
use crate::engine::{ExtractError, Extraction, Extractor};
use crate::reconcile;
use crate::registry::Category;
use crate::table::{self, ReconciledTable, TableError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One log file to process, with an optional legend label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSource {
    pub path: PathBuf,
    pub label: Option<String>,
}

impl RunSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    /// Bound to the shared, already compiled registry of an [`Extractor`].
    /// Compilation happens once, before any run exists.
    PatternsCompiled,
    Scanned,
    /// The source could not be read; terminal.
    ScanFailed,
    TablesBuilt,
    /// At least one category table failed; raw series stay available.
    TableBuildFailed,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Idle, RunState::PatternsCompiled)
                | (RunState::PatternsCompiled, RunState::Scanned)
                | (RunState::PatternsCompiled, RunState::ScanFailed)
                | (RunState::Scanned, RunState::TablesBuilt)
                | (RunState::Scanned, RunState::TableBuildFailed)
        )
    }
}

/// Per-category table outcomes of a run.
#[derive(Debug, Clone)]
pub struct RunTables {
    pub train: Result<ReconciledTable, TableError>,
    pub eval: Result<ReconciledTable, TableError>,
}

impl RunTables {
    pub fn get(&self, category: Category) -> Result<&ReconciledTable, &TableError> {
        match category {
            Category::Train => self.train.as_ref(),
            Category::Eval => self.eval.as_ref(),
        }
    }
}

/// Everything known about one processed log.
#[derive(Debug)]
pub struct RunResult {
    source: RunSource,
    state: RunState,
    scan: Option<Result<Extraction, ExtractError>>,
    tables: Option<RunTables>,
}

impl RunResult {
    fn new(source: RunSource) -> Self {
        Self {
            source,
            state: RunState::Idle,
            scan: None,
            tables: None,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid run transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(
            path = %self.source.path.display(),
            from = ?self.state,
            to = ?next,
            "run state"
        );
        self.state = next;
    }

    /// Bind a run to the compiled registry of `extractor`.
    fn prepared(extractor: &Extractor, source: RunSource) -> Self {
        let mut run = Self::new(source);
        debug!(
            path = %run.source.path.display(),
            patterns = extractor.registry().len(),
            "run bound to compiled registry"
        );
        run.transition(RunState::PatternsCompiled);
        run
    }

    /// Scan `source` with `extractor`, closing the file before returning.
    pub fn scan(extractor: &Extractor, source: RunSource) -> Self {
        let mut run = Self::prepared(extractor, source);
        match extractor.extract_file(&run.source.path) {
            Ok(extraction) => {
                info!(
                    path = %run.source.path.display(),
                    lines = extraction.lines,
                    "scanned log"
                );
                run.scan = Some(Ok(extraction));
                run.transition(RunState::Scanned);
            }
            Err(e) => {
                error!(error = %e, "run aborted");
                run.scan = Some(Err(e));
                run.transition(RunState::ScanFailed);
            }
        }
        run
    }

    pub fn source(&self) -> &RunSource {
        &self.source
    }

    pub fn path(&self) -> &Path {
        &self.source.path
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Raw series, available whenever the scan succeeded.
    pub fn extraction(&self) -> Option<&Extraction> {
        self.scan.as_ref().and_then(|r| r.as_ref().ok())
    }

    pub fn scan_error(&self) -> Option<&ExtractError> {
        self.scan.as_ref().and_then(|r| r.as_ref().err())
    }

    pub fn tables(&self) -> Option<&RunTables> {
        self.tables.as_ref()
    }

    /// Reconciled table for `category`, if built successfully.
    pub fn table(&self, category: Category) -> Option<&ReconciledTable> {
        self.tables.as_ref().and_then(|t| t.get(category).ok())
    }

    /// Build (once) and return this run's tables.
    ///
    /// Returns `None` when the scan failed. A failure in one category
    /// leaves the other category's table intact.
    pub fn build_tables(&mut self, cfg: &ExtractConfig) -> Option<&RunTables> {
        if self.tables.is_some() {
            return self.tables.as_ref();
        }
        let extraction = self.extraction()?;

        let train = table::build_table(Category::Train, &extraction.train, cfg);
        let eval = table::build_table(Category::Eval, &extraction.eval, cfg);

        if let (Ok(t), Ok(e)) = (&train, &eval) {
            if let Some(&last) = t.iterations.last() {
                let keyed = extraction
                    .train
                    .get(table::ITERATION_METRIC)
                    .is_some_and(|s| !s.is_empty());
                if keyed {
                    reconcile::check_eval_calibration(
                        e.rows(),
                        last,
                        cfg.eval_start_iter,
                        cfg.eval_interval,
                    );
                }
            }
        }

        for (category, result) in [(Category::Train, &train), (Category::Eval, &eval)] {
            if let Err(e) = result {
                warn!(
                    path = %self.source.path.display(),
                    category = %category,
                    error = %e,
                    "no table for run"
                );
            }
        }

        let next = if train.is_ok() && eval.is_ok() {
            RunState::TablesBuilt
        } else {
            RunState::TableBuildFailed
        };
        self.tables = Some(RunTables { train, eval });
        self.transition(next);
        self.tables.as_ref()
    }

    /// Legend label for this run on a chart of `metric`.
    ///
    /// The explicit label wins; otherwise multi-run charts use the file
    /// stem and single-run charts use the metric name.
    pub fn legend_label(&self, metric: &str, multi_run: bool) -> String {
        if let Some(label) = &self.source.label {
            return label.clone();
        }
        if multi_run {
            if let Some(stem) = self.source.path.file_stem() {
                return stem.to_string_lossy().into_owned();
            }
        }
        metric.to_string()
    }

    fn aborted(extractor: &Extractor, source: RunSource, reason: String) -> Self {
        let mut run = Self::prepared(extractor, source);
        run.scan = Some(Err(ExtractError::Aborted {
            path: run.source.path.clone(),
            reason,
        }));
        run.transition(RunState::ScanFailed);
        run
    }
}

/// Runs the extractor over several logs.
#[derive(Debug, Clone)]
pub struct Aggregator {
    extractor: Arc<Extractor>,
}

impl Aggregator {
    pub fn new(extractor: Extractor) -> Self {
        Self {
            extractor: Arc::new(extractor),
        }
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Scan every source one after another, in input order.
    pub fn run_all(&self, sources: Vec<RunSource>) -> Vec<RunResult> {
        sources
            .into_iter()
            .map(|source| RunResult::scan(&self.extractor, source))
            .collect()
    }

    /// Scan every source on its own blocking worker. Results keep input
    /// order.
    pub async fn run_all_concurrent(&self, sources: Vec<RunSource>) -> Vec<RunResult> {
        let handles: Vec<_> = sources
            .into_iter()
            .map(|source| {
                let extractor = Arc::clone(&self.extractor);
                let fallback = source.clone();
                let handle =
                    tokio::task::spawn_blocking(move || RunResult::scan(&extractor, source));
                (fallback, handle)
            })
            .collect();

        let mut runs = Vec::with_capacity(handles.len());
        for (source, handle) in handles {
            match handle.await {
                Ok(run) => runs.push(run),
                Err(e) => {
                    error!(path = %source.path.display(), error = %e, "scan worker failed");
                    runs.push(RunResult::aborted(&self.extractor, source, e.to_string()));
                }
            }
        }
        runs
    }
}

/// Union of numeric metric names with a built table in `category`,
/// in first-seen order across runs.
pub fn visualized_metrics(runs: &[RunResult], category: Category) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for run in runs {
        let Some(table) = run.table(category) else {
            continue;
        };
        if table.is_empty() {
            continue;
        }
        for name in table.column_names() {
            if table.points(name).is_some() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// Each run's (iteration, value) points for `metric`, skipping runs
/// without that column.
pub fn metric_across_runs<'a>(
    runs: &'a [RunResult],
    category: Category,
    metric: &str,
) -> Vec<(&'a RunResult, Vec<(i64, f64)>)> {
    runs.iter()
        .filter_map(|run| {
            let points = run.table(category)?.points(metric)?;
            Some((run, points))
        })
        .collect()
}
