/// Reconciled, row-aligned tables built from extracted series.
///
/// Row `i` of every column is the `i`-th value emitted for that metric.
/// That only means anything when all participating series in a category
/// have the same length, so a mismatch fails the build instead of
/// truncating or padding. Once any metric of a category has a value, a
/// metric that never matched counts as a zero-length series.
use crate::coerce::{Value, ValueType};
use crate::config::ExtractConfig;
use crate::engine::{Series, SeriesMap};
use crate::reconcile;
use crate::registry::Category;
use serde::Serialize;
use tracing::{debug, warn};

/// Train metric whose values, when present, key the train table.
pub const ITERATION_METRIC: &str = "iteration";

/// One metric's values inside a table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub value_type: ValueType,
    pub values: Vec<Value>,
}

/// Row-aligned view of one category of one run, keyed by iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledTable {
    pub category: Category,
    pub iterations: Vec<i64>,
    pub columns: Vec<Column>,
}

impl ReconciledTable {
    pub fn rows(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// (iteration, value) pairs for a numeric column.
    ///
    /// `None` for unknown or string-typed columns.
    pub fn points(&self, name: &str) -> Option<Vec<(i64, f64)>> {
        let column = self.column(name)?;
        if column.value_type == ValueType::String {
            return None;
        }
        column
            .values
            .iter()
            .zip(&self.iterations)
            .map(|(v, &it)| v.as_f64().map(|y| (it, y)))
            .collect()
    }
}

/// Why a table could not be built for a run/category.
#[derive(Debug, Clone, PartialEq)]
pub enum TableError {
    /// Train series have different lengths.
    LengthMismatch {
        category: Category,
        lengths: Vec<(String, usize)>,
    },
    /// Eval series have different lengths, so no iteration index exists.
    EvalCountMismatch { lengths: Vec<(String, usize)> },
    /// A value does not have the metric's declared type.
    TypeMismatch {
        category: Category,
        metric: String,
        row: usize,
        expected: ValueType,
        found: Value,
    },
    /// The configured schedule leaves the `i64` iteration range.
    IterationOverflow { category: Category, rows: usize },
}

fn format_lengths(lengths: &[(String, usize)]) -> String {
    lengths
        .iter()
        .map(|(name, len)| format!("{name}={len}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableError::LengthMismatch { category, lengths } => write!(
                f,
                "{category} metrics have unequal lengths ({}); the log probably ends with an incomplete block",
                format_lengths(lengths)
            ),
            TableError::EvalCountMismatch { lengths } => write!(
                f,
                "eval metrics have unequal sample counts ({}), so no eval iteration index can be derived; \
                 the log may end inside an eval block or eval_start_iter/eval_interval may be miscalibrated",
                format_lengths(lengths)
            ),
            TableError::TypeMismatch {
                category,
                metric,
                row,
                expected,
                found,
            } => write!(
                f,
                "{category} metric '{metric}' row {row} holds {found} where {expected} was declared"
            ),
            TableError::IterationOverflow { category, rows } => write!(
                f,
                "{category} iteration numbers for {rows} rows overflow; check start_iter, eval_start_iter and eval_interval"
            ),
        }
    }
}

impl std::error::Error for TableError {}

/// Build the table for `category` from a run's series.
pub fn build_table(
    category: Category,
    series: &SeriesMap,
    cfg: &ExtractConfig,
) -> Result<ReconciledTable, TableError> {
    let participating: Vec<&Series> = if series.has_no_values() {
        debug!(category = %category, "no metric matched, table is empty");
        Vec::new()
    } else {
        series.iter().collect()
    };

    for s in &participating {
        check_types(category, s)?;
    }

    let rows = participating.first().map_or(0, |s| s.len());
    if participating.iter().any(|s| s.len() != rows) {
        let lengths = participating
            .iter()
            .map(|s| (s.name.clone(), s.len()))
            .collect();
        return Err(match category {
            Category::Train => TableError::LengthMismatch { category, lengths },
            Category::Eval => TableError::EvalCountMismatch { lengths },
        });
    }

    let mut columns: Vec<Column> = participating
        .into_iter()
        .map(|s| Column {
            name: s.name.clone(),
            value_type: s.value_type,
            values: s.values.clone(),
        })
        .collect();

    let iterations = match category {
        Category::Train => {
            let keyed = columns
                .iter()
                .position(|c| c.name == ITERATION_METRIC && c.value_type == ValueType::Int);
            match keyed {
                Some(pos) => {
                    let keys: Vec<i64> = columns
                        .remove(pos)
                        .values
                        .iter()
                        .filter_map(Value::as_i64)
                        .collect();
                    if let Some(w) = keys.windows(2).find(|w| w[1] <= w[0]) {
                        warn!(
                            previous = w[0],
                            next = w[1],
                            "train iteration column is not increasing"
                        );
                    }
                    keys
                }
                None => reconcile::sequential_iterations(rows, cfg.start_iter)
                    .ok_or(TableError::IterationOverflow { category, rows })?,
            }
        }
        Category::Eval => {
            reconcile::reconcile_eval_iterations(rows, cfg.eval_start_iter, cfg.eval_interval)
                .ok_or(TableError::IterationOverflow { category, rows })?
        }
    };

    Ok(ReconciledTable {
        category,
        iterations,
        columns,
    })
}

fn check_types(category: Category, series: &Series) -> Result<(), TableError> {
    match series
        .values
        .iter()
        .enumerate()
        .find(|(_, v)| v.value_type() != series.value_type)
    {
        Some((row, found)) => Err(TableError::TypeMismatch {
            category,
            metric: series.name.clone(),
            row,
            expected: series.value_type,
            found: found.clone(),
        }),
        None => Ok(()),
    }
}
