/// Console output: raw series dumps and JSON table export.
use crate::aggregate::{RunResult, RunTables};
use crate::registry::Category;
use crate::table::{ReconciledTable, TableError};
use serde_json::{json, Value};
use std::io::Write;

/// Echo every extracted series of `run`, one metric per block.
pub fn print_series<W: Write>(out: &mut W, run: &RunResult) -> std::io::Result<()> {
    match &run.source().label {
        Some(label) => writeln!(out, "== {} ({label})", run.path().display())?,
        None => writeln!(out, "== {}", run.path().display())?,
    }

    let Some(extraction) = run.extraction() else {
        if let Some(e) = run.scan_error() {
            writeln!(out, "  error: {e}")?;
        }
        return Ok(());
    };

    for category in Category::ALL {
        for series in extraction.category(category).iter() {
            let values: Vec<String> = series.values.iter().map(|v| v.to_string()).collect();
            writeln!(out, "{}", series.name)?;
            writeln!(out, " [{}]", values.join(", "))?;
        }
    }
    if extraction.degraded > 0 {
        writeln!(
            out,
            "  {} value(s) could not be converted to their declared type",
            extraction.degraded
        )?;
    }
    Ok(())
}

fn table_json(result: Result<&ReconciledTable, &TableError>) -> Value {
    match result {
        Ok(table) => {
            let mut columns = serde_json::Map::new();
            for column in &table.columns {
                columns.insert(column.name.clone(), json!(column.values));
            }
            json!({
                "rows": table.rows(),
                "iteration": table.iterations,
                "columns": columns,
            })
        }
        Err(e) => json!({ "error": e.to_string() }),
    }
}

fn tables_json(tables: &RunTables) -> Value {
    json!({
        "train": table_json(tables.get(Category::Train)),
        "eval": table_json(tables.get(Category::Eval)),
    })
}

/// JSON document describing each run's state and reconciled tables.
///
/// A failed table is reported as `{"error": ...}`, distinct from an empty
/// table with zero rows.
pub fn runs_json(runs: &[RunResult]) -> Value {
    let entries: Vec<Value> = runs
        .iter()
        .map(|run| {
            let mut entry = json!({
                "source": run.path().display().to_string(),
                "label": run.source().label,
                "state": run.state(),
            });
            if let Some(e) = run.scan_error() {
                entry["error"] = json!(e.to_string());
            }
            if let Some(tables) = run.tables() {
                entry["tables"] = tables_json(tables);
            }
            entry
        })
        .collect();
    Value::Array(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Aggregator, RunSource};
    use crate::config::ExtractConfig;
    use crate::engine::tests::{default_extractor, eval_block, iteration_block};

    fn runs(dir: &tempfile::TempDir, logs: &[(&str, String)]) -> Vec<RunResult> {
        let sources = logs
            .iter()
            .map(|(name, contents)| {
                let path = dir.path().join(name);
                std::fs::write(&path, contents).unwrap();
                RunSource::new(path)
            })
            .collect();
        let cfg = ExtractConfig {
            eval_start_iter: 0,
            ..Default::default()
        };
        let mut runs = Aggregator::new(default_extractor()).run_all(sources);
        for run in &mut runs {
            run.build_tables(&cfg);
        }
        runs
    }

    #[test]
    fn print_series_lists_each_metric() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = iteration_block(0, 100, 10, 0.5, 1.5);
        log.push_str(&eval_block(2.0, 42.0));
        let runs = runs(&dir, &[("a.log", log)]);

        let mut out = Vec::new();
        print_series(&mut out, &runs[0]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("env_steps\n [100]\n"));
        assert!(text.contains("train_time\n [1.5]\n"));
        assert!(text.contains("eval_avg_return\n [42]\n"));
    }

    #[test]
    fn print_series_reports_scan_error() {
        let mut all = Aggregator::new(default_extractor())
            .run_all(vec![RunSource::new("/nonexistent/x.log").with_label("x")]);
        let mut out = Vec::new();
        print_series(&mut out, &all.remove(0)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("== /nonexistent/x.log (x)"));
        assert!(text.contains("error: cannot open log file"));
    }

    #[test]
    fn json_reports_empty_and_partial_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut partial = iteration_block(0, 100, 10, 0.5, 1.5);
        partial.push_str("# Eval time: [1.0]s\n");
        let runs = runs(
            &dir,
            &[
                ("train_only.log", iteration_block(0, 100, 10, 0.5, 1.5)),
                ("partial.log", partial),
            ],
        );
        let doc = runs_json(&runs);

        let first = &doc[0];
        assert_eq!(first["state"], "tables_built");
        assert_eq!(first["tables"]["train"]["rows"], 1);
        assert_eq!(first["tables"]["train"]["iteration"], json!([0]));
        assert_eq!(first["tables"]["train"]["columns"]["env_steps"], json!([100]));
        assert_eq!(first["tables"]["eval"]["rows"], 0);

        let second = &doc[1];
        assert_eq!(second["state"], "table_build_failed");
        assert_eq!(second["tables"]["train"]["rows"], 1);
        assert!(second["tables"]["eval"]["error"]
            .as_str()
            .unwrap()
            .contains("eval_avg_return=0"));
    }

    #[test]
    fn json_reports_table_errors() {
        let dir = tempfile::tempdir().unwrap();
        let log = "# Eval time: [1.0]s\n# Eval time: [2.0]s\n# Eval average return: 3\n";
        let runs = runs(&dir, &[("bad.log", log.to_string())]);
        let doc = runs_json(&runs);
        assert_eq!(doc[0]["state"], "table_build_failed");
        assert!(doc[0]["tables"]["eval"]["error"]
            .as_str()
            .unwrap()
            .contains("unequal sample counts"));
        assert_eq!(doc[0]["tables"]["train"]["rows"], 0);
    }
}
