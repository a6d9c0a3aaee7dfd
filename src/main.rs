mod aggregate;
mod coerce;
mod config;
mod engine;
mod preprocess;
mod reconcile;
mod registry;
mod render;
mod report;
mod table;

use aggregate::{Aggregator, RunResult, RunSource, RunState};
use clap::Parser;
use config::{ConfigError, ImageFormat, TrainlogConfig};
use engine::Extractor;
use registry::Category;
use render::{ChartRenderer, ChartRequest, ImageRenderer, TerminalRenderer};
use std::path::{Path, PathBuf};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "trainlog.toml";

/// Extract train and eval metrics from console training logs and chart
/// them, comparing several runs on one chart.
#[derive(Parser, Debug)]
#[command(name = "trainlog", version, about)]
pub struct Cli {
    /// Log file to read (repeatable; glob patterns are expanded)
    #[arg(short, long = "file", value_name = "FILE", required = true)]
    files: Vec<String>,

    /// Legend label for each file, in the same order as the files
    #[arg(short, long = "label", value_name = "LABEL")]
    labels: Vec<String>,

    /// Config file path [default: trainlog.toml if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// First iteration number present in the log (overrides config)
    #[arg(long, allow_negative_numbers = true)]
    start_iter: Option<i64>,

    /// Iteration of the first eval event (overrides config)
    #[arg(long, allow_negative_numbers = true)]
    eval_start_iter: Option<i64>,

    /// Iterations between evals (overrides config)
    #[arg(long)]
    eval_interval: Option<i64>,

    /// Verbose match/no-match diagnostics
    #[arg(short, long)]
    debug: bool,

    /// Print the extracted series to stdout
    #[arg(short, long)]
    print: bool,

    /// Print the reconciled tables as JSON
    #[arg(long)]
    json: bool,

    /// Save one chart per metric into a timestamped subdirectory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Preview charts in the terminal
    #[arg(long)]
    show: bool,

    /// Image format for saved charts
    #[arg(long, value_enum)]
    format: Option<ImageFormat>,

    /// Highlight this iteration on every chart
    #[arg(long, allow_negative_numbers = true)]
    mark_iteration: Option<i64>,

    /// Lower end of the y axis
    #[arg(long, allow_negative_numbers = true)]
    start_y_at: Option<f64>,

    /// Scan log files concurrently
    #[arg(long)]
    parallel: bool,

    /// Validate config and patterns, print the registry, don't scan
    #[arg(long)]
    dry_run: bool,
}

/// Load the config file and apply CLI overrides on top.
fn resolve_config(cli: &Cli) -> Result<TrainlogConfig, ConfigError> {
    let (path, required) = match &cli.config {
        Some(p) => (p.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let mut cfg = config::load_config(&path, required)?;

    let extract = &mut cfg.extract;
    if let Some(v) = cli.start_iter {
        extract.start_iter = v;
    }
    if let Some(v) = cli.eval_start_iter {
        extract.eval_start_iter = v;
    }
    if let Some(v) = cli.eval_interval {
        extract.eval_interval = v;
    }
    extract.debug |= cli.debug;
    extract.print |= cli.print;
    extract.parallel |= cli.parallel;

    let chart = &mut cfg.chart;
    if let Some(dir) = &cli.output_dir {
        chart.output_dir = Some(dir.clone());
    }
    chart.show |= cli.show;
    if let Some(format) = cli.format {
        chart.format = format;
    }
    if let Some(mark) = cli.mark_iteration {
        chart.mark_iteration = Some(mark);
    }
    if let Some(y) = cli.start_y_at {
        chart.start_y_at = Some(y);
    }

    cfg.validate()?;
    Ok(cfg)
}

/// `RUST_LOG` (or `trainlog=info`), with `trainlog=debug` layered on top
/// when debug output was requested.
fn tracing_filter(debug: bool) -> EnvFilter {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trainlog=info"));
    if !debug {
        return filter;
    }
    match "trainlog=debug".parse::<Directive>() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

fn init_tracing(debug: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_filter(debug))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Expand glob patterns and pair the resulting files with labels.
///
/// A pattern matching nothing is kept as a literal path so the missing
/// file is reported by its run.
fn expand_sources(files: &[String], labels: &[String]) -> Vec<RunSource> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for pattern in files {
        let matched: Vec<PathBuf> = match glob::glob(pattern) {
            Ok(entries) => entries.filter_map(Result::ok).collect(),
            Err(e) => {
                tracing::debug!(pattern = %pattern, error = %e, "not a glob pattern");
                Vec::new()
            }
        };
        if matched.is_empty() {
            paths.push(PathBuf::from(pattern));
        } else {
            paths.extend(matched);
        }
    }

    if labels.len() > paths.len() {
        tracing::warn!(
            labels = labels.len(),
            files = paths.len(),
            "more labels than files, extra labels ignored"
        );
    }

    paths
        .into_iter()
        .enumerate()
        .map(|(i, path)| {
            let source = RunSource::new(path);
            match labels.get(i) {
                Some(label) => source.with_label(label.clone()),
                None => source,
            }
        })
        .collect()
}

fn print_registry(extractor: &Extractor, cfg: &TrainlogConfig) {
    println!("trainlog v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "start_iter={} eval_start_iter={} eval_interval={}",
        cfg.extract.start_iter, cfg.extract.eval_start_iter, cfg.extract.eval_interval
    );
    println!("{:<6} {:<20} {:<7} PATTERN", "GROUP", "METRIC", "TYPE");
    println!("{}", "-".repeat(72));
    for category in Category::ALL {
        for def in extractor.registry().patterns_for(category) {
            println!(
                "{:<6} {:<20} {:<7} {}",
                category.as_str(),
                def.name(),
                def.value_type().as_str(),
                def.pattern().as_str()
            );
        }
    }
}

/// Draw one chart per visualized metric, every run as its own line.
fn render_charts(runs: &[RunResult], cfg: &TrainlogConfig, renderers: &mut [Box<dyn ChartRenderer>]) {
    let multi_run = runs.len() > 1;
    for category in Category::ALL {
        for metric in aggregate::visualized_metrics(runs, category) {
            let mut request = ChartRequest::new(&metric, category, &cfg.chart);
            for (run, points) in aggregate::metric_across_runs(runs, category, &metric) {
                request.add_line(run.legend_label(&metric, multi_run), points);
            }
            if !request.has_points() {
                continue;
            }
            for renderer in renderers.iter_mut() {
                if let Err(e) = renderer.render(&request) {
                    tracing::warn!(metric = %metric, error = %e, "chart not rendered");
                }
            }
        }
    }
}

fn build_renderers(cfg: &TrainlogConfig, text_output: bool) -> Vec<Box<dyn ChartRenderer>> {
    let mut renderers: Vec<Box<dyn ChartRenderer>> = Vec::new();
    if let Some(dir) = &cfg.chart.output_dir {
        renderers.push(Box::new(ImageRenderer::new(dir, &cfg.chart)));
    }
    // Preview by default when nothing else would be produced.
    if cfg.chart.show || (renderers.is_empty() && !text_output) {
        renderers.push(Box::new(TerminalRenderer::new(std::io::stdout(), 60)));
    }
    renderers
}

fn exit_with(e: &dyn std::fmt::Display, path: Option<&Path>) -> ! {
    match path {
        Some(p) => eprintln!("Error ({}): {e}", p.display()),
        None => eprintln!("Error: {e}"),
    }
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match resolve_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => exit_with(&e, cli.config.as_deref()),
    };

    init_tracing(cfg.extract.debug);
    tracing::debug!(?cli, "parsed CLI arguments");

    let registry = match cfg.build_registry() {
        Ok(r) => r,
        Err(e) => exit_with(&e, cli.config.as_deref()),
    };
    let preprocessor = match cfg.build_preprocessor() {
        Ok(p) => p,
        Err(e) => exit_with(&e, cli.config.as_deref()),
    };
    let aggregator = Aggregator::new(Extractor::new(registry, preprocessor));

    if cli.dry_run {
        print_registry(aggregator.extractor(), &cfg);
        println!("Dry run: config validated, no files scanned.");
        return;
    }

    let sources = expand_sources(&cli.files, &cli.labels);
    let mut runs = if cfg.extract.parallel {
        aggregator.run_all_concurrent(sources).await
    } else {
        aggregator.run_all(sources)
    };

    for run in &mut runs {
        run.build_tables(&cfg.extract);
    }

    if cfg.extract.print {
        let mut stdout = std::io::stdout().lock();
        for run in &runs {
            if let Err(e) = report::print_series(&mut stdout, run) {
                tracing::error!(error = %e, "failed to write series");
            }
        }
    }
    if cli.json {
        match serde_json::to_string_pretty(&report::runs_json(&runs)) {
            Ok(s) => println!("{s}"),
            Err(e) => tracing::error!(error = %e, "failed to encode tables"),
        }
    }

    let mut renderers = build_renderers(&cfg, cfg.extract.print || cli.json);
    render_charts(&runs, &cfg, &mut renderers);

    let failed = runs
        .iter()
        .filter(|r| r.state() == RunState::ScanFailed)
        .count();
    if failed > 0 {
        eprintln!("{failed} of {} log file(s) could not be read", runs.len());
        if failed == runs.len() {
            std::process::exit(1);
        }
    }
}
