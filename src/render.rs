//! Chart rendering.
//!
//! Renderers know nothing about logs: they receive a [`ChartRequest`] with
//! finished (iteration, value) lines and either draw it to an image file
//! via plotters or preview it in the terminal. All per-chart state lives
//! in the request, so one chart is fully finished before the next starts.

use crate::config::{ChartConfig, ImageFormat};
use crate::registry::Category;
use plotters::coord::Shift;
use plotters::prelude::*;
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

/// One line on a chart.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartLine {
    pub label: String,
    pub points: Vec<(i64, f64)>,
}

/// Everything needed to draw one metric's chart.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRequest {
    pub metric: String,
    pub category: Category,
    pub lines: Vec<ChartLine>,
    pub x_label: String,
    pub y_label: String,
    pub start_y_at: Option<f64>,
    pub mark_iteration: Option<i64>,
}

impl ChartRequest {
    pub fn new(metric: impl Into<String>, category: Category, cfg: &ChartConfig) -> Self {
        Self {
            metric: metric.into(),
            category,
            lines: Vec::new(),
            x_label: cfg.x_label.clone(),
            y_label: cfg.y_label.clone(),
            start_y_at: cfg.start_y_at,
            mark_iteration: cfg.mark_iteration,
        }
    }

    pub fn add_line(&mut self, label: impl Into<String>, points: Vec<(i64, f64)>) {
        self.lines.push(ChartLine {
            label: label.into(),
            points,
        });
    }

    pub fn has_points(&self) -> bool {
        self.lines.iter().any(|l| !l.points.is_empty())
    }
}

#[derive(Debug)]
pub enum RenderError {
    NoData {
        metric: String,
    },
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Draw {
        path: PathBuf,
        message: String,
    },
    Io(std::io::Error),
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::NoData { metric } => write!(f, "no data points for metric '{metric}'"),
            RenderError::CreateDir { path, source } => {
                write!(
                    f,
                    "failed to create output directory {}: {source}",
                    path.display()
                )
            }
            RenderError::Draw { path, message } => {
                write!(f, "failed to draw chart {}: {message}", path.display())
            }
            RenderError::Io(e) => write!(f, "I/O error while rendering: {e}"),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::CreateDir { source, .. } => Some(source),
            RenderError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RenderError {
    fn from(e: std::io::Error) -> Self {
        RenderError::Io(e)
    }
}

/// Presents or saves charts, strictly one at a time.
pub trait ChartRenderer {
    fn render(&mut self, request: &ChartRequest) -> Result<(), RenderError>;
}

/// Axis bounds for a chart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x: (f64, f64),
    pub y: (f64, f64),
}

/// Compute axis ranges covering every point (and the marker).
///
/// Degenerate ranges are widened so plotters always gets a non-empty
/// interval; the y range gets a 5% margin unless `start_y_at` pins its
/// lower end.
pub fn compute_bounds(request: &ChartRequest) -> Option<Bounds> {
    let mut pts = request.lines.iter().flat_map(|l| l.points.iter());
    let &(x0, y0) = pts.next()?;
    let (mut x_lo, mut x_hi, mut y_lo, mut y_hi) = (x0 as f64, x0 as f64, y0, y0);
    for &(x, y) in pts {
        x_lo = x_lo.min(x as f64);
        x_hi = x_hi.max(x as f64);
        if y.is_finite() {
            y_lo = y_lo.min(y);
            y_hi = y_hi.max(y);
        }
    }
    if let Some(mark) = request.mark_iteration {
        x_lo = x_lo.min(mark as f64);
        x_hi = x_hi.max(mark as f64);
    }
    if x_hi <= x_lo {
        x_lo -= 1.0;
        x_hi += 1.0;
    }

    if !y_lo.is_finite() || !y_hi.is_finite() {
        y_lo = 0.0;
        y_hi = 1.0;
    }
    let margin = if y_hi > y_lo {
        (y_hi - y_lo) * 0.05
    } else {
        y_lo.abs().max(1.0) * 0.5
    };
    y_hi += margin;
    y_lo = match request.start_y_at {
        Some(start) => start.min(y_hi - margin),
        None => y_lo - margin,
    };
    if y_hi <= y_lo {
        y_hi = y_lo + 1.0;
    }

    Some(Bounds {
        x: (x_lo, x_hi),
        y: (y_lo, y_hi),
    })
}

/// Evenly spaced tick positions on "nice" values (1, 2, 5 × 10^k).
pub fn axis_ticks(lo: f64, hi: f64, max_ticks: usize) -> Vec<f64> {
    if hi <= lo || max_ticks < 2 {
        return vec![lo];
    }
    let raw_step = (hi - lo) / (max_ticks - 1) as f64;
    let magnitude = 10f64.powf(raw_step.log10().floor());
    let step = [1.0, 2.0, 5.0, 10.0]
        .iter()
        .map(|m| m * magnitude)
        .find(|s| *s >= raw_step)
        .unwrap_or(10.0 * magnitude);
    let first = (lo / step).ceil() * step;
    let mut ticks = Vec::new();
    let mut t = first;
    while t <= hi + step * 1e-9 {
        ticks.push(t);
        t += step;
    }
    ticks
}

/// Whether the marker label would collide with a regular tick label.
///
/// Collision means a tick (other than one at the marker itself) lies
/// within `threshold` of the x range from the marker.
pub fn marker_needs_rotation(mark: f64, ticks: &[f64], x_range: (f64, f64), threshold: f64) -> bool {
    let span = x_range.1 - x_range.0;
    if span <= 0.0 {
        return false;
    }
    ticks.iter().any(|&t| {
        let distance = (t - mark).abs() / span;
        distance > 1e-9 && distance < threshold
    })
}

const X_TICKS: usize = 10;

fn draw_chart<DB>(
    root: DrawingArea<DB, Shift>,
    request: &ChartRequest,
    bounds: Bounds,
    overlap_threshold: f64,
) -> Result<(), Box<dyn std::error::Error>>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(&request.metric, ("sans-serif", 28).into_font())
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(bounds.x.0..bounds.x.1, bounds.y.0..bounds.y.1)?;

    chart
        .configure_mesh()
        .x_labels(X_TICKS)
        .x_label_formatter(&|x| format!("{x:.0}"))
        .x_desc(request.x_label.as_str())
        .y_desc(request.y_label.as_str())
        .draw()?;

    for (idx, line) in request.lines.iter().enumerate() {
        let style = Palette99::pick(idx).mix(0.9).stroke_width(2);
        chart
            .draw_series(LineSeries::new(
                line.points.iter().map(|&(x, y)| (x as f64, y)),
                style,
            ))?
            .label(line.label.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], style));
    }

    if let Some(mark) = request.mark_iteration {
        let mark = mark as f64;
        chart.draw_series(std::iter::once(PathElement::new(
            vec![(mark, bounds.y.0), (mark, bounds.y.1)],
            RED.stroke_width(1),
        )))?;

        let ticks = axis_ticks(bounds.x.0, bounds.x.1, X_TICKS);
        let rotate = marker_needs_rotation(mark, &ticks, bounds.x, overlap_threshold);
        let font = ("sans-serif", 14).into_font();
        let font = if rotate {
            font.transform(FontTransform::Rotate90)
        } else {
            font
        };
        let (px, py) = chart.backend_coord(&(mark, bounds.y.0));
        root.draw(&Text::new(
            format!("{mark:.0}"),
            (px + 2, py + 22),
            font.color(&RED),
        ))?;
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}

/// File name for a metric's chart; path separators are replaced.
pub fn chart_file_name(metric: &str, format: ImageFormat) -> String {
    let stem: String = metric
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    format!("{stem}.{}", format.extension())
}

/// Pick a file name not yet used in this run directory.
///
/// The plain metric name comes first. A metric sharing its name with one
/// already written (e.g. `loss` in both train and eval) is prefixed with
/// its category, then numbered if that is taken too.
fn unique_file_name(used: &mut HashSet<String>, request: &ChartRequest, format: ImageFormat) -> String {
    let plain = chart_file_name(&request.metric, format);
    let prefixed = chart_file_name(&format!("{}_{}", request.category, request.metric), format);
    let mut name = plain;
    if used.contains(&name) {
        name = prefixed;
    }
    let mut n = 2;
    while used.contains(&name) {
        name = chart_file_name(
            &format!("{}_{}_{n}", request.category, request.metric),
            format,
        );
        n += 1;
    }
    used.insert(name.clone());
    name
}

/// Saves one image per metric into `<output_dir>/<timestamp>/`.
///
/// The timestamped directory is created on the first save only.
pub struct ImageRenderer {
    output_dir: PathBuf,
    stamp: String,
    run_dir: Option<PathBuf>,
    written: HashSet<String>,
    format: ImageFormat,
    size: (u32, u32),
    overlap_threshold: f64,
}

impl ImageRenderer {
    pub fn new(output_dir: impl Into<PathBuf>, cfg: &ChartConfig) -> Self {
        Self {
            output_dir: output_dir.into(),
            stamp: chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string(),
            run_dir: None,
            written: HashSet::new(),
            format: cfg.format,
            size: (cfg.width, cfg.height),
            overlap_threshold: cfg.mark_overlap_threshold,
        }
    }

    /// Directory charts are written to, once it exists.
    #[cfg(test)]
    pub fn run_dir(&self) -> Option<&std::path::Path> {
        self.run_dir.as_deref()
    }

    fn ensure_run_dir(&mut self) -> Result<PathBuf, RenderError> {
        if let Some(dir) = &self.run_dir {
            return Ok(dir.clone());
        }
        let dir = self.output_dir.join(&self.stamp);
        std::fs::create_dir_all(&dir).map_err(|e| RenderError::CreateDir {
            path: dir.clone(),
            source: e,
        })?;
        tracing::info!(dir = %dir.display(), "created chart output directory");
        self.run_dir = Some(dir.clone());
        Ok(dir)
    }
}

impl ChartRenderer for ImageRenderer {
    fn render(&mut self, request: &ChartRequest) -> Result<(), RenderError> {
        let bounds = compute_bounds(request).ok_or_else(|| RenderError::NoData {
            metric: request.metric.clone(),
        })?;
        let dir = self.ensure_run_dir()?;
        let path = dir.join(unique_file_name(&mut self.written, request, self.format));

        let drawn = match self.format {
            ImageFormat::Png => draw_chart(
                BitMapBackend::new(&path, self.size).into_drawing_area(),
                request,
                bounds,
                self.overlap_threshold,
            ),
            ImageFormat::Svg => draw_chart(
                SVGBackend::new(&path, self.size).into_drawing_area(),
                request,
                bounds,
                self.overlap_threshold,
            ),
        };
        drawn.map_err(|e| RenderError::Draw {
            path: path.clone(),
            message: e.to_string(),
        })?;

        tracing::info!(metric = %request.metric, path = %path.display(), "saved chart");
        Ok(())
    }
}

const SPARK_CHARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Render values as a fixed-width sparkline scaled to `lo..hi`.
pub fn sparkline(values: &[f64], width: usize, lo: f64, hi: f64) -> String {
    if values.is_empty() {
        return " ".repeat(width);
    }
    let range = (hi - lo).max(f64::EPSILON);
    (0..width.min(values.len()).max(1))
        .map(|i| {
            let idx = if values.len() <= width {
                i
            } else {
                i * values.len() / width
            };
            let norm = ((values[idx] - lo) / range).clamp(0.0, 1.0);
            SPARK_CHARS[((norm * 7.0).round() as usize).min(7)]
        })
        .collect()
}

/// Terminal preview: one sparkline per line with first/last values.
pub struct TerminalRenderer<W: Write> {
    out: W,
    width: usize,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W, width: usize) -> Self {
        Self {
            out,
            width: width.max(1),
        }
    }
}

impl<W: Write> ChartRenderer for TerminalRenderer<W> {
    fn render(&mut self, request: &ChartRequest) -> Result<(), RenderError> {
        let bounds = compute_bounds(request).ok_or_else(|| RenderError::NoData {
            metric: request.metric.clone(),
        })?;
        writeln!(
            self.out,
            "{} [{}]  {} {:.0}..{:.0}  {} {:.4}..{:.4}",
            request.metric,
            request.category,
            request.x_label,
            bounds.x.0,
            bounds.x.1,
            request.y_label,
            bounds.y.0,
            bounds.y.1
        )?;
        let label_width = request
            .lines
            .iter()
            .map(|l| l.label.chars().count())
            .max()
            .unwrap_or(0);
        for line in &request.lines {
            let ys: Vec<f64> = line.points.iter().map(|&(_, y)| y).collect();
            let (first, last) = match (ys.first(), ys.last()) {
                (Some(f), Some(l)) => (format!("{f}"), format!("{l}")),
                _ => ("-".to_string(), "-".to_string()),
            };
            writeln!(
                self.out,
                "  {:<label_width$}  [{}] {} -> {} ({} points)",
                line.label,
                sparkline(&ys, self.width, bounds.y.0, bounds.y.1),
                first,
                last,
                ys.len()
            )?;
        }
        if let Some(mark) = request.mark_iteration {
            writeln!(self.out, "  marked iteration: {mark}")?;
        }
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(lines: Vec<(&str, Vec<(i64, f64)>)>) -> ChartRequest {
        let mut req = ChartRequest::new("env_steps", Category::Train, &ChartConfig::default());
        for (label, points) in lines {
            req.add_line(label, points);
        }
        req
    }

    #[test]
    fn bounds_cover_all_lines() {
        let req = request(vec![
            ("a", vec![(0, 1.0), (10, 5.0)]),
            ("b", vec![(-1, 3.0), (4, 9.0)]),
        ]);
        let b = compute_bounds(&req).unwrap();
        assert_eq!(b.x, (-1.0, 10.0));
        assert!(b.y.0 < 1.0 && b.y.1 > 9.0);
    }

    #[test]
    fn bounds_respect_start_y_and_marker() {
        let mut req = request(vec![("a", vec![(0, 10.0), (5, 20.0)])]);
        req.start_y_at = Some(0.0);
        req.mark_iteration = Some(40);
        let b = compute_bounds(&req).unwrap();
        assert_eq!(b.y.0, 0.0);
        assert_eq!(b.x, (0.0, 40.0));
    }

    #[test]
    fn single_point_gets_non_empty_ranges() {
        let req = request(vec![("a", vec![(0, 42.0)])]);
        let b = compute_bounds(&req).unwrap();
        assert!(b.x.1 > b.x.0);
        assert!(b.y.1 > b.y.0);
    }

    #[test]
    fn no_points_no_bounds() {
        assert!(compute_bounds(&request(vec![("a", vec![])])).is_none());
        assert!(compute_bounds(&request(vec![])).is_none());
    }

    #[test]
    fn nice_ticks() {
        assert_eq!(
            axis_ticks(0.0, 100.0, 11),
            vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0]
        );
        assert_eq!(axis_ticks(0.0, 9.0, 4), vec![0.0, 5.0]);
        assert_eq!(axis_ticks(3.0, 3.0, 10), vec![3.0]);
    }

    #[test]
    fn marker_rotation_only_when_close_to_a_tick() {
        let ticks = axis_ticks(0.0, 100.0, 11);
        // 41 is 1% of the range away from the 40 tick
        assert!(marker_needs_rotation(41.0, &ticks, (0.0, 100.0), 0.03));
        // exactly on a tick: the tick is the marker
        assert!(!marker_needs_rotation(40.0, &ticks, (0.0, 100.0), 0.03));
        // halfway between ticks
        assert!(!marker_needs_rotation(45.0, &ticks, (0.0, 100.0), 0.03));
    }

    #[test]
    fn chart_file_names() {
        assert_eq!(chart_file_name("env_steps", ImageFormat::Png), "env_steps.png");
        assert_eq!(chart_file_name("a/b", ImageFormat::Svg), "a_b.svg");
    }

    #[test]
    fn same_metric_in_both_categories_gets_distinct_files() {
        let cfg = ChartConfig::default();
        let mut used = HashSet::new();
        let train = ChartRequest::new("loss", Category::Train, &cfg);
        let eval = ChartRequest::new("loss", Category::Eval, &cfg);
        assert_eq!(unique_file_name(&mut used, &train, ImageFormat::Svg), "loss.svg");
        assert_eq!(unique_file_name(&mut used, &eval, ImageFormat::Svg), "eval_loss.svg");
        assert_eq!(unique_file_name(&mut used, &eval, ImageFormat::Svg), "eval_loss_2.svg");
        assert_eq!(used.len(), 3);
    }

    #[test]
    fn image_renderer_keeps_train_and_eval_charts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ChartConfig {
            format: ImageFormat::Svg,
            width: 320,
            height: 240,
            ..Default::default()
        };
        let mut renderer = ImageRenderer::new(dir.path(), &cfg);
        let mut drawn = true;
        for category in Category::ALL {
            let mut req = ChartRequest::new("loss", category, &cfg);
            req.add_line("loss", vec![(0, 1.0), (1, 0.5)]);
            drawn &= renderer.render(&req).is_ok();
        }
        assert_eq!(renderer.written.len(), 2);
        // Drawing needs system fonts; only check files when it succeeded.
        if drawn {
            let run_dir = renderer.run_dir().unwrap();
            assert!(run_dir.join("loss.svg").is_file());
            assert!(run_dir.join("eval_loss.svg").is_file());
        }
    }

    #[test]
    fn sparkline_scales_to_range() {
        assert_eq!(sparkline(&[0.0, 0.5, 1.0], 10, 0.0, 1.0), "▁▅█");
        assert_eq!(sparkline(&[], 3, 0.0, 1.0), "   ");
        assert_eq!(sparkline(&[1.0; 40], 20, 0.0, 1.0).chars().count(), 20);
    }

    #[test]
    fn terminal_renderer_writes_each_line() {
        let mut req = request(vec![
            ("baseline", vec![(0, 100.0), (1, 200.0)]),
            ("tuned", vec![(0, 150.0), (1, 300.0)]),
        ]);
        req.mark_iteration = Some(1);
        let mut buf = Vec::new();
        TerminalRenderer::new(&mut buf, 20).render(&req).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.starts_with("env_steps [train]"));
        assert!(out.contains("baseline"));
        assert!(out.contains("tuned"));
        assert!(out.contains("100 -> 200 (2 points)"));
        assert!(out.contains("marked iteration: 1"));
    }

    #[test]
    fn terminal_renderer_rejects_empty_chart() {
        let mut renderer = TerminalRenderer::new(Vec::new(), 20);
        let err = renderer.render(&request(vec![])).unwrap_err();
        assert!(matches!(err, RenderError::NoData { .. }));
    }

    #[test]
    fn image_renderer_creates_dir_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("plots");
        let cfg = ChartConfig {
            format: ImageFormat::Svg,
            width: 320,
            height: 240,
            ..Default::default()
        };
        let mut renderer = ImageRenderer::new(&root, &cfg);
        assert!(renderer.run_dir().is_none());

        // Nothing to draw: no directory either.
        assert!(renderer.render(&request(vec![])).is_err());
        assert!(!root.exists());

        let mut req = request(vec![("a", vec![(0, 1.0), (5, 2.0), (10, 1.5)])]);
        req.mark_iteration = Some(5);
        // Text layout needs system fonts, which a bare test host may lack;
        // the directory must exist either way.
        let drawn = renderer.render(&req);
        let run_dir = renderer.run_dir().unwrap().to_path_buf();
        assert!(run_dir.starts_with(&root));
        assert!(run_dir.is_dir());
        if drawn.is_ok() {
            assert!(run_dir.join("env_steps.svg").is_file());
        }
    }
}
