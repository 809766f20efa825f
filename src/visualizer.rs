use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::prelude::*;
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, Gauge, GraphType, Paragraph, Wrap};
use std::io::{self, IsTerminal, Stdout};
use std::sync::Mutex;
use std::time::{Duration, Instant};

static VISUALIZER: Mutex<Option<SamplingVisualizer>> = Mutex::new(None);

const REDRAW_INTERVAL: Duration = Duration::from_millis(40);

/// Keeps the terminal dashboard alive; restores the terminal when dropped.
pub struct VisualizerGuard {
    active: bool,
}

impl Drop for VisualizerGuard {
    fn drop(&mut self) {
        if self.active {
            teardown();
        }
    }
}

impl VisualizerGuard {
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Starts the dashboard when `enabled` and stdout is a terminal. The
/// returned guard is inactive otherwise.
pub fn init_guard(enabled: bool, title: &str, total_iterations: usize) -> VisualizerGuard {
    let active = enabled && init(title, total_iterations);
    VisualizerGuard { active }
}

struct SamplingVisualizer {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    title: String,
    history_alpha: Vec<(f64, f64)>,
    history_metric_this: Vec<(f64, f64)>,
    history_metric_mean: Vec<(f64, f64)>,
    metric_name: String,
    start_time: Instant,
    current_iter: usize,
    total_iter: usize,
    current_alpha: f64,
    current_w0: f64,
    kept_so_far: usize,
    last_draw: Instant,
    messages: Vec<String>,
}

impl SamplingVisualizer {
    fn new(title: &str, total_iter: usize) -> io::Result<Self> {
        if !io::stdout().is_terminal() {
            return Err(io::Error::other("stdout is not a terminal"));
        }

        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;

        Ok(Self {
            terminal,
            title: title.to_string(),
            history_alpha: Vec::new(),
            history_metric_this: Vec::new(),
            history_metric_mean: Vec::new(),
            metric_name: String::new(),
            start_time: Instant::now(),
            current_iter: 0,
            total_iter,
            current_alpha: f64::NAN,
            current_w0: f64::NAN,
            kept_so_far: 0,
            last_draw: Instant::now() - REDRAW_INTERVAL,
            messages: Vec::new(),
        })
    }

    fn redraw_if_due(&mut self) {
        if self.last_draw.elapsed() >= REDRAW_INTERVAL {
            let _ = self.draw();
            self.last_draw = Instant::now();
        }
    }

    fn draw(&mut self) -> io::Result<()> {
        let alpha_data = self.history_alpha.clone();
        let this_data = self.history_metric_this.clone();
        let mean_data = self.history_metric_mean.clone();
        let metric_name = self.metric_name.clone();
        let title = self.title.clone();
        let iter = self.current_iter;
        let total = self.total_iter.max(1);
        let alpha = self.current_alpha;
        let w0 = self.current_w0;
        let kept = self.kept_so_far;
        let elapsed = self.start_time.elapsed().as_secs();
        let messages = self.messages.clone();

        self.terminal.draw(|f| {
            let rows = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(3),
                    Constraint::Percentage(65),
                    Constraint::Min(6),
                ])
                .split(f.area());
            let charts = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
                .split(rows[1]);

            let ratio = (iter as f64 / total as f64).clamp(0.0, 1.0);
            let gauge = Gauge::default()
                .block(Block::default().title(title).borders(Borders::ALL))
                .gauge_style(Style::default().fg(Color::Cyan))
                .ratio(ratio)
                .label(format!("{iter}/{total} iterations, {elapsed}s"));
            f.render_widget(gauge, rows[0]);

            let x_max = (iter as f64).max(10.0);
            let (a_lo, a_hi) = bounds(&alpha_data);
            let alpha_chart = Chart::new(vec![
                Dataset::default()
                    .name("alpha")
                    .marker(symbols::Marker::Braille)
                    .graph_type(GraphType::Line)
                    .style(Style::default().fg(Color::Cyan))
                    .data(&alpha_data),
            ])
            .block(
                Block::default()
                    .title("Noise precision")
                    .borders(Borders::ALL),
            )
            .x_axis(
                Axis::default()
                    .title("Iteration")
                    .bounds([0.0, x_max])
                    .labels(vec![Line::from("0"), Line::from(format!("{x_max:.0}"))]),
            )
            .y_axis(
                Axis::default()
                    .bounds([a_lo, a_hi])
                    .labels(vec![
                        Line::from(format!("{a_lo:.2}")),
                        Line::from(format!("{a_hi:.2}")),
                    ]),
            );
            f.render_widget(alpha_chart, charts[0]);

            let (m_lo, m_hi) = bounds_of(this_data.iter().chain(mean_data.iter()));
            let metric_title = if metric_name.is_empty() {
                "Held-out metric (no test set)".to_string()
            } else {
                format!("Held-out {metric_name}")
            };
            let metric_chart = Chart::new(vec![
                Dataset::default()
                    .name("this draw")
                    .marker(symbols::Marker::Dot)
                    .graph_type(GraphType::Scatter)
                    .style(Style::default().fg(Color::LightBlue))
                    .data(&this_data),
                Dataset::default()
                    .name("posterior mean")
                    .marker(symbols::Marker::Braille)
                    .graph_type(GraphType::Line)
                    .style(Style::default().fg(Color::Yellow))
                    .data(&mean_data),
            ])
            .block(Block::default().title(metric_title).borders(Borders::ALL))
            .x_axis(Axis::default().bounds([0.0, x_max]))
            .y_axis(
                Axis::default()
                    .bounds([m_lo, m_hi])
                    .labels(vec![
                        Line::from(format!("{m_lo:.3}")),
                        Line::from(format!("{m_hi:.3}")),
                    ]),
            );
            f.render_widget(metric_chart, charts[1]);

            let mut lines = vec![
                format!("alpha = {alpha:.4}   w0 = {w0:.4}   kept draws = {kept}"),
                String::new(),
            ];
            if messages.is_empty() {
                lines.push("(no held-out evaluations yet)".to_string());
            } else {
                lines.extend(messages.iter().cloned());
            }
            let status = Paragraph::new(lines.join("\n"))
                .block(Block::default().title("Status").borders(Borders::ALL))
                .style(Style::default().fg(Color::White))
                .wrap(Wrap { trim: true });
            f.render_widget(status, rows[2]);
        })?;
        Ok(())
    }
}

fn bounds(series: &[(f64, f64)]) -> (f64, f64) {
    bounds_of(series.iter())
}

fn bounds_of<'a>(series: impl Iterator<Item = &'a (f64, f64)>) -> (f64, f64) {
    let (lo, hi) = series.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, y)| {
        (lo.min(*y), hi.max(*y))
    });
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.1).max(1e-6);
    (lo - pad, hi + pad)
}

fn init(title: &str, total_iterations: usize) -> bool {
    let Ok(mut guard) = VISUALIZER.lock() else {
        return false;
    };
    install(&mut *guard, || SamplingVisualizer::new(title, total_iterations))
}

/// Fills an empty slot. An occupied slot belongs to another guard, so the
/// caller gets no ownership of it and must not tear it down.
fn install<T>(slot: &mut Option<T>, create: impl FnOnce() -> io::Result<T>) -> bool {
    if slot.is_some() {
        return false;
    }
    match create() {
        Ok(value) => {
            *slot = Some(value);
            true
        }
        Err(_) => false,
    }
}

/// Records the state after one sweep.
pub fn update_iteration(iteration: usize, alpha: f64, w0: f64, kept_so_far: usize) {
    let Ok(mut guard) = VISUALIZER.lock() else {
        return;
    };
    if let Some(vis) = guard.as_mut() {
        vis.current_iter = iteration + 1;
        vis.current_alpha = alpha;
        vis.current_w0 = w0;
        vis.kept_so_far = kept_so_far;
        if alpha.is_finite() {
            push_sample(&mut vis.history_alpha, (iteration as f64, alpha));
        }
        vis.redraw_if_due();
    }
}

/// Records a held-out evaluation. `mean_value` is absent until the first
/// kept draw has been seen.
pub fn update_metric(iteration: usize, name: &str, this_value: f64, mean_value: Option<f64>) {
    let Ok(mut guard) = VISUALIZER.lock() else {
        return;
    };
    if let Some(vis) = guard.as_mut() {
        vis.metric_name = name.to_string();
        if this_value.is_finite() {
            push_sample(&mut vis.history_metric_this, (iteration as f64, this_value));
        }
        let mut line = format!("iter {iteration}: {name}_this = {this_value:.4}");
        if let Some(mean) = mean_value {
            if mean.is_finite() {
                push_sample(&mut vis.history_metric_mean, (iteration as f64, mean));
            }
            line.push_str(&format!("  {name}_mean = {mean:.4}"));
        }
        push_message(&mut vis.messages, line);
        vis.redraw_if_due();
    }
}

fn teardown() {
    let Ok(mut guard) = VISUALIZER.lock() else {
        return;
    };
    if guard.take().is_some() {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
    }
}

fn push_message(messages: &mut Vec<String>, line: String) {
    const MAX_LINES: usize = 6;
    messages.push(line);
    if messages.len() > MAX_LINES {
        let overflow = messages.len() - MAX_LINES;
        messages.drain(0..overflow);
    }
}

fn push_sample(series: &mut Vec<(f64, f64)>, sample: (f64, f64)) {
    const MAX_POINTS: usize = 1200;
    series.push(sample);
    if series.len() > MAX_POINTS {
        let mut compacted = Vec::with_capacity(series.len() / 2 + 1);
        for (idx, point) in series.iter().enumerate() {
            if idx % 2 == 0 {
                compacted.push(*point);
            }
        }
        *series = compacted;
    }
}
