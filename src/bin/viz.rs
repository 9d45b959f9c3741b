/// pimflow live visualizer: attach to any running simulation at any time.
///
/// Run in a separate terminal:
///   cargo run --bin viz
///
/// Polls /tmp/pimflow_live.json every 200ms and renders a live TUI dashboard:
///
///   ┌ header: stage / mode / status / cycles ─────────────────────┐
///   │ Platform dispatch (one gauge per SA/PIM engine) │ Channels  │
///   │ Stage history (cycles per completed stage)                  │
///   │ q/esc: quit  …footer…                                       │
///
/// Press q or Esc to quit. The simulation keeps running unaffected.
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use pimflow::metrics::{read_metrics, LiveMetrics};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use std::{io, time::Duration};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let metrics = read_metrics();
        terminal.draw(|f| render(f, metrics.as_ref()))?;

        // Non-blocking: poll for 200ms, then redraw regardless
        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level layout
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, metrics: Option<&LiveMetrics>) {
    let area = f.area();

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(8),    // platforms + channels
            Constraint::Length(6), // stage history
            Constraint::Length(1), // footer
        ])
        .split(area);

    render_header(f, rows[0], metrics);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(rows[1]);

    render_platforms(f, cols[0], metrics);
    render_channels(f, cols[1], metrics);
    render_stage_history(f, rows[2], metrics);
    render_footer(f, rows[3]);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(Span::styled(
            " ⚡ pimflow live monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (stage, mode, status, cycles) = metrics
        .map(|m| (m.stage.as_str(), m.mode.as_str(), m.status.as_str(), m.cycles))
        .unwrap_or(("—", "—", "idle", 0));

    let status_color = match status {
        "running" => Color::Green,
        "complete" => Color::Cyan,
        _ => Color::DarkGray,
    };

    let spans = vec![
        Span::styled("  stage: ", Style::default().fg(Color::DarkGray)),
        Span::styled(stage, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::styled("   mode: ", Style::default().fg(Color::DarkGray)),
        Span::styled(mode, Style::default().fg(Color::Cyan)),
        Span::styled("   status: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.to_uppercase(),
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
        Span::styled("   cycle: ", Style::default().fg(Color::DarkGray)),
        Span::styled(format!("{cycles}"), Style::default().fg(Color::Yellow)),
    ];

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

// ---------------------------------------------------------------------------
// Platform dispatch panel
// ---------------------------------------------------------------------------

fn render_platforms(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Platform dispatch ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        let msg = Paragraph::new(vec![
            Line::raw(""),
            Line::from(Span::styled(
                "  No simulation running.",
                Style::default().fg(Color::DarkGray),
            )),
            Line::from(Span::styled(
                "  Start pimflow with --live to see live data.",
                Style::default().fg(Color::DarkGray),
            )),
        ]);
        f.render_widget(msg, inner);
        return;
    };

    // Three rows per platform: label, progress gauge, spacer.
    let constraints: Vec<Constraint> = m
        .platforms
        .iter()
        .flat_map(|_| [Constraint::Length(1), Constraint::Length(1), Constraint::Length(1)])
        .chain([Constraint::Min(0)])
        .collect();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(inner);

    for (i, p) in m.platforms.iter().enumerate() {
        let label = match &p.current_op {
            Some(op) => Line::from(vec![
                Span::styled(
                    format!("  {:<4}", p.name),
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                ),
                Span::styled(op.clone(), Style::default().fg(Color::White)),
                Span::styled(
                    format!("   queue: {}", p.queue_depth),
                    Style::default().fg(Color::DarkGray),
                ),
            ]),
            None => Line::from(vec![
                Span::styled(
                    format!("  {:<4}", p.name),
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                ),
                Span::styled("idle", Style::default().fg(Color::DarkGray)),
            ]),
        };
        f.render_widget(Paragraph::new(label), rows[3 * i]);

        let finished = p.total.saturating_sub(p.remain);
        let pct = if p.total > 0 {
            (finished as f32 / p.total as f32 * 100.0) as u16
        } else {
            0
        };
        let gauge = Gauge::default()
            .gauge_style(Style::default().fg(Color::Blue))
            .percent(pct.min(100))
            .label(format!("{finished} / {} tiles", p.total));
        f.render_widget(gauge, rows[3 * i + 1]);
    }
}

// ---------------------------------------------------------------------------
// Channel occupancy panel
// ---------------------------------------------------------------------------

fn render_channels(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" KV channels ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else { return };

    let max_avail = m
        .channels
        .iter()
        .map(|c| c.available_tiles)
        .max()
        .unwrap_or(1)
        .max(1);

    let mut lines: Vec<Line> = vec![Line::from(vec![
        Span::styled(
            format!(
                "  requests: {} pending / {} active / {} done",
                m.pending_requests, m.active_requests, m.completed_requests
            ),
            Style::default().fg(Color::DarkGray),
        ),
    ])];
    lines.push(Line::raw(""));

    let bar_width = (inner.width as usize).saturating_sub(24).max(8);
    for (ch, c) in m.channels.iter().enumerate() {
        if lines.len() + 2 > inner.height as usize {
            lines.push(Line::from(Span::styled(
                format!("  … {} more channels", m.channels.len() - ch),
                Style::default().fg(Color::DarkGray),
            )));
            break;
        }
        let filled = ((c.available_tiles as f64 / max_avail as f64) * bar_width as f64) as usize;
        let bar: String = "█".repeat(filled) + &"░".repeat(bar_width - filled);
        lines.push(Line::from(vec![
            Span::styled(format!("  ch{ch:<3}"), Style::default().fg(Color::Yellow)),
            Span::styled(bar, Style::default().fg(Color::Green)),
            Span::styled(
                format!(" {:>2} reqs", c.active_requests),
                Style::default().fg(Color::DarkGray),
            ),
        ]));
    }

    f.render_widget(Paragraph::new(lines), inner);
}

// ---------------------------------------------------------------------------
// Stage history
// ---------------------------------------------------------------------------

fn render_stage_history(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Stage history ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else { return };

    // Per-stage execution cycles from the cumulative records, latest last.
    let mut spans: Vec<Span> = vec![Span::raw("  ")];
    let mut prev = 0u64;
    let diffs: Vec<(String, u64)> = m
        .stage_cycles
        .iter()
        .map(|(name, cum)| {
            let d = cum - prev;
            prev = *cum;
            (name.clone(), d)
        })
        .collect();
    let keep = diffs.len().saturating_sub(16);
    for (name, cycles) in &diffs[keep..] {
        spans.push(Span::styled(
            format!("{name}:"),
            Style::default().fg(Color::Yellow),
        ));
        spans.push(Span::styled(
            format!("{cycles} "),
            Style::default().fg(Color::White),
        ));
    }
    if diffs.is_empty() {
        spans.push(Span::styled(
            "no stages completed yet",
            Style::default().fg(Color::DarkGray),
        ));
    }

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

fn render_footer(f: &mut Frame, area: Rect) {
    f.render_widget(
        Paragraph::new(Line::from(Span::styled(
            "  q/esc: quit",
            Style::default().fg(Color::DarkGray),
        ))),
        area,
    );
}
