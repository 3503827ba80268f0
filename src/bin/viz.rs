/// gcnsim live monitor — attach to any running simulation at any time.
///
/// Run in a separate terminal:
///   cargo run --bin viz
///
/// Polls /tmp/gcnsim_live.json every 200ms and renders a live dashboard:
///
///   ┌ header: cycle / policy / status ───────────────────────────────┐
///   │ CU occupancy heatmap (one cell per CU) │ Dispatchers: gauges   │
///   │                                        │ Drain protocol: acks  │
///   │ q/esc: quit  …footer…                                          │
///
/// Press q or Esc to quit. The simulation keeps running unaffected.
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use gcnsim::metrics::{read_metrics, LiveMetrics};
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
            Constraint::Min(0),    // heatmap + side panels
            Constraint::Length(1), // footer
        ])
        .split(area);

    render_header(f, rows[0], metrics);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(58), Constraint::Percentage(42)])
        .split(rows[1]);

    render_heatmap(f, cols[0], metrics);

    let side = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(cols[1]);
    render_dispatchers(f, side[0], metrics);
    render_protocol(f, side[1], metrics);

    render_footer(f, rows[2]);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(Span::styled(
            " ⚡ gcnsim live monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (cycle, policy, status) = metrics
        .map(|m| (m.cycle, m.placement_policy.as_str(), m.status.as_str()))
        .unwrap_or((0, "—", "idle"));

    let status_color = match status {
        "running" => Color::Green,
        "draining" => Color::Magenta,
        "complete" => Color::Cyan,
        _ => Color::DarkGray,
    };

    let spans = vec![
        Span::styled("  cycle: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            cycle.to_string(),
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        ),
        Span::styled("   policy: ", Style::default().fg(Color::DarkGray)),
        Span::styled(policy, Style::default().fg(Color::Cyan)),
        Span::styled("   status: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.to_uppercase(),
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
    ];

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

// ---------------------------------------------------------------------------
// CU occupancy heatmap
// ---------------------------------------------------------------------------

fn render_heatmap(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(" CU Wavefront Slots ")
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (used, total) = metrics
        .map(|m| (m.cu_wf_slots_used.clone(), m.cu_wf_slots_total.max(1)))
        .unwrap_or_else(|| (vec![0usize; 64], 40));

    // Fit as many CUs per row as the panel width allows (each CU = 2 chars + 1 space)
    let cus_per_row = ((inner.width as usize).saturating_sub(1) / 3).max(1);

    let legend = Line::from(vec![
        Span::styled("██", Style::default().fg(Color::Green)),
        Span::raw(" busy   "),
        Span::styled("▒▒", Style::default().fg(Color::Yellow)),
        Span::raw(" partial   "),
        Span::styled("░░", Style::default().fg(Color::DarkGray)),
        Span::raw(" idle"),
    ]);

    let mut lines: Vec<Line> = vec![legend, Line::raw("")];

    for row in used.chunks(cus_per_row) {
        let spans: Vec<Span> = row
            .iter()
            .flat_map(|&n| {
                let fill = n as f32 / total as f32;
                let (symbol, color) = if fill >= 0.75 {
                    ("██", Color::Green)
                } else if n > 0 {
                    ("▒▒", Color::Yellow)
                } else {
                    ("░░", Color::DarkGray)
                };
                vec![Span::styled(symbol, Style::default().fg(color)), Span::raw(" ")]
            })
            .collect();
        lines.push(Line::from(spans));
    }

    let busy_count = used.iter().filter(|&&n| n > 0).count();
    let slots_used: usize = used.iter().sum();
    lines.push(Line::raw(""));
    lines.push(Line::from(vec![Span::styled(
        format!(
            "  {}/{} CUs busy   {} wavefront slots held",
            busy_count,
            used.len(),
            slots_used,
        ),
        Style::default().fg(Color::DarkGray),
    )]));

    f.render_widget(Paragraph::new(lines), inner);
}

// ---------------------------------------------------------------------------
// Dispatcher panel
// ---------------------------------------------------------------------------

fn render_dispatchers(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Dispatchers ").borders(Borders::ALL);
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
                "  Start gcnsim to see live data.",
                Style::default().fg(Color::DarkGray),
            )),
        ]);
        f.render_widget(msg, inner);
        return;
    };

    // One gauge row per dispatcher slot, idle slots dimmed.
    let constraints: Vec<Constraint> = m
        .dispatchers
        .iter()
        .map(|_| Constraint::Length(2))
        .chain(std::iter::once(Constraint::Min(0)))
        .collect();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(inner);

    for (i, d) in m.dispatchers.iter().enumerate() {
        if !d.active {
            let label = Paragraph::new(Span::styled(
                format!("{} — idle", d.name),
                Style::default().fg(Color::DarkGray),
            ));
            f.render_widget(label, rows[i]);
            continue;
        }

        let pct = if d.wgs_total > 0 {
            ((d.wgs_completed as f32 / d.wgs_total as f32) * 100.0) as u16
        } else {
            0
        };
        let gauge = Gauge::default()
            .block(Block::default().title(d.name.clone()))
            .gauge_style(Style::default().fg(Color::Blue))
            .percent(pct)
            .label(format!(
                "{}/{} done, {} mapped",
                d.wgs_completed, d.wgs_total, d.wgs_dispatched,
            ));
        f.render_widget(gauge, rows[i]);
    }
}

// ---------------------------------------------------------------------------
// Drain-protocol panel
// ---------------------------------------------------------------------------

fn render_protocol(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(" Drain Protocol ")
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        return;
    };
    let p = &m.protocol;

    let mode = if p.shootdown_active {
        ("SHOOTDOWN", Color::Red)
    } else if p.flush_active {
        ("FLUSH", Color::Magenta)
    } else {
        ("—", Color::DarkGray)
    };

    let ack_line = |label: &str, n: usize| {
        Line::from(vec![
            Span::styled(format!("  {label:<22}"), Style::default().fg(Color::DarkGray)),
            if n > 0 {
                Span::styled(n.to_string(), Style::default().fg(Color::Yellow))
            } else {
                Span::styled("0", Style::default().fg(Color::DarkGray))
            },
        ])
    };

    let lines = vec![
        Line::from(vec![
            Span::styled("  active: ", Style::default().fg(Color::DarkGray)),
            Span::styled(mode.0, Style::default().fg(mode.1).add_modifier(Modifier::BOLD)),
        ]),
        Line::raw(""),
        ack_line("CU acks outstanding", p.cu_acks),
        ack_line("AT acks outstanding", p.at_acks),
        ack_line("cache acks outstanding", p.cache_acks),
        ack_line("TLB acks outstanding", p.tlb_acks),
    ];

    f.render_widget(Paragraph::new(lines), inner);
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

fn render_footer(f: &mut Frame, area: Rect) {
    let text = Paragraph::new(Span::styled(
        "  q / esc: quit    auto-refreshes every 200ms    reads /tmp/gcnsim_live.json",
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}
