//! Terminal dashboard for the relay server

use crate::config::RelayConfig;
use crate::metrics::{truncate_peer_id, LogLevel, Metrics, ServerStatus};
use crate::registry::{SessionRegistry, SessionSummary};
use crate::server;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Scrollbar, ScrollbarOrientation, ScrollbarState, Table},
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;

/// Rows shown in the session table
const SESSION_ROWS: u16 = 6;

/// Dashboard state for scrolling etc.
struct DashboardState {
    /// Log scroll position (0 = most recent at bottom)
    log_scroll: usize,
    /// Whether auto-scroll is enabled (follows new logs)
    auto_scroll: bool,
    /// Log count at the last frame, to notice new entries
    seen_logs: usize,
}

impl DashboardState {
    fn new() -> Self {
        Self {
            log_scroll: 0,
            auto_scroll: true,
            seen_logs: 0,
        }
    }

    /// Follow new log entries while auto-scroll is on
    fn observe_logs(&mut self, log_count: usize) {
        if log_count != self.seen_logs {
            self.seen_logs = log_count;
            if self.auto_scroll {
                self.log_scroll = 0;
            }
        }
    }

    /// Apply a key press; returns true when the dashboard should exit
    fn handle_key(&mut self, key: KeyEvent, log_count: usize) -> bool {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::Up | KeyCode::Char('k') => self.scroll_up(1, log_count),
            KeyCode::Down | KeyCode::Char('j') => self.scroll_down(1),
            KeyCode::PageUp => self.scroll_up(10, log_count),
            KeyCode::PageDown => self.scroll_down(10),
            KeyCode::Home => self.scroll_up(log_count, log_count),
            KeyCode::End => self.scroll_down(usize::MAX),
            KeyCode::Char('a') => {
                self.auto_scroll = !self.auto_scroll;
                if self.auto_scroll {
                    self.log_scroll = 0;
                }
            }
            _ => {}
        }
        false
    }

    fn scroll_up(&mut self, lines: usize, log_count: usize) {
        if log_count > 0 {
            self.log_scroll = (self.log_scroll + lines).min(log_count.saturating_sub(1));
            self.auto_scroll = false;
        }
    }

    fn scroll_down(&mut self, lines: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(lines);
        if self.log_scroll == 0 {
            self.auto_scroll = true;
        }
    }
}

/// Run the dashboard
pub async fn run(
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Start server in background
    let metrics_for_server = Arc::clone(&metrics);
    let registry_for_server = Arc::clone(&registry);
    tokio::spawn(async move {
        if let Err(e) = server::run(config, registry_for_server, Arc::clone(&metrics_for_server)).await {
            let mut m = metrics_for_server.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Server stopped: {}", e));
        }
    });

    let mut state = DashboardState::new();
    let tick_rate = Duration::from_millis(100);

    loop {
        let log_count = metrics.read().logs.len();
        state.observe_logs(log_count);

        let sessions = registry.summaries();
        terminal.draw(|f| draw(f, &metrics, &sessions, &state))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && state.handle_key(key, log_count) {
                    break;
                }
            }
        }
    }

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

/// Draw the dashboard
fn draw(f: &mut Frame, metrics: &Arc<RwLock<Metrics>>, sessions: &[SessionSummary], state: &DashboardState) {
    let m = metrics.read();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),                // Header
            Constraint::Length(5),                // Stats
            Constraint::Length(SESSION_ROWS + 3), // Session table
            Constraint::Min(8),                   // Logs
            Constraint::Length(1),                // Footer
        ])
        .split(f.area());

    draw_header(f, chunks[0], &m);
    draw_stats(f, chunks[1], &m);
    draw_sessions(f, chunks[2], sessions);
    draw_logs(f, chunks[3], &m, state);
    draw_footer(f, chunks[4], state);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status_text, status_style) = match m.status {
        ServerStatus::Starting => ("STARTING", Style::default().fg(Color::Yellow)),
        ServerStatus::Running => ("RUNNING", Style::default().fg(Color::Green)),
        ServerStatus::Error => ("ERROR", Style::default().fg(Color::Red)),
    };

    let title = vec![Line::from(vec![
        Span::styled("SyncWatch Relay", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  │  Status: "),
        Span::styled(status_text, status_style),
        Span::raw("  │  Uptime: "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ])];

    let header = Paragraph::new(title).block(Block::default().borders(Borders::ALL).title(" Dashboard "));
    f.render_widget(header, area);
}

fn stat_line<'a>(label: &'a str, value: String, color: Color) -> Line<'a> {
    Line::from(vec![
        Span::raw(label),
        Span::styled(value, Style::default().fg(color)),
    ])
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    let listen = if m.listen_addr.is_empty() {
        "...".to_string()
    } else {
        format!("ws://{}", m.listen_addr)
    };
    let server_info = vec![
        stat_line("Listen: ", listen, Color::Yellow),
        stat_line("Connections: ", m.connections.to_string(), Color::Cyan),
        stat_line("Store: ", m.checkpoint_dir.clone(), Color::DarkGray),
    ];
    let server_block = Paragraph::new(server_info).block(Block::default().borders(Borders::ALL).title(" Server "));
    f.render_widget(server_block, chunks[0]);

    let session_info = vec![
        Line::from(vec![
            Span::raw("Sessions: "),
            Span::styled(
                m.active_sessions.to_string(),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
            Span::raw(format!(" (peak {})", m.peak_sessions)),
        ]),
        Line::from(vec![
            Span::raw("Peers: "),
            Span::styled(
                m.connected_peers.to_string(),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
            Span::raw(format!(" (peak {})", m.peak_peers)),
        ]),
        stat_line("Joins / rejected: ", format!("{} / {}", m.total_joins, m.rejected_joins), Color::Magenta),
    ];
    let session_block = Paragraph::new(session_info).block(Block::default().borders(Borders::ALL).title(" Sessions "));
    f.render_widget(session_block, chunks[1]);

    let signal_info = vec![
        stat_line("Relayed: ", m.signals_relayed.to_string(), Color::Cyan),
        stat_line("Host elections: ", m.host_elections.to_string(), Color::Yellow),
        stat_line("Checkpoints: ", m.checkpoints_saved.to_string(), Color::Green),
    ];
    let signal_block = Paragraph::new(signal_info).block(Block::default().borders(Borders::ALL).title(" Signaling "));
    f.render_widget(signal_block, chunks[2]);
}

fn draw_sessions(f: &mut Frame, area: Rect, sessions: &[SessionSummary]) {
    let header = Row::new(["Session", "Host", "Peers", "Version", "State", "Media"])
        .style(Style::default().add_modifier(Modifier::BOLD));

    let rows = sessions.iter().take(SESSION_ROWS as usize).map(|s| {
        let name = if s.locked {
            format!("{} (locked)", s.session_id)
        } else {
            s.session_id.clone()
        };
        let (state, color) = if s.playing {
            ("playing", Color::Green)
        } else {
            ("paused", Color::Yellow)
        };
        Row::new(vec![
            Cell::from(name),
            Cell::from(truncate_peer_id(&s.host)),
            Cell::from(s.members.to_string()),
            Cell::from(s.version.to_string()),
            Cell::from(state).style(Style::default().fg(color)),
            Cell::from(s.media_id.clone().unwrap_or_else(|| "-".to_string())),
        ])
    });

    let hidden = sessions.len().saturating_sub(SESSION_ROWS as usize);
    let title = if hidden > 0 {
        format!(" Live Sessions (+{} more) ", hidden)
    } else {
        " Live Sessions ".to_string()
    };

    let table = Table::new(
        rows,
        [
            Constraint::Percentage(25),
            Constraint::Percentage(20),
            Constraint::Length(6),
            Constraint::Length(8),
            Constraint::Length(8),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(table, area);
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, state: &DashboardState) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let total_logs = m.logs.len();

    let log_items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .skip(state.log_scroll)
        .take(visible_height)
        .map(|entry| {
            let level_style = match entry.level {
                LogLevel::Info => Style::default().fg(Color::Blue),
                LogLevel::Warning => Style::default().fg(Color::Yellow),
                LogLevel::Error => Style::default().fg(Color::Red),
                LogLevel::Connection => Style::default().fg(Color::Green),
                LogLevel::Session => Style::default().fg(Color::Magenta),
            };

            let time = entry.timestamp.format("%H:%M:%S").to_string();

            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", time), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("[{}] ", entry.level.as_str()), level_style),
                Span::raw(entry.message.as_str()),
            ]))
        })
        .collect();

    let scroll_indicator = if state.auto_scroll {
        " [AUTO] ".to_string()
    } else if total_logs > 0 {
        format!(" [{}/{}] ", total_logs - state.log_scroll, total_logs)
    } else {
        String::new()
    };

    let logs = List::new(log_items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Activity Log{}", scroll_indicator)),
    );
    f.render_widget(logs, area);

    if total_logs > visible_height {
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .begin_symbol(Some("↑"))
            .end_symbol(Some("↓"));

        let mut scrollbar_state =
            ScrollbarState::new(total_logs).position(total_logs.saturating_sub(state.log_scroll + visible_height));

        f.render_stateful_widget(
            scrollbar,
            area.inner(ratatui::layout::Margin {
                vertical: 1,
                horizontal: 0,
            }),
            &mut scrollbar_state,
        );
    }
}

fn draw_footer(f: &mut Frame, area: Rect, state: &DashboardState) {
    let auto_text = if state.auto_scroll { "ON " } else { "OFF" };
    let auto_color = if state.auto_scroll { Color::Green } else { Color::Yellow };
    let key = Style::default().fg(Color::Black).bg(Color::White);

    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Q ", key),
        Span::raw(" Quit  "),
        Span::styled(" ↑↓ ", key),
        Span::raw(" Scroll  "),
        Span::styled(" PgUp/Dn ", key),
        Span::raw(" Page  "),
        Span::styled(" A ", key),
        Span::raw(" Auto-scroll: "),
        Span::styled(auto_text, Style::default().fg(auto_color)),
    ]));

    f.render_widget(footer, area);
}
