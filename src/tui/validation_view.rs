//! Live dashboard for a validation run

use crate::validate::{Endpoint, ProgressSnapshot, RunPhase, RunReport, ValidationEngine};
use crate::Result;
use anyhow::anyhow;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Ranked endpoints shown once the run is done
const MAX_FASTEST_SHOWN: usize = 100;

type RunHandle = JoinHandle<std::result::Result<RunReport, crate::validate::SetupError>>;

/// Terminal dashboard that drives one engine run
pub struct ValidationDashboard {
    engine: Arc<ValidationEngine>,
    candidates: Vec<Endpoint>,
    /// Candidates the engine will schedule
    total: u64,
    progress_rx: UnboundedReceiver<ProgressSnapshot>,
    phase_rx: watch::Receiver<RunPhase>,
    /// Latest progress snapshot
    snapshot: Option<ProgressSnapshot>,
    report: Option<RunReport>,
    list_state: ListState,
    status_message: String,
    should_quit: bool,
}

impl ValidationDashboard {
    /// `progress_rx` should be fed by a channel sink installed on `engine`
    pub fn new(
        engine: ValidationEngine,
        candidates: Vec<Endpoint>,
        progress_rx: UnboundedReceiver<ProgressSnapshot>,
    ) -> Self {
        let phase_rx = engine.subscribe();
        let total = match engine.config().max_candidates {
            Some(max) => candidates.len().min(max),
            None => candidates.len(),
        } as u64;
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            engine: Arc::new(engine),
            candidates,
            total,
            progress_rx,
            phase_rx,
            snapshot: None,
            report: None,
            list_state,
            status_message: "Starting validation... Press 'q' to stop.".to_string(),
            should_quit: false,
        }
    }

    /// Run the dashboard until the user quits, returning the run's report
    pub async fn run(mut self) -> Result<RunReport> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result?;
        self.report
            .ok_or_else(|| anyhow!("validation run produced no report"))
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let candidates = std::mem::take(&mut self.candidates);
        let mut handle: Option<RunHandle> =
            Some(tokio::spawn(async move { engine.run(candidates).await }));

        loop {
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                    }
                }
            }

            loop {
                match self.progress_rx.try_recv() {
                    Ok(snapshot) => self.snapshot = Some(snapshot),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            if handle.as_ref().is_some_and(|h| h.is_finished()) {
                if let Some(finished) = handle.take() {
                    self.complete(finished).await?;
                }
            }

            if self.should_quit {
                if let Some(running) = handle.take() {
                    // Stop probing but keep whatever already came back.
                    self.engine.cancel_token().cancel();
                    self.complete(running).await?;
                }
                break;
            }
        }

        Ok(())
    }

    async fn complete(&mut self, handle: RunHandle) -> Result<()> {
        let report = handle.await??;
        self.status_message = format!(
            "{} {} working of {} probed in {:.1}s | Press 'q' to quit",
            if report.stats.cancelled { "Stopped." } else { "Complete!" },
            report.ranked.len(),
            report.stats.processed,
            report.stats.elapsed.as_secs_f64()
        );
        self.report = Some(report);
        Ok(())
    }

    fn handle_input(&mut self, key: KeyCode) {
        let shown = self
            .report
            .as_ref()
            .map_or(0, |r| r.ranked.len().min(MAX_FASTEST_SHOWN));

        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Down => {
                let i = match self.list_state.selected() {
                    Some(i) if i + 1 < shown => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let i = match self.list_state.selected() {
                    Some(0) | None => shown.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title and phase
                Constraint::Length(3), // Progress bar
                Constraint::Length(3), // Rates
                Constraint::Min(0),    // Fastest endpoints
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let phase = *self.phase_rx.borrow();
        let title = Paragraph::new(format!("Proxy Sieve | {}", phase))
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let snapshot = self.snapshot.unwrap_or_else(|| {
            ProgressSnapshot::compute(self.total, 0, 0, Duration::ZERO)
        });
        let percent = snapshot.percent.clamp(0.0, 100.0) as u16;
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(percent)
            .label(format!(
                "{}/{} ({}%)",
                snapshot.processed, snapshot.total, percent
            ));
        f.render_widget(gauge, chunks[1]);

        let rates = Paragraph::new(format!(
            "Working: {} | {:.1} probes/s | ETA {:.0}s | Elapsed {:.0}s",
            snapshot.succeeded, snapshot.throughput, snapshot.eta_secs, snapshot.elapsed_secs
        ))
        .block(Block::default().borders(Borders::ALL).title("Rates"));
        f.render_widget(rates, chunks[2]);

        let (items, count): (Vec<ListItem>, usize) = match &self.report {
            Some(report) => (
                report
                    .ranked
                    .iter()
                    .take(MAX_FASTEST_SHOWN)
                    .enumerate()
                    .map(|(i, entry)| {
                        ListItem::new(format!(
                            "{:>3}. {}  {}ms",
                            i + 1,
                            entry.endpoint,
                            entry.latency_ms
                        ))
                        .style(Style::default().fg(Color::Green))
                    })
                    .collect(),
                report.ranked.len(),
            ),
            None => (Vec::new(), 0),
        };
        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("Fastest ({})", count))
                    .border_style(
                        Style::default()
                            .fg(Color::Cyan)
                            .add_modifier(Modifier::BOLD),
                    ),
            )
            .highlight_style(Style::default().bg(Color::DarkGray))
            .highlight_symbol(">> ");
        f.render_stateful_widget(list, chunks[3], &mut self.list_state);

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.report.is_some() {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[4]);
    }
}
