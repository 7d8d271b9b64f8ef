use crate::normalize_handle;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use libhandle_storm::{profile_url, ProbeOutcome, ProbeResult, ProberStatus, Supervisor};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame, Terminal,
};
use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc::{self, error::TrySendError};

const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const MAX_RESULTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterMode {
    All,
    Available,
    Taken,
}

impl FilterMode {
    fn next(self) -> Self {
        match self {
            FilterMode::All => FilterMode::Available,
            FilterMode::Available => FilterMode::Taken,
            FilterMode::Taken => FilterMode::All,
        }
    }

    fn matches(self, outcome: &ProbeOutcome) -> bool {
        match self {
            FilterMode::All => true,
            FilterMode::Available => outcome.is_available(),
            FilterMode::Taken => outcome.is_taken(),
        }
    }
}

enum Scroll {
    Up(usize),
    Down(usize),
    Top,
    Bottom,
}

type Results = Arc<Mutex<VecDeque<ProbeResult>>>;

fn lock(results: &Results) -> MutexGuard<'_, VecDeque<ProbeResult>> {
    results.lock().unwrap_or_else(PoisonError::into_inner)
}

struct App {
    supervisor: Supervisor,
    handles: mpsc::Sender<String>,
    /// Newest first.
    results: Results,
    lookup_base: String,
    input: String,
    input_mode: bool,
    list_state: ListState,
    quit: bool,
    tick: usize,
    filter_mode: FilterMode,
    toast_message: Option<(String, Instant)>,
    refreshing: Arc<AtomicBool>,
}

impl App {
    fn new(
        supervisor: Supervisor,
        handles: mpsc::Sender<String>,
        results: Results,
        lookup_base: String,
    ) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            supervisor,
            handles,
            results,
            lookup_base,
            input: String::new(),
            input_mode: false,
            list_state,
            quit: false,
            tick: 0,
            filter_mode: FilterMode::All,
            toast_message: None,
            refreshing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn toast(&mut self, message: impl Into<String>) {
        self.toast_message = Some((message.into(), Instant::now()));
    }

    fn get_filtered_results(&self) -> Vec<ProbeResult> {
        lock(&self.results)
            .iter()
            .filter(|r| self.filter_mode.matches(&r.outcome))
            .cloned()
            .collect()
    }

    fn get_selected_url(&self) -> Option<String> {
        let filtered = self.get_filtered_results();
        self.list_state
            .selected()
            .and_then(|i| filtered.get(i).map(|r| profile_url(&self.lookup_base, &r.handle)))
    }

    fn copy_selected_to_clipboard(&mut self) {
        if let Some(url) = self.get_selected_url() {
            if let Ok(mut clipboard) = arboard::Clipboard::new() {
                if clipboard.set_text(&url).is_ok() {
                    self.toast(format!("Copied: {}", url));
                }
            }
        }
    }

    fn open_selected_in_browser(&mut self) {
        if let Some(url) = self.get_selected_url() {
            let _ = open::that(&url);
            self.toast(format!("Opening: {}", url));
        }
    }

    fn toggle_prober(&mut self) {
        match self.supervisor.status() {
            ProberStatus::Running => {
                let supervisor = self.supervisor.clone();
                tokio::spawn(async move { supervisor.stop().await });
                self.toast("Stopping prober");
            }
            ProberStatus::Stopped | ProberStatus::Exhausted => {
                if self.supervisor.start() {
                    self.toast("Prober started");
                }
            }
        }
    }

    fn refresh_proxies(&mut self) {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            self.toast("Refresh already in progress");
            return;
        }

        let supervisor = self.supervisor.clone();
        let refreshing = Arc::clone(&self.refreshing);
        tokio::spawn(async move {
            supervisor.force_refresh().await;
            refreshing.store(false, Ordering::SeqCst);
        });
        self.toast("Refreshing proxy pool");
    }

    fn submit_input(&mut self) {
        let raw = std::mem::take(&mut self.input);
        let Some(handle) = normalize_handle(&raw) else {
            self.toast(format!("Not a valid handle: {}", raw.trim()));
            return;
        };

        match self.handles.try_send(handle.clone()) {
            Ok(()) => self.toast(format!("Queued @{}", handle)),
            Err(TrySendError::Full(_)) => self.toast("Queue is full, try again shortly"),
            Err(TrySendError::Closed(_)) => self.toast("Queue is closed"),
        }
    }

    fn spinner_frame(&self) -> &'static str {
        SPINNER_FRAMES[self.tick % SPINNER_FRAMES.len()]
    }

    fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst) || self.supervisor.refresh_count() == 0
    }

    fn visible_len(&self) -> usize {
        lock(&self.results)
            .iter()
            .filter(|r| self.filter_mode.matches(&r.outcome))
            .count()
    }

    fn scroll(&mut self, scroll: Scroll) {
        let last = self.visible_len().saturating_sub(1);
        let current = self.list_state.selected().unwrap_or(0);
        let i = match scroll {
            Scroll::Down(n) => (current + n).min(last),
            Scroll::Up(n) => current.saturating_sub(n),
            Scroll::Top => 0,
            Scroll::Bottom => last,
        };
        self.list_state.select(Some(i));
    }
}

pub async fn run_tui(
    supervisor: Supervisor,
    handles: mpsc::Sender<String>,
    mut outcomes: mpsc::UnboundedReceiver<ProbeResult>,
    lookup_base: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let results: Results = Arc::new(Mutex::new(VecDeque::new()));

    let collected = Arc::clone(&results);
    tokio::spawn(async move {
        while let Some(result) = outcomes.recv().await {
            let mut res = lock(&collected);
            res.push_front(result);
            res.truncate(MAX_RESULTS);
        }
    });

    supervisor.launch();
    let starter = supervisor.clone();
    tokio::spawn(async move {
        starter.ready().await;
        if starter.status() == ProberStatus::Stopped {
            starter.start();
        }
    });

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(supervisor.clone(), handles, results, lookup_base);
    let res = run_app(&mut terminal, &mut app).await;

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    supervisor.shutdown().await;

    if let Err(err) = res {
        println!("{:?}", err)
    }

    Ok(())
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> io::Result<()> {
    loop {
        app.tick = app.tick.wrapping_add(1);

        if let Some((_, created)) = &app.toast_message {
            if created.elapsed() > Duration::from_secs(2) {
                app.toast_message = None;
            }
        }

        terminal.draw(|f| ui(f, app))?;

        if app.quit {
            break;
        }

        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };

        if app.input_mode {
            match key.code {
                KeyCode::Enter => {
                    app.input_mode = false;
                    app.submit_input();
                }
                KeyCode::Char(c) => app.input.push(c),
                KeyCode::Backspace => {
                    app.input.pop();
                }
                KeyCode::Esc => {
                    app.input_mode = false;
                    app.input.clear();
                }
                _ => {}
            }
            continue;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => app.quit = true,
            KeyCode::Down | KeyCode::Char('j') => app.scroll(Scroll::Down(1)),
            KeyCode::Up | KeyCode::Char('k') => app.scroll(Scroll::Up(1)),
            KeyCode::PageDown => app.scroll(Scroll::Down(20)),
            KeyCode::PageUp => app.scroll(Scroll::Up(20)),
            KeyCode::Home | KeyCode::Char('g') => app.scroll(Scroll::Top),
            KeyCode::End | KeyCode::Char('G') => app.scroll(Scroll::Bottom),
            KeyCode::Char('s') => app.toggle_prober(),
            KeyCode::Char('r') => app.refresh_proxies(),
            KeyCode::Char('i') => app.input_mode = true,
            KeyCode::Enter | KeyCode::Char('y') => app.copy_selected_to_clipboard(),
            KeyCode::Char('o') => app.open_selected_in_browser(),
            KeyCode::Tab | KeyCode::Char('f') => {
                app.filter_mode = app.filter_mode.next();
                app.list_state.select(Some(0));
            }
            _ => {}
        }
    }

    Ok(())
}

fn status_line(app: &App) -> Line<'static> {
    let (symbol, color, label) = match app.supervisor.status() {
        ProberStatus::Running => ("●", Color::Green, "Running"),
        ProberStatus::Stopped => ("○", Color::DarkGray, "Stopped"),
        ProberStatus::Exhausted => ("!", Color::Red, "Out of proxies"),
    };
    let stats = app.supervisor.stats();

    let mut spans = vec![
        Span::styled(format!(" {} ", symbol), Style::default().fg(color).add_modifier(Modifier::BOLD)),
        Span::styled(label, Style::default().fg(color)),
        Span::styled(
            format!(
                "  checked {}  available {}  taken {}  inconclusive {}  evicted {}",
                stats.checked, stats.available, stats.taken, stats.inconclusive, stats.evicted
            ),
            Style::default().fg(Color::White),
        ),
    ];

    if app.is_refreshing() {
        spans.push(Span::styled(
            format!("  {} refreshing proxies", app.spinner_frame()),
            Style::default().fg(Color::Yellow),
        ));
    }

    Line::from(spans)
}

fn ui(f: &mut Frame, app: &mut App) {
    let has_toast = app.toast_message.is_some();

    let mut constraints = vec![Constraint::Length(3), Constraint::Length(1)];

    if app.input_mode {
        constraints.push(Constraint::Length(3));
    }

    constraints.push(Constraint::Min(1));

    if has_toast {
        constraints.push(Constraint::Length(1));
    }

    constraints.push(Constraint::Length(3));

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(f.area());

    let mut chunk_idx = 0;

    let header = Paragraph::new(status_line(app))
        .block(Block::default().borders(Borders::ALL).title("Handle Query"));
    f.render_widget(header, chunks[chunk_idx]);
    chunk_idx += 1;

    let health = app.supervisor.health();
    let pct = health.percentage as usize;
    let bar_width = (f.area().width as usize).saturating_sub(30);
    let filled = (bar_width * pct) / 100;
    let bar: String = "█".repeat(filled) + &"░".repeat(bar_width - filled);
    let bar_color = match pct {
        50.. => Color::Green,
        20..=49 => Color::Yellow,
        _ => Color::Red,
    };

    let health_line = Line::from(vec![
        Span::styled(" pool ", Style::default().fg(Color::Cyan)),
        Span::styled(bar, Style::default().fg(bar_color)),
        Span::styled(
            format!(" {:>3}% fresh ({}/{})", pct, health.under_threshold, health.total),
            Style::default().fg(Color::DarkGray),
        ),
    ]);
    f.render_widget(Paragraph::new(health_line), chunks[chunk_idx]);
    chunk_idx += 1;

    if app.input_mode {
        let input = Paragraph::new(format!("Handle: @{}_", app.input))
            .style(Style::default().fg(Color::Yellow))
            .block(Block::default().borders(Borders::ALL).title("Queue Handle"));
        f.render_widget(input, chunks[chunk_idx]);
        chunk_idx += 1;
    }

    let results_chunk = chunks[chunk_idx];
    chunk_idx += 1;

    let toast_chunk = if has_toast {
        let c = chunks[chunk_idx];
        chunk_idx += 1;
        Some(c)
    } else {
        None
    };

    let help_chunk = chunks[chunk_idx];

    let results = app.get_filtered_results();
    let items: Vec<ListItem> = results
        .iter()
        .map(|result| {
            let (symbol, color, text): (&str, Color, String) = match &result.outcome {
                ProbeOutcome::Available => ("✓", Color::Green, "Available".to_string()),
                ProbeOutcome::Taken => ("✗", Color::Red, "Taken".to_string()),
                ProbeOutcome::Inconclusive { reason } => ("!", Color::Magenta, reason.clone()),
            };

            let line = Line::from(vec![
                Span::styled(format!("{} ", symbol), Style::default().fg(color).add_modifier(Modifier::BOLD)),
                Span::styled(format!("{:<26}", format!("@{}", result.handle)), Style::default().fg(Color::Cyan)),
                Span::styled(format!("{:<20}", text), Style::default().fg(color)),
                Span::styled(
                    format!("{:>6}ms  via {}", result.duration.as_millis(), result.proxy),
                    Style::default().fg(Color::DarkGray),
                ),
            ]);

            ListItem::new(line)
        })
        .collect();

    let (total, available_count, taken_count) = {
        let all = lock(&app.results);
        (
            all.len(),
            all.iter().filter(|r| r.outcome.is_available()).count(),
            all.iter().filter(|r| r.outcome.is_taken()).count(),
        )
    };

    let filter_indicator = match app.filter_mode {
        FilterMode::All => format!("[All:{}]", total),
        FilterMode::Available => format!("[Available:{}]", available_count),
        FilterMode::Taken => format!("[Taken:{}]", taken_count),
    };

    let title = format!("Results {} - Tab/f to filter", filter_indicator);

    let results_list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(title))
        .style(Style::default().fg(Color::White))
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD)
        )
        .highlight_symbol("» ");

    f.render_stateful_widget(results_list, results_chunk, &mut app.list_state);

    if let Some(chunk) = toast_chunk {
        if let Some((msg, _)) = &app.toast_message {
            let toast = Paragraph::new(Line::from(vec![
                Span::styled(" ✓ ", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)),
                Span::styled(msg.as_str(), Style::default().fg(Color::White)),
            ]));
            f.render_widget(toast, chunk);
        }
    }

    let help_text = if app.input_mode {
        "Enter: Queue | Esc: Cancel"
    } else {
        "s: Start/Stop | r: Refresh | i: Add | ↑↓/jk: Scroll | Tab/f: Filter | y: Copy | o: Open | q: Quit"
    };

    let help = Paragraph::new(help_text)
        .style(Style::default().fg(Color::DarkGray))
        .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, help_chunk);
}
