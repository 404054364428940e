use anyhow::Result;
use chrono::NaiveDate;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
};
use std::io::stdout;

use crate::calendar;
use crate::db::{ApplicationFilter, ApplicationSummary, Database};
use crate::lifecycle::{self, classify_interview};
use crate::models::{InterviewSource, InterviewView, Status};

struct AppState {
    items: Vec<ApplicationSummary>,
    selected: usize,
    scroll_offset: u16,
    interview: Option<InterviewView>,
    message: Option<String>,
    today: NaiveDate,
    soon_days: i64,
}

impl AppState {
    fn new(items: Vec<ApplicationSummary>, today: NaiveDate, soon_days: i64) -> Self {
        Self {
            items,
            selected: 0,
            scroll_offset: 0,
            interview: None,
            message: None,
            today,
            soon_days,
        }
    }

    fn current(&self) -> Option<&ApplicationSummary> {
        self.items.get(self.selected)
    }

    fn load_interview(&mut self, db: &Database) {
        let Some(item) = self.current() else { return };
        self.interview = db.get_interview(item.application.id).ok().flatten();
    }

    fn next(&mut self) {
        if !self.items.is_empty() && self.selected < self.items.len() - 1 {
            self.selected += 1;
            self.scroll_offset = 0;
        }
    }

    fn prev(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
            self.scroll_offset = 0;
        }
    }

    fn scroll_down(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_add(3);
    }

    fn scroll_up(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_sub(3);
    }

    fn apply_status(&mut self, db: &mut Database, status: Status) {
        let Some(item) = self.current() else { return };
        let id = item.application.id;
        match db.set_status(id, status.as_str()) {
            Ok(updated) => {
                let today = self.today;
                if let Some(item) = self.items.get_mut(self.selected) {
                    item.needs_follow_up = lifecycle::needs_follow_up(&updated, today);
                    item.awaiting_interview_details = updated.status == Status::Interview
                        && self.interview.is_none();
                    item.application = updated;
                }
                self.message = Some(format!("#{} is now {}", id, status));
            }
            Err(e) => self.message = Some(format!("Error: {}", e)),
        }
    }
}

fn status_for_key(c: char) -> Option<Status> {
    match c {
        'a' => Some(Status::Applied),
        'i' => Some(Status::Interview),
        'r' => Some(Status::Rejected),
        'o' => Some(Status::Offer),
        _ => None,
    }
}

pub fn run_browse(db: &mut Database, filter: &ApplicationFilter, today: NaiveDate, soon_days: i64) -> Result<()> {
    let items = db.list_applications(filter, today)?;
    if items.is_empty() {
        println!("No applications found.");
        return Ok(());
    }

    let mut state = AppState::new(items, today, soon_days);
    state.load_interview(db);

    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = run_loop(&mut terminal, &mut state, db);

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    state: &mut AppState,
    db: &mut Database,
) -> Result<()> {
    let mut list_state = ListState::default();
    list_state.select(Some(0));

    loop {
        terminal.draw(|frame| draw(frame, state, &mut list_state))?;

        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            let prev_selected = state.selected;
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => break,
                KeyCode::Down | KeyCode::Char('j') => state.next(),
                KeyCode::Up | KeyCode::Char('k') => state.prev(),
                KeyCode::Char('J') | KeyCode::PageDown => state.scroll_down(),
                KeyCode::Char('K') | KeyCode::PageUp => state.scroll_up(),
                KeyCode::Char(c) => {
                    if let Some(status) = status_for_key(c) {
                        state.apply_status(db, status);
                    }
                }
                _ => {}
            }
            if state.selected != prev_selected {
                list_state.select(Some(state.selected));
                state.message = None;
                state.load_interview(db);
            }
        }
    }
    Ok(())
}

fn status_style(status: Status) -> Style {
    match status {
        Status::Applied => Style::default().fg(Color::Cyan),
        Status::Interview => Style::default().fg(Color::Yellow),
        Status::Rejected => Style::default().fg(Color::Red),
        Status::Offer => Style::default().fg(Color::Green),
    }
}

fn draw(frame: &mut Frame, state: &AppState, list_state: &mut ListState) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(frame.area());

    // Left panel: application list
    let items: Vec<ListItem> = state
        .items
        .iter()
        .map(|item| {
            let app = &item.application;
            let flag = if item.needs_follow_up {
                "!"
            } else if item.awaiting_interview_details {
                "?"
            } else {
                " "
            };
            let company = if app.company.chars().count() > 22 {
                format!("{}...", app.company.chars().take(19).collect::<String>())
            } else {
                app.company.clone()
            };
            ListItem::new(Line::from(vec![
                Span::raw(format!("{} #{:<4} {:<22} ", flag, app.id, company)),
                Span::styled(app.status.as_str(), status_style(app.status)),
            ]))
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(format!(
            " Applications ({}) ", state.items.len()
        )))
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, chunks[0], list_state);

    // Right panel: application detail
    let detail = build_detail(state);
    let detail_widget = Paragraph::new(detail)
        .block(Block::default().borders(Borders::ALL).title(" Detail "))
        .wrap(Wrap { trim: false })
        .scroll((state.scroll_offset, 0));

    frame.render_widget(detail_widget, chunks[1]);

    // Footer help
    let help_area = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(frame.area());

    let footer = match &state.message {
        Some(message) => format!(" {}", message),
        None => " j/k:navigate  J/K:scroll  a:applied i:interview r:rejected o:offer  q:quit".to_string(),
    };
    let help = Paragraph::new(footer).style(Style::default().fg(Color::DarkGray));
    frame.render_widget(help, help_area[1]);
}

fn build_detail<'a>(state: &'a AppState) -> Text<'a> {
    let Some(item) = state.current() else {
        return Text::raw("No application selected");
    };
    let app = &item.application;

    let mut lines: Vec<Line> = Vec::new();

    // Header
    lines.push(Line::from(Span::styled(
        format!("{} at {}", app.role, app.company),
        Style::default().add_modifier(Modifier::BOLD),
    )));
    lines.push(Line::from(format!("Location: {}", app.location)));
    lines.push(Line::from(Span::styled(
        format!("Status: {}", app.status),
        status_style(app.status),
    )));
    lines.push(Line::from(format!(
        "Applied: {} ({} days ago)",
        app.applied_date,
        lifecycle::days_since_applied(app, state.today)
    )));
    lines.push(Line::from(format!("Link: {}", app.job_link)));

    if item.needs_follow_up {
        lines.push(Line::from(Span::styled(
            "Follow up: no reply yet",
            Style::default().fg(Color::Magenta),
        )));
    }

    lines.push(Line::from(""));

    match &state.interview {
        Some(interview) => {
            lines.push(Line::from(Span::styled(
                "INTERVIEW",
                Style::default().add_modifier(Modifier::BOLD),
            )));
            let when = match interview.time {
                Some(time) => format!("{} {}", interview.date, time.format("%H:%M")),
                None => interview.date.to_string(),
            };
            let timing = classify_interview(interview.date, state.today, state.soon_days);
            lines.push(Line::from(format!("  When:  {} ({})", when, timing.label())));
            lines.push(Line::from(format!("  Venue: {}", interview.venue)));
            if interview.completed {
                let difficulty = interview.difficulty.map(|d| d.as_str()).unwrap_or("-");
                lines.push(Line::from(format!("  Completed, difficulty {}", difficulty)));
            }
            if interview.source == InterviewSource::Legacy {
                lines.push(Line::from(Span::styled(
                    "  (stored inline on the application)",
                    Style::default().fg(Color::DarkGray),
                )));
            }
            if !interview.completed {
                if let Some(link) = calendar::interview_link(interview) {
                    lines.push(Line::from(format!("  Calendar: {}", link)));
                }
            }
            if let Some(notes) = &interview.notes {
                for line in textwrap::fill(notes, 70).lines() {
                    lines.push(Line::from(format!("  {}", line)));
                }
            }
            lines.push(Line::from(""));
        }
        None if item.awaiting_interview_details => {
            lines.push(Line::from(Span::styled(
                "(Interview not confirmed yet: jobtrack interview confirm)",
                Style::default().fg(Color::DarkGray),
            )));
            lines.push(Line::from(""));
        }
        None => {}
    }

    if let Some(notes) = &app.notes {
        lines.push(Line::from(Span::styled(
            "Notes",
            Style::default().add_modifier(Modifier::BOLD),
        )));
        for line in notes.lines() {
            lines.push(Line::from(line.to_string()));
        }
    }

    Text::from(lines)
}
