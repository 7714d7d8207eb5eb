use crate::{
    chain::Address,
    client::AppView,
    history::DrawRecord,
    session::SessionStatus,
    sync::{
        Phase,
        format_ether,
    },
    ticket::{
        HIGHEST_NUMBER,
        TICKET_SIZE,
    },
};
use color_eyre::eyre::{
    Result,
    eyre,
};
use crossterm::{
    event::{
        Event,
        EventStream,
        KeyCode,
        KeyEventKind,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use futures::StreamExt;
use itertools::Itertools;
use ratatui::{
    prelude::*,
    widgets::*,
};
use std::io::{
    Stdout,
    stdout,
};

const GRID_WIDTH: u8 = 6;

pub type InputEvents = EventStream;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserEvent {
    Quit,
    Redraw,
    Connect,
    SwitchNetwork,
    Disconnect,
    Toggle(u8),
    QuickPick,
    Clear,
    Submit,
    Refresh,
    Withdraw,
}

#[derive(Debug, Default)]
pub struct UiState {
    mode: Mode,
    // Zero based grid position, number = cursor + 1.
    cursor: u8,
    terminal: Option<Terminal<CrosstermBackend<Stdout>>>,
}

impl UiState {
    pub fn cursor_number(&self) -> u8 {
        self.cursor + 1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    QuitModal,
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(
        stdout(),
        crossterm::terminal::EnterAlternateScreen,
        crossterm::event::EnableMouseCapture
    )?;
    // One persistent Terminal keeps the diffing buffers between draws
    let backend = CrosstermBackend::new(stdout());
    let terminal = Terminal::new(backend)?;
    state.terminal = Some(terminal);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(
        stdout(),
        crossterm::event::DisableMouseCapture,
        crossterm::terminal::LeaveAlternateScreen
    )?;
    Ok(())
}

pub fn input_event_stream() -> InputEvents {
    EventStream::new()
}

pub async fn next_raw_event(events: &mut InputEvents) -> Result<Event> {
    match events.next().await {
        Some(event) => Ok(event?),
        None => Err(eyre!("terminal input stream closed")),
    }
}

pub fn draw(state: &mut UiState, view: &AppView) -> Result<()> {
    if let Some(mut term) = state.terminal.take() {
        let res = term.draw(|f| ui(f, state, view)).map(|_| ());
        state.terminal = Some(term);
        res?;
    }
    Ok(())
}

/// Map a terminal event to what the user asked for. `None` means the event
/// changes nothing on screen.
pub fn interpret_event(state: &mut UiState, event: Event) -> Option<UserEvent> {
    let key = match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => key,
        Event::Resize(..) => return Some(UserEvent::Redraw),
        _ => return None,
    };

    if state.mode == Mode::QuitModal {
        return match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => Some(UserEvent::Quit),
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                state.mode = Mode::Normal;
                Some(UserEvent::Redraw)
            }
            _ => None,
        };
    }

    let row = state.cursor / GRID_WIDTH;
    let col = state.cursor % GRID_WIDTH;
    let last_row = (HIGHEST_NUMBER - 1) / GRID_WIDTH;
    Some(match key.code {
        KeyCode::Char('q') | KeyCode::Esc => {
            state.mode = Mode::QuitModal;
            UserEvent::Redraw
        }
        KeyCode::Left | KeyCode::Char('h') => {
            if col > 0 {
                state.cursor -= 1;
            }
            UserEvent::Redraw
        }
        KeyCode::Right | KeyCode::Char('l') => {
            if col + 1 < GRID_WIDTH && state.cursor + 1 < HIGHEST_NUMBER {
                state.cursor += 1;
            }
            UserEvent::Redraw
        }
        KeyCode::Up | KeyCode::Char('k') => {
            if row > 0 {
                state.cursor -= GRID_WIDTH;
            }
            UserEvent::Redraw
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if row < last_row {
                state.cursor += GRID_WIDTH;
            }
            UserEvent::Redraw
        }
        KeyCode::Char(' ') => UserEvent::Toggle(state.cursor_number()),
        KeyCode::Enter => UserEvent::Submit,
        KeyCode::Char('c') => UserEvent::Connect,
        KeyCode::Char('n') => UserEvent::SwitchNetwork,
        KeyCode::Char('d') => UserEvent::Disconnect,
        KeyCode::Char('p') => UserEvent::QuickPick,
        KeyCode::Char('x') => UserEvent::Clear,
        KeyCode::Char('r') => UserEvent::Refresh,
        KeyCode::Char('w') => UserEvent::Withdraw,
        _ => return None,
    })
}

fn ui(f: &mut Frame, state: &UiState, view: &AppView) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(5),  // session
            Constraint::Length(9),  // lottery + ticket
            Constraint::Min(12),    // history
            Constraint::Length(6),  // status + help
        ])
        .split(f.area());

    draw_session(f, chunks[0], view);
    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(chunks[1]);
    draw_lottery(f, middle[0], view);
    draw_ticket(f, middle[1], state, view);
    draw_history(f, chunks[2], view);
    draw_bottom(f, chunks[3], view);

    if state.mode == Mode::QuitModal {
        let area = centered_rect(40, 20, f.area());
        let block = Block::default().borders(Borders::ALL).title("Confirm Quit");
        f.render_widget(Clear, area);
        f.render_widget(block.clone(), area);
        f.render_widget(Paragraph::new("Quit Fantasy Five? (Y/N)"), block.inner(area));
    }
}

fn draw_session(f: &mut Frame, area: Rect, view: &AppView) {
    let session = &view.session;
    let (label, color) = match session.status {
        SessionStatus::Disconnected => ("Disconnected", Color::DarkGray),
        SessionStatus::Connecting => ("Connecting", Color::Yellow),
        SessionStatus::Connected => ("Connected", Color::Green),
        SessionStatus::WrongNetwork => ("Wrong network", Color::Red),
        SessionStatus::Error => ("Error", Color::Red),
    };
    let account = session
        .address
        .map(short_address)
        .unwrap_or_else(|| String::from("-"));
    let network = match session.network_id {
        Some(id) if id == view.required_network => format!("{id}"),
        Some(id) => format!("{id} (need {})", view.required_network),
        None => String::from("-"),
    };
    let role = if view.is_operator { " | operator" } else { "" };
    let contract = match &view.explorer_url {
        Some(url) => url.clone(),
        None => view.contract.to_string(),
    };
    let lines = vec![
        Line::from(vec![
            Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
            Span::raw(format!(" | Account: {account} | Network: {network}{role}")),
        ]),
        Line::from(format!("Contract: {contract}")),
    ];
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Wallet"));
    f.render_widget(p, area);
}

fn draw_lottery(f: &mut Frame, area: Rect, view: &AppView) {
    let block = Block::default().borders(Borders::ALL).title("Lottery");
    let Some(snap) = &view.snapshot else {
        let hint = if view.session.status == SessionStatus::Connected {
            "Loading lottery state..."
        } else {
            "Connect a wallet to see the lottery"
        };
        let p = Paragraph::new(Line::styled(hint, Style::default().fg(Color::DarkGray)))
            .block(block);
        f.render_widget(p, area);
        return;
    };
    let phase_color = match snap.phase {
        Phase::Open => Color::Green,
        Phase::Calculating => Color::Yellow,
        Phase::Closed => Color::Red,
    };
    let countdown = view
        .countdown
        .map(format_countdown)
        .unwrap_or_else(|| String::from("--:--"));
    let last = snap
        .last_winning_numbers
        .map(|numbers| numbers.iter().join(" "))
        .unwrap_or_else(|| String::from("no draw yet"));
    let lines = vec![
        Line::from(vec![
            Span::raw("Phase: "),
            Span::styled(snap.phase.to_string(), Style::default().fg(phase_color)),
        ]),
        Line::from(format!("Next draw in: {countdown}")),
        Line::from(format!("Jackpot: {} ETH", snap.jackpot_ether())),
        Line::from(format!("Entrance fee: {} ETH", snap.entrance_fee_ether())),
        Line::from(format!("Players this round: {}", snap.player_count)),
        Line::from(format!("Last winning numbers: {last}")),
    ];
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_ticket(f: &mut Frame, area: Rect, state: &UiState, view: &AppView) {
    let mut lines: Vec<Line> = (0..HIGHEST_NUMBER.div_ceil(GRID_WIDTH))
        .map(|row| {
            let first = row * GRID_WIDTH;
            let spans: Vec<Span> = (first..(first + GRID_WIDTH).min(HIGHEST_NUMBER))
                .map(|idx| {
                    let number = idx + 1;
                    let mut style = Style::default();
                    if view.draft.contains(&number) {
                        style = style.fg(Color::Green).add_modifier(Modifier::BOLD);
                    }
                    if idx == state.cursor {
                        style = style.add_modifier(Modifier::REVERSED);
                    }
                    Span::styled(format!(" {number:>2} "), style)
                })
                .collect();
            Line::from(spans)
        })
        .collect();
    lines.push(Line::from(format!(
        "Picked {}/{TICKET_SIZE}: {}",
        view.draft.len(),
        view.draft.iter().join(" ")
    )));
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Ticket"));
    f.render_widget(p, area);
}

fn draw_history(f: &mut Frame, area: Rect, view: &AppView) {
    let block = Block::default().borders(Borders::ALL).title("Previous Draws");
    let lines: Vec<Line> = match &view.history {
        None => vec![Line::styled("Not loaded", Style::default().fg(Color::DarkGray))],
        Some(records) if records.is_empty() => {
            vec![Line::styled("No draws yet", Style::default().fg(Color::DarkGray))]
        }
        Some(records) => records.iter().map(history_line).collect(),
    };
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn history_line(record: &DrawRecord) -> Line<'static> {
    match record {
        DrawRecord::Drawn(summary) => {
            let when = summary
                .drawn_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| String::from("?"));
            let tiers = summary
                .prize_tiers
                .iter()
                .zip(summary.winner_counts.iter())
                .map(|(prize, winners)| format!("{} ETH x{winners}", format_ether(*prize, 4)))
                .join(", ");
            Line::from(format!(
                "#{:<4} {when}  {}  [{tiers}]",
                summary.round_id,
                summary.winning_numbers.iter().map(|n| format!("{n:>2}")).join(" ")
            ))
        }
        DrawRecord::Failed { round_id, error } => Line::styled(
            format!("#{round_id:<4} unavailable: {error}"),
            Style::default().fg(Color::Red),
        ),
    }
}

fn draw_bottom(f: &mut Frame, area: Rect, view: &AppView) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Length(3)])
        .split(area);

    let status = if view.errors.is_empty() {
        Paragraph::new(view.status.clone())
            .style(Style::default().fg(Color::Green))
            .block(Block::default().borders(Borders::ALL).title("Status"))
    } else {
        let lines: Vec<Line> = view.errors.iter().map(|e| Line::from(e.clone())).collect();
        Paragraph::new(lines)
            .style(Style::default().fg(Color::Red))
            .block(Block::default().borders(Borders::ALL).title("Errors"))
    };
    f.render_widget(status, chunks[0]);

    let mut help = String::from(
        "c connect | n switch network | d disconnect | ←↑↓→ move | space pick | p quick pick | x clear | Enter submit | r refresh",
    );
    if view.is_operator {
        help.push_str(" | w withdraw");
    }
    help.push_str(" | q/Esc quit");
    let help = Paragraph::new(help).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, chunks[1]);
}

fn centered_rect(w_percent: u16, h_percent: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - h_percent) / 2),
            Constraint::Percentage(h_percent),
            Constraint::Percentage((100 - h_percent) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - w_percent) / 2),
            Constraint::Percentage(w_percent),
            Constraint::Percentage((100 - w_percent) / 2),
        ])
        .split(popup_layout[1])[1]
}

/// `0x1234...abcd` form of an address.
pub fn short_address(address: Address) -> String {
    let full = address.to_string();
    match (full.get(..6), full.get(full.len().saturating_sub(4)..)) {
        (Some(head), Some(tail)) => format!("{head}...{tail}"),
        _ => full,
    }
}

pub fn format_countdown(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crossterm::event::{
        KeyEvent,
        KeyModifiers,
    };

    fn press(code: KeyCode) -> Event {
        Event::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    #[test]
    fn short_address__full_address__keeps_prefix_and_suffix() {
        let address = Address::repeat_byte(0x12);
        assert_eq!(short_address(address), "0x1212...1212");
    }

    #[test]
    fn format_countdown__under_an_hour__is_minutes_and_seconds() {
        assert_eq!(format_countdown(0), "00:00");
        assert_eq!(format_countdown(65), "01:05");
        assert_eq!(format_countdown(3_661), "1:01:01");
    }

    #[test]
    fn interpret_event__space_on_start__toggles_number_one() {
        let mut state = UiState::default();
        assert_eq!(
            interpret_event(&mut state, press(KeyCode::Char(' '))),
            Some(UserEvent::Toggle(1))
        );
    }

    #[test]
    fn interpret_event__moves__stay_inside_the_grid() {
        // given
        let mut state = UiState::default();

        // when
        interpret_event(&mut state, press(KeyCode::Left));
        interpret_event(&mut state, press(KeyCode::Up));

        // then
        assert_eq!(state.cursor_number(), 1);

        // when
        for _ in 0..10 {
            interpret_event(&mut state, press(KeyCode::Right));
            interpret_event(&mut state, press(KeyCode::Char('j')));
        }

        // then
        assert_eq!(state.cursor_number(), 36);
    }

    #[test]
    fn interpret_event__down_then_right__selects_number_eight() {
        let mut state = UiState::default();
        interpret_event(&mut state, press(KeyCode::Down));
        interpret_event(&mut state, press(KeyCode::Char('l')));
        assert_eq!(
            interpret_event(&mut state, press(KeyCode::Char(' '))),
            Some(UserEvent::Toggle(8))
        );
    }

    #[test]
    fn interpret_event__quit_modal__needs_confirmation() {
        // given
        let mut state = UiState::default();

        // when
        let first = interpret_event(&mut state, press(KeyCode::Char('q')));
        let declined = interpret_event(&mut state, press(KeyCode::Char('n')));
        interpret_event(&mut state, press(KeyCode::Esc));
        let confirmed = interpret_event(&mut state, press(KeyCode::Char('y')));

        // then
        assert_eq!(first, Some(UserEvent::Redraw));
        assert_eq!(declined, Some(UserEvent::Redraw));
        assert_eq!(confirmed, Some(UserEvent::Quit));
    }

    #[test]
    fn interpret_event__key_release__is_ignored() {
        let mut state = UiState::default();
        let mut release = KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE);
        release.kind = KeyEventKind::Release;
        assert_eq!(interpret_event(&mut state, Event::Key(release)), None);
    }

    #[test]
    fn interpret_event__action_keys__map_to_intents() {
        let mut state = UiState::default();
        let cases = [
            ('c', UserEvent::Connect),
            ('n', UserEvent::SwitchNetwork),
            ('p', UserEvent::QuickPick),
            ('x', UserEvent::Clear),
            ('r', UserEvent::Refresh),
            ('w', UserEvent::Withdraw),
        ];
        for (key, expected) in cases {
            assert_eq!(
                interpret_event(&mut state, press(KeyCode::Char(key))),
                Some(expected),
                "key {key}"
            );
        }
        assert_eq!(
            interpret_event(&mut state, press(KeyCode::Enter)),
            Some(UserEvent::Submit)
        );
    }
}
