#![cfg(feature = "tui")]

use crate::conversation::{Conversation, Role};
use crate::session::{ResetHandle, Session, TurnOutcome};
use anyhow::Context;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Terminal;
use std::io;
use tokio::sync::mpsc;

const HELP: &str = "Type a message and press Enter. Commands: /quit, /reset";

#[derive(Debug)]
enum SessionCmd {
    Submit(String),
    Reset,
}

#[derive(Debug)]
enum SessionUpdate {
    Conversation(Conversation),
    Finished(Result<TurnOutcome, String>),
}

/// Screen state owned by the render loop. The conversation here is a snapshot; the
/// session task is the only writer of the real one.
struct Screen {
    conversation: Conversation,
    input: String,
    notice: Option<String>,
    busy: bool,
}

pub async fn run_tui(session: Session) -> anyhow::Result<()> {
    let reset = session.reset_handle();
    let mut screen = Screen {
        conversation: session.conversation().clone(),
        input: String::new(),
        notice: Some(HELP.to_string()),
        busy: false,
    };

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<SessionCmd>();
    let (upd_tx, mut upd_rx) = mpsc::unbounded_channel::<SessionUpdate>();
    let driver = tokio::spawn(drive_session(session, cmd_rx, upd_tx));

    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("enter alt screen")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<Event>();
    std::thread::spawn(move || {
        while let Ok(ev) = crossterm::event::read() {
            if ev_tx.send(ev).is_err() {
                break;
            }
        }
    });

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(33));

    let res = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = draw(&mut terminal, &screen) {
                    break Err(e);
                }
            }
            Some(ev) = ev_rx.recv() => {
                if let Event::Key(key) = ev {
                    if handle_key(key, &mut screen, &cmd_tx, &reset) {
                        break Ok(());
                    }
                }
            }
            Some(update) = upd_rx.recv() => {
                match update {
                    SessionUpdate::Conversation(conv) => screen.conversation = conv,
                    SessionUpdate::Finished(Ok(_)) => screen.busy = false,
                    SessionUpdate::Finished(Err(e)) => {
                        screen.busy = false;
                        screen.notice = Some(format!("error: {e}"));
                    }
                }
            }
        }
    };

    driver.abort();
    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();

    res
}

/// Runs turns one after another; a second submission waits for the first to finish.
async fn drive_session(
    mut session: Session,
    mut cmds: mpsc::UnboundedReceiver<SessionCmd>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
) {
    while let Some(cmd) = cmds.recv().await {
        match cmd {
            SessionCmd::Submit(text) => {
                let res = session
                    .submit(&text, |conv| {
                        let _ = updates.send(SessionUpdate::Conversation(conv.clone()));
                    })
                    .await
                    .map_err(|e| format!("{e:#}"));
                let _ = updates.send(SessionUpdate::Finished(res));
            }
            SessionCmd::Reset => {
                session.reset();
                let _ = updates.send(SessionUpdate::Conversation(session.conversation().clone()));
            }
        }
    }
}

/// Returns true when the UI should exit.
fn handle_key(
    key: KeyEvent,
    screen: &mut Screen,
    cmds: &mpsc::UnboundedSender<SessionCmd>,
    reset: &ResetHandle,
) -> bool {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return true;
    }

    match key.code {
        KeyCode::Esc => return true,
        KeyCode::Char(c) => screen.input.push(c),
        KeyCode::Backspace => {
            screen.input.pop();
        }
        KeyCode::Enter => {
            let msg = screen.input.trim().to_string();
            if msg.is_empty() {
                return false;
            }

            if msg == "/quit" {
                return true;
            }
            if msg == "/reset" || msg == "/clear" {
                screen.input.clear();
                reset.reset();
                let _ = cmds.send(SessionCmd::Reset);
                screen.notice = Some("conversation cleared".to_string());
                return false;
            }

            if screen.busy {
                screen.notice = Some("(streaming in progress; wait for completion)".to_string());
                return false;
            }

            let text = std::mem::take(&mut screen.input);
            screen.busy = true;
            screen.notice = None;
            let _ = cmds.send(SessionCmd::Submit(text));
        }
        _ => {}
    }

    false
}

fn draw(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, screen: &Screen) -> anyhow::Result<()> {
    terminal.draw(|f| {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(3)])
            .split(f.area());

        let mut text = Text::default();
        if let Some(notice) = &screen.notice {
            text.lines.push(Line::styled(notice.clone(), Style::default().add_modifier(Modifier::ITALIC)));
            text.lines.push(Line::from(""));
        }
        for m in screen.conversation.messages() {
            let style = match m.role {
                Role::User => Style::default().add_modifier(Modifier::BOLD),
                Role::Assistant | Role::System => Style::default(),
            };
            text.lines.push(Line::styled(format!("{}: ", m.role), style));
            text.lines.extend(Text::from(m.content.clone()).lines);
            text.lines.push(Line::from(""));
        }

        let title = if screen.busy { "wizard (streaming...)" } else { "wizard" };
        let chat = Paragraph::new(text)
            .block(Block::default().borders(Borders::ALL).title(title))
            .wrap(Wrap { trim: false });

        let input_w = Paragraph::new(screen.input.as_str())
            .block(Block::default().borders(Borders::ALL).title("input"));

        f.render_widget(chat, chunks[0]);
        f.render_widget(input_w, chunks[1]);

        let x = chunks[1].x + 1 + screen.input.chars().count() as u16;
        let y = chunks[1].y + 1;
        f.set_cursor_position((x.min(chunks[1].x + chunks[1].width.saturating_sub(2)), y));
    })?;
    Ok(())
}
