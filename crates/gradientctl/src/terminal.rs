//! Interactive terminal frontend.
//!
//! `Interactive` owns the alternate screen and raw mode for its lifetime and
//! forwards key presses to the runner from a dedicated input thread.

use anyhow::Result;
use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute, queue,
    terminal::{self, disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use gradient_common::{Frontend, Message, Snapshot, UserInput};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::display;

const INPUT_POLL: Duration = Duration::from_millis(100);

const FALLBACK_WIDTH: usize = 80;

pub struct Interactive {
    started: Instant,
    stop: Arc<AtomicBool>,
    input: Option<JoinHandle<()>>,
}

impl Interactive {
    pub fn start(tx: UnboundedSender<Message>) -> Result<Self> {
        enable_raw_mode().map_err(|e| {
            anyhow::anyhow!(
                "Failed to enable raw mode: {}. Use --plain outside a real terminal.",
                e
            )
        })?;

        let mut stdout = io::stdout();
        if let Err(e) = execute!(stdout, EnterAlternateScreen, cursor::Hide) {
            let _ = disable_raw_mode();
            return Err(anyhow::anyhow!("Failed to initialize terminal: {}", e));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let input = spawn_input_thread(tx, stop.clone());

        Ok(Self {
            started: Instant::now(),
            stop,
            input: Some(input),
        })
    }

    fn draw(&self, snapshot: &Snapshot) -> io::Result<()> {
        let width = terminal::size()
            .map(|(w, _)| w as usize)
            .unwrap_or(FALLBACK_WIDTH);
        let text = display::render(snapshot, self.started.elapsed(), width);

        let mut stdout = io::stdout();
        queue!(
            stdout,
            cursor::MoveTo(0, 0),
            terminal::Clear(terminal::ClearType::All)
        )?;
        // Raw mode: no implicit carriage return
        stdout.write_all(text.replace('\n', "\r\n").as_bytes())?;
        stdout.flush()
    }
}

impl Frontend for Interactive {
    fn render(&mut self, snapshot: &Snapshot) {
        if let Err(e) = self.draw(snapshot) {
            debug!("Redraw failed: {}", e);
        }
    }
}

impl Drop for Interactive {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.input.take() {
            let _ = handle.join();
        }
        let _ = disable_raw_mode();
        if let Err(e) = execute!(io::stdout(), cursor::Show, LeaveAlternateScreen) {
            warn!("Failed to restore terminal: {}", e);
        }
    }
}

fn key_to_input(code: KeyCode, modifiers: KeyModifiers) -> Option<UserInput> {
    match code {
        KeyCode::Char('q') | KeyCode::Esc => Some(UserInput::Quit),
        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => Some(UserInput::Quit),
        KeyCode::Tab => Some(UserInput::ToggleDetails),
        _ => None,
    }
}

fn spawn_input_thread(tx: UnboundedSender<Message>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            match event::poll(INPUT_POLL) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!("Input poll failed: {}", e);
                    break;
                }
            }
            let key = match event::read() {
                Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => key,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Input read failed: {}", e);
                    break;
                }
            };
            if let Some(input) = key_to_input(key.code, key.modifiers) {
                if tx.send(Message::UserInput(input)).is_err() {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mapping() {
        assert_eq!(
            key_to_input(KeyCode::Char('q'), KeyModifiers::NONE),
            Some(UserInput::Quit)
        );
        assert_eq!(key_to_input(KeyCode::Esc, KeyModifiers::NONE), Some(UserInput::Quit));
        assert_eq!(
            key_to_input(KeyCode::Char('c'), KeyModifiers::CONTROL),
            Some(UserInput::Quit)
        );
        assert_eq!(key_to_input(KeyCode::Char('c'), KeyModifiers::NONE), None);
        assert_eq!(
            key_to_input(KeyCode::Tab, KeyModifiers::NONE),
            Some(UserInput::ToggleDetails)
        );
    }
}
