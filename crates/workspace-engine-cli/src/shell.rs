//! Bridge the local terminal to a terminal session.

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal,
};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use workspace_engine_core::{AgentId, EngineConfig, TerminalEvent};
use workspace_engine_pty::{TerminalError, TerminalSession};
use workspace_engine_session::TerminalManager;

use crate::exit_code;

const INPUT_POLL: Duration = Duration::from_millis(100);

/// Leaves raw mode when dropped, including on error paths.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> anyhow::Result<Self> {
        terminal::enable_raw_mode().context("enabling raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Convert a crossterm key event to terminal input bytes.
#[must_use]
pub fn key_to_bytes(key: &KeyEvent) -> Option<Vec<u8>> {
    let mut bytes = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => match c {
            'a'..='z' => vec![c as u8 - b'a' + 1],
            'A'..='Z' => vec![c as u8 - b'A' + 1],
            ' ' | '@' => vec![0],
            '[' => vec![0x1b],
            '\\' => vec![0x1c],
            ']' => vec![0x1d],
            _ => return None,
        },
        KeyCode::Char(c) => {
            let mut buf = [0; 4];
            c.encode_utf8(&mut buf).as_bytes().to_vec()
        }
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::F(n) => match n {
            1 => b"\x1bOP".to_vec(),
            2 => b"\x1bOQ".to_vec(),
            3 => b"\x1bOR".to_vec(),
            4 => b"\x1bOS".to_vec(),
            5 => b"\x1b[15~".to_vec(),
            6 => b"\x1b[17~".to_vec(),
            7 => b"\x1b[18~".to_vec(),
            8 => b"\x1b[19~".to_vec(),
            9 => b"\x1b[20~".to_vec(),
            10 => b"\x1b[21~".to_vec(),
            11 => b"\x1b[23~".to_vec(),
            12 => b"\x1b[24~".to_vec(),
            _ => return None,
        },
        _ => return None,
    };
    if key.modifiers.contains(KeyModifiers::ALT) {
        bytes.insert(0, 0x1b);
    }
    Some(bytes)
}

/// Forward local key and resize events until `stop` is set or the session stops accepting input.
fn forward_input(session: &TerminalSession, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        match event::poll(INPUT_POLL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "Polling terminal input failed");
                return;
            }
        }
        let result = match event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                key_to_bytes(&key).map_or(Ok(()), |bytes| session.write(&bytes))
            }
            Ok(Event::Paste(text)) => session.write(text.as_bytes()),
            Ok(Event::Resize(cols, rows)) => {
                session.resize(cols, rows);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "Reading terminal input failed");
                return;
            }
        };
        match result {
            Ok(()) => {}
            Err(TerminalError::NotRunning) => return,
            Err(e) => tracing::debug!(error = %e, "Forwarding input failed"),
        }
    }
}

/// Open a shell in `agent`'s container on the local terminal.
///
/// # Errors
/// Returns error if the session cannot start or local output fails.
pub async fn run(config: &EngineConfig, agent: &AgentId, init: Option<String>) -> anyhow::Result<ExitCode> {
    let manager = TerminalManager::from_config(config);
    let (cols, rows) = terminal::size().unwrap_or((0, 0));
    let session = manager
        .create(agent, cols, rows, init)
        .await
        .with_context(|| format!("starting shell for agent {agent}"))?;

    let raw_mode = RawModeGuard::enable()?;
    let stop = Arc::new(AtomicBool::new(false));
    let input = {
        let session = Arc::clone(&session);
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || forward_input(&session, &stop))
    };

    let mut events = session.subscribe();
    let mut stdout = tokio::io::stdout();
    let mut output = Ok(());
    while let Some(event) = events.next().await {
        let TerminalEvent::Output(bytes) = event else {
            break;
        };
        if let Err(e) = async {
            stdout.write_all(&bytes).await?;
            stdout.flush().await
        }
        .await
        {
            output = Err(e);
            break;
        }
    }

    stop.store(true, Ordering::Release);
    let _ = input.await;
    manager.terminate_all().await;
    drop(raw_mode);

    output.context("writing terminal output")?;
    Ok(exit_code(session.exit_code()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn test_key_to_bytes() {
        assert_eq!(key_to_bytes(&key(KeyCode::Char('a'), KeyModifiers::NONE)), Some(b"a".to_vec()));
        assert_eq!(key_to_bytes(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)), Some(vec![3]));
        assert_eq!(key_to_bytes(&key(KeyCode::Char('é'), KeyModifiers::NONE)), Some("é".as_bytes().to_vec()));
        assert_eq!(key_to_bytes(&key(KeyCode::Enter, KeyModifiers::NONE)), Some(vec![b'\r']));
        assert_eq!(key_to_bytes(&key(KeyCode::Up, KeyModifiers::NONE)), Some(b"\x1b[A".to_vec()));
        assert_eq!(key_to_bytes(&key(KeyCode::Char('b'), KeyModifiers::ALT)), Some(b"\x1bb".to_vec()));
        assert_eq!(key_to_bytes(&key(KeyCode::F(13), KeyModifiers::NONE)), None);
    }
}
