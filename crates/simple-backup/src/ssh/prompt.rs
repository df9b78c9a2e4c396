use std::io::{self, BufRead, IsTerminal, Write};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use super::Secret;
use crate::error::{Error, Result};

pub trait Prompter {
    // Ok(None) when nobody can answer (non-interactive run or no terminal).
    fn secret(&mut self, prompt: &str) -> Result<Option<Secret>>;

    fn confirm(&mut self, question: &str) -> Result<bool>;
}

// Unattended runs: every prompt is declined.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl Prompter for NonInteractive {
    fn secret(&mut self, _prompt: &str) -> Result<Option<Secret>> {
        Ok(None)
    }

    fn confirm(&mut self, _question: &str) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        enable_raw_mode().map_err(|e| Error::msg(format!("cannot read from terminal: {e}")))?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

impl Prompter for TerminalPrompter {
    fn secret(&mut self, prompt: &str) -> Result<Option<Secret>> {
        if !io::stdin().is_terminal() {
            return Ok(None);
        }
        let mut err = io::stderr();
        let _ = write!(err, "{prompt}");
        let _ = err.flush();

        let mut buf = String::new();
        let cancelled = {
            let _raw = RawModeGuard::enable()?;
            read_hidden(&mut buf)?
        };
        let _ = writeln!(err);
        if cancelled {
            super::wipe(buf);
            return Err(Error::auth("input cancelled"));
        }
        Ok(Some(Secret::new(buf)))
    }

    fn confirm(&mut self, question: &str) -> Result<bool> {
        if !io::stdin().is_terminal() {
            return Ok(false);
        }
        let mut err = io::stderr();
        let _ = write!(err, "{question} (Y/N) ");
        let _ = err.flush();
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line
            .trim_start()
            .chars()
            .next()
            .is_some_and(|c| c.eq_ignore_ascii_case(&'y')))
    }
}

// Returns true when the user aborted with Ctrl-C / Esc.
fn read_hidden(buf: &mut String) -> Result<bool> {
    loop {
        let ev = event::read().map_err(|e| Error::msg(format!("terminal read failed: {e}")))?;
        let Event::Key(key) = ev else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(false),
            KeyCode::Esc => return Ok(true),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return Ok(true),
            KeyCode::Backspace => {
                buf.pop();
            }
            KeyCode::Char(c) => buf.push(c),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_interactive_declines_everything() {
        let mut p = NonInteractive;
        assert!(p.secret("password: ").expect("secret").is_none());
        assert!(!p.confirm("continue?").expect("confirm"));
    }
}
