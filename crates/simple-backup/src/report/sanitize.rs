use std::iter::Peekable;
use std::str::Chars;

const MAX_LOG_CHARS: usize = 4096;
const REDACTED: &str = "[redacted]";

// Copy engine output is echoed into the journal/terminal, so terminal escapes
// (CSI, OSC, DCS-style strings) and bidi/format controls are dropped.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut chars = input.chars().peekable();
    let mut count = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => skip_escape(&mut chars),
            '\r' | '\n' => {}
            '\t' => {
                out.push(' ');
                count += 1;
            }
            c if c.is_control() || is_format_control(c) => {}
            c => {
                out.push(c);
                count += 1;
            }
        }
        if count >= MAX_LOG_CHARS {
            if chars.peek().is_some() {
                out.push_str(" ...[truncated]");
            }
            break;
        }
    }
    out
}

fn skip_escape(chars: &mut Peekable<Chars<'_>>) {
    match chars.next() {
        Some('[') => {
            // CSI: parameters until a final byte in '@'..='~'.
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
        Some(']') => skip_string(chars, true),
        Some('P' | 'X' | '^' | '_') => skip_string(chars, false),
        _ => {}
    }
}

// OSC ends on BEL or ST (ESC \); DCS/SOS/PM/APC only on ST.
fn skip_string(chars: &mut Peekable<Chars<'_>>, bel_terminates: bool) {
    while let Some(c) = chars.next() {
        if bel_terminates && c == '\x07' {
            return;
        }
        if c == '\x1b' && chars.peek() == Some(&'\\') {
            chars.next();
            return;
        }
    }
}

fn is_format_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

// Masks secrets (password, passphrase) that a transport might echo back.
#[derive(Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn add(&mut self, secret: &str) {
        if !secret.is_empty() {
            self.secrets.push(secret.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn apply(&self, line: &str) -> String {
        let mut out = line.to_string();
        for s in &self.secrets {
            if out.contains(s.as_str()) {
                out = out.replace(s.as_str(), REDACTED);
            }
        }
        out
    }
}

impl Drop for Redactor {
    fn drop(&mut self) {
        for s in self.secrets.drain(..) {
            crate::ssh::wipe(s);
        }
    }
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Redactor({} secrets)", self.secrets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_and_title_sequences() {
        let got = sanitize_log_line("sent \u{1b}[1m12\u{1b}[0m bytes\u{1b}]0;rsync\u{7}!");
        assert_eq!(got, "sent 12 bytes!");
    }

    #[test]
    fn strips_dcs_until_string_terminator() {
        assert_eq!(sanitize_log_line("a\u{1b}Pq#0\u{1b}\\b"), "ab");
    }

    #[test]
    fn tabs_become_spaces_and_controls_vanish() {
        assert_eq!(sanitize_log_line("x\ty\r\n\u{202e}z\u{7}"), "x yz");
    }

    #[test]
    fn long_lines_are_truncated() {
        let long = "a".repeat(MAX_LOG_CHARS + 10);
        let got = sanitize_log_line(&long);
        let kept = got
            .strip_suffix(" ...[truncated]")
            .expect("truncation marker");
        assert_eq!(kept.len(), MAX_LOG_CHARS);
    }

    #[test]
    fn redactor_masks_every_occurrence() {
        let mut r = Redactor::default();
        r.add("hunter2");
        r.add("");
        assert_eq!(
            r.apply("password hunter2 rejected (hunter2)"),
            "password [redacted] rejected ([redacted])"
        );
        assert_eq!(r.apply("nothing here"), "nothing here");
    }
}
