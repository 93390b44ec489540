//! A headless `IoProvider` that buffers output and returns canned input,
//! for use in tests and other non-interactive contexts.

use super::{IoCommand, IoProvider, IoResult, Window};
use log::debug;

/// Collects all output without displaying it; feeds input from a
/// pre-loaded queue. Useful for automated testing and CI.
#[derive(Debug, Default)]
pub struct HeadlessIoProvider {
    buffer: Vec<String>,
    current_line: String,
    cursor: (u16, u16),
    upper_window_lines: u16,
    current_window: Window,
    pending_input: std::collections::VecDeque<String>,
    pending_chars: std::collections::VecDeque<u16>,
    saved_games: Vec<Vec<u8>>,
}

impl HeadlessIoProvider {
    pub fn new() -> Self {
        Self {
            cursor: (1, 1),
            ..Default::default()
        }
    }

    /// Queue a line of input that a future `read` command will consume.
    pub fn queue_line(&mut self, line: impl Into<String>) {
        self.pending_input.push_back(line.into());
    }

    /// Queue a ZSCII character that a future `read_char` command will consume.
    pub fn queue_char(&mut self, ch: u16) {
        self.pending_chars.push_back(ch);
    }

    pub fn output(&self) -> String {
        let mut out = self.buffer.join("\n");
        if !self.current_line.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.current_line);
        }
        out
    }

    fn flush_line(&mut self) {
        if !self.current_line.is_empty() || self.buffer.is_empty() {
            self.buffer.push(std::mem::take(&mut self.current_line));
        }
    }

    fn print(&mut self, text: &str) {
        if !text.contains('\n') {
            self.current_line.push_str(text);
            return;
        }
        let parts: Vec<&str> = text.split('\n').collect();
        for (i, part) in parts.iter().enumerate() {
            self.current_line.push_str(part);
            if i < parts.len() - 1 {
                self.flush_line();
            }
        }
    }
}

impl IoProvider for HeadlessIoProvider {
    fn command(&mut self, cmd: IoCommand) -> IoResult {
        match cmd {
            IoCommand::Print { text, .. } => {
                self.print(&text);
                IoResult::None
            }
            IoCommand::Status { room_name, score_one, score_two, .. } => {
                self.buffer.push(format!(
                    "[STATUS: {room_name} {score_one} {score_two}]"
                ));
                IoResult::None
            }
            IoCommand::SplitWindow { lines } => {
                self.upper_window_lines = lines;
                IoResult::None
            }
            IoCommand::SetWindow { window } => {
                self.current_window = window;
                IoResult::None
            }
            IoCommand::ClearScreen { .. } => {
                self.buffer.clear();
                self.current_line.clear();
                IoResult::None
            }
            IoCommand::SetCursor { line, column } => {
                self.cursor = (line, column);
                IoResult::None
            }
            IoCommand::GetCursor => IoResult::Cursor {
                row: self.cursor.0,
                column: self.cursor.1,
            },
            IoCommand::EraseLine => {
                self.buffer.push("[ERASE_LINE]".to_string());
                IoResult::None
            }
            IoCommand::SetTextStyle { .. }
            | IoCommand::SetColour { .. }
            | IoCommand::SetTrueColour { .. }
            | IoCommand::SoundEffect { .. } => IoResult::None,
            IoCommand::SetFont { .. } => IoResult::PreviousFont(1),
            IoCommand::Read => {
                let line = self.pending_input.pop_front().unwrap_or_default();
                debug!("headless read() -> {line:?}");
                IoResult::Line(line)
            }
            IoCommand::ReadChar => {
                let ch = self.pending_chars.pop_front().unwrap_or(13);
                IoResult::Char(ch)
            }
            IoCommand::Save { file_data } => {
                self.saved_games.push(file_data);
                IoResult::Saved(true)
            }
            IoCommand::Restore => {
                IoResult::Restored(self.saved_games.last().cloned())
            }
            IoCommand::Quit => IoResult::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_accumulates_lines() {
        let mut io = HeadlessIoProvider::new();
        io.command(IoCommand::Print {
            window: Window::Main,
            text: "hello\nworld".to_string(),
        });
        assert_eq!(io.output(), "hello\nworld");
    }

    #[test]
    fn read_drains_queued_input() {
        let mut io = HeadlessIoProvider::new();
        io.queue_line("take lamp");
        match io.command(IoCommand::Read) {
            IoResult::Line(l) => assert_eq!(l, "take lamp"),
            _ => panic!("expected Line"),
        }
    }

    #[test]
    fn save_then_restore_round_trips() {
        let mut io = HeadlessIoProvider::new();
        let data = vec![1, 2, 3];
        io.command(IoCommand::Save { file_data: data.clone() });
        match io.command(IoCommand::Restore) {
            IoResult::Restored(Some(d)) => assert_eq!(d, data),
            other => panic!("unexpected {other:?}"),
        }
    }
}
