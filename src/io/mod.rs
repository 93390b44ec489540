//! The I/O provider contract: a single typed command/result sum type and the
//! trait a concrete presentation layer implements, plus two reference
//! providers (`headless`, `logging`) used by tests and diagnostics.
//!
//! Concrete terminal/TUI/GUI rendering is out of scope for this crate; the
//! engine only depends on this trait, injected at `Interpreter::new`.

pub mod headless;
pub mod logging;

/// Window selector shared by several commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Window {
    #[default]
    Main,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameType {
    Score,
    Time,
}

/// Every request the engine can make of a presentation layer, one variant per
/// row of the I/O provider contract.
#[derive(Debug, Clone)]
pub enum IoCommand {
    Print { window: Window, text: String },
    Status {
        room_name: String,
        game_type: GameType,
        score_one: i16,
        score_two: i16,
    },
    SplitWindow { lines: u16 },
    SetWindow { window: Window },
    /// -2 = unsplit+clear, -1 = clear all, 0 = clear main, 1 = clear upper
    ClearScreen { window_id: i16 },
    SetCursor { line: u16, column: u16 },
    GetCursor,
    EraseLine,
    SetTextStyle { style_bits: u16 },
    SetColour { fg: u8, bg: u8 },
    SetTrueColour { fg: u16, bg: u16 },
    SetFont { font_id: u8 },
    Read,
    ReadChar,
    Save { file_data: Vec<u8> },
    Restore,
    SoundEffect {
        number: u16,
        effect: Option<u16>,
        volume: Option<u16>,
        routine: Option<u16>,
    },
    Quit,
}

/// Every answer a provider can give back, matching `IoCommand`'s result column.
#[derive(Debug, Clone)]
pub enum IoResult {
    None,
    Cursor { row: u16, column: u16 },
    PreviousFont(u8),
    Line(String),
    Char(u16),
    Saved(bool),
    Restored(Option<Vec<u8>>),
}

/// A presentation layer. Implementors never see VM internals, only this
/// typed command/result boundary.
pub trait IoProvider {
    fn command(&mut self, cmd: IoCommand) -> IoResult;

    /// Whether the provider can render colour/bold/italic, used to set the
    /// header's capability flags on load.
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderCapabilities {
    pub colour: bool,
    pub bold: bool,
    pub italic: bool,
    pub timed_input: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        ProviderCapabilities {
            colour: false,
            bold: false,
            italic: false,
            timed_input: false,
        }
    }
}
