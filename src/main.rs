//! Reference CLI driver: loads a story file from the command line, wires up
//! a plain terminal `IoProvider`, and runs it to completion. Concrete
//! presentation (windowing, styling, TUIs) is out of scope for this binary;
//! it exists to exercise the engine end to end.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use log::{error, info};

use zmgrotto::error::ZError;
use zmgrotto::interpreter::Interpreter;
use zmgrotto::io::{GameType, IoCommand, IoProvider, IoResult, ProviderCapabilities, Window};
use zmgrotto::vm::{Game, VM};

/// A plain stdout/stdin `IoProvider`. Upper-window text is interleaved with
/// the main window rather than rendered in a separate pane, since splitting
/// the terminal is a presentation concern this binary doesn't take on.
struct TerminalIoProvider {
    current_window: Window,
    save_path: String,
}

impl TerminalIoProvider {
    fn new(save_path: String) -> Self {
        TerminalIoProvider {
            current_window: Window::Main,
            save_path,
        }
    }
}

impl IoProvider for TerminalIoProvider {
    fn command(&mut self, cmd: IoCommand) -> IoResult {
        match cmd {
            IoCommand::Print { text, .. } => {
                print!("{text}");
                let _ = io::stdout().flush();
                IoResult::None
            }
            IoCommand::Status {
                room_name,
                game_type,
                score_one,
                score_two,
            } => {
                let status = match game_type {
                    GameType::Score => format!("{room_name}  Score: {score_one}  Moves: {score_two}"),
                    GameType::Time => format!("{room_name}  Time: {score_one:02}:{score_two:02}"),
                };
                println!("[{status}]");
                IoResult::None
            }
            IoCommand::SetWindow { window } => {
                self.current_window = window;
                IoResult::None
            }
            IoCommand::ClearScreen { .. } => IoResult::None,
            IoCommand::SplitWindow { .. }
            | IoCommand::SetCursor { .. }
            | IoCommand::EraseLine
            | IoCommand::SetTextStyle { .. }
            | IoCommand::SetColour { .. }
            | IoCommand::SetTrueColour { .. } => IoResult::None,
            IoCommand::SetFont { .. } => IoResult::PreviousFont(1),
            IoCommand::GetCursor => IoResult::Cursor { row: 1, column: 1 },
            IoCommand::Read => {
                let mut line = String::new();
                match io::stdin().read_line(&mut line) {
                    Ok(0) => IoResult::Line(String::new()),
                    Ok(_) => IoResult::Line(line.trim_end_matches(['\r', '\n']).to_string()),
                    Err(e) => {
                        error!("stdin read failed: {e}");
                        IoResult::Line(String::new())
                    }
                }
            }
            IoCommand::ReadChar => {
                let mut line = String::new();
                let ch = io::stdin()
                    .read_line(&mut line)
                    .ok()
                    .and_then(|_| line.chars().next())
                    .map(|c| c as u16)
                    .unwrap_or(13);
                IoResult::Char(ch)
            }
            IoCommand::Save { file_data } => {
                match fs::write(&self.save_path, &file_data) {
                    Ok(()) => IoResult::Saved(true),
                    Err(e) => {
                        error!("save failed: {e}");
                        IoResult::Saved(false)
                    }
                }
            }
            IoCommand::Restore => match fs::read(&self.save_path) {
                Ok(data) => IoResult::Restored(Some(data)),
                Err(e) => {
                    error!("restore failed: {e}");
                    IoResult::Restored(None)
                }
            },
            IoCommand::SoundEffect { .. } => IoResult::None,
            IoCommand::Quit => IoResult::None,
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }
}

fn run(story_path: &str) -> Result<(), ZError> {
    let memory = fs::read(story_path)
        .map_err(|e| ZError::Internal(format!("failed to read story file {story_path}: {e}")))?;

    let game = Game::from_memory(memory)?;
    info!(
        "Loaded story file: version {}, release {}",
        game.header.version, game.header.release
    );

    let vm = VM::new(game);
    let save_path = format!("{story_path}.qzl");
    let io = Box::new(TerminalIoProvider::new(save_path));
    let mut interpreter = Interpreter::new(vm, io);

    interpreter.run()
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(story_path) = args.get(1) else {
        eprintln!("usage: {} <story-file>", args[0]);
        return ExitCode::FAILURE;
    };

    match run(story_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.fault_line(0));
            ExitCode::FAILURE
        }
    }
}
