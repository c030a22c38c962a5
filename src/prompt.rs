//! Blocking stdin prompts. The pipeline is single-operator and fully
//! synchronous, so these simply block until input arrives.

use anyhow::Result;
use std::io::{self, Write};

pub fn line(msg: &str) -> Result<String> {
    print!("{msg}");
    io::stdout().flush()?;
    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_string())
}

pub fn yes_no(msg: &str) -> Result<bool> {
    let answer = line(&format!("{msg} [y/n]: "))?;
    Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
}

/// Reads a secret without echoing it back. Falls back to a plain read when
/// stdin is not a terminal (piped input, tests).
pub fn secret(msg: &str) -> Result<String> {
    use crossterm::event::{self, Event, KeyCode, KeyEventKind};
    use crossterm::terminal;

    print!("{msg}");
    io::stdout().flush()?;

    if terminal::enable_raw_mode().is_err() {
        let mut buf = String::new();
        io::stdin().read_line(&mut buf)?;
        return Ok(buf.trim().to_string());
    }

    let mut buf = String::new();
    let res = loop {
        match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => match key.code {
                KeyCode::Enter => break Ok(buf.clone()),
                KeyCode::Backspace => {
                    buf.pop();
                }
                KeyCode::Char(c) => buf.push(c),
                _ => {}
            },
            Ok(_) => {}
            Err(err) => break Err(err.into()),
        }
    };
    terminal::disable_raw_mode()?;
    println!();
    res
}
