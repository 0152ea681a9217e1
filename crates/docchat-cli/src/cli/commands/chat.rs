//! Line-based interactive chat.

use std::io::Write;

use anyhow::{Context, Result};
use docchat_core::config::Config;
use docchat_core::core::events::{EventSender, create_event_channel};
use docchat_core::core::interrupt::{self, InterruptedError};
use docchat_core::core::session::ChatSession;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::output::{OutputMode, spawn_printer_task};

const QUIT_COMMANDS: &[&str] = &[":q", ":quit", ":exit"];
const RESET_COMMAND: &str = ":reset";

/// What to do with one line of input.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Skip,
    Quit,
    Reset,
    Prompt(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        Input::Skip
    } else if QUIT_COMMANDS.contains(&line) {
        Input::Quit
    } else if line == RESET_COMMAND {
        Input::Reset
    } else {
        Input::Prompt(line)
    }
}

pub async fn run(config: &Config, model_override: Option<&str>) -> Result<()> {
    let mut session = ChatSession::from_config(config, model_override)?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!(
        "docchat ({}). Type :q to quit, :reset to start over.",
        session.model()
    );

    loop {
        prompt_marker();
        let Some(line) = lines.next_line().await.context("read stdin")? else {
            break;
        };

        match parse_input(&line) {
            Input::Skip => {}
            Input::Quit => break,
            Input::Reset => {
                session.reset();
                eprintln!("History cleared.");
            }
            Input::Prompt(prompt) => run_one(&mut session, prompt).await,
        }
    }
    Ok(())
}

/// Runs one turn. Errors are reported and the loop continues.
async fn run_one(session: &mut ChatSession, prompt: &str) {
    interrupt::reset();

    let (tx, rx) = create_event_channel();
    let printer = spawn_printer_task(rx, OutputMode::Blocks);
    let sender = EventSender::new(tx);
    let result = session.run_turn(prompt, &sender).await;
    drop(sender);
    let _ = printer.await;

    match result {
        Ok(_) => {}
        Err(e) if e.is::<InterruptedError>() => interrupt::reset(),
        // The printer already reported the failure.
        Err(e) => tracing::debug!(error = %e, "Turn failed"),
    }
}

fn prompt_marker() {
    let mut err = std::io::stderr();
    let _ = write!(err, "> ");
    let _ = err.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("   "), Input::Skip);
        assert_eq!(parse_input(":q"), Input::Quit);
        assert_eq!(parse_input(" :exit "), Input::Quit);
        assert_eq!(parse_input(":reset"), Input::Reset);
        assert_eq!(parse_input("  draw a flowchart "), Input::Prompt("draw a flowchart"));
    }
}
