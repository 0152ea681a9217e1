//! Exec command handler.

use anyhow::{Context, Result};
use docchat_core::config::Config;
use docchat_core::core::events::{EventSender, create_event_channel};
use docchat_core::core::session::ChatSession;

use crate::output::{OutputMode, spawn_printer_task};

pub struct ExecRunOptions<'a> {
    pub prompt: &'a str,
    pub config: &'a Config,
    pub model_override: Option<&'a str>,
    pub json: bool,
}

pub async fn run(options: ExecRunOptions<'_>) -> Result<()> {
    let prompt = options.prompt.trim();
    if prompt.is_empty() {
        anyhow::bail!("Prompt is empty");
    }

    let mut session = ChatSession::from_config(options.config, options.model_override)?;

    let mode = if options.json {
        OutputMode::Json
    } else {
        OutputMode::Blocks
    };
    let (tx, rx) = create_event_channel();
    let printer = spawn_printer_task(rx, mode);

    let sender = EventSender::new(tx);
    let result = session.run_turn(prompt, &sender).await;

    // Close the channel so the printer drains and exits.
    drop(sender);
    let _ = printer.await;

    result.context("execute prompt")?;
    Ok(())
}
