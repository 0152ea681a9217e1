//! Timeline command handler.

use anyhow::{Context, Result};
use docchat_core::config::Config;
use docchat_core::core::interrupt;
use docchat_core::timeline::{HttpTimelineSource, TimelineMonitor, TimelineUpdate};
use tokio::sync::mpsc;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

pub async fn run(config: &Config, url_override: Option<&str>) -> Result<()> {
    let url = url_override.unwrap_or(&config.timeline.url);
    let source = HttpTimelineSource::new(url)?;
    eprintln!("Following timeline at {}", source.base_url());

    let monitor = TimelineMonitor::new(source, &config.timeline);
    let (tx, mut rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let handle = tokio::spawn(monitor.run(tx));

    loop {
        tokio::select! {
            biased;
            () = interrupt::wait_for_interrupt() => {
                handle.abort();
                return Ok(());
            }
            update = rx.recv() => match update {
                Some(update) => print_update(&update),
                None => break,
            },
        }
    }

    handle
        .await
        .context("timeline task")?
        .context("timeline backend unavailable")
}

fn print_update(update: &TimelineUpdate) {
    match update {
        TimelineUpdate::Status(status) => eprintln!("[{status}]"),
        TimelineUpdate::Entry(entry) => {
            let time = entry.timestamp.format("%H:%M:%S");
            let state = if entry.data.state.is_empty() {
                String::new()
            } else {
                format!(" {}", entry.data.state)
            };
            println!("{time} {:<20}{state} {}", entry.event.label(), entry.data.file);
        }
    }
}
