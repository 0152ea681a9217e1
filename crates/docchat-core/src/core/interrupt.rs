use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::sync::Notify;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static INTERRUPT_NOTIFY: OnceLock<Notify> = OnceLock::new();

/// Exit code used when the process stops on Ctrl+C.
pub const EXIT_CODE: i32 = 130;

#[derive(Debug)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

/// Installs the Ctrl+C handler.
///
/// The handler only sets the interrupt flag and wakes waiters. Printing the
/// interruption is left to whoever renders the turn.
///
/// # Errors
/// Returns an error if a handler is already installed.
pub fn init() -> Result<()> {
    ctrlc::set_handler(trigger_ctrl_c).context("Error setting Ctrl+C handler")
}

fn notify() -> &'static Notify {
    INTERRUPT_NOTIFY.get_or_init(Notify::new)
}

/// Triggers an interrupt, force-exiting on a second Ctrl+C.
pub fn trigger_ctrl_c() {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        std::process::exit(EXIT_CODE);
    }
    notify().notify_waiters();
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Waits until an interrupt is triggered.
pub async fn wait_for_interrupt() {
    loop {
        // Register before checking the flag so a trigger in between is not lost.
        let notified = notify().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if is_interrupted() {
            return;
        }
        notified.await;
    }
}

/// Clears the interrupt flag, e.g. after the REPL has reported it.
pub fn reset() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

