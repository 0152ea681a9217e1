//! External command renderer: payload on stdin, markup on stdout.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::reconciler::dispatch::RenderError;

const MAX_STDERR_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    /// Builds a renderer from an argv list. Returns `None` for an empty list.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        let program = program.trim();
        if program.is_empty() {
            return None;
        }
        Some(Self {
            program: program.to_string(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs the command with `input` on stdin and returns its stdout.
    ///
    /// # Errors
    /// Returns `RenderError::Failed` if the command cannot start or exits non-zero.
    pub async fn run(&self, input: &str) -> Result<String, RenderError> {
        debug!(program = %self.program, bytes = input.len(), "Running external renderer");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RenderError::failed(format!("failed to start {}: {e}", self.program)))?;

        // Feed stdin while stdout/stderr drain.
        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                // A renderer that exits without reading stdin closes the pipe
                // early; its exit status is what matters.
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(program = %self.program, error = %e, "Renderer closed stdin early");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| RenderError::failed(format!("{} did not finish: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(RenderError::failed(format!(
                "{} exited with {code}: {stderr}",
                self.program
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
