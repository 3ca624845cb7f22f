use std::{process::Stdio, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use resources::config::Method;
use tokio::{io::AsyncWriteExt, process::Command, time::timeout};

use super::{truncate, Execute};

/// Runs the method as a subprocess with the payload on standard input.
///
/// The payload always goes over stdin, never argv, so JSON containing
/// quotes survives intact.
#[derive(Debug, Default)]
pub struct ShellExecute;

#[async_trait]
impl Execute for ShellExecute {
    async fn execute(&self, method: &Method, payload: &str) -> Result<String> {
        let shell = method
            .shell
            .as_ref()
            .ok_or_else(|| anyhow!("shell method has no shell block"))?;
        let mut child = Command::new(&shell.entrypoint)
            .args(&shell.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", shell.entrypoint))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("no stdin handle for {}", shell.entrypoint))?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .with_context(|| format!("failed to write payload to {}", shell.entrypoint))?;
        // Close stdin so methods reading to EOF can finish.
        drop(stdin);

        let output = match timeout(
            Duration::from_millis(method.timeout),
            child.wait_with_output(),
        )
        .await
        {
            Ok(result) => {
                result.with_context(|| format!("failed to run {}", shell.entrypoint))?
            },
            // Dropping the wait future kills the child.
            Err(_) => bail!(
                "{} timed out after {}ms",
                shell.entrypoint,
                method.timeout
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("{} failed: {}", shell.entrypoint, stderr.trim_end());
            bail!(
                "{} exited with {}: {}",
                shell.entrypoint,
                output.status,
                truncate(stderr.trim_end())
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
