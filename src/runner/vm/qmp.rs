use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Minimal QMP client: greeting, capability negotiation, one command at a
/// time. QEMU speaks line-delimited JSON on the QMP unix socket.
pub struct QmpClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl QmpClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connect QMP socket {}", path.display()))?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        // Greeting: {"QMP": {...}}.
        let greeting = client.read_json().await?;
        if greeting.get("QMP").is_none() {
            bail!("unexpected QMP greeting: {greeting}");
        }
        client.execute(json!({"execute": "qmp_capabilities"})).await?;
        Ok(client)
    }

    /// Request a guest ACPI shutdown.
    pub async fn system_powerdown(&mut self) -> Result<()> {
        self.execute(json!({"execute": "system_powerdown"})).await?;
        Ok(())
    }

    /// Hard stop from the hypervisor side.
    pub async fn quit(&mut self) -> Result<()> {
        self.execute(json!({"execute": "quit"})).await?;
        Ok(())
    }

    async fn execute(&mut self, command: Value) -> Result<Value> {
        let mut line = serde_json::to_string(&command)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("QMP write")?;

        // Async events may interleave with the response; skip anything that
        // is neither "return" nor "error".
        loop {
            let value = self.read_json().await?;
            if let Some(err) = value.get("error") {
                bail!("QMP error: {err}");
            }
            if value.get("return").is_some() {
                return Ok(value);
            }
        }
    }

    async fn read_json(&mut self) -> Result<Value> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.context("QMP read")?;
        if n == 0 {
            bail!("QMP socket closed");
        }
        serde_json::from_str(&line).with_context(|| format!("bad QMP line {line:?}"))
    }
}
