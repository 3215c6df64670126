//! Binary session capture for later replay.
//!
//! The format is a sequence of timestamped chunks, little-endian:
//!
//!   `<u32 seconds><u32 microseconds><u32 byte-length><utf-8 bytes>`
//!
//! where the timestamp is elapsed time since the session connected. A header
//! (terminal size escape, UTF-8 mode escape) is written as ordinary chunks,
//! and a trailer (style reset, session info dump) is appended on stop.
//! Chunks are flushed as written and never rewritten afterwards; replay
//! players depend on the exact layout, so rewrite-style compression is
//! deliberately not performed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

pub struct SessionRecorder {
    file: File,
    path: PathBuf,
}

impl SessionRecorder {
    /// Open a fresh capture file under `dir` (created if missing), named
    /// `<timestamp><seq>-<origin>.rec` with the sequence digit bumped until
    /// the name is free, then write the header for a `height`x`width`
    /// terminal.
    pub async fn create(
        dir: &Path,
        origin: &str,
        height: u16,
        width: u16,
        elapsed: Duration,
    ) -> Result<Self> {
        if !dir.exists() {
            info!("creating recording folder {}", dir.display());
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let stamp = chrono::Local::now().format("%Y%m%d.%H%M%S").to_string();
        let mut digit = 0u32;
        let (file, path) = loop {
            let path = dir.join(format!("{stamp}{digit}-{origin}.rec"));
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => break (file, path),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => digit += 1,
                Err(err) => {
                    return Err(err).with_context(|| format!("creating {}", path.display()))
                }
            }
        };
        let mut recorder = Self { file, path };
        recorder.write_header(height, width, elapsed).await?;
        info!("session recording to {}", recorder.path.display());
        Ok(recorder)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name for the session info snapshot.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Terminal geometry, then the ISO 2022 escape declaring UTF-8 mode.
    async fn write_header(&mut self, height: u16, width: u16, elapsed: Duration) -> Result<()> {
        self.write(elapsed, &format!("\x1b[8;{height};{width}t")).await?;
        self.write(elapsed, "\x1b%G").await
    }

    /// Append one timestamped chunk and flush it to the capture file.
    pub async fn write(&mut self, elapsed: Duration, text: &str) -> Result<()> {
        let bytes = text.as_bytes();
        let mut chunk = Vec::with_capacity(12 + bytes.len());
        chunk.extend_from_slice(&(elapsed.as_secs() as u32).to_le_bytes());
        chunk.extend_from_slice(&elapsed.subsec_micros().to_le_bytes());
        chunk.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        chunk.extend_from_slice(bytes);
        self.file.write_all(&chunk).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Append the trailer and close the capture: style reset, a blank line,
    /// a sorted `key: value` dump of the session info, and a final newline.
    pub async fn stop(mut self, elapsed: Duration, snapshot: &BTreeMap<String, Value>) -> Result<()> {
        self.write(elapsed, "\x1b[m").await?;
        self.write(elapsed, "\r\n\r\n").await?;
        let dump = snapshot
            .iter()
            .map(|(key, value)| format!("{key}: {}", display_value(value)))
            .collect::<Vec<_>>()
            .join("\r\n");
        self.write(elapsed, &dump).await?;
        self.write(elapsed, "\r\n").await?;
        self.file.shutdown().await?;
        info!("session recording closed: {}", self.path.display());
        Ok(())
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
