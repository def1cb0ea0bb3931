use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use kernel_common::KernelMsg;
use kestrel_core::CorrelationEngine;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, BufReader, stdin},
};

/// Feeds newline-delimited JSON raw messages into the engine until
/// the source is exhausted. Returns the number of accepted messages.
pub async fn feed(engine: &Arc<CorrelationEngine>, source: Option<&Path>) -> Result<u64> {
    match source {
        Some(path) => {
            let file = File::open(path)
                .await
                .with_context(|| format!("opening replay file {}", path.display()))?;
            feed_reader(engine, file).await
        }
        None => feed_reader(engine, stdin()).await,
    }
}

async fn feed_reader(
    engine: &Arc<CorrelationEngine>,
    reader: impl AsyncRead + Unpin,
) -> Result<u64> {
    let mut lines = BufReader::new(reader).lines();
    let mut accepted = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let msg: KernelMsg = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("skipping undecodable message: {err}");
                continue;
            }
        };
        let key = msg.process_key();
        match engine.handle_msg(msg) {
            Ok(_) => accepted += 1,
            Err(err) => log::warn!("rejected message for {key}: {err}"),
        }
    }
    Ok(accepted)
}
