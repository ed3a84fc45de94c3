use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use crate::{ReaderSide, TagRead};

const BAUD: u32 = 9600;

/// A read gap this long flushes whatever is buffered as an incomplete tag.
const PARTIAL_FLUSH: std::time::Duration = std::time::Duration::from_millis(250);

/// Open the serial port and spawn the read loop. Framed reads arrive on the
/// channel; the receiver runs them through the correlator on the main loop.
pub fn spawn_reader(
    side: ReaderSide,
    path: &str,
    tx: mpsc::Sender<TagRead>,
) -> Result<tokio::task::JoinHandle<()>> {
    let port = tokio_serial::new(path, BAUD)
        .open_native_async()
        .with_context(|| format!("open {} RFID reader {}", side.name(), path))?;

    info!("{} RFID reader on {}", side.name(), path);
    Ok(tokio::spawn(read_loop(side, port, tx)))
}

async fn read_loop(side: ReaderSide, mut port: tokio_serial::SerialStream, tx: mpsc::Sender<TagRead>) {
    let mut buf = BytesMut::with_capacity(256);
    let mut chunk = [0u8; 64];

    loop {
        match tokio::time::timeout(PARTIAL_FLUSH, port.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                warn!("{} RFID reader closed", side.name());
                return;
            }
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                for tag in extract_complete_tags(&mut buf) {
                    if tx.send(TagRead { side, complete: true, data: tag }).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("{} RFID read error: {:#}", side.name(), e);
                return;
            }
            Err(_) => {
                if let Some(partial) = flush_partial(&mut buf) {
                    if tx.send(TagRead { side, complete: false, data: partial }).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Pull newline-terminated tags out of the accumulation buffer.
fn extract_complete_tags(buf: &mut BytesMut) -> Vec<String> {
    let mut tags = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n' || b == b'\r') {
        let line = buf.split_to(pos + 1);
        let tag = String::from_utf8_lossy(&line[..line.len() - 1]).trim().to_string();
        if !tag.is_empty() {
            tags.push(tag);
        }
    }
    tags
}

/// Hand out buffered bytes as an incomplete tag after a read gap.
fn flush_partial(buf: &mut BytesMut) -> Option<String> {
    if buf.is_empty() {
        return None;
    }
    let partial = String::from_utf8_lossy(buf).trim().to_string();
    buf.clear();
    if partial.is_empty() { None } else { Some(partial) }
}
