//! Local status socket.
//!
//! A unix stream endpoint at a well-known path that lets sibling processes
//! ask "what is my tunnel status and address?" without touching the network.
//! Records are length-framed CBOR, self-describing `{ kind, payload }`.

use crate::state::ConnectState;
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SOCK_PATH: &str = "/var/run/wiremesh/status.sock";

const MAX_FRAME_LEN: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    CompletedConn,
}

/// Tunnel status payload served to sibling processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub status: String,
    pub ip: String,
    pub cidr: String,
}

/// One framed request/response record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub kind: RecordKind,
    pub payload: TunnelStatus,
}

pub fn encode_record(record: &StatusRecord) -> Result<Vec<u8>> {
    let body = serde_cbor::to_vec(record).context("failed to encode status record")?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_record(body: &[u8]) -> Result<StatusRecord> {
    serde_cbor::from_slice(body).context("failed to decode status record")
}

async fn read_record(stream: &mut UnixStream) -> Result<Option<StatusRecord>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read status frame header"),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        bail!("oversized status frame ({len} bytes)");
    }

    let mut body = vec![0u8; len as usize];
    stream
        .read_exact(&mut body)
        .await
        .context("failed to read status frame body")?;
    Ok(Some(decode_record(&body)?))
}

async fn write_record(stream: &mut UnixStream, record: &StatusRecord) -> Result<()> {
    stream
        .write_all(&encode_record(record)?)
        .await
        .context("failed to write status frame")
}

/// Status socket server. Serves one inbound connection at a time.
pub struct StatusSock {
    path: PathBuf,
    conn_state: Arc<ConnectState>,
    ip: String,
    cidr: String,
    cancel: CancellationToken,
}

impl StatusSock {
    pub fn new(
        path: PathBuf,
        conn_state: Arc<ConnectState>,
        ip: String,
        cidr: String,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            path,
            conn_state,
            ip,
            cidr,
            cancel: parent.child_token(),
        }
    }

    fn remove_stale(&self) {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Serve until cancelled. The socket file is cleaned up on start and on
    /// shutdown.
    pub async fn serve(self) -> Result<()> {
        self.remove_stale();
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create socket directory {dir:?}"))?;
        }

        let listener = UnixListener::bind(&self.path)
            .with_context(|| format!("failed to bind status socket at {:?}", self.path))?;
        debug!("status socket listening at {:?}", self.path);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.remove_stale();
                    debug!("status socket closed");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                self.remove_stale();
                                return Ok(());
                            }
                            served = self.handle(stream) => {
                                if let Err(e) = served {
                                    debug!("status connection ended: {e:#}");
                                }
                            }
                        }
                    }
                    Err(e) => warn!("status socket accept failed: {e}"),
                }
            }
        }
    }

    async fn handle(&self, mut stream: UnixStream) -> Result<()> {
        while let Some(mut record) = read_record(&mut stream).await? {
            match record.kind {
                RecordKind::CompletedConn => {
                    record.payload = TunnelStatus {
                        status: self.conn_state.status().to_string(),
                        ip: self.ip.clone(),
                        cidr: self.cidr.clone(),
                    };
                }
            }
            write_record(&mut stream, &record).await?;
        }
        Ok(())
    }
}

/// Companion-process helper: ask a running daemon for its tunnel status.
pub async fn dial_status(path: &Path) -> Result<TunnelStatus> {
    let mut stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("failed to connect to status socket at {path:?}"))?;

    let request = StatusRecord {
        kind: RecordKind::CompletedConn,
        payload: TunnelStatus::default(),
    };
    write_record(&mut stream, &request).await?;

    match read_record(&mut stream).await? {
        Some(response) => Ok(response.payload),
        None => bail!("status socket closed without a response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_record_roundtrip() {
        let record = StatusRecord {
            kind: RecordKind::CompletedConn,
            payload: TunnelStatus {
                status: "connected".to_string(),
                ip: "100.64.0.7".to_string(),
                cidr: "24".to_string(),
            },
        };
        let frame = encode_record(&record).unwrap();
        let decoded = decode_record(&frame[4..]).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn test_frame_length_prefix() {
        let record = StatusRecord {
            kind: RecordKind::CompletedConn,
            payload: TunnelStatus::default(),
        };
        let frame = encode_record(&record).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len as usize, frame.len() - 4);
    }

    #[tokio::test]
    async fn test_serve_and_dial() {
        let path = std::env::temp_dir().join(format!("wiremesh-status-{}.sock", std::process::id()));
        let conn_state = Arc::new(ConnectState::new());
        conn_state.connected();

        let cancel = CancellationToken::new();
        let sock = StatusSock::new(
            path.clone(),
            Arc::clone(&conn_state),
            "100.64.0.7".to_string(),
            "24".to_string(),
            &cancel,
        );
        let server = tokio::spawn(sock.serve());

        // wait for the socket file to appear
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !path.exists() {
            assert!(tokio::time::Instant::now() < deadline, "socket never bound");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let status = dial_status(&path).await.unwrap();
        assert_eq!(status.status, "connected");
        assert_eq!(status.ip, "100.64.0.7");
        assert_eq!(status.cidr, "24");

        // a second client is served after the first hangs up
        conn_state.disconnected();
        let status = dial_status(&path).await.unwrap();
        assert_eq!(status.status, "disconnected");

        cancel.cancel();
        let _ = server.await;
        assert!(!path.exists(), "stale socket file left behind");
    }
}
