//! Control socket client

use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use versiongate_api::{Command, Request, Response, ResponsePayload, ResponseResult, StatusSnapshot};

use crate::{IpcError, IpcResult};

/// Connection to a running versiongated
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_request_id: u64,
}

impl ControlClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let (read_half, write_half) = UnixStream::connect(socket_path).await?.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_request_id: 1,
        })
    }

    /// Send a command and wait for its response
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        let request = Request::new(self.next_request_id, command);
        self.next_request_id += 1;

        let mut json = serde_json::to_string(&request)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(IpcError::ConnectionClosed);
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// The daemon's status snapshot
    pub async fn status(&mut self) -> IpcResult<StatusSnapshot> {
        match self.expect_ok(Command::Status).await? {
            ResponsePayload::Status(snapshot) => Ok(snapshot),
            other => Err(IpcError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Start, stop or reload; succeeds once the daemon has accepted it
    pub async fn control(&mut self, command: Command) -> IpcResult<()> {
        match self.expect_ok(command).await? {
            ResponsePayload::Accepted => Ok(()),
            other => Err(IpcError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn expect_ok(&mut self, command: Command) -> IpcResult<ResponsePayload> {
        match self.send(command).await?.result {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(e) => Err(IpcError::Rejected {
                code: e.code,
                message: e.message,
            }),
        }
    }
}
