//! Control socket server

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use versiongate_api::{ClientInfo, ClientRole, ErrorCode, ErrorInfo, Request, Response};

use crate::IpcResult;

/// What a connection reports to the daemon
#[derive(Debug)]
pub enum ControlEvent {
    Connected(ClientInfo),
    /// A parsed request; the daemon answers through `reply`
    Request {
        client: ClientInfo,
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    Disconnected(ClientInfo),
}

/// A bound control socket
pub struct ControlSocket {
    path: PathBuf,
    listener: UnixListener,
    events: mpsc::UnboundedSender<ControlEvent>,
}

impl ControlSocket {
    /// Bind at `path`, replacing a socket left behind by an earlier run.
    /// Connection events arrive on the returned receiver.
    pub fn bind(path: impl AsRef<Path>) -> IpcResult<(Self, mpsc::UnboundedReceiver<ControlEvent>)> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        // Group members may connect; control still requires an admin uid
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o660))?;
        info!(path = %path.display(), "Control socket listening");

        let (events, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                path,
                listener,
                events,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the event receiver goes away
    pub async fn serve(&self) {
        while !self.events.is_closed() {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let uid = peer_uid(&stream);
                    let mut client = ClientInfo::new(role_for_uid(uid));
                    if let Some(uid) = uid {
                        client = client.with_uid(uid);
                    }
                    info!(client_id = %client.client_id, uid = ?uid, role = ?client.role, "Client connected");
                    tokio::spawn(connection(stream, client, self.events.clone()));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
        debug!("Control socket no longer serving");
    }

    /// Remove the socket file
    pub fn shutdown(&self) {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn connection(
    stream: UnixStream,
    client: ClientInfo,
    events: mpsc::UnboundedSender<ControlEvent>,
) {
    let _ = events.send(ControlEvent::Connected(client.clone()));
    if let Err(e) = converse(stream, &client, &events).await {
        debug!(client_id = %client.client_id, error = %e, "Connection ended");
    }
    let _ = events.send(ControlEvent::Disconnected(client));
}

/// Answer each request line before reading the next
async fn converse(
    stream: UnixStream,
    client: &ClientInfo,
    events: &mpsc::UnboundedSender<ControlEvent>,
) -> IpcResult<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                let request_id = request.request_id;
                let (reply, answer) = oneshot::channel();
                let _ = events.send(ControlEvent::Request {
                    client: client.clone(),
                    request,
                    reply,
                });
                answer.await.unwrap_or_else(|_| {
                    Response::error(
                        request_id,
                        ErrorInfo::new(ErrorCode::ServiceUnavailable, "service is shutting down"),
                    )
                })
            }
            Err(e) => {
                warn!(client_id = %client.client_id, error = %e, "Invalid request");
                Response::error(0, ErrorInfo::new(ErrorCode::InvalidRequest, e.to_string()))
            }
        };

        let mut json = serde_json::to_string(&response)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
    }

    Ok(())
}

/// Root and the daemon's own user may control it; everyone else observes
pub fn role_for_uid(uid: Option<u32>) -> ClientRole {
    match uid {
        Some(0) => ClientRole::Admin,
        Some(u) if u == nix::unistd::getuid().as_raw() => ClientRole::Admin,
        _ => ClientRole::Observer,
    }
}

fn peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsFd;

    nix::sys::socket::getsockopt(&stream.as_fd(), nix::sys::socket::sockopt::PeerCredentials)
        .ok()
        .map(|cred| cred.uid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControlClient, IpcError};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use versiongate_api::{Command, ResponsePayload, ResponseResult};

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run").join("versiongate.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let (socket, _events) = ControlSocket::bind(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);

        drop(socket);
        assert!(!path.exists());
    }

    #[test]
    fn own_uid_is_admin() {
        let me = nix::unistd::getuid().as_raw();
        assert_eq!(role_for_uid(Some(0)), ClientRole::Admin);
        assert_eq!(role_for_uid(Some(me)), ClientRole::Admin);
        assert_eq!(role_for_uid(None), ClientRole::Observer);
    }

    #[tokio::test]
    async fn requests_are_answered_through_reply() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rt.sock");
        let (socket, mut events) = ControlSocket::bind(&path).unwrap();
        let socket = Arc::new(socket);
        let serving = socket.clone();
        tokio::spawn(async move { serving.serve().await });

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ControlEvent::Request { client, request, reply } => {
                        assert_eq!(client.role, ClientRole::Admin);
                        let _ = reply.send(Response::success(request.request_id, ResponsePayload::Pong));
                    }
                    ControlEvent::Connected(_) | ControlEvent::Disconnected(_) => {}
                }
            }
        });

        let mut client = ControlClient::connect(&path).await.unwrap();
        let response = client.send(Command::Ping).await.unwrap();
        assert_eq!(response.request_id, 1);
        assert!(matches!(response.result, ResponseResult::Ok(ResponsePayload::Pong)));

        let response = client.send(Command::Ping).await.unwrap();
        assert_eq!(response.request_id, 2);
    }

    #[tokio::test]
    async fn garbage_line_gets_invalid_request() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.sock");
        let (socket, _events) = ControlSocket::bind(&path).unwrap();
        let socket = Arc::new(socket);
        let serving = socket.clone();
        tokio::spawn(async move { serving.serve().await });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"not json\n").await.unwrap();
        let mut buf = vec![0u8; 512];
        let n = stream.read(&mut buf).await.unwrap();
        let response: Response = serde_json::from_slice(&buf[..n]).unwrap();
        match response.result {
            ResponseResult::Err(e) => assert_eq!(e.code, ErrorCode::InvalidRequest),
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unanswered_request_reports_unavailable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.sock");
        let (socket, mut events) = ControlSocket::bind(&path).unwrap();
        let socket = Arc::new(socket);
        let serving = socket.clone();
        tokio::spawn(async move { serving.serve().await });

        // Drop every reply without answering
        tokio::spawn(async move { while events.recv().await.is_some() {} });

        let mut client = ControlClient::connect(&path).await.unwrap();
        match client.status().await {
            Err(IpcError::Rejected { code, .. }) => assert_eq!(code, ErrorCode::ServiceUnavailable),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
