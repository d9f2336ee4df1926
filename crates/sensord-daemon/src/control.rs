//! Control dispatch over a unix socket.
//!
//! Clients drive the manager operations through newline-delimited JSON
//! frames on a second unix socket: one request per line, one response per
//! line, in order. Each request is turned into a [`ManagerCommand`] and
//! queued for the manager loop; the connection task awaits the oneshot reply
//! before answering.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sensord_core::{ErrorKind, SessionId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::events::ManagerCommand;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    RequestControlSensor { id: String },
    RequestListenSensor { id: String },
    ReleaseSensor { id: String, session: SessionId },
    StartSensor { id: String, session: SessionId },
    StopSensor { id: String, session: SessionId },
    SetPropertyRequest {
        session: SessionId,
        property: String,
        adaptor: String,
        value: i32,
    },
    Status,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Session { session: SessionId },
    Ack { ok: bool },
    PropertyValue { value: i32 },
    Status { text: String },
    Error {
        message: String,
        /// Present for manager errors, absent for protocol-level failures.
        kind: Option<ErrorKind>,
        code: Option<u8>,
    },
}

impl ControlResponse {
    fn protocol_error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            kind: None,
            code: None,
        }
    }

    fn manager_error(err: sensord_core::ManagerError) -> Self {
        Self::Error {
            message: err.message,
            kind: Some(err.kind),
            code: Some(err.kind.code()),
        }
    }
}

/// Binds the control socket and serves connections until the listener fails.
pub async fn serve(path: PathBuf, commands: mpsc::Sender<ManagerCommand>) -> io::Result<()> {
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let commands = commands.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, commands).await {
                debug!(%err, "control connection closed");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    commands: mpsc::Sender<ManagerCommand>,
) -> io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => dispatch(request, &commands).await,
            Err(err) => {
                warn!(%err, "malformed control request");
                ControlResponse::protocol_error(format!("malformed request: {err}"))
            }
        };
        let mut frame = serde_json::to_vec(&response)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        frame.push(b'\n');
        write_half.write_all(&frame).await?;
    }
    Ok(())
}

async fn dispatch(
    request: ControlRequest,
    commands: &mpsc::Sender<ManagerCommand>,
) -> ControlResponse {
    match request {
        ControlRequest::RequestControlSensor { id } => {
            let (command, rx) = ManagerCommand::request_control_sensor(id);
            match send_and_wait(commands, command, rx).await {
                Some(Ok(session)) => ControlResponse::Session { session },
                Some(Err(err)) => ControlResponse::manager_error(err),
                None => shutting_down(),
            }
        }
        ControlRequest::RequestListenSensor { id } => {
            let (command, rx) = ManagerCommand::request_listen_sensor(id);
            match send_and_wait(commands, command, rx).await {
                Some(Ok(session)) => ControlResponse::Session { session },
                Some(Err(err)) => ControlResponse::manager_error(err),
                None => shutting_down(),
            }
        }
        ControlRequest::ReleaseSensor { id, session } => {
            let (command, rx) = ManagerCommand::release_sensor(id, session);
            match send_and_wait(commands, command, rx).await {
                Some(ok) => ControlResponse::Ack { ok },
                None => shutting_down(),
            }
        }
        ControlRequest::StartSensor { id, session } => {
            let (reply, rx) = oneshot::channel();
            let command = ManagerCommand::StartSensor { id, session, reply };
            match send_and_wait(commands, command, rx).await {
                Some(ok) => ControlResponse::Ack { ok },
                None => shutting_down(),
            }
        }
        ControlRequest::StopSensor { id, session } => {
            let (reply, rx) = oneshot::channel();
            let command = ManagerCommand::StopSensor { id, session, reply };
            match send_and_wait(commands, command, rx).await {
                Some(ok) => ControlResponse::Ack { ok },
                None => shutting_down(),
            }
        }
        ControlRequest::SetPropertyRequest {
            session,
            property,
            adaptor,
            value,
        } => {
            let (reply, rx) = oneshot::channel();
            let command = ManagerCommand::SetPropertyRequest {
                session,
                property,
                adaptor,
                value,
                reply,
            };
            match send_and_wait(commands, command, rx).await {
                Some(value) => ControlResponse::PropertyValue { value },
                None => shutting_down(),
            }
        }
        ControlRequest::Status => {
            let (command, rx) = ManagerCommand::status();
            match send_and_wait(commands, command, rx).await {
                Some(text) => ControlResponse::Status { text },
                None => shutting_down(),
            }
        }
    }
}

async fn send_and_wait<T>(
    commands: &mpsc::Sender<ManagerCommand>,
    command: ManagerCommand,
    rx: oneshot::Receiver<T>,
) -> Option<T> {
    commands.send(command).await.ok()?;
    rx.await.ok()
}

fn shutting_down() -> ControlResponse {
    ControlResponse::protocol_error("daemon is shutting down")
}
