//! Message types and the event loop that owns the manager.
//!
//! Everything that mutates the manager flows through one queue pair consumed
//! by a single task: bus-mirrored operations arrive as [`ManagerCommand`]s
//! carrying a oneshot reply sender, and internal notifications (client
//! disconnects, operational-state changes) arrive as [`ManagerEvent`]s. The
//! loop processes one message at a time, so manager state never sees
//! concurrent mutation and handlers never re-enter.

use sensord_core::{ManagerError, SessionId, INVALID_SESSION};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::manager::SensorManager;
use crate::pump::SampleDrain;

/// Operations mirrored from the control bus. Each variant embeds the oneshot
/// sender its response goes back on.
#[derive(Debug)]
pub enum ManagerCommand {
    RequestControlSensor {
        id: String,
        reply: oneshot::Sender<Result<SessionId, ManagerError>>,
    },
    RequestListenSensor {
        id: String,
        reply: oneshot::Sender<Result<SessionId, ManagerError>>,
    },
    ReleaseSensor {
        id: String,
        session: SessionId,
        reply: oneshot::Sender<bool>,
    },
    StartSensor {
        id: String,
        session: SessionId,
        reply: oneshot::Sender<bool>,
    },
    StopSensor {
        id: String,
        session: SessionId,
        reply: oneshot::Sender<bool>,
    },
    /// The property-request channel: record a session's request and apply the
    /// arbitrated winner. Replies with the winning value.
    SetPropertyRequest {
        session: SessionId,
        property: String,
        adaptor: String,
        value: i32,
        reply: oneshot::Sender<i32>,
    },
    /// Human-readable registry listing.
    Status {
        reply: oneshot::Sender<String>,
    },
}

impl ManagerCommand {
    pub fn request_control_sensor(
        id: String,
    ) -> (Self, oneshot::Receiver<Result<SessionId, ManagerError>>) {
        let (reply, rx) = oneshot::channel();
        (Self::RequestControlSensor { id, reply }, rx)
    }

    pub fn request_listen_sensor(
        id: String,
    ) -> (Self, oneshot::Receiver<Result<SessionId, ManagerError>>) {
        let (reply, rx) = oneshot::channel();
        (Self::RequestListenSensor { id, reply }, rx)
    }

    pub fn release_sensor(id: String, session: SessionId) -> (Self, oneshot::Receiver<bool>) {
        let (reply, rx) = oneshot::channel();
        (Self::ReleaseSensor { id, session, reply }, rx)
    }

    pub fn status() -> (Self, oneshot::Receiver<String>) {
        let (reply, rx) = oneshot::channel();
        (Self::Status { reply }, rx)
    }
}

/// Internal notifications delivered on the same thread as the commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    /// The transport gateway saw a client disconnect.
    LostSession(SessionId),
    DisplayStateChanged(bool),
    DevicePsmStateChanged(bool),
}

/// Runs the manager until the command channel closes. Samples drained from
/// the pump are forwarded between messages; ordering within each producer is
/// preserved because the pump itself is FIFO.
pub async fn run(
    mut manager: SensorManager,
    mut commands: mpsc::Receiver<ManagerCommand>,
    mut events: mpsc::Receiver<ManagerEvent>,
    mut samples: SampleDrain,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut manager, command),
                None => break,
            },
            Some(event) = events.recv() => handle_event(&mut manager, event),
            Some(packet) = samples.recv() => manager.forward_sample(packet),
        }
    }
    info!("manager event loop stopped");
}

fn handle_command(manager: &mut SensorManager, command: ManagerCommand) {
    match command {
        ManagerCommand::RequestControlSensor { id, reply } => {
            let session = manager.request_control_sensor(&id);
            let result = if session == INVALID_SESSION {
                Err(manager.last_error().clone())
            } else {
                Ok(session)
            };
            let _ = reply.send(result);
        }
        ManagerCommand::RequestListenSensor { id, reply } => {
            let session = manager.request_listen_sensor(&id);
            let result = if session == INVALID_SESSION {
                Err(manager.last_error().clone())
            } else {
                Ok(session)
            };
            let _ = reply.send(result);
        }
        ManagerCommand::ReleaseSensor { id, session, reply } => {
            let _ = reply.send(manager.release_sensor(&id, session));
        }
        ManagerCommand::StartSensor { id, session, reply } => {
            let _ = reply.send(manager.start_sensor(&id, session));
        }
        ManagerCommand::StopSensor { id, session, reply } => {
            let _ = reply.send(manager.stop_sensor(&id, session));
        }
        ManagerCommand::SetPropertyRequest {
            session,
            property,
            adaptor,
            value,
            reply,
        } => {
            let _ = reply.send(manager.set_property_request(session, &property, &adaptor, value));
        }
        ManagerCommand::Status { reply } => {
            let mut output = Vec::new();
            manager.print_status(&mut output);
            let _ = reply.send(output.concat());
        }
    }
}

fn handle_event(manager: &mut SensorManager, event: ManagerEvent) {
    match event {
        ManagerEvent::LostSession(session) => manager.lost_client(session),
        ManagerEvent::DisplayStateChanged(display_on) => {
            manager.display_state_changed(display_on)
        }
        ManagerEvent::DevicePsmStateChanged(power_save) => {
            manager.device_psm_state_changed(power_save)
        }
    }
}
