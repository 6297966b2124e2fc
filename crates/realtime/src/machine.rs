//! Connection lifecycle for the inference socket, with no I/O of its own.
//!
//! The machine decides; the driver in `client` acts. Every input that comes
//! from a socket or a timer carries the generation of the connect attempt it
//! belongs to. Each physical connect attempt gets a fresh generation, so
//! callbacks from a superseded socket or timer are recognised and dropped
//! before they can touch any state.

use crate::error::ClientError;
use crate::protocol::{self, ClientMessage, ServerMessage};
use signstream_core::prediction::{Mode, Model, PredictionResult};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket exists and none is wanted.
    Idle,
    Connecting,
    Open,
    /// The socket is gone; a reconnect is about to be scheduled.
    Closed,
    ReconnectScheduled,
}

/// Notifications for listeners of the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Result(PredictionResult),
    Error(ClientError),
}

/// Side effects the driver must carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Open { generation: u64, url: String },
    Send { generation: u64, text: String },
    Close { generation: u64 },
    ScheduleReconnect { generation: u64, delay: Duration },
    CancelReconnect,
    Emit(ClientEvent),
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    endpoint: String,
    mode: Mode,
    model: Model,
    target: Option<String>,
    reconnect_delay: Duration,
    state: ConnectionState,
    generation: u64,
}

impl ConnectionMachine {
    pub fn new(endpoint: impl Into<String>, mode: Mode, model: Model, reconnect_delay: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            mode,
            model,
            target: None,
            reconnect_delay,
            state: ConnectionState::Idle,
            generation: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn model(&self) -> Model {
        self.model
    }

    /// The URL a connect attempt made right now would use.
    pub fn url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}mode={}&model={}",
            self.endpoint, separator, self.mode, self.model
        )
    }

    fn is_current(&self, generation: u64) -> bool {
        if generation != self.generation {
            trace!(generation, current = self.generation, "Dropping event from a superseded socket");
            return false;
        }
        true
    }

    fn begin_connect(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        let url = self.url();
        info!(generation = self.generation, %url, "Connecting to inference backend");
        vec![Effect::Open {
            generation: self.generation,
            url,
        }]
    }

    fn send_if_open(&self, message: ClientMessage) -> Vec<Effect> {
        if self.state != ConnectionState::Open {
            return Vec::new();
        }
        match message.encode() {
            Ok(text) => vec![Effect::Send {
                generation: self.generation,
                text,
            }],
            Err(e) => vec![Effect::Emit(ClientEvent::Error(e.into()))],
        }
    }

    /// Starts connecting. Does nothing unless the machine is idle.
    pub fn connect(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Idle {
            debug!(state = ?self.state, "Connect requested while already active");
            return Vec::new();
        }
        self.begin_connect()
    }

    pub fn on_open(&mut self, generation: u64) -> Vec<Effect> {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::Open;
        info!(generation, "Inference socket open");

        let mut effects = vec![Effect::Emit(ClientEvent::Connected)];
        if self.target.is_some() {
            effects.extend(self.send_if_open(ClientMessage::Target {
                target: self.target.clone(),
            }));
        }
        effects
    }

    /// The socket of `generation` is gone. Unless the caller tore the
    /// connection down, a reconnect is scheduled.
    pub fn on_close(&mut self, generation: u64) -> Vec<Effect> {
        if !self.is_current(generation)
            || !matches!(self.state, ConnectionState::Connecting | ConnectionState::Open)
        {
            return Vec::new();
        }
        let was_open = self.state == ConnectionState::Open;
        self.state = ConnectionState::Closed;

        let mut effects = Vec::new();
        if was_open {
            effects.push(Effect::Emit(ClientEvent::Disconnected));
        }
        self.state = ConnectionState::ReconnectScheduled;
        warn!(
            generation,
            delay_ms = self.reconnect_delay.as_millis() as u64,
            "Inference socket closed, scheduling reconnect"
        );
        effects.push(Effect::ScheduleReconnect {
            generation,
            delay: self.reconnect_delay,
        });
        effects
    }

    /// Reports a socket error. The state is left alone; the close that follows
    /// drives the reconnect.
    pub fn on_error(&mut self, generation: u64, error: impl Into<String>) -> Vec<Effect> {
        if !self.is_current(generation) || self.state == ConnectionState::Idle {
            return Vec::new();
        }
        let error = error.into();
        warn!(generation, %error, "Inference socket error");
        vec![Effect::Emit(ClientEvent::Error(ClientError::Transport(error)))]
    }

    pub fn on_reconnect_due(&mut self, generation: u64) -> Vec<Effect> {
        if !self.is_current(generation) || self.state != ConnectionState::ReconnectScheduled {
            return Vec::new();
        }
        self.begin_connect()
    }

    pub fn on_message(&mut self, generation: u64, text: &str) -> Vec<Effect> {
        if !self.is_current(generation) || self.state != ConnectionState::Open {
            return Vec::new();
        }
        match protocol::decode(text, self.mode, self.model) {
            Ok(ServerMessage::Hello(hello)) => {
                debug!(%hello, "Backend handshake");
                Vec::new()
            }
            Ok(ServerMessage::Error(message)) => {
                warn!(%message, "Backend reported an error");
                vec![Effect::Emit(ClientEvent::Error(ClientError::Server(message)))]
            }
            Ok(ServerMessage::Result(result)) => vec![Effect::Emit(ClientEvent::Result(result))],
            Err(e) => {
                warn!(error = %e, "Discarding malformed message");
                vec![Effect::Emit(ClientEvent::Error(ClientError::Protocol(e)))]
            }
        }
    }

    /// Queues one frame for sending. Frames offered while the socket is not
    /// open are dropped.
    pub fn send_frame(&mut self, frame_b64: String) -> Vec<Effect> {
        if self.state != ConnectionState::Open {
            trace!(state = ?self.state, "Dropping frame, socket not open");
            return Vec::new();
        }
        self.send_if_open(ClientMessage::Frame { frame_b64 })
    }

    pub fn set_mode(&mut self, mode: Mode) -> Vec<Effect> {
        self.mode = mode;
        self.send_if_open(ClientMessage::Mode { mode })
    }

    pub fn set_model(&mut self, model: Model) -> Vec<Effect> {
        self.model = model;
        self.send_if_open(ClientMessage::Model { model })
    }

    pub fn set_target(&mut self, target: Option<String>) -> Vec<Effect> {
        self.target = target;
        self.send_if_open(ClientMessage::Target {
            target: self.target.clone(),
        })
    }

    /// Caller-initiated shutdown. Cancels a pending reconnect, closes a live
    /// socket and leaves the machine idle. Callbacks still in flight for the
    /// old socket become stale.
    pub fn teardown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.state {
            ConnectionState::Idle => return effects,
            ConnectionState::ReconnectScheduled => effects.push(Effect::CancelReconnect),
            ConnectionState::Connecting | ConnectionState::Closed => effects.push(Effect::Close {
                generation: self.generation,
            }),
            ConnectionState::Open => {
                effects.push(Effect::Close {
                    generation: self.generation,
                });
                effects.push(Effect::Emit(ClientEvent::Disconnected));
            }
        }
        info!(generation = self.generation, "Tearing down inference connection");
        self.generation += 1;
        self.state = ConnectionState::Idle;
        effects
    }
}
