//! The tokio side of the streaming client.
//!
//! `StreamingInferenceClient` is a cheap, cloneable handle. All connection
//! state lives in one driver task that owns a `ConnectionMachine`; socket
//! readers and reconnect timers run as their own tasks and report back to the
//! driver tagged with the generation they were started under.

use crate::machine::{
    ClientEvent, ConnectionMachine, ConnectionState, DEFAULT_RECONNECT_DELAY, Effect,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use signstream_core::prediction::{Mode, Model, PredictionResult};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{Instrument, debug, error, info_span, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Settings for one client. The endpoint gets `mode` and `model` appended as
/// query parameters on every connect attempt.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub mode: Mode,
    pub model: Model,
    pub reconnect_delay: Duration,
    /// Frames waiting for the driver beyond this are dropped.
    pub frame_queue: usize,
    /// Events a listener may fall behind by before it starts missing them.
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            mode: Mode::default(),
            model: Model::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            frame_queue: 2,
            event_capacity: 64,
        }
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    SetMode(Mode),
    SetModel(Model),
    SetTarget(Option<String>),
    Shutdown(oneshot::Sender<()>),
}

enum SocketEvent {
    Opened { generation: u64, sink: WsSink },
    Message { generation: u64, text: String },
    Error { generation: u64, error: String },
    Closed { generation: u64 },
    ReconnectDue { generation: u64 },
}

#[derive(Clone)]
pub struct StreamingInferenceClient {
    control: mpsc::Sender<Command>,
    frames: mpsc::Sender<String>,
    state: watch::Receiver<ConnectionState>,
    latest: watch::Receiver<Option<PredictionResult>>,
    events: broadcast::Sender<ClientEvent>,
}

impl StreamingInferenceClient {
    /// Starts the driver task. The client stays idle until `connect` is called.
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: ClientConfig) -> Self {
        let (control_tx, control_rx) = mpsc::channel(32);
        let (frames_tx, frames_rx) = mpsc::channel(config.frame_queue.max(1));
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (latest_tx, latest_rx) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let span = info_span!("inference_client", endpoint = %config.endpoint);
        let driver = Driver {
            machine: ConnectionMachine::new(
                config.endpoint,
                config.mode,
                config.model,
                config.reconnect_delay,
            ),
            socket_tx,
            sink: None,
            socket_task: None,
            reconnect_task: None,
            state_tx,
            latest_tx,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(
            driver
                .run(control_rx, frames_rx, socket_rx)
                .instrument(span),
        );

        Self {
            control: control_tx,
            frames: frames_tx,
            state: state_rx,
            latest: latest_rx,
            events: events_tx,
        }
    }

    async fn command(&self, command: Command) {
        if self.control.send(command).await.is_err() {
            warn!("Inference client driver has stopped; command ignored");
        }
    }

    pub async fn connect(&self) {
        self.command(Command::Connect).await;
    }

    /// Offers one base64 JPEG frame (no data-URL prefix). Returns whether the
    /// frame was queued; frames are dropped while the socket is not open or
    /// when the driver is still busy with earlier frames.
    pub fn send_frame(&self, frame_b64: String) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.frames.try_send(frame_b64).is_ok()
    }

    pub async fn set_mode(&self, mode: Mode) {
        self.command(Command::SetMode(mode)).await;
    }

    pub async fn set_model(&self, model: Model) {
        self.command(Command::SetModel(model)).await;
    }

    pub async fn set_target(&self, target: Option<String>) {
        self.command(Command::SetTarget(target)).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn latest_result(&self) -> Option<PredictionResult> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Calls `callback` once for every decoded prediction until every handle
    /// to the client is dropped or the returned task is aborted. A callback
    /// that falls more than `event_capacity` events behind skips the oldest
    /// ones; the gap is logged as a warning.
    pub fn on_result<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(PredictionResult) + Send + 'static,
    {
        self.listen(move |event| {
            if let ClientEvent::Result(result) = event {
                callback(result);
            }
        })
    }

    /// Calls `callback` for every transport, protocol or server error.
    pub fn on_error<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(crate::ClientError) + Send + 'static,
    {
        self.listen(move |event| {
            if let ClientEvent::Error(e) = event {
                callback(e);
            }
        })
    }

    fn listen<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(ClientEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Listener fell behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Tears the connection down for good: cancels any pending reconnect,
    /// closes the socket and stops the driver.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command(Command::Shutdown(ack_tx)).await;
        let _ = ack_rx.await;
    }
}

struct Driver {
    machine: ConnectionMachine,
    socket_tx: mpsc::UnboundedSender<SocketEvent>,
    sink: Option<(u64, WsSink)>,
    socket_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    state_tx: watch::Sender<ConnectionState>,
    latest_tx: watch::Sender<Option<PredictionResult>>,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut control: mpsc::Receiver<Command>,
        mut frames: mpsc::Receiver<String>,
        mut socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        let effects = self.machine.teardown();
                        self.apply(effects).await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => {
                        let effects = self.handle_command(command);
                        self.apply(effects).await;
                    }
                    None => {
                        let effects = self.machine.teardown();
                        self.apply(effects).await;
                        break;
                    }
                },
                Some(event) = socket_rx.recv() => {
                    let effects = self.handle_socket_event(event);
                    self.apply(effects).await;
                },
                Some(frame) = frames.recv() => {
                    let effects = self.machine.send_frame(frame);
                    self.apply(effects).await;
                },
            }
        }
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
        debug!("Inference client driver stopped");
    }

    fn handle_command(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::Connect => self.machine.connect(),
            Command::SetMode(mode) => self.machine.set_mode(mode),
            Command::SetModel(model) => self.machine.set_model(model),
            Command::SetTarget(target) => self.machine.set_target(target),
            Command::Shutdown(_) => self.machine.teardown(),
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) -> Vec<Effect> {
        match event {
            SocketEvent::Opened { generation, sink } => {
                if generation != self.machine.generation()
                    || self.machine.state() != ConnectionState::Connecting
                {
                    debug!(generation, "Dropping socket from a superseded connect attempt");
                    return Vec::new();
                }
                self.sink = Some((generation, sink));
                self.machine.on_open(generation)
            }
            SocketEvent::Message { generation, text } => self.machine.on_message(generation, &text),
            SocketEvent::Error { generation, error } => self.machine.on_error(generation, error),
            SocketEvent::Closed { generation } => {
                if matches!(self.sink, Some((current, _)) if current == generation) {
                    self.sink = None;
                }
                self.machine.on_close(generation)
            }
            SocketEvent::ReconnectDue { generation } => {
                self.reconnect_task = None;
                self.machine.on_reconnect_due(generation)
            }
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        self.publish_state();
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Open { generation, url } => {
                    if let Some(task) = self.socket_task.take() {
                        task.abort();
                    }
                    self.sink = None;
                    let tx = self.socket_tx.clone();
                    self.socket_task = Some(tokio::spawn(run_socket(generation, url, tx)));
                }
                Effect::Send { generation, text } => {
                    let Some((current, sink)) = self.sink.as_mut() else {
                        continue;
                    };
                    if *current != generation {
                        continue;
                    }
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        queue.extend(self.machine.on_error(generation, e.to_string()));
                    }
                }
                Effect::Close { generation } => {
                    if let Some((current, mut sink)) = self.sink.take() {
                        if current == generation {
                            if let Err(e) = sink.close().await {
                                debug!(error = %e, "Error while closing inference socket");
                            }
                        }
                    }
                    if let Some(task) = self.socket_task.take() {
                        task.abort();
                    }
                }
                Effect::ScheduleReconnect { generation, delay } => {
                    if let Some(task) = self.reconnect_task.take() {
                        task.abort();
                    }
                    let tx = self.socket_tx.clone();
                    self.reconnect_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(SocketEvent::ReconnectDue { generation });
                    }));
                }
                Effect::CancelReconnect => {
                    if let Some(task) = self.reconnect_task.take() {
                        task.abort();
                    }
                }
                Effect::Emit(event) => {
                    if let ClientEvent::Result(result) = &event {
                        self.latest_tx.send_replace(Some(result.clone()));
                    }
                    // No receivers is fine; nobody is listening yet.
                    let _ = self.events_tx.send(event);
                }
            }
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

/// Owns one physical socket: connects, then forwards everything it reads to
/// the driver tagged with `generation`. Always ends with `Closed`.
async fn run_socket(generation: u64, url: String, tx: mpsc::UnboundedSender<SocketEvent>) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            error!(generation, error = %e, "Failed to connect to inference backend");
            let _ = tx.send(SocketEvent::Error {
                generation,
                error: e.to_string(),
            });
            let _ = tx.send(SocketEvent::Closed { generation });
            return;
        }
    };
    let (sink, mut stream) = stream.split();
    if tx.send(SocketEvent::Opened { generation, sink }).is_err() {
        return;
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                let _ = tx.send(SocketEvent::Message {
                    generation,
                    text: text.to_string(),
                });
            }
            Ok(WsMessage::Close(frame)) => {
                debug!(generation, ?frame, "Inference backend closed the socket");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(SocketEvent::Error {
                    generation,
                    error: e.to_string(),
                });
                break;
            }
        }
    }
    let _ = tx.send(SocketEvent::Closed { generation });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientError;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{
        accept_hdr_async,
        tungstenite::handshake::server::{ErrorResponse, Request, Response},
    };

    const WAIT: Duration = Duration::from_secs(5);

    async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, String) {
        let (tcp, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut uri = String::new();
        let ws = accept_hdr_async(tcp, |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            uri = request.uri().to_string();
            Ok(response)
        })
        .await
        .unwrap();
        (ws, uri)
    }

    async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_frames_results_and_reconnect_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
        let client = StreamingInferenceClient::spawn(ClientConfig {
            model: Model::Gestures,
            reconnect_delay: Duration::from_millis(50),
            ..ClientConfig::new(endpoint)
        });
        let mut events = client.subscribe();

        assert!(!client.send_frame("ignored".to_string()));
        client.connect().await;

        let (mut server, uri) = accept(&listener).await;
        assert_eq!(uri, "/ws?mode=letters&model=gestures");
        assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
        assert!(client.is_connected());

        server
            .send(WsMessage::Text(json!({"hello": "ready"}).to_string().into()))
            .await
            .unwrap();
        server
            .send(WsMessage::Text(
                json!({"top": "14", "conf": 0.93, "probs": [{"name": "14", "p": 0.93}]})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();

        // The handshake produces no event; the result is next.
        match next_event(&mut events).await {
            ClientEvent::Result(result) => {
                assert_eq!(result.top_label.as_deref(), Some("MORE"));
                assert_eq!(result.candidates[0].label, "MORE");
                assert_eq!(result.mode, Some(Mode::Letters));
            }
            other => panic!("expected a result, got {other:?}"),
        }
        assert_eq!(
            client.latest_result().and_then(|r| r.top_label),
            Some("MORE".to_string())
        );

        assert!(client.send_frame("/9j/4AAQ".to_string()));
        assert_eq!(next_json(&mut server).await, json!({"frame_b64": "/9j/4AAQ"}));

        client.set_mode(Mode::Numbers).await;
        assert_eq!(next_json(&mut server).await, json!({"mode": "numbers"}));

        server.close(None).await.unwrap();
        drop(server);
        assert_eq!(next_event(&mut events).await, ClientEvent::Disconnected);

        let (_server, uri) = accept(&listener).await;
        assert_eq!(uri, "/ws?mode=numbers&model=gestures");
        assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

        client.shutdown().await;
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(!client.send_frame("late".to_string()));
    }

    #[tokio::test]
    async fn test_target_hint_is_sent_on_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
        let client = StreamingInferenceClient::spawn(ClientConfig::new(endpoint));

        client.set_target(Some("B".to_string())).await;
        client.connect().await;

        let (mut server, _) = accept(&listener).await;
        assert_eq!(next_json(&mut server).await, json!({"target": "B"}));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_backend_reports_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
        drop(listener);

        let client = StreamingInferenceClient::spawn(ClientConfig {
            reconnect_delay: Duration::from_millis(20),
            ..ClientConfig::new(endpoint)
        });
        let mut events = client.subscribe();
        client.connect().await;

        assert!(matches!(
            next_event(&mut events).await,
            ClientEvent::Error(ClientError::Transport(_))
        ));
        // It keeps retrying until told to stop.
        assert!(matches!(
            next_event(&mut events).await,
            ClientEvent::Error(ClientError::Transport(_))
        ));
        client.shutdown().await;
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_server_error_is_surfaced_and_connection_survives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
        let client = StreamingInferenceClient::spawn(ClientConfig::new(endpoint));
        let mut events = client.subscribe();
        client.connect().await;

        let (mut server, _) = accept(&listener).await;
        assert_eq!(next_event(&mut events).await, ClientEvent::Connected);

        server
            .send(WsMessage::Text(json!({"error": "model not loaded"}).to_string().into()))
            .await
            .unwrap();
        server
            .send(WsMessage::Text("not json".to_string().into()))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Error(ClientError::Server("model not loaded".to_string()))
        );
        assert!(matches!(
            next_event(&mut events).await,
            ClientEvent::Error(ClientError::Protocol(_))
        ));
        assert!(client.is_connected());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_result_and_error_callbacks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
        let client = StreamingInferenceClient::spawn(ClientConfig {
            model: Model::Gestures,
            ..ClientConfig::new(endpoint)
        });

        let labels = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (calls_tx, mut calls_rx) = mpsc::unbounded_channel();
        let result_task = client.on_result({
            let labels = labels.clone();
            let calls = calls_tx.clone();
            move |result| {
                labels.lock().unwrap().push(result.top_label);
                let _ = calls.send(());
            }
        });
        let error_task = client.on_error({
            let errors = errors.clone();
            move |e| {
                errors.lock().unwrap().push(e);
                let _ = calls_tx.send(());
            }
        });

        let mut state = client.watch_state();
        client.connect().await;
        let (mut server, _) = accept(&listener).await;
        timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Open))
            .await
            .unwrap()
            .unwrap();

        for frame in [
            json!({"hello": "ready"}),
            json!({"error": "model not loaded"}),
            json!({"top": "14", "conf": 0.9}),
            json!({"top": "3", "conf": 0.8}),
        ] {
            server
                .send(WsMessage::Text(frame.to_string().into()))
                .await
                .unwrap();
        }
        for _ in 0..3 {
            timeout(WAIT, calls_rx.recv()).await.unwrap().unwrap();
        }

        assert_eq!(
            *labels.lock().unwrap(),
            vec![Some("MORE".to_string()), Some("3".to_string())]
        );
        assert_eq!(
            *errors.lock().unwrap(),
            vec![ClientError::Server("model not loaded".to_string())]
        );

        client.shutdown().await;
        result_task.abort();
        error_task.abort();
    }

    #[tokio::test]
    async fn test_listener_behind_event_capacity_skips_oldest() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
        let client = StreamingInferenceClient::spawn(ClientConfig {
            event_capacity: 2,
            ..ClientConfig::new(endpoint)
        });
        let mut events = client.subscribe();
        client.connect().await;

        let (mut server, _) = accept(&listener).await;
        for label in ["A", "B", "C"] {
            server
                .send(WsMessage::Text(json!({"top": label, "conf": 0.9}).to_string().into()))
                .await
                .unwrap();
        }
        timeout(WAIT, async {
            while client.latest_result().and_then(|r| r.top_label).as_deref() != Some("C") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Connected, A, B and C were published; only the last two are kept.
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        match events.recv().await.unwrap() {
            ClientEvent::Result(result) => assert_eq!(result.top_label.as_deref(), Some("B")),
            other => panic!("expected a result, got {other:?}"),
        }
        client.shutdown().await;
    }
}
