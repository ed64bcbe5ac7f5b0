//! [`ProtocolClient`] over a WebSocket relay bridge.
//!
//! The bridge speaks the messaging network's wire protocol; this side only
//! exchanges the JSON frames from [`tether_protocol::relay`]. One WebSocket
//! carries one session: a writer task drains outgoing frames and a reader task
//! turns server frames into [`SessionEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tether_protocol::{ClientFrame, Credentials, DisconnectReason, ServerFrame};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::client::{ConnectOptions, ProtocolClient, Session, SessionEvent, SessionHandle};
use crate::error::{Error, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const PAIRING_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CHANNEL_CAPACITY: usize = 64;

type PendingCodes = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<String>>>>>;

/// Connects to a relay bridge at a `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct RelayClient {
	url: String,
	connect_timeout: Duration,
}

impl RelayClient {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
		}
	}

	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
		self
	}

	pub fn url(&self) -> &str {
		&self.url
	}
}

#[async_trait]
impl ProtocolClient for RelayClient {
	async fn connect(&self, credentials: Option<Credentials>, options: &ConnectOptions) -> Result<Session> {
		debug!(target = "tether.relay", url = %self.url, identity = %options.identity, "opening relay connection");
		let (socket, _) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(self.url.as_str()))
			.await
			.map_err(|_| Error::Transport(format!("relay connect to {} timed out", self.url)))?
			.map_err(|err| Error::Transport(format!("relay connect to {} failed: {err}", self.url)))?;
		let (mut sink, mut stream) = socket.split();

		let hello = ClientFrame::Hello {
			identity: options.identity.clone(),
			credentials,
			fingerprint: options.fingerprint.clone(),
		};
		sink.send(Message::Text(serde_json::to_string(&hello)?.into()))
			.await
			.map_err(|err| Error::Transport(err.to_string()))?;

		let (frames_tx, mut frames_rx) = mpsc::channel::<ClientFrame>(CHANNEL_CAPACITY);
		let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(CHANNEL_CAPACITY);
		let pending: PendingCodes = Arc::default();

		tokio::spawn(async move {
			while let Some(frame) = frames_rx.recv().await {
				let closing = matches!(frame, ClientFrame::Close);
				let text = match serde_json::to_string(&frame) {
					Ok(text) => text,
					Err(err) => {
						warn!(target = "tether.relay", error = %err, "dropping unserializable frame");
						continue;
					}
				};
				if let Err(err) = sink.send(Message::Text(text.into())).await {
					debug!(target = "tether.relay", error = %err, "relay write failed");
					break;
				}
				if closing {
					break;
				}
			}
			let _ = sink.close().await;
		});

		let reader_pending = Arc::clone(&pending);
		tokio::spawn(async move {
			let reason = loop {
				let Some(message) = stream.next().await else {
					break DisconnectReason::StreamEnded;
				};
				let text = match message {
					Ok(Message::Text(text)) => text,
					Ok(Message::Close(_)) => break DisconnectReason::StreamEnded,
					Ok(_) => continue,
					Err(err) => break DisconnectReason::transport(err.to_string()),
				};
				let frame: ServerFrame = match serde_json::from_str(&text) {
					Ok(frame) => frame,
					Err(err) => {
						warn!(target = "tether.relay", error = %err, "ignoring malformed relay frame");
						continue;
					}
				};
				trace!(target = "tether.relay", ?frame, "relay frame");

				let event = match frame {
					ServerFrame::Qr { payload } => SessionEvent::Qr(payload),
					ServerFrame::Open => SessionEvent::Open,
					ServerFrame::Credentials { credentials } => SessionEvent::CredentialsUpdated(credentials),
					ServerFrame::Message { message } => SessionEvent::Message(message),
					ServerFrame::Close { code, message } => break DisconnectReason::Remote { code, message },
					ServerFrame::PairingCode { request_id, code } => {
						resolve(&reader_pending, request_id, Ok(code));
						continue;
					}
					ServerFrame::PairingCodeError { request_id, message } => {
						let err = Error::ProtocolRejection {
							reason: DisconnectReason::transport(message),
						};
						resolve(&reader_pending, request_id, Err(err));
						continue;
					}
				};
				if events_tx.send(event).await.is_err() {
					return;
				}
			};

			for (_, waiter) in reader_pending.lock().drain() {
				let _ = waiter.send(Err(Error::Transport("relay connection closed".to_string())));
			}
			let _ = events_tx.send(SessionEvent::Closed(reason)).await;
		});

		Ok(Session {
			handle: Arc::new(RelaySession {
				frames: frames_tx,
				pending,
				next_request: AtomicU64::new(1),
				closed: AtomicBool::new(false),
			}),
			events: events_rx,
		})
	}
}

fn resolve(pending: &PendingCodes, request_id: u64, result: Result<String>) {
	match pending.lock().remove(&request_id) {
		Some(waiter) => {
			let _ = waiter.send(result);
		}
		None => debug!(target = "tether.relay", request_id, "pairing response for unknown request"),
	}
}

struct RelaySession {
	frames: mpsc::Sender<ClientFrame>,
	pending: PendingCodes,
	next_request: AtomicU64,
	closed: AtomicBool,
}

impl RelaySession {
	async fn push(&self, frame: ClientFrame) -> Result<()> {
		self.frames
			.send(frame)
			.await
			.map_err(|_| Error::Transport("relay connection closed".to_string()))
	}
}

#[async_trait]
impl SessionHandle for RelaySession {
	async fn send(&self, target: &str, content: &str) -> Result<()> {
		self.push(ClientFrame::Send {
			target: target.to_string(),
			content: content.to_string(),
		})
		.await
	}

	async fn request_pairing_code(&self, number: &str) -> Result<String> {
		let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(request_id, tx);

		if let Err(err) = self
			.push(ClientFrame::RequestPairingCode {
				request_id,
				number: number.to_string(),
			})
			.await
		{
			self.pending.lock().remove(&request_id);
			return Err(err);
		}

		match tokio::time::timeout(PAIRING_REQUEST_TIMEOUT, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(Error::Transport("relay connection closed".to_string())),
			Err(_) => {
				self.pending.lock().remove(&request_id);
				Err(Error::Transport("pairing code request timed out".to_string()))
			}
		}
	}

	async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		// The writer may already be gone after a remote close.
		let _ = self.frames.send(ClientFrame::Close).await;
		Ok(())
	}
}
