//! Capability traits for the protocol client that owns the wire protocol.

use std::sync::Arc;

use async_trait::async_trait;
use tether_protocol::{ClientFingerprint, Credentials, DisconnectReason, InboundMessage, SessionIdentity};
use tokio::sync::mpsc;

use crate::error::Result;

/// Options passed through to every connect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
	pub identity: SessionIdentity,
	pub fingerprint: ClientFingerprint,
}

/// Events a live session reports, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
	/// A QR payload for linking a new device. May rotate.
	Qr(String),
	/// The handshake finished; the session is usable.
	Open,
	/// The remote rotated or issued credentials; persist them.
	CredentialsUpdated(Credentials),
	/// The session ended. No further events follow.
	Closed(DisconnectReason),
	Message(InboundMessage),
}

/// Handle to one established session.
#[async_trait]
pub trait SessionHandle: Send + Sync {
	async fn send(&self, target: &str, content: &str) -> Result<()>;

	/// Asks the remote for an out-of-band pairing code for `number`.
	async fn request_pairing_code(&self, number: &str) -> Result<String>;

	/// Closes the session gracefully. Idempotent.
	async fn close(&self) -> Result<()>;
}

/// A connected session: its handle plus the event stream.
pub struct Session {
	pub handle: Arc<dyn SessionHandle>,
	pub events: mpsc::Receiver<SessionEvent>,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session").finish_non_exhaustive()
	}
}

/// Opens sessions with the remote messaging service.
///
/// `connect` resolves once the transport is up; the handshake outcome arrives
/// as [`SessionEvent::Open`] or [`SessionEvent::Closed`]. A connect without
/// credentials starts device linking and yields QR events.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
	async fn connect(&self, credentials: Option<Credentials>, options: &ConnectOptions) -> Result<Session>;
}
