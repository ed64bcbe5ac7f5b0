//! Collaborators the supervisor reports to.

use async_trait::async_trait;
use tether_protocol::{Challenge, ChallengeProblem, InboundMessage};

use crate::error::Result;
use crate::supervisor::Outbox;

/// Renders challenges for a human. Rendering must not block.
pub trait PresentationSink: Send + Sync {
	fn show_challenge(&self, challenge: &Challenge);

	/// The current challenge cannot be used (expired, misconfigured, failed).
	fn challenge_unavailable(&self, problem: &ChallengeProblem);
}

/// Delivers owner status pings. Failures are logged by the caller, never retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
	async fn notify(&self, target: &str, content: &str) -> Result<()>;
}

/// Receives every inbound message, one at a time, in arrival order.
#[async_trait]
pub trait CommandDispatch: Send + Sync {
	async fn on_message(&self, message: InboundMessage, outbox: Outbox);
}

/// Presentation sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPresentation;

impl PresentationSink for NoPresentation {
	fn show_challenge(&self, _challenge: &Challenge) {}

	fn challenge_unavailable(&self, _problem: &ChallengeProblem) {}
}

#[async_trait]
impl NotificationSink for Outbox {
	async fn notify(&self, target: &str, content: &str) -> Result<()> {
		self.send(target, content).await
	}
}
