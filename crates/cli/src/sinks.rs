//! Terminal-facing collaborators for the supervisor.

use std::io::Write;

use async_trait::async_trait;
use tether_protocol::{Challenge, ChallengeProblem, InboundMessage};
use tether_runtime::backup::EmergencySnapshot;
use tether_runtime::sinks::{CommandDispatch, PresentationSink};
use tether_runtime::supervisor::Outbox;
use tracing::{debug, error, info, warn};

/// Prints challenges to stdout for whoever is at the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPresenter;

impl TerminalPresenter {
	/// Text shown for `challenge`.
	pub fn render(challenge: &Challenge) -> String {
		match challenge {
			Challenge::Qr { payload } => format!(
				"Link this device: open Linked Devices on your phone and scan a QR code made from:\n\n{payload}\n"
			),
			Challenge::PairingCode { code, expires_in_secs } => format!(
				"Link this device: choose \"Link with phone number\" on your phone and enter\n\n    {}\n\nThe code expires in {expires_in_secs}s.\n",
				group_code(code)
			),
		}
	}
}

impl PresentationSink for TerminalPresenter {
	fn show_challenge(&self, challenge: &Challenge) {
		let mut stdout = std::io::stdout().lock();
		let _ = writeln!(stdout, "{}", Self::render(challenge));
		let _ = stdout.flush();
	}

	fn challenge_unavailable(&self, problem: &ChallengeProblem) {
		warn!(target = "tether", %problem, "challenge unavailable");
		eprintln!("{problem}");
		if matches!(problem, ChallengeProblem::Expired) {
			eprintln!("Run `tether reset` to start over.");
		}
	}
}

/// Splits an unformatted 8-character code as `ABCD-EFGH`.
fn group_code(code: &str) -> String {
	if code.len() == 8 && code.is_ascii() && !code.contains('-') {
		format!("{}-{}", &code[..4], &code[4..])
	} else {
		code.to_string()
	}
}

/// Logs inbound messages and answers `!ping`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingDispatch;

#[async_trait]
impl CommandDispatch for PingDispatch {
	async fn on_message(&self, message: InboundMessage, outbox: Outbox) {
		debug!(target = "tether", id = %message.id, chat = %message.chat, "inbound message");
		if message.text.as_deref().map(str::trim) != Some("!ping") {
			return;
		}
		match outbox.send(&message.chat, "pong").await {
			Ok(()) => info!(target = "tether", to = %message.chat, "answered ping"),
			Err(err) => warn!(target = "tether", to = %message.chat, error = %err, "ping reply failed"),
		}
	}
}

/// Takes a bounded-wait credential snapshot before the default panic output.
pub fn install_panic_hook(snapshot: EmergencySnapshot) {
	let previous = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		match snapshot.take() {
			Ok(Some(record)) => eprintln!("credentials saved to {} before exit", record.blob_ref.display()),
			Ok(None) => {}
			Err(err) => error!(target = "tether.backup", error = %err, "emergency snapshot failed"),
		}
		previous(info);
	}));
}
