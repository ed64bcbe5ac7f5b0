//! Retry timing: environment profiles, retry policies and the backoff function.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

/// Upper bound for fast retries, whatever the configured delay.
pub const FAST_RETRY_CEILING: Duration = Duration::from_secs(10);

/// Deployment style the process was started in. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvironmentProfile {
	/// A person is watching; give up after a bounded number of attempts.
	#[default]
	Interactive,
	/// Cloud or container hosting; keep retrying forever.
	Unattended,
}

impl EnvironmentProfile {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Interactive => "interactive",
			Self::Unattended => "unattended",
		}
	}

	/// Default retry policy for this profile.
	pub fn retry_policy(self) -> RetryPolicy {
		match self {
			Self::Interactive => RetryPolicy::interactive(),
			Self::Unattended => RetryPolicy::unattended(),
		}
	}
}

impl fmt::Display for EnvironmentProfile {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EnvironmentProfile {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"interactive" | "local" => Ok(Self::Interactive),
			"unattended" | "cloud" | "production" => Ok(Self::Unattended),
			other => Err(format!("unknown environment profile '{other}' (expected interactive or unattended)")),
		}
	}
}

/// Immutable retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
	pub base_delay: Duration,
	pub multiplier: f64,
	pub max_delay: Duration,
	/// Fraction of the delay added or removed at random, in `[0, 1]`.
	pub jitter_ratio: f64,
	/// Soft-cap the attempt counter instead of giving up.
	pub infinite_in_production: bool,
	/// Hard ceiling (interactive) or soft-cap trigger (unattended).
	pub attempt_ceiling: u32,
	pub fast_retry_delay: Duration,
	/// Consecutive fast retries allowed before falling back to backoff.
	pub fast_retry_limit: u32,
}

/// Outcome of scheduling the next backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
	Wait { attempt: u32, delay: Duration },
	/// The hard ceiling was reached; stop retrying.
	GiveUp { attempts: u32 },
}

impl RetryPolicy {
	pub fn interactive() -> Self {
		Self {
			base_delay: Duration::from_secs(1),
			multiplier: 2.0,
			max_delay: Duration::from_secs(60),
			jitter_ratio: 0.1,
			infinite_in_production: false,
			attempt_ceiling: 10,
			fast_retry_delay: Duration::from_secs(2),
			fast_retry_limit: 5,
		}
	}

	pub fn unattended() -> Self {
		Self {
			base_delay: Duration::from_secs(2),
			multiplier: 2.0,
			max_delay: Duration::from_secs(300),
			jitter_ratio: 0.2,
			infinite_in_production: true,
			attempt_ceiling: 12,
			fast_retry_delay: Duration::from_secs(2),
			fast_retry_limit: 5,
		}
	}

	/// Delay before jitter: `base * multiplier^(attempt-1)`, capped at `max_delay`.
	pub fn unjittered(&self, attempt: u32) -> Duration {
		let exponent = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
		let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
		let max = self.max_delay.as_secs_f64();
		if !secs.is_finite() || secs >= max {
			self.max_delay
		} else {
			Duration::from_secs_f64(secs.max(0.0))
		}
	}

	/// Jittered delay for `attempt`, never above `max_delay`.
	pub fn next_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
		jitter(self.unjittered(attempt), self.jitter_ratio, rng).min(self.max_delay)
	}

	/// Advances the long-horizon counter after a failure and picks the wait.
	///
	/// `previous` is the number of backoff attempts already consumed.
	pub fn schedule<R: Rng + ?Sized>(&self, previous: u32, rng: &mut R) -> RetryDecision {
		let mut attempt = previous.saturating_add(1);
		if attempt > self.attempt_ceiling {
			if !self.infinite_in_production {
				return RetryDecision::GiveUp { attempts: previous };
			}
			// Resume halfway up the ramp so the delay stays large.
			attempt = (self.attempt_ceiling / 2).max(1);
		}
		RetryDecision::Wait {
			attempt,
			delay: self.next_delay(attempt, rng),
		}
	}

	/// Jittered fast-retry delay, capped at [`FAST_RETRY_CEILING`].
	pub fn fast_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
		jitter(self.fast_retry_delay, self.jitter_ratio, rng).min(FAST_RETRY_CEILING)
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::interactive()
	}
}

fn jitter<R: Rng + ?Sized>(delay: Duration, ratio: f64, rng: &mut R) -> Duration {
	let ratio = ratio.clamp(0.0, 1.0);
	if ratio == 0.0 || delay.is_zero() {
		return delay;
	}
	let factor = rng.gen_range((1.0 - ratio)..=(1.0 + ratio));
	Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
