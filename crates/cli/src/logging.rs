use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over `verbosity` when set.
pub fn init_logging(verbosity: u8) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.with_writer(std::io::stderr)
		.try_init();
}

/// Filter used when `RUST_LOG` is unset: `-v` info, `-vv` debug, `-vvv` trace.
pub fn default_directives(verbosity: u8) -> String {
	let (deps, ours) = match verbosity {
		0 => ("warn", "info"),
		1 => ("info", "info"),
		2 => ("info", "debug"),
		_ => ("debug", "trace"),
	};
	format!("{deps},tether={ours},tether_cli={ours},tether_runtime={ours}")
}
