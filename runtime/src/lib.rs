pub mod clock;
pub mod logger;

pub use clock::Clock;

use log::LevelFilter;

/// Install [`logger::Logger`] as the global `log` sink.
///
/// Safe to call more than once; only the first call takes effect.
pub fn init_logging(level: LevelFilter) {
	static LOGGER: logger::Logger = logger::Logger;

	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(level);
	}
}

/// Install a Ctrl+C handler that flips an `AtomicBool` a caller can poll
/// from a reassembler or capture loop. Does not itself drive shutdown —
/// callers decide what "stop" means for their own loop.
pub fn shutdown_signal() -> std::sync::Arc<std::sync::atomic::AtomicBool> {
	let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
	let handler_flag = flag.clone();

	if let Err(err) = ctrlc::set_handler(move || {
		handler_flag.store(true, std::sync::atomic::Ordering::SeqCst);
	}) {
		log::warn!("Failed to install Ctrl+C handler: {err}");
	}

	flag
}
