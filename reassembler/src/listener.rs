//! The facade a binary actually constructs: owns a `Reassembler` worker
//! thread, the capture backend that feeds it, and the bounded channels that
//! connect them. A thin owning type around an otherwise-standalone worker
//! loop, signaled down via the same `AtomicBool` shutdown flag `runtime`
//! uses elsewhere in this workspace.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::info;

use crate::message::Message;
use crate::reassembler::{Reassembler, Stats};

const QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_EXPIRE: Duration = Duration::from_millis(2000);

/// Construction parameters for [`Listener::spawn`].
#[derive(Clone, Debug)]
pub struct Config {
	/// Interface address to bind/filter on. `None` means every interface.
	pub bind: Option<IpAddr>,
	/// Listener port. `0` means test mode: no capture thread is started,
	/// and callers drive the reassembler entirely through [`Listener::submit`].
	pub port: u16,
	/// Capture backend name (`"raw"` or `"pcap"`), parsed in [`Listener::spawn`].
	/// An unrecognized name is a fatal configuration error, checked even in
	/// test mode so a typo in config surfaces the same way regardless of port.
	pub backend: String,
	pub track_response: bool,
	/// Idle duration after which an unfinished message is forced through GC.
	/// Zero means "use the default" (2000ms).
	pub expire: Duration,
}

/// Coarse-grained diagnostics, separate from the message stream, for a
/// consumer that wants visibility into capture health without scraping logs.
#[derive(Clone, Debug)]
pub enum Event {
	CaptureStarted,
	DeviceError(String),
	MessagesDropped { n: u64 },
}

/// A point-in-time read of the reassembler's counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
	pub messages_live: u64,
	pub packets_processed: u64,
	pub messages_emitted: u64,
	pub messages_expired: u64,
}

/// Owns a running reassembler and (outside of test mode) the capture
/// backend feeding it. Dropping a `Listener` without calling [`Listener::close`]
/// leaves its worker threads running; `close` is the clean shutdown path.
#[derive(Debug)]
pub struct Listener {
	inbound: Sender<Vec<u8>>,
	outbound: Receiver<Message>,
	events: Receiver<Event>,
	ready: Receiver<()>,
	stats: Arc<Stats>,
	capture: Option<capture::Handle>,
	reassembler_shutdown: Arc<AtomicBool>,
	reassembler_thread: Option<JoinHandle<()>>,
	monitor_shutdown: Arc<AtomicBool>,
	monitor_thread: Option<JoinHandle<()>>,
}

impl Listener {
	/// Start the reassembler worker and, unless `config.port == 0`, the
	/// capture backend. Fatal at startup: a bad interface or unknown backend
	/// is the one place callers need a structured error to print something
	/// useful, rather than a logged-and-swallowed `()`.
	pub fn spawn(config: Config) -> Result<Listener, capture::Error> {
		let backend: capture::Backend = config.backend.parse().map_err(capture::Error::UnknownBackend)?;
		let expire = if config.expire.is_zero() { DEFAULT_EXPIRE } else { config.expire };

		let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
		let (outbound_tx, outbound_rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
		let (events_tx, events_rx) = crossbeam_channel::unbounded();
		let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

		let stats = Arc::new(Stats::default());

		let capture = if config.port == 0 {
			let _ = ready_tx.send(());
			None
		} else {
			let capture_config = capture::Config { bind: config.bind, port: config.port, backend, track_response: config.track_response, expire };

			match capture::spawn(&capture_config, inbound_tx.clone()) {
				Ok(handle) => {
					info!("Capture backend live on port {}", config.port);
					let _ = events_tx.send(Event::CaptureStarted);
					let _ = ready_tx.send(());
					Some(handle)
				}
				Err(err) => {
					let _ = events_tx.send(Event::DeviceError(err.to_string()));
					return Err(err);
				}
			}
		};

		let reassembler_shutdown = Arc::new(AtomicBool::new(false));
		let engine = Reassembler::new(config.port, config.track_response, expire, stats.clone());

		let worker_shutdown = reassembler_shutdown.clone();
		let worker_outbound = outbound_tx.clone();
		let reassembler_thread = std::thread::spawn(move || {
			crate::reassembler::run(engine, config.port, inbound_rx, worker_outbound, worker_shutdown);
		});

		let monitor_shutdown = Arc::new(AtomicBool::new(false));
		let monitor_thread = spawn_drop_monitor(stats.clone(), events_tx, monitor_shutdown.clone());

		Ok(Listener {
			inbound: inbound_tx,
			outbound: outbound_rx,
			events: events_rx,
			ready: ready_rx,
			stats,
			capture,
			reassembler_shutdown,
			reassembler_thread: Some(reassembler_thread),
			monitor_shutdown,
			monitor_thread: Some(monitor_thread),
		})
	}

	/// Enqueue one capture record (`[16-byte src addr][TCP segment]`).
	/// Non-blocking: returns `false` (and drops the record) if the inbound
	/// queue is full, the same overload behavior as the capture backends.
	pub fn submit(&self, raw: Vec<u8>) -> bool {
		self.inbound.try_send(raw).is_ok()
	}

	/// A handle to read completed messages. Cheap to clone (it's a
	/// `crossbeam_channel::Receiver`); every clone sees every message once.
	pub fn receiver(&self) -> Receiver<Message> {
		self.outbound.clone()
	}

	pub fn events(&self) -> Receiver<Event> {
		self.events.clone()
	}

	/// Fires once capture is live (or immediately, in test mode).
	pub fn ready(&self) -> Receiver<()> {
		self.ready.clone()
	}

	pub fn stats(&self) -> StatsSnapshot {
		StatsSnapshot {
			messages_live: self.stats.messages_live.load(Ordering::Relaxed),
			packets_processed: self.stats.packets_processed.load(Ordering::Relaxed),
			messages_emitted: self.stats.messages_emitted.load(Ordering::Relaxed),
			messages_expired: self.stats.messages_expired.load(Ordering::Relaxed),
		}
	}

	/// Cease input, release capture resources, and stop draining output.
	/// Joins every worker thread before returning.
	pub fn close(mut self) {
		if let Some(capture) = self.capture.take() {
			capture.shutdown();
		}

		self.reassembler_shutdown.store(true, Ordering::Relaxed);
		if let Some(thread) = self.reassembler_thread.take() {
			let _ = thread.join();
		}

		self.monitor_shutdown.store(true, Ordering::Relaxed);
		if let Some(thread) = self.monitor_thread.take() {
			let _ = thread.join();
		}
	}
}

/// Watches `stats.messages_dropped` and forwards increments onto the events
/// channel, so a consumer gets drop visibility without polling `stats()`
/// itself. A tick-driven diff rather than a callback from the reassembler,
/// since nothing on the hot path should block on sending an event.
fn spawn_drop_monitor(stats: Arc<Stats>, events: Sender<Event>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
	std::thread::spawn(move || {
		let tick = crossbeam_channel::tick(Duration::from_millis(500));
		let mut last_seen = 0u64;

		while !shutdown.load(Ordering::Relaxed) {
			let _ = tick.recv();

			let current = stats.messages_dropped.load(Ordering::Relaxed);
			if current > last_seen {
				let _ = events.send(Event::MessagesDropped { n: current - last_seen });
				last_seen = current;
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_backend_is_fatal_at_startup() {
		let err = Listener::spawn(Config { bind: None, port: 0, backend: "tcpdump".to_string(), track_response: false, expire: Duration::ZERO }).unwrap_err();
		assert!(matches!(err, capture::Error::UnknownBackend(_)));
	}

	#[test]
	fn test_mode_has_no_capture_thread_and_is_ready_immediately() {
		let listener = Listener::spawn(Config { bind: None, port: 0, backend: "raw".to_string(), track_response: false, expire: Duration::ZERO }).unwrap();

		listener.ready().recv_timeout(Duration::from_millis(100)).expect("ready fires immediately in test mode");
		assert!(listener.capture.is_none());

		listener.close();
	}

	#[test]
	fn submit_and_receive_round_trip() {
		// Test mode (port 0): no capture thread is spawned, so the fixture
		// packet targets dst_port 0 to match the reassembler's listener_port.
		let listener = Listener::spawn(Config { bind: None, port: 0, backend: "raw".to_string(), track_response: false, expire: Duration::from_millis(50) }).unwrap();

		listener.ready().recv_timeout(Duration::from_millis(200)).unwrap();

		let segment = {
			let mut seg = vec![0u8; 20 + 18];
			seg[0..2].copy_from_slice(&4000u16.to_be_bytes());
			seg[2..4].copy_from_slice(&0u16.to_be_bytes());
			seg[4..8].copy_from_slice(&1000u32.to_be_bytes());
			seg[8..12].copy_from_slice(&500u32.to_be_bytes());
			seg[12] = 5 << 4;
			seg[13] = 0x18;
			seg[20..].copy_from_slice(b"GET / HTTP/1.1\r\n\r\n");
			seg
		};
		let record = capture::record::encode("10.0.0.1".parse().unwrap(), &segment);

		assert!(listener.submit(record));

		let receiver = listener.receiver();
		let message = receiver.recv_timeout(Duration::from_secs(1)).expect("message emitted");
		assert!(message.is_incoming);

		let snapshot = listener.stats();
		assert_eq!(snapshot.messages_emitted, 1);

		listener.close();
	}
}
