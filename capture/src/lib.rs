//! Packet acquisition backends: a narrow, self-contained collaborator that
//! turns live network traffic into the opaque `[addr; 16][tcp segment]`
//! capture records the reassembler consumes. Nothing in here understands
//! HTTP, TCP reassembly, or message pairing.

pub mod ip;
pub mod link;
pub mod pcap_file;
pub mod pcap_live;
pub mod raw;
pub mod record;
pub mod replay;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Which packet-acquisition backend to use.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Backend {
	Raw,
	Pcap,
}

impl std::str::FromStr for Backend {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"raw" => Ok(Backend::Raw),
			"pcap" => Ok(Backend::Pcap),
			other => Err(format!("Unknown capture backend: {other:?}")),
		}
	}
}

#[derive(Clone, Debug)]
pub struct Config {
	/// Interface address to bind/filter on. `None` means "every interface".
	pub bind: Option<IpAddr>,
	pub port: u16,
	pub backend: Backend,
	pub track_response: bool,
	pub expire: Duration,
}

#[derive(Debug)]
pub enum Error {
	DeviceNotFound { interfaces: Vec<(String, Vec<IpAddr>)> },
	UnknownBackend(String),
	Io(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::DeviceNotFound { interfaces } => {
				write!(f, "No matching capture device found. Available interfaces:")?;
				for (name, addrs) in interfaces {
					write!(f, "\n  {name}: {addrs:?}")?;
				}
				Ok(())
			}
			Error::UnknownBackend(msg) => write!(f, "{msg}"),
			Error::Io(msg) => write!(f, "{msg}"),
		}
	}
}

impl std::error::Error for Error {}

/// A running set of capture worker threads. Dropping this does not stop the
/// threads — call [`Handle::shutdown`] and join first.
#[derive(Debug)]
pub struct Handle {
	threads: Vec<JoinHandle<()>>,
	shutdown: Arc<AtomicBool>,
}

impl Handle {
	/// Signal every capture thread to stop at its next opportunity (the next
	/// read timeout) and wait for them to exit.
	pub fn shutdown(self) {
		self.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);

		for thread in self.threads {
			let _ = thread.join();
		}
	}
}

/// Start capture workers per `config.backend`, forwarding records onto `tx`.
pub fn spawn(config: &Config, tx: crossbeam_channel::Sender<Vec<u8>>) -> Result<Handle, Error> {
	let shutdown = Arc::new(AtomicBool::new(false));

	let threads = match config.backend {
		Backend::Raw => vec![raw::spawn(config, tx, shutdown.clone())?],
		Backend::Pcap => pcap_live::spawn(config, tx, shutdown.clone())?,
	};

	Ok(Handle { threads, shutdown })
}
