use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use pcap::{Active, Capture, Device};

use crate::link::Linktype;
use crate::{record, Config, Error};

const SNAPLEN: i32 = 65536;

/// Every non-loopback interface whose addresses intersect `bind` (or every
/// interface, when `bind` is empty/"all interfaces").
pub fn matching_interfaces(bind: Option<IpAddr>) -> Result<Vec<Device>, Error> {
	let devices = Device::list().map_err(|err| Error::Io(format!("Failed to list capture devices: {err}")))?;

	let matches: Vec<Device> = devices
		.into_iter()
		.filter(|device| match bind {
			None => !device.addresses.is_empty(),
			Some(addr) => device.addresses.iter().any(|a| a.addr == addr),
		})
		.collect();

	if matches.is_empty() {
		let available = Device::list()
			.unwrap_or_default()
			.into_iter()
			.map(|d| (d.name, d.addresses.into_iter().map(|a| a.addr).collect()))
			.collect();

		return Err(Error::DeviceNotFound { interfaces: available });
	}

	Ok(matches)
}

fn bpf_filter(port: u16, track_response: bool, device: &Device) -> String {
	let hosts: Vec<String> = device.addresses.iter().map(|a| a.addr.to_string()).collect();
	let host_clause = if hosts.is_empty() { String::new() } else { format!(" and (dst host {})", hosts.join(" or dst host ")) };

	if track_response {
		let src_host_clause = if hosts.is_empty() { String::new() } else { format!(" and (src host {})", hosts.join(" or src host ")) };
		format!("(tcp dst port {port}{host_clause}) or (tcp src port {port}{src_host_clause})")
	} else {
		format!("tcp dst port {port}{host_clause}")
	}
}

/// Spawns one capture thread per matching interface. Interfaces are opened
/// with a read timeout equal to `config.expire`, so each capture thread
/// wakes up periodically to check `shutdown` even with no traffic — this is
/// the cooperative substitute for explicitly closing the pcap handle from
/// another thread, which the Rust bindings don't expose a safe way to do.
pub fn spawn(config: &Config, tx: Sender<Vec<u8>>, shutdown: Arc<AtomicBool>) -> Result<Vec<JoinHandle<()>>, Error> {
	let devices = matching_interfaces(config.bind)?;
	let mut join_handles = Vec::with_capacity(devices.len());

	for device in devices {
		let name = device.name.clone();
		let filter = bpf_filter(config.port, config.track_response, &device);

		let inactive = Capture::from_device(device).map_err(|err| Error::Io(format!("Failed to open {name}: {err}")))?;

		let mut active = inactive
			.promisc(true)
			.snaplen(SNAPLEN)
			.timeout(config.expire.as_millis().try_into().unwrap_or(i32::MAX))
			.open()
			.map_err(|err| Error::Io(format!("Failed to activate capture on {name}: {err}")))?;

		// BPF filtering isn't supported on every platform pcap targets (notably
		// Darwin's older libpcap); a failure here degrades to userspace
		// filtering rather than aborting the capture.
		if let Err(err) = active.filter(&filter, true) {
			warn!("Could not install BPF filter {filter:?} on {name}: {err}");
		}

		let linktype = Linktype::from_pcap(active.get_datalink());

		let tx = tx.clone();
		let shutdown = shutdown.clone();
		let device_name = name.clone();

		join_handles.push(std::thread::spawn(move || {
			info!("Listening for TCP traffic on interface {device_name}");
			run(active, linktype, &device_name, &tx, &shutdown);
		}));
	}

	Ok(join_handles)
}

fn run(mut capture: Capture<Active>, linktype: Option<Linktype>, device_name: &str, tx: &Sender<Vec<u8>>, shutdown: &AtomicBool) {
	let Some(linktype) = linktype else {
		error!("Unsupported data-link type on {device_name}, not capturing");
		return;
	};

	while !shutdown.load(Ordering::Relaxed) {
		match capture.next_packet() {
			Ok(packet) => {
				let Some(ip_buf) = crate::link::strip(linktype, packet.data) else {
					continue;
				};

				let Some((addr, segment)) = crate::ip::tcp_segment(ip_buf) else {
					continue;
				};

				let record = record::encode(addr, segment);

				if tx.try_send(record).is_err() {
					debug!("Inbound capture queue full, dropping packet from {device_name}");
				}
			}
			Err(pcap::Error::TimeoutExpired) => continue,
			Err(err) => {
				warn!("Error reading from {device_name}: {err}");
			}
		}
	}
}
