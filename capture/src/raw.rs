//! Raw IP socket backend. Opens a single `AF_INET` `SOCK_RAW` socket bound to
//! `IPPROTO_TCP`, which on Unix delivers every locally-visible TCP/IP
//! datagram regardless of destination port — filtering to the listener's
//! port happens in userspace via [`is_valid_packet`].

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use log::{debug, warn};

use crate::{record, Config, Error};

const RECV_BUF: usize = 65536;

#[cfg(unix)]
pub fn spawn(config: &Config, tx: Sender<Vec<u8>>, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>, Error> {
	let fd = open_socket(config.bind)?;
	let port = config.port;
	let track_response = config.track_response;

	Ok(std::thread::spawn(move || run(fd, port, track_response, &tx, &shutdown)))
}

#[cfg(not(unix))]
pub fn spawn(_config: &Config, _tx: Sender<Vec<u8>>, _shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>, Error> {
	Err(Error::Io("Raw IP socket capture is only supported on Unix".into()))
}

#[cfg(unix)]
fn open_socket(bind: Option<IpAddr>) -> Result<libc::c_int, Error> {
	use std::mem::{size_of, zeroed};

	unsafe {
		let fd = libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_TCP);

		if fd < 0 {
			return Err(Error::Io(format!("Failed to open raw socket: {}", std::io::Error::last_os_error())));
		}

		if let Some(IpAddr::V4(addr)) = bind {
			let mut sockaddr: libc::sockaddr_in = zeroed();
			sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
			sockaddr.sin_addr.s_addr = u32::from_ne_bytes(addr.octets());

			let ret = libc::bind(fd, &sockaddr as *const _ as *const libc::sockaddr, size_of::<libc::sockaddr_in>() as u32);

			if ret < 0 {
				let err = std::io::Error::last_os_error();
				libc::close(fd);
				return Err(Error::Io(format!("Failed to bind raw socket to {addr}: {err}")));
			}
		}

		// A receive timeout lets the loop periodically check `shutdown` even
		// with no traffic, mirroring the pcap backend's read-timeout behavior.
		let timeout = libc::timeval { tv_sec: 1, tv_usec: 0 };
		libc::setsockopt(
			fd,
			libc::SOL_SOCKET,
			libc::SO_RCVTIMEO,
			&timeout as *const _ as *const libc::c_void,
			size_of::<libc::timeval>() as u32,
		);

		Ok(fd)
	}
}

#[cfg(unix)]
fn run(fd: libc::c_int, port: u16, track_response: bool, tx: &Sender<Vec<u8>>, shutdown: &AtomicBool) {
	let mut buf = vec![0u8; RECV_BUF];

	while !shutdown.load(Ordering::Relaxed) {
		let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };

		if n < 0 {
			let err = std::io::Error::last_os_error();

			match err.kind() {
				std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => continue,
				std::io::ErrorKind::Interrupted => continue,
				_ => {
					warn!("Raw socket read failed: {err}");
					continue;
				}
			}
		}

		let Some((addr, segment)) = crate::ip::tcp_segment(&buf[..n as usize]) else { continue };

		if !is_valid_packet(segment, port, track_response) {
			continue;
		}

		if tx.try_send(record::encode(addr, segment)).is_err() {
			debug!("Inbound capture queue full, dropping packet");
		}
	}

	unsafe { libc::close(fd) };
}

/// A packet is worth forwarding when it targets the listener's port — as a
/// destination always, and as a source too when response tracking is on —
/// and actually carries a TCP payload (bare ACKs are noise for an HTTP
/// sniffer that never needs to see them).
fn is_valid_packet(segment: &[u8], port: u16, track_response: bool) -> bool {
	if segment.len() < 20 {
		return false;
	}

	let src_port = u16::from_be_bytes([segment[0], segment[1]]);
	let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
	let data_offset = (segment[12] >> 4) as usize * 4;

	if segment.len() <= data_offset {
		return false;
	}

	(dst_port == port || (track_response && src_port == port)) && segment.len() > data_offset
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tcp_segment(src: u16, dst: u16, payload_len: usize) -> Vec<u8> {
		let mut seg = vec![0u8; 20 + payload_len];
		seg[0..2].copy_from_slice(&src.to_be_bytes());
		seg[2..4].copy_from_slice(&dst.to_be_bytes());
		seg[12] = 5 << 4;
		seg
	}

	#[test]
	fn accepts_dst_port_match() {
		let seg = tcp_segment(4000, 80, 10);
		assert!(is_valid_packet(&seg, 80, false));
	}

	#[test]
	fn rejects_unrelated_port() {
		let seg = tcp_segment(4000, 81, 10);
		assert!(!is_valid_packet(&seg, 80, false));
	}

	#[test]
	fn accepts_src_port_when_tracking_responses() {
		let seg = tcp_segment(80, 4000, 10);
		assert!(is_valid_packet(&seg, 80, true));
	}

	#[test]
	fn rejects_src_port_when_not_tracking() {
		let seg = tcp_segment(80, 4000, 10);
		assert!(!is_valid_packet(&seg, 80, false));
	}
}
