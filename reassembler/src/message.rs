//! A live HTTP message under reassembly: an ordered bag of packets plus the
//! bookkeeping the reassembler needs to know when it's done and who its
//! peer is.

use std::net::IpAddr;
use std::time::Instant;

use log::debug;
use utils::error::Ext as _;

use crate::packet::{ConnId, Packet};

/// One side of an HTTP exchange being reassembled from TCP segments.
pub struct Message {
	pub packets: Vec<Packet>,
	pub is_incoming: bool,

	/// Source address and ports of the first packet. Along with `ack`, this
	/// is the message's connection key.
	addr: IpAddr,
	src_port: u16,
	dst_port: u16,

	/// The message's *current* effective ack. Starts as the first packet's
	/// own ack; 100-continue fix-ups move it to the merged parent's ack
	/// without ever touching the packets themselves.
	pub ack: u32,

	pub start: Instant,
	pub end: Instant,

	/// Set when this message is the headers half of a 100-continue POST:
	/// `first.seq + len(first.payload)`, the seq the body half will carry.
	pub data_seq: Option<u32>,
	/// Set when this message is the body half that got merged into a
	/// headers half: the original (pre-alias) ack the body segment carried.
	pub data_ack: Option<u32>,

	/// For incoming messages: the ack the server's response will carry.
	/// Recomputed on every `add()`.
	pub response_ack: u32,

	/// Set once this message has absorbed a 100-continue headers/body split:
	/// the byte offset within the assembled payload where the
	/// `Expect: 100-continue` line starts, and its length. Applied lazily in
	/// `bytes()` rather than by mutating the stored headers packet, so the
	/// seq-contiguity check against the body packet's real (unshortened) seq
	/// still lines up.
	pub continue_strip: Option<(usize, usize)>,

	/// For an outgoing message: true once the reassembler has discovered that
	/// the paired request was a HEAD. A HEAD response never carries a body
	/// regardless of Content-Length/Transfer-Encoding, so this overrides the
	/// usual status-code-based no-body rule.
	pub response_to_head: bool,
}

impl Message {
	pub fn new(packet: Packet, is_incoming: bool) -> Self {
		let addr = packet.addr;
		let src_port = packet.src_port;
		let dst_port = packet.dst_port;
		let ack = packet.ack;
		let start = packet.arrived_at;
		let end = packet.arrived_at;
		let response_ack = response_ack_of(&packet);

		Message { packets: vec![packet], is_incoming, addr, src_port, dst_port, ack, start, end, data_seq: None, data_ack: None, response_ack, continue_strip: None, response_to_head: false }
	}

	/// Parses the concatenated payload as an HTTP request and reports whether
	/// its method is HEAD. Used by the reassembler to carry HEAD-ness from an
	/// incoming message over to its paired outgoing message.
	pub fn is_head_request(&self) -> bool {
		let Some(payload) = self.bytes() else { return false };
		let mut header_buf = [httparse::EMPTY_HEADER; 64];
		let mut req = httparse::Request::new(&mut header_buf);

		matches!(req.parse(&payload), Ok(httparse::Status::Complete(_))) && req.method == Some("HEAD")
	}

	/// The connection key this message currently lives under.
	pub fn id(&self) -> ConnId {
		ConnId { addr: self.addr, src_port: self.src_port, dst_port: self.dst_port, ack: self.ack }
	}

	/// The connection key a paired response (for an incoming message) would
	/// carry: source/destination swapped, ack = `response_ack`. Informational
	/// only — indexing uses `response_ack` directly (see the reassembler's
	/// `resp_aliases`/`resp_without_req` maps), never this derived key.
	pub fn response_id(&self) -> ConnId {
		ConnId { addr: self.addr, src_port: self.dst_port, dst_port: self.src_port, ack: self.response_ack }
	}

	pub fn add(&mut self, packet: Packet) {
		self.start = self.start.min(packet.arrived_at);
		self.end = self.end.max(packet.arrived_at);
		self.packets.push(packet);

		if self.is_incoming {
			self.update_response_ack();
		}
	}

	/// Recompute `response_ack` from the packet with the highest
	/// `seq + len(payload)` — the byte offset the server's ack will echo
	/// back once it has consumed everything sent so far.
	fn update_response_ack(&mut self) {
		let last = self.packets.iter().max_by_key(|p| p.seq.wrapping_add(p.payload.len() as u32)).expect("message always holds at least one packet");
		self.response_ack = response_ack_of(last);
	}

	/// Concatenate packet payloads in seq order (ties broken by insertion/
	/// arrival order, which `Vec` already preserves for a stable sort).
	/// Returns `None` if the covered seq range has a gap.
	pub fn bytes(&self) -> Option<Vec<u8>> {
		let mut order: Vec<&Packet> = self.packets.iter().collect();
		order.sort_by_key(|p| p.seq);

		let mut out = Vec::new();
		let mut expected = order.first()?.seq;

		for p in order {
			if p.seq != expected {
				return None;
			}
			out.extend_from_slice(&p.payload);
			expected = expected.wrapping_add(p.payload.len() as u32);
		}

		if let Some((offset, len)) = self.continue_strip {
			out.drain(offset..offset + len);
		}

		Some(out)
	}

	/// True once the concatenated payload holds a full HTTP/1.x request
	/// (incoming) or response (outgoing): headers complete, and the body
	/// boundary implied by Content-Length / chunked encoding / no-body
	/// status has been reached. A gap in seq coverage is never finished.
	pub fn is_finished(&self) -> bool {
		let Some(payload) = self.bytes() else { return false };

		if self.is_incoming {
			request_finished(&payload)
		} else {
			response_finished(&payload, self.response_to_head)
		}
	}
}

fn response_ack_of(packet: &Packet) -> u32 {
	packet.seq.wrapping_add(packet.payload.len() as u32)
}

fn header_name_is(header: &httparse::Header, name: &str) -> bool {
	header.name.eq_ignore_ascii_case(name)
}

fn content_length(headers: &[httparse::Header]) -> Option<usize> {
	let header = headers.iter().filter(|h| !h.name.is_empty()).find(|h| header_name_is(h, "content-length"))?;

	std::str::from_utf8(header.value)
		.ok_or(|err| debug!("Content-Length header is not valid UTF-8: {err}"))
		.and_then(|v| v.trim().parse().ok_or(|err| debug!("Content-Length header is not a valid integer: {err}")))
}

fn is_chunked(headers: &[httparse::Header]) -> bool {
	headers
		.iter()
		.filter(|h| !h.name.is_empty())
		.any(|h| header_name_is(h, "transfer-encoding") && h.value.windows(7).any(|w| w.eq_ignore_ascii_case(b"chunked")))
}

/// Recognizes only the terminating zero-length chunk, not a full chunked
/// decode — all `is_finished()` needs is to know the body is over.
fn chunked_body_complete(body: &[u8]) -> bool {
	body.windows(5).any(|w| w == b"0\r\n\r\n")
}

fn body_complete(headers: &[httparse::Header], body: &[u8], no_body_by_default: bool) -> bool {
	if is_chunked(headers) {
		chunked_body_complete(body)
	} else if let Some(len) = content_length(headers) {
		body.len() >= len
	} else {
		no_body_by_default
	}
}

fn request_finished(payload: &[u8]) -> bool {
	let mut header_buf = [httparse::EMPTY_HEADER; 64];
	let mut req = httparse::Request::new(&mut header_buf);

	let header_len = match req.parse(payload) {
		Ok(httparse::Status::Complete(n)) => n,
		_ => return false,
	};

	let no_body = matches!(req.method, Some("GET") | Some("HEAD") | Some("DELETE") | Some("OPTIONS"));
	body_complete(req.headers, &payload[header_len..], no_body)
}

fn response_finished(payload: &[u8], request_is_head: bool) -> bool {
	let mut header_buf = [httparse::EMPTY_HEADER; 64];
	let mut res = httparse::Response::new(&mut header_buf);

	let header_len = match res.parse(payload) {
		Ok(httparse::Status::Complete(n)) => n,
		_ => return false,
	};

	let no_body = request_is_head || matches!(res.code, Some(204) | Some(304)) || res.code.is_some_and(|c| (100..200).contains(&c));
	body_complete(res.headers, &payload[header_len..], no_body)
}

#[cfg(test)]
mod tests {
	use std::time::Instant;

	use bytes::Bytes;

	use super::*;

	fn packet(seq: u32, ack: u32, payload: &[u8]) -> Packet {
		Packet {
			addr: "10.0.0.1".parse().unwrap(),
			src_port: 4000,
			dst_port: 80,
			seq,
			ack,
			flags: crate::packet::Flags::from_byte(0x18),
			payload: Bytes::copy_from_slice(payload),
			arrived_at: Instant::now(),
		}
	}

	#[test]
	fn single_segment_get_is_finished() {
		let m = Message::new(packet(1000, 500, b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n"), true);
		assert!(m.is_finished());
		assert_eq!(m.response_ack, 1000 + 28);
	}

	#[test]
	fn request_with_content_length_waits_for_body() {
		let mut m = Message::new(packet(1000, 500, b"POST /p HTTP/1.1\r\nContent-Length: 5\r\n\r\n"), true);
		assert!(!m.is_finished());
		m.add(packet(1000 + 41, 500, b"hello"));
		assert!(m.is_finished());
	}

	#[test]
	fn response_with_204_has_no_body() {
		let m = Message::new(packet(900, 3018, b"HTTP/1.1 204 No Content\r\n\r\n"), false);
		assert!(m.is_finished());
	}

	#[test]
	fn head_response_has_no_body_despite_content_length() {
		let mut m = Message::new(packet(900, 3018, b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n"), false);
		assert!(!m.is_finished());
		m.response_to_head = true;
		assert!(m.is_finished());
	}

	#[test]
	fn is_head_request_reads_the_method() {
		let get = Message::new(packet(1000, 500, b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n"), true);
		assert!(!get.is_head_request());

		let head = Message::new(packet(1000, 500, b"HEAD /x HTTP/1.1\r\nHost: a\r\n\r\n"), true);
		assert!(head.is_head_request());
	}

	#[test]
	fn gap_in_seq_coverage_is_not_finished() {
		let mut m = Message::new(packet(1000, 500, b"GET"), true);
		m.add(packet(2000, 500, b" /x HTTP/1.1\r\n\r\n"));
		assert!(!m.is_finished());
	}

	#[test]
	fn out_of_order_packets_reassemble_by_seq() {
		let mut m = Message::new(packet(1005, 500, b"world"), true);
		m.add(packet(1000, 500, b"hello"));
		assert_eq!(m.bytes().unwrap(), b"helloworld");
	}

	#[test]
	fn chunked_response_waits_for_terminal_chunk() {
		let mut m = Message::new(packet(900, 3000, b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n"), false);
		assert!(!m.is_finished());
		m.add(packet(900 + 60, 3000, b"0\r\n\r\n"));
		assert!(m.is_finished());
	}
}
