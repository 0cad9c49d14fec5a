//! The single-threaded reassembly engine: demultiplexes inbound packets into
//! [`Message`]s, maintains the four side-indices, runs the periodic GC
//! sweep, and emits completed messages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender};
use log::debug;
use runtime::Clock;

use crate::message::Message;
use crate::packet::{ConnId, Packet};

/// Counters a caller can read from any thread while the reassembler runs on
/// its own. Relaxed ordering throughout — these are diagnostics, not a
/// synchronization point.
#[derive(Default, Debug)]
pub struct Stats {
	pub packets_processed: AtomicU64,
	pub messages_emitted: AtomicU64,
	pub messages_expired: AtomicU64,
	pub messages_dropped: AtomicU64,
	/// Number of messages currently under reassembly. Maintained incrementally
	/// (not derived from `messages.len()`) so `Listener::stats()` can read it
	/// without touching the worker thread's state at all.
	pub messages_live: AtomicU64,
}

impl Stats {
	fn record_processed(&self) {
		self.packets_processed.fetch_add(1, Ordering::Relaxed);
	}

	fn record_emitted(&self) {
		self.messages_emitted.fetch_add(1, Ordering::Relaxed);
	}

	fn record_expired(&self) {
		self.messages_expired.fetch_add(1, Ordering::Relaxed);
	}

	fn record_dropped(&self) {
		self.messages_dropped.fetch_add(1, Ordering::Relaxed);
	}

	fn record_created(&self) {
		self.messages_live.fetch_add(1, Ordering::Relaxed);
	}

	fn record_removed(&self) {
		self.messages_live.fetch_sub(1, Ordering::Relaxed);
	}
}

/// The reassembly engine's private state. Owned entirely by the thread
/// running [`run`] — nothing here is behind a lock.
pub struct Reassembler {
	listener_port: u16,
	track_response: bool,
	expire: Duration,

	messages: AHashMap<ConnId, Message>,

	/// Secondary ack -> canonical ack, installed whenever a 100-continue
	/// pair (or a reordered pair) is collapsed into one message.
	ack_aliases: AHashMap<u32, u32>,
	/// seq the still-pending body half of a 100-continue POST will carry ->
	/// the headers half's ack, so the body can find its way home.
	seq_with_data: AHashMap<u32, u32>,
	/// response ack -> id of the incoming request expecting it.
	resp_aliases: AHashMap<u32, ConnId>,
	/// response ack -> id of an outgoing message that arrived before any
	/// request claimed it.
	resp_without_req: AHashMap<u32, ConnId>,
	/// mutual request<->response association, keyed both ways.
	assoc: AHashMap<ConnId, ConnId>,

	stats: Arc<Stats>,
}

impl Reassembler {
	pub fn new(listener_port: u16, track_response: bool, expire: Duration, stats: Arc<Stats>) -> Self {
		Reassembler {
			listener_port,
			track_response,
			expire,
			messages: AHashMap::new(),
			ack_aliases: AHashMap::new(),
			seq_with_data: AHashMap::new(),
			resp_aliases: AHashMap::new(),
			resp_without_req: AHashMap::new(),
			assoc: AHashMap::new(),
			stats,
		}
	}

	/// Run one packet through the full reassembly pipeline. 100-continue
	/// reassociation is expressed as a worklist rather than recursion, so a
	/// pathological run of merges can't blow the stack.
	pub fn process(&mut self, packet: Packet, out: &Sender<Message>) {
		let mut worklist = VecDeque::new();
		worklist.push_back(packet);

		while let Some(packet) = worklist.pop_front() {
			self.process_one(packet, out, &mut worklist);
		}
	}

	fn process_one(&mut self, mut packet: Packet, out: &Sender<Message>, worklist: &mut VecDeque<Packet>) {
		self.stats.record_processed();

		let is_incoming = packet.is_incoming(self.listener_port);
		// Remembered so the message that finally absorbs this packet can
		// record which now-stale ack_aliases entry to clean up at dispatch,
		// if steps 2/3 below end up rewriting `packet.ack`.
		let original_ack = packet.ack;

		// Step 2: 100-continue body reassociation -- this packet's seq is
		// the body half of a headers/body split already seen.
		if let Some(&parent_ack) = self.seq_with_data.get(&packet.seq) {
			let stale: Vec<ConnId> = self
				.messages
				.iter()
				.filter(|(id, m)| m.ack == packet.ack && id.addr == packet.addr)
				.map(|(id, _)| *id)
				.collect();

			for id in stale {
				if let Some(m) = self.messages.remove(&id) {
					self.stats.record_removed();
					self.forget_indices(&m);

					if let Some(peer) = self.assoc.remove(&id) {
						self.assoc.remove(&peer);
					}

					for p in m.packets {
						worklist.push_back(p);
					}
				}
			}

			self.ack_aliases.insert(packet.ack, parent_ack);
			packet.ack = parent_ack;
		} else if let Some(&alias) = self.ack_aliases.get(&packet.ack) {
			// Step 3: otherwise apply any already-known ack alias.
			packet.ack = alias;
		}

		// Step 4: for an outgoing packet, see if a request is already
		// waiting for this ack.
		let resp_req = if !is_incoming { self.resp_aliases.get(&packet.ack).copied() } else { None };

		// Step 5: lookup or create the owning message.
		let id = ConnId { addr: packet.addr, src_port: packet.src_port, dst_port: packet.dst_port, ack: packet.ack };
		let created = !self.messages.contains_key(&id);

		let mut previous_response_ack = None;

		if created {
			self.stats.record_created();
			self.messages.insert(id, Message::new(packet.clone(), is_incoming));

			if !is_incoming {
				match resp_req {
					Some(req_id) => {
						self.assoc.insert(id, req_id);
						self.assoc.insert(req_id, id);

						let request_is_head = self.messages.get(&req_id).is_some_and(Message::is_head_request);
						if let Some(m) = self.messages.get_mut(&id) {
							m.response_to_head = request_is_head;
						}
					}
					None => {
						self.resp_without_req.insert(packet.ack, id);
					}
				}
			}
		} else {
			// Step 6: append to the existing message.
			if let Some(m) = self.messages.get_mut(&id) {
				if is_incoming {
					previous_response_ack = Some(m.response_ack);
				}
				m.add(packet.clone());
			}
		}

		if original_ack != packet.ack {
			if let Some(m) = self.messages.get_mut(&id) {
				m.data_ack = Some(original_ack);
			}
		}

		// Step 7: 100-continue detection on the (possibly just-appended)
		// incoming packet.
		if is_incoming {
			self.detect_continue(id, &packet, worklist);
		}

		// Step 8: incoming messages keep resp_aliases pointed at their
		// current response_ack, which shifts as more packets arrive (both
		// from ordinary multi-segment appends and from the merges above).
		if is_incoming {
			self.refresh_resp_alias(id, previous_response_ack);
		}

		let finished = self.messages.get(&id).is_some_and(|m| m.is_finished());

		if finished {
			self.try_dispatch(id, out);
		}
	}

	/// Detect the `POST ... Expect: 100-continue\r\n\r\n` split: a literal
	/// suffix match on the exact header line, rather than a general
	/// case-insensitive header scan (see design notes).
	fn detect_continue(&mut self, id: ConnId, packet: &Packet, worklist: &mut VecDeque<Packet>) {
		const MARKER: &[u8] = b"Expect: 100-continue\r\n";

		if !packet.payload.starts_with(b"POST") {
			return;
		}

		let trimmed = trim_trailing_crlf(&packet.payload);

		if trimmed.len() < MARKER.len() || &trimmed[trimmed.len() - MARKER.len()..] != MARKER {
			return;
		}

		let marker_offset = trimmed.len() - MARKER.len();
		let data_seq = packet.seq.wrapping_add(packet.payload.len() as u32);

		let stale: Vec<ConnId> = self.messages.iter().filter(|(other_id, m)| **other_id != id && m.packets.first().is_some_and(|p| p.seq == data_seq)).map(|(i, _)| *i).collect();

		for other_id in stale {
			let Some(other) = self.messages.remove(&other_id) else { continue };
			self.stats.record_removed();
			self.forget_indices(&other);

			if let Some(peer) = self.assoc.remove(&other_id) {
				self.assoc.remove(&peer);
				self.assoc.insert(id, peer);
				self.assoc.insert(peer, id);
			}

			self.ack_aliases.insert(other.ack, packet.ack);

			if let Some(m) = self.messages.get_mut(&id) {
				m.data_ack = Some(other.ack);

				for p in other.packets {
					m.add(p);
				}
			}
		}

		self.seq_with_data.insert(data_seq, packet.ack);

		if let Some(m) = self.messages.get_mut(&id) {
			m.data_seq = Some(data_seq);
			// The headers packet is always the lowest-seq packet in this
			// message, so its own byte offset doubles as the offset into the
			// fully assembled payload `bytes()` will produce.
			m.continue_strip = Some((marker_offset, MARKER.len()));
		}

		// Re-run the finish/dispatch check is unnecessary here: `process_one`
		// re-reads `is_finished()` after this call returns.
		let _ = worklist;
	}

	fn refresh_resp_alias(&mut self, id: ConnId, previous_response_ack: Option<u32>) {
		let Some(m) = self.messages.get(&id) else { return };
		let current = m.response_ack;

		if let Some(previous) = previous_response_ack {
			if previous != current && self.resp_aliases.get(&previous) == Some(&id) {
				self.resp_aliases.remove(&previous);
			}
		}

		self.resp_aliases.insert(current, id);
	}

	/// Step 9: an incoming message dispatches once a matching response
	/// already exists and is itself finished (or tracking is off, in which
	/// case it dispatches unconditionally). An outgoing message dispatches
	/// once its associated request is finished.
	fn try_dispatch(&mut self, id: ConnId, out: &Sender<Message>) {
		let Some(m) = self.messages.get(&id) else { return };

		if m.is_incoming {
			if !self.track_response {
				self.dispatch(id, out);
				return;
			}

			let response_ack = m.response_ack;
			let request_is_head = m.is_head_request();
			let peer = self.assoc.get(&id).copied().or_else(|| self.resp_without_req.get(&response_ack).copied());

			if let Some(peer_id) = peer {
				if let Some(p) = self.messages.get_mut(&peer_id) {
					p.response_to_head = request_is_head;
				}

				if self.messages.get(&peer_id).is_some_and(|p| p.is_finished()) {
					self.dispatch(id, out);
				}
			}
		} else if let Some(req_id) = self.assoc.get(&id).copied() {
			if self.messages.get(&req_id).is_some_and(|r| r.is_finished()) {
				self.dispatch(req_id, out);
			}
		}
	}

	/// Emission-and-cleanup. Idempotent: dispatching an id not currently
	/// live is a no-op. Cascades to a matched peer for incoming messages
	/// (via `assoc`, or via `resp_without_req` for the reordering race
	/// where a response was seen before the request that explains it).
	fn dispatch(&mut self, id: ConnId, out: &Sender<Message>) {
		let Some(m) = self.messages.remove(&id) else { return };
		self.stats.record_removed();

		self.forget_indices(&m);
		let assoc_peer = self.assoc.remove(&id);

		if m.is_incoming {
			let response_ack = m.response_ack;
			self.emit(m, out);

			if self.track_response {
				let peer = assoc_peer.or_else(|| self.resp_without_req.remove(&response_ack));

				if let Some(peer_id) = peer {
					self.dispatch(peer_id, out);
				}
			}
		} else if assoc_peer.is_some() {
			self.emit(m, out);
		} else {
			self.stats.record_dropped();
			debug!("Dropping outgoing message with no associated request (ack {})", m.ack);
		}
	}

	fn forget_indices(&mut self, m: &Message) {
		self.ack_aliases.remove(&m.ack);
		if let Some(a) = m.data_ack {
			self.ack_aliases.remove(&a);
		}
		if let Some(s) = m.data_seq {
			self.seq_with_data.remove(&s);
		}
		self.resp_aliases.remove(&m.response_ack);
	}

	fn emit(&mut self, m: Message, out: &Sender<Message>) {
		self.stats.record_emitted();
		let _ = out.send(m);
	}

	/// Walk every live message and dispatch the ones that have been idle for
	/// at least `expire`. Incoming messages are dispatched before outgoing
	/// ones so a forced expiry can't emit a response ahead of its request.
	pub fn gc(&mut self, now: Instant, out: &Sender<Message>) {
		let mut incoming = Vec::new();
		let mut outgoing = Vec::new();

		for (id, m) in self.messages.iter() {
			if now.saturating_duration_since(m.end) >= self.expire {
				if m.is_incoming {
					incoming.push(*id);
				} else {
					outgoing.push(*id);
				}
			}
		}

		for id in incoming {
			self.stats.record_expired();
			self.dispatch(id, out);
		}

		for id in outgoing {
			self.stats.record_expired();
			self.dispatch(id, out);
		}
	}

	#[cfg(test)]
	pub fn live_message_count(&self) -> usize {
		self.messages.len()
	}

	#[cfg(test)]
	pub fn indices_empty(&self) -> bool {
		self.ack_aliases.is_empty() && self.seq_with_data.is_empty() && self.resp_aliases.is_empty() && self.resp_without_req.is_empty()
	}
}

fn trim_trailing_crlf(payload: &[u8]) -> &[u8] {
	payload.strip_suffix(b"\r\n").unwrap_or(payload)
}

/// Drives a [`Reassembler`] from three event sources: inbound packet
/// records, a GC tick at `expire/2`, and a shutdown signal.
pub fn run(
	mut engine: Reassembler,
	listener_port: u16,
	inbound: Receiver<Vec<u8>>,
	outbound: Sender<Message>,
	shutdown: Arc<AtomicBool>,
) {
	let clock = Clock::new();
	let tick = crossbeam_channel::tick(engine_gc_period(&engine));

	loop {
		crossbeam_channel::select! {
			recv(inbound) -> record => {
				match record {
					Ok(raw) => handle_record(&mut engine, listener_port, &raw, &outbound, &clock),
					Err(_) => break,
				}
			}
			recv(tick) -> _ => {
				engine.gc(clock.now(), &outbound);
			}
		}

		if shutdown.load(Ordering::Relaxed) {
			break;
		}
	}
}

fn engine_gc_period(engine: &Reassembler) -> Duration {
	engine.expire / 2
}

fn handle_record(engine: &mut Reassembler, listener_port: u16, raw: &[u8], out: &Sender<Message>, clock: &Clock) {
	let Some((addr, segment)) = capture::record::split(raw) else { return };
	let Some(packet) = crate::packet::parse(addr, segment, clock.now()) else { return };

	let _ = listener_port; // packet carries its own dst_port; kept for symmetry with capture's filtering.

	// Defense-in-depth: a single malformed packet must not take down the
	// reassembler thread.
	let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
		engine.process(packet, out);
	}));

	if result.is_err() {
		log::error!("Reassembler panicked while processing a packet; continuing");
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;

	use super::*;
	use crate::packet::Flags;

	fn packet(addr: &str, src_port: u16, dst_port: u16, seq: u32, ack: u32, payload: &[u8]) -> Packet {
		Packet {
			addr: addr.parse().unwrap(),
			src_port,
			dst_port,
			seq,
			ack,
			flags: Flags::from_byte(0x18),
			payload: Bytes::copy_from_slice(payload),
			arrived_at: Instant::now(),
		}
	}

	fn engine(track_response: bool) -> (Reassembler, Sender<Message>, Receiver<Message>) {
		let (tx, rx) = crossbeam_channel::unbounded();
		(Reassembler::new(80, track_response, Duration::from_millis(200), Arc::new(Stats::default())), tx, rx)
	}

	#[test]
	fn simple_get_single_segment() {
		let (mut re, tx, rx) = engine(false);
		let p = packet("10.0.0.1", 4000, 80, 1000, 500, b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n");
		re.process(p, &tx);

		let m = rx.try_recv().expect("request emitted");
		assert_eq!(m.bytes().unwrap(), b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n");
		assert_eq!(m.response_ack, 1000 + 28);
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn response_dropped_without_tracking() {
		let (mut re, tx, rx) = engine(false);
		re.process(packet("10.0.0.1", 4000, 80, 1000, 500, b"GET / HTTP/1.1\r\n\r\n"), &tx);
		rx.try_recv().unwrap();

		re.process(packet("10.0.0.2", 80, 4000, 500, 1018, b"HTTP/1.1 204 No Content\r\n\r\n"), &tx);
		assert!(rx.try_recv().is_err());
		assert_eq!(re.stats.messages_dropped.load(Ordering::Relaxed), 0); // response not yet finished path not hit; dropped only at dispatch
	}

	#[test]
	fn hundred_continue_normal_order() {
		let (mut re, tx, rx) = engine(false);
		let headers = b"POST /p HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n";
		let a = packet("10.0.0.1", 4000, 80, 2000, 700, headers);
		let body_seq = 2000 + headers.len() as u32;
		let b = packet("10.0.0.1", 4000, 80, body_seq, 800, b"hello");

		re.process(a, &tx);
		re.process(b, &tx);

		let m = rx.try_recv().expect("merged message emitted");
		let bytes = m.bytes().unwrap();
		assert!(!String::from_utf8_lossy(&bytes).contains("100-continue"));
		assert!(String::from_utf8_lossy(&bytes).ends_with("hello"));
	}

	#[test]
	fn hundred_continue_reversed_order() {
		let (mut re, tx, rx) = engine(false);
		let headers = b"POST /p HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n";
		let a = packet("10.0.0.1", 4000, 80, 2000, 700, headers);
		let body_seq = 2000 + headers.len() as u32;
		let b = packet("10.0.0.1", 4000, 80, body_seq, 800, b"hello");

		re.process(b, &tx);
		re.process(a, &tx);

		let m = rx.try_recv().expect("merged message emitted");
		let bytes = m.bytes().unwrap();
		assert!(String::from_utf8_lossy(&bytes).ends_with("hello"));
	}

	#[test]
	fn request_response_pairing_with_tracking() {
		let (mut re, tx, rx) = engine(true);
		re.process(packet("10.0.0.1", 4000, 80, 3000, 900, b"GET / HTTP/1.1\r\n\r\n"), &tx);
		assert!(rx.try_recv().is_err(), "request withheld until response is known to be finished");

		re.process(packet("10.0.0.2", 80, 4000, 900, 3018, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"), &tx);

		let first = rx.try_recv().expect("request emitted");
		assert!(first.is_incoming);
		let second = rx.try_recv().expect("response emitted");
		assert!(!second.is_incoming);
	}

	#[test]
	fn head_response_dispatches_despite_content_length() {
		let (mut re, tx, rx) = engine(true);
		re.process(packet("10.0.0.1", 4000, 80, 3000, 900, b"HEAD / HTTP/1.1\r\n\r\n"), &tx);
		assert!(rx.try_recv().is_err(), "request withheld until response is known to be finished");

		re.process(packet("10.0.0.2", 80, 4000, 900, 3019, b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n"), &tx);

		let first = rx.try_recv().expect("request emitted");
		assert!(first.is_incoming);
		let second = rx.try_recv().expect("response emitted despite declared Content-Length");
		assert!(!second.is_incoming);
	}

	#[test]
	fn orphan_response_expires_via_gc() {
		let (mut re, tx, rx) = engine(true);
		re.process(packet("10.0.0.2", 80, 4000, 900, 3018, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"), &tx);
		assert!(rx.try_recv().is_err());

		re.gc(Instant::now() + Duration::from_millis(500), &tx);

		assert!(rx.try_recv().is_err(), "unassociated response is dropped silently");
		assert_eq!(re.live_message_count(), 0);
		assert!(re.indices_empty());
	}
}
