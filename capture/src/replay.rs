//! Offline backend: replays capture records previously written by
//! [`crate::pcap_file::Writer`], or built in memory, through the same
//! channel shape a live backend uses, without opening any socket or
//! interface. Useful for batch replay of a whole file or slice at once;
//! a caller that wants to feed records one at a time (as the reassembler's
//! own tests do) can just send on the channel directly instead.

use crossbeam_channel::Sender;

use crate::pcap_file::Reader;

/// Feed every record from a pcap file to `tx`, in file order, as fast as
/// the channel accepts them.
pub fn replay_file(path: &str, tx: &Sender<Vec<u8>>) -> std::io::Result<()> {
	Reader::open(path)?.for_each(|_, record| {
		let _ = tx.send(record);
	})
}

/// Feed records built in-memory (typically by a test) to `tx`, in order.
pub fn replay_records(records: impl IntoIterator<Item = Vec<u8>>, tx: &Sender<Vec<u8>>) {
	for record in records {
		let _ = tx.send(record);
	}
}
