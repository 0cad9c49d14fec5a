//! Strip link-layer framing so the bytes handed to [`crate::ip`] start at the
//! IP header, as described for the pcap backend.

/// Data-link types we know how to strip. Mirrors the subset of
/// <https://www.tcpdump.org/linktypes.html> the pcap backend needs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Linktype {
	Ethernet,
	/// BSD loopback ("null") framing: a 4-byte address family header.
	NullOrLoop,
	/// No link layer at all — the capture starts at the IP header.
	Raw,
}

impl Linktype {
	pub fn from_pcap(dlt: pcap::Linktype) -> Option<Self> {
		match dlt {
			pcap::Linktype::ETHERNET => Some(Self::Ethernet),
			pcap::Linktype::NULL | pcap::Linktype::LOOP => Some(Self::NullOrLoop),
			pcap::Linktype::RAW => Some(Self::Raw),
			_ => None,
		}
	}
}

/// Strip link-layer framing, returning the bytes starting at the IP header.
pub fn strip<'a>(linktype: Linktype, buf: &'a [u8]) -> Option<&'a [u8]> {
	let skip = match linktype {
		Linktype::Ethernet => 14,
		Linktype::NullOrLoop => 4,
		Linktype::Raw => 0,
	};

	buf.get(skip..)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_ethernet_header() {
		let mut buf = vec![0u8; 14];
		buf.extend_from_slice(b"ip-packet");
		assert_eq!(strip(Linktype::Ethernet, &buf).unwrap(), b"ip-packet");
	}

	#[test]
	fn raw_passes_through() {
		assert_eq!(strip(Linktype::Raw, b"ip-packet").unwrap(), b"ip-packet");
	}

	#[test]
	fn too_short_is_none() {
		assert!(strip(Linktype::Ethernet, b"short").is_none());
	}
}
