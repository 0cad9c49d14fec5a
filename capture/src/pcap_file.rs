//! Read and write capture records to a pcap-framed file: standard global
//! and per-packet header shape and magic number, but the "packet data" each
//! record carries is our own `[addr; 16][tcp segment]` capture record rather
//! than a raw link-layer frame, and the field writes are ordinary safe byte
//! serialization instead of struct-overlay casts.
//!
//! This is what `Writer` recording and the [`crate::replay`] test backend
//! both speak.

use std::fs::File;
use std::io::{self, Read, Write};
use std::time::{Duration, SystemTime};

use log::warn;

const MAGIC_NANOS: u32 = 0xa1b23c4d;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;
/// pcap's "raw IP" linktype — accurate for us since a record's payload
/// starts at our own address prefix, not a link-layer frame.
const LINKTYPE_RAW: u32 = 101;

pub struct Writer {
	file: File,
}

impl Writer {
	pub fn create(path: &str) -> io::Result<Self> {
		let mut file = File::create(path)?;

		let mut header = [0u8; GLOBAL_HEADER_LEN];
		header[0..4].copy_from_slice(&MAGIC_NANOS.to_le_bytes());
		header[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
		header[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
		// thiszone, sigfigs both stay zero.
		header[16..20].copy_from_slice(&u32::MAX.to_le_bytes()); // snaplen
		header[20..24].copy_from_slice(&LINKTYPE_RAW.to_le_bytes());

		file.write_all(&header)?;

		Ok(Self { file })
	}

	/// Append one capture record, stamped with the current time.
	pub fn write(&mut self, record: &[u8]) -> io::Result<()> {
		let timestamp = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();

		let mut header = [0u8; RECORD_HEADER_LEN];
		header[0..4].copy_from_slice(&(timestamp.as_secs() as u32).to_le_bytes());
		header[4..8].copy_from_slice(&timestamp.subsec_nanos().to_le_bytes());
		header[8..12].copy_from_slice(&(record.len() as u32).to_le_bytes());
		header[12..16].copy_from_slice(&(record.len() as u32).to_le_bytes());

		self.file.write_all(&header)?;
		self.file.write_all(record)?;

		Ok(())
	}
}

pub struct Reader {
	file: File,
	nano: bool,
}

impl Reader {
	pub fn open(path: &str) -> io::Result<Self> {
		let mut file = File::open(path)?;
		let mut header = [0u8; GLOBAL_HEADER_LEN];
		file.read_exact(&mut header)?;

		let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
		let nano = match magic {
			0xa1b2c3d4 => false,
			0xa1b23c4d => true,
			other => {
				return Err(io::Error::new(io::ErrorKind::InvalidData, format!("Unsupported pcap magic number: 0x{other:08X}")));
			}
		};

		let major = u16::from_le_bytes(header[4..6].try_into().unwrap());
		let minor = u16::from_le_bytes(header[6..8].try_into().unwrap());

		if major != VERSION_MAJOR || minor != VERSION_MINOR {
			warn!("Unexpected pcap version {major}.{minor}, expected {VERSION_MAJOR}.{VERSION_MINOR}");
		}

		Ok(Self { file, nano })
	}

	/// Walk every record in the file, in the order written.
	pub fn for_each(mut self, mut f: impl FnMut(SystemTime, Vec<u8>)) -> io::Result<()> {
		let mut header = [0u8; RECORD_HEADER_LEN];
		let mut buf = Vec::new();

		loop {
			match self.file.read_exact(&mut header) {
				Ok(()) => {}
				Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
				Err(err) => return Err(err),
			}

			let ts_sec = u32::from_le_bytes(header[0..4].try_into().unwrap());
			let ts_frac = u32::from_le_bytes(header[4..8].try_into().unwrap());
			let incl_len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;

			let time = SystemTime::UNIX_EPOCH
				+ Duration::from_secs(ts_sec as u64)
				+ if self.nano { Duration::from_nanos(ts_frac as u64) } else { Duration::from_micros(ts_frac as u64) };

			buf.resize(incl_len, 0);
			self.file.read_exact(&mut buf)?;

			f(time, buf.clone());
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrips_records() {
		let dir = std::env::temp_dir();
		let path = dir.join(format!("capture-pcap-file-test-{:?}.pcap", std::thread::current().id()));
		let path_str = path.to_str().unwrap();

		let mut writer = Writer::create(path_str).unwrap();
		writer.write(b"first-record").unwrap();
		writer.write(b"second-record").unwrap();
		drop(writer);

		let mut seen = Vec::new();
		Reader::open(path_str).unwrap().for_each(|_, record| seen.push(record)).unwrap();

		assert_eq!(seen, vec![b"first-record".to_vec(), b"second-record".to_vec()]);

		let _ = std::fs::remove_file(path);
	}
}
