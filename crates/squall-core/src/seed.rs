//! Deterministic byte stream derived from a shared secret.
//!
//! When both endpoints derive their ephemeral TLS key material from the same
//! pre-shared key they must produce identical certificates, so the generator
//! feeding the key generator has to be reproducible. The stream is a rolling
//! SHA-512 chain: the state starts as the digest of the secret and each block
//! of output is the digest of the previous state.

use std::io;

use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};

const BLOCK_LEN: usize = 64;

pub struct SeedReader {
	state: [u8; BLOCK_LEN],
	buf:   [u8; BLOCK_LEN],
	used:  usize,
}

impl SeedReader {
	pub fn new(secret: &[u8]) -> Self {
		let mut state = [0u8; BLOCK_LEN];
		state.copy_from_slice(&Sha512::digest(secret));
		Self {
			state,
			buf: [0u8; BLOCK_LEN],
			used: BLOCK_LEN,
		}
	}

	fn refill(&mut self) {
		let next = Sha512::digest(self.state);
		self.state.copy_from_slice(&next);
		self.buf.copy_from_slice(&next);
		self.used = 0;
	}

	pub fn fill(&mut self, dest: &mut [u8]) {
		let mut written = 0;
		while written < dest.len() {
			if self.used == BLOCK_LEN {
				self.refill();
			}
			let take = (dest.len() - written).min(BLOCK_LEN - self.used);
			dest[written..written + take].copy_from_slice(&self.buf[self.used..self.used + take]);
			self.used += take;
			written += take;
		}
	}
}

impl RngCore for SeedReader {
	fn next_u32(&mut self) -> u32 {
		let mut buf = [0u8; 4];
		self.fill(&mut buf);
		u32::from_le_bytes(buf)
	}

	fn next_u64(&mut self) -> u64 {
		let mut buf = [0u8; 8];
		self.fill(&mut buf);
		u64::from_le_bytes(buf)
	}

	fn fill_bytes(&mut self, dest: &mut [u8]) {
		self.fill(dest);
	}
}

impl CryptoRng for SeedReader {}

/// Single-byte reads are refused. Some crypto libraries probe an entropy
/// source one byte at a time to fold extra randomness into key generation,
/// which would make the derived material irreproducible.
impl io::Read for SeedReader {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		if buf.len() == 1 {
			return Err(io::Error::new(
				io::ErrorKind::InvalidInput,
				"deterministic seed does not serve single-byte reads",
			));
		}
		self.fill(buf);
		Ok(buf.len())
	}
}

#[cfg(test)]
mod test {
	use std::io::Read as _;

	use super::*;

	#[test]
	fn same_secret_same_stream() {
		let mut a = SeedReader::new(b"shared key");
		let mut b = SeedReader::new(b"shared key");
		let mut out_a = [0u8; 200];
		let mut out_b = [0u8; 200];
		a.fill(&mut out_a);
		b.fill(&mut out_b);
		assert_eq!(out_a, out_b);

		let mut c = SeedReader::new(b"other key");
		let mut out_c = [0u8; 200];
		c.fill(&mut out_c);
		assert_ne!(out_a, out_c);
	}

	#[test]
	fn read_sizes_compose() {
		// Reading 3 then 5 bytes must equal one 8-byte read.
		let mut split = SeedReader::new(b"k");
		let mut whole = SeedReader::new(b"k");
		let mut first = [0u8; 3];
		let mut second = [0u8; 5];
		split.read_exact(&mut first).unwrap();
		split.read_exact(&mut second).unwrap();
		let mut all = [0u8; 8];
		whole.read_exact(&mut all).unwrap();
		assert_eq!(&all[..3], &first);
		assert_eq!(&all[3..], &second);
	}

	#[test]
	fn single_byte_read_is_refused() {
		let mut seed = SeedReader::new(b"k");
		let mut one = [0u8; 1];
		assert_eq!(
			seed.read(&mut one).unwrap_err().kind(),
			io::ErrorKind::InvalidInput
		);
		// Larger reads still work afterwards.
		let mut two = [0u8; 2];
		assert_eq!(seed.read(&mut two).unwrap(), 2);
	}
}
