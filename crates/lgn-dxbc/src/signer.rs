//! Container signing.
//!
//! The runtime only accepts containers whose header carries a valid digest.
//! The bypass signer reproduces the validator's digest layout directly: a
//! standard MD5 round function driven through a non-standard finalization
//! (the trailing block embeds the bit count in one of two layouts depending
//! on how much of the last 64-byte chunk is occupied). The platform
//! validator, when available, is plugged in through [`Signer`].

use crate::{container, CodecError, Result};

/// A container signer. Implementations write the 16-byte digest into the
/// header checksum field of a stitched container.
pub trait Signer: Send + Sync {
    /// Sign a stitched container in place.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::SigningFailed`] when the payload is rejected.
    fn sign(&self, container: &mut [u8]) -> Result<()>;
}

const S: [u32; 64] = [
    7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, //
    5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, //
    4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, //
    6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
];

const K: [u32; 64] = [
    0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613,
    0xfd469501, 0x698098d8, 0x8b44f7af, 0xffff5bb1, 0x895cd7be, 0x6b901122, 0xfd987193,
    0xa679438e, 0x49b40821, 0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa, 0xd62f105d,
    0x02441453, 0xd8a1e681, 0xe7d3fbc8, 0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed,
    0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a, 0xfffa3942, 0x8771f681, 0x6d9d6122,
    0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70, 0x289b7ec6, 0xeaa127fa,
    0xd4ef3085, 0x04881d05, 0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665, 0xf4292244,
    0x432aff97, 0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1,
    0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1, 0xf7537e82, 0xbd3af235, 0x2ad7d2bb,
    0xeb86d391,
];

/// An MD5 round state fed by explicit updates. Finalization is the
/// caller's responsibility; the signer reads the raw state words.
pub struct Md5Context {
    state: [u32; 4],
    buffer: [u8; 64],
    buffered: usize,
}

impl Md5Context {
    pub fn new() -> Self {
        Self {
            state: [0x6745_2301, 0xefcd_ab89, 0x98ba_dcfe, 0x1032_5476],
            buffer: [0u8; 64],
            buffered: 0,
        }
    }

    /// Raw state words, little-endian digest order.
    pub fn state(&self) -> [u32; 4] {
        self.state
    }

    pub fn update(&mut self, mut data: &[u8]) {
        if self.buffered > 0 {
            let take = (64 - self.buffered).min(data.len());
            self.buffer[self.buffered..self.buffered + take].copy_from_slice(&data[..take]);
            self.buffered += take;
            data = &data[take..];

            if self.buffered == 64 {
                let block = self.buffer;
                self.process_block(&block);
                self.buffered = 0;
            }
        }

        let mut chunks = data.chunks_exact(64);
        for block in &mut chunks {
            let mut owned = [0u8; 64];
            owned.copy_from_slice(block);
            self.process_block(&owned);
        }

        let rest = chunks.remainder();
        self.buffer[..rest.len()].copy_from_slice(rest);
        self.buffered = rest.len();
    }

    fn process_block(&mut self, block: &[u8; 64]) {
        let mut m = [0u32; 16];
        for (i, word) in m.iter_mut().enumerate() {
            *word = u32::from_le_bytes([
                block[i * 4],
                block[i * 4 + 1],
                block[i * 4 + 2],
                block[i * 4 + 3],
            ]);
        }

        let [mut a, mut b, mut c, mut d] = self.state;

        for i in 0..64 {
            let (f, g) = match i / 16 {
                0 => ((b & c) | (!b & d), i),
                1 => ((d & b) | (!d & c), (5 * i + 1) % 16),
                2 => (b ^ c ^ d, (3 * i + 5) % 16),
                _ => (c ^ (b | !d), (7 * i) % 16),
            };

            let temp = d;
            d = c;
            c = b;
            b = b.wrapping_add(
                a.wrapping_add(f)
                    .wrapping_add(K[i])
                    .wrapping_add(m[g])
                    .rotate_left(S[i]),
            );
            a = temp;
        }

        self.state[0] = self.state[0].wrapping_add(a);
        self.state[1] = self.state[1].wrapping_add(b);
        self.state[2] = self.state[2].wrapping_add(c);
        self.state[3] = self.state[3].wrapping_add(d);
    }
}

impl Default for Md5Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Sign a stitched container by computing the digest in place.
///
/// The digest covers everything after the checksum field. The trailing
/// 64-byte chunk takes one of two layouts: at 56 bytes or more, the data
/// chunk is closed with a padding block and a final block carrying the bit
/// count; below that, the bit count leads and the remainder marker is
/// embedded in the padding itself.
///
/// Signing is idempotent: the checksum field is excluded from the digest,
/// so re-signing an unchanged container yields the same bytes.
///
/// # Errors
///
/// Returns [`CodecError::SigningFailed`] when the container is shorter
/// than its header.
pub fn sign_with_bypass(container: &mut [u8]) -> Result<()> {
    if container.len() < container::HEADER_SIZE {
        return Err(CodecError::SigningFailed(format!(
            "container of {} bytes is shorter than the header",
            container.len()
        )));
    }

    let digest_start = container::DIGEST_START;
    let byte_count = (container.len() - digest_start) as u32;
    let bit_count = byte_count.wrapping_mul(8);
    let last_chunk_length = (byte_count % 64) as usize;
    let last_chunk_padding = 64 - last_chunk_length;
    let full_chunk_length = byte_count as usize - last_chunk_length;
    let bit_count_2o1 = (bit_count >> 2) | 1;

    let mut ctx = Md5Context::new();
    ctx.update(&container[digest_start..digest_start + full_chunk_length]);

    let dangling = &container[digest_start + full_chunk_length..];

    let mut md5_block = [0u8; 64];
    md5_block[0] = 0x80;

    if last_chunk_length >= 56 {
        ctx.update(dangling);
        ctx.update(&md5_block[..last_chunk_padding]);

        let mut tail = [0u8; 64];
        tail[0..4].copy_from_slice(&bit_count.to_le_bytes());
        tail[60..64].copy_from_slice(&bit_count_2o1.to_le_bytes());
        ctx.update(&tail);
    } else {
        ctx.update(&bit_count.to_le_bytes());
        if last_chunk_length > 0 {
            ctx.update(dangling);
        }

        let padding_bytes = last_chunk_padding - 4;
        md5_block[padding_bytes - 4..padding_bytes].copy_from_slice(&bit_count_2o1.to_le_bytes());
        ctx.update(&md5_block[..padding_bytes]);
    }

    let state = ctx.state();
    for (i, word) in state.iter().enumerate() {
        container[4 + i * 4..8 + i * 4].copy_from_slice(&word.to_le_bytes());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference MD5 (standard finalization) built on the same round
    /// function, to validate the block core.
    fn md5_digest(data: &[u8]) -> [u8; 16] {
        let mut ctx = Md5Context::new();
        ctx.update(data);

        let bit_len = (data.len() as u64).wrapping_mul(8);
        let mut pad = vec![0x80u8];
        while (data.len() + pad.len()) % 64 != 56 {
            pad.push(0);
        }
        pad.extend_from_slice(&bit_len.to_le_bytes());
        ctx.update(&pad);

        let mut digest = [0u8; 16];
        for (i, word) in ctx.state().iter().enumerate() {
            digest[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        digest
    }

    #[test]
    fn test_md5_round_core_matches_reference_vectors() {
        // RFC 1321 test vectors.
        assert_eq!(
            md5_digest(b""),
            [
                0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec,
                0xf8, 0x42, 0x7e
            ]
        );
        assert_eq!(
            md5_digest(b"abc"),
            [
                0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f, 0x7d, 0x28,
                0xe1, 0x7f, 0x72
            ]
        );
        assert_eq!(
            md5_digest(b"abcdefghijklmnopqrstuvwxyz"),
            [
                0xc3, 0xfc, 0xd3, 0xd7, 0x61, 0x92, 0xe4, 0x00, 0x7d, 0xfb, 0x49, 0x6c, 0xca,
                0x67, 0xe1, 0x3b
            ]
        );
    }

    #[test]
    fn test_bypass_signing_is_idempotent() {
        let mut container = vec![0u8; 200];
        container[0..4].copy_from_slice(&crate::container::MAGIC.to_le_bytes());
        container[24..28].copy_from_slice(&200u32.to_le_bytes());

        sign_with_bypass(&mut container).unwrap();
        let first: Vec<u8> = container.clone();

        sign_with_bypass(&mut container).unwrap();
        assert_eq!(container, first);
    }

    #[test]
    fn test_bypass_signing_covers_both_tail_layouts() {
        // 84 bytes after the checksum -> 20-byte tail (short path).
        let mut short = vec![0x5Au8; 104];
        sign_with_bypass(&mut short).unwrap();

        // 120 bytes after the checksum -> 56-byte tail (two-update path).
        let mut long = vec![0x5Au8; 140];
        sign_with_bypass(&mut long).unwrap();

        assert_ne!(&short[4..20], &[0u8; 16]);
        assert_ne!(&long[4..20], &[0u8; 16]);
        assert_ne!(&short[4..20], &long[4..20]);
    }

    #[test]
    fn test_signature_changes_with_payload() {
        let mut a = vec![1u8; 100];
        let mut b = vec![1u8; 100];
        b[50] = 2;

        sign_with_bypass(&mut a).unwrap();
        sign_with_bypass(&mut b).unwrap();
        assert_ne!(&a[4..20], &b[4..20]);
    }
}
