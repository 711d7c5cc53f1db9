//! The Blowfish block cipher, used to decrypt encrypted SFU chunk payloads.
//!
//! Subkeys are derived from a key of at least one byte, repeated as often as needed. Only the first
//! [`MAX_KEY_BYTES`] bytes influence every subkey. Blocks are 64 bits wide and handled as a pair of
//! 32-bit halves.

mod tables;

use tables::{P_INIT, S_INIT};

const ROUNDS: usize = 16;

/// The longest key (in bytes) that still affects every subkey
pub const MAX_KEY_BYTES: usize = 56;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum KeyError {
    #[error("blowfish key is empty")]
    Empty,
}

/// Expanded key state: the P-array and the four S-boxes
#[derive(Clone, Eq, PartialEq)]
pub struct Blowfish {
    p: [u32; ROUNDS + 2],
    s: [[u32; 256]; 4],
}

impl std::fmt::Debug for Blowfish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Subkeys are key material; don't dump them into logs.
        f.debug_struct("Blowfish").finish_non_exhaustive()
    }
}

impl Blowfish {
    /// Run the key schedule for `key`.
    pub fn new(key: &[u8]) -> Result<Self, KeyError> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }

        let mut bf = Self {
            p: P_INIT,
            s: S_INIT,
        };

        let mut key_bytes = key.iter().copied().cycle();
        for p in bf.p.iter_mut() {
            let data = (&mut key_bytes)
                .take(4)
                .fold(0u32, |acc, byte| (acc << 8) | byte as u32);
            *p ^= data;
        }

        let (mut l, mut r) = (0u32, 0u32);
        for i in (0..ROUNDS + 2).step_by(2) {
            (l, r) = bf.encipher(l, r);
            bf.p[i] = l;
            bf.p[i + 1] = r;
        }
        for sbox in 0..4 {
            for i in (0..256).step_by(2) {
                (l, r) = bf.encipher(l, r);
                bf.s[sbox][i] = l;
                bf.s[sbox][i + 1] = r;
            }
        }

        Ok(bf)
    }

    fn f(&self, x: u32) -> u32 {
        let [a, b, c, d] = x.to_be_bytes();
        let y = self.s[0][a as usize].wrapping_add(self.s[1][b as usize]);
        (y ^ self.s[2][c as usize]).wrapping_add(self.s[3][d as usize])
    }

    /// Encrypt one block, given as its left and right halves.
    pub fn encipher(&self, mut l: u32, mut r: u32) -> (u32, u32) {
        for i in 0..ROUNDS {
            l ^= self.p[i];
            r ^= self.f(l);
            std::mem::swap(&mut l, &mut r);
        }
        std::mem::swap(&mut l, &mut r);
        r ^= self.p[ROUNDS];
        l ^= self.p[ROUNDS + 1];
        (l, r)
    }

    /// Decrypt one block, given as its left and right halves.
    pub fn decipher(&self, mut l: u32, mut r: u32) -> (u32, u32) {
        for i in (2..ROUNDS + 2).rev() {
            l ^= self.p[i];
            r ^= self.f(l);
            std::mem::swap(&mut l, &mut r);
        }
        std::mem::swap(&mut l, &mut r);
        r ^= self.p[1];
        l ^= self.p[0];
        (l, r)
    }

    /// Decrypt every complete 8-byte block of `buf` in place (ECB).
    ///
    /// Each half-block is loaded as a little-endian word, matching the byte order the update
    /// images were produced for. A trailing partial block is left untouched.
    pub fn decrypt_in_place(&self, buf: &mut [u8]) {
        self.apply_in_place(buf, Self::decipher)
    }

    /// Encrypt every complete 8-byte block of `buf` in place (ECB); the inverse of
    /// [`Blowfish::decrypt_in_place`].
    pub fn encrypt_in_place(&self, buf: &mut [u8]) {
        self.apply_in_place(buf, Self::encipher)
    }

    fn apply_in_place(&self, buf: &mut [u8], op: fn(&Self, u32, u32) -> (u32, u32)) {
        for block in buf.chunks_exact_mut(8) {
            let (left, right) = block.split_at_mut(4);
            let l = u32::from_le_bytes([left[0], left[1], left[2], left[3]]);
            let r = u32::from_le_bytes([right[0], right[1], right[2], right[3]]);
            let (l, r) = op(self, l, r);
            left.copy_from_slice(&l.to_le_bytes());
            right.copy_from_slice(&r.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_vectors() -> anyhow::Result<()> {
        let bf = Blowfish::new(&[0u8; 8])?;
        assert_eq!(bf.encipher(0, 0), (0x4EF99745, 0x6198DD78));

        let bf = Blowfish::new(&[0xFFu8; 8])?;
        assert_eq!(
            bf.encipher(0xFFFFFFFF, 0xFFFFFFFF),
            (0x51866FD5, 0xB85ECB8A)
        );

        let bf = Blowfish::new(b"TESTKEY")?;
        assert_eq!(bf.encipher(1, 2), (0xDF333FD2, 0x30A71BB4));
        assert_eq!(bf.decipher(0xDF333FD2, 0x30A71BB4), (1, 2));
        Ok(())
    }

    #[test]
    fn test_decrypt_in_place_byte_order() -> anyhow::Result<()> {
        let bf = Blowfish::new(b"key")?;
        let mut buf = [0x5D, 0xF8, 0xF9, 0xA1, 0x7C, 0x68, 0x30, 0x76, 0xAA];
        bf.decrypt_in_place(&mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8, 0xAA]);
        Ok(())
    }

    #[test]
    fn test_key_limits() {
        assert_eq!(Blowfish::new(&[]), Err(KeyError::Empty));
        assert!(Blowfish::new(&[0; MAX_KEY_BYTES]).is_ok());
    }

    #[test]
    fn test_long_key() -> anyhow::Result<()> {
        let key: Vec<u8> = (0..60).collect();
        let bf = Blowfish::new(&key)?;
        let (l, r) = bf.encipher(0x0123_4567, 0x89AB_CDEF);
        assert_eq!(bf.decipher(l, r), (0x0123_4567, 0x89AB_CDEF));

        let mut buf = *b"sixteen byte buf";
        bf.encrypt_in_place(&mut buf);
        assert_ne!(&buf, b"sixteen byte buf");
        bf.decrypt_in_place(&mut buf);
        assert_eq!(&buf, b"sixteen byte buf");

        // The P-array consumes 72 key bytes, so bytes past the 56th still count
        assert_ne!(bf, Blowfish::new(&key[..MAX_KEY_BYTES])?);
        Ok(())
    }

    #[test]
    fn test_key_schedule_deterministic() -> anyhow::Result<()> {
        assert_eq!(Blowfish::new(b"secret")?, Blowfish::new(b"secret")?);
        assert_ne!(Blowfish::new(b"secret")?, Blowfish::new(b"secreT")?);
        Ok(())
    }

    proptest! {
        #[test]
        fn decipher_inverts_encipher(
            key in prop::collection::vec(any::<u8>(), 1..=MAX_KEY_BYTES),
            l: u32,
            r: u32,
        ) {
            let bf = Blowfish::new(&key).unwrap();
            let (cl, cr) = bf.encipher(l, r);
            prop_assert_eq!(bf.decipher(cl, cr), (l, r));
        }
    }
}
