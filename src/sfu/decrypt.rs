//! In-place decryption of Blowfish-encrypted chunk payloads.
//!
//! An encrypted payload is the plaintext, zero-padded to a multiple of 8 bytes, followed by an
//! 8-byte trailer whose last 4 bytes hold the plaintext length (big-endian). The whole thing is
//! Blowfish-ECB encrypted.

use crate::blowfish::Blowfish;

use super::DecryptError;

const BLOCK_LEN: usize = 8;

/// Decrypt `buf` in place and return the length of the original payload.
///
/// `buf` is the padded payload exactly as stored in the image.
pub fn decrypt_chunk(key: &[u8], buf: &mut [u8]) -> Result<u32, DecryptError> {
    if buf.is_empty() || buf.len() % BLOCK_LEN != 0 {
        return Err(DecryptError::BadPadding(buf.len()));
    }

    let cipher = Blowfish::new(key)?;
    cipher.decrypt_in_place(buf);

    let [.., a, b, c, d] = *buf else {
        return Err(DecryptError::BadPadding(buf.len()));
    };
    let original = u32::from_be_bytes([a, b, c, d]);

    if (buf.len() - BLOCK_LEN) as u64 >= original as u64 {
        Ok(original)
    } else {
        log::error!(
            "padded_len({:#010x}) orig_len({:#010x})",
            buf.len(),
            original
        );
        Err(DecryptError::LengthMismatch {
            padded: buf.len(),
            original,
        })
    }
}

/// Produce the padded, encrypted form of `plain` that [`decrypt_chunk`] undoes.
pub fn encrypt_chunk(key: &[u8], plain: &[u8]) -> Result<Vec<u8>, DecryptError> {
    let cipher = Blowfish::new(key)?;

    let mut buf = plain.to_vec();
    buf.resize(plain.len().next_multiple_of(BLOCK_LEN) + BLOCK_LEN, 0);
    let len_at = buf.len() - 4;
    buf[len_at..].copy_from_slice(&(plain.len() as u32).to_be_bytes());

    cipher.encrypt_in_place(&mut buf);
    Ok(buf)
}

#[test]
fn test_decrypt_roundtrip() -> anyhow::Result<()> {
    for len in [0usize, 1, 7, 8, 9, 100] {
        let plain: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
        let mut buf = encrypt_chunk(b"key", &plain)?;
        assert_eq!(buf.len() % 8, 0);
        assert!(buf.len() >= plain.len() + 8);

        let original = decrypt_chunk(b"key", &mut buf)?;
        assert_eq!(original as usize, len);
        assert_eq!(&buf[..len], &plain[..]);
    }
    Ok(())
}

#[test]
fn test_decrypt_rejects_bad_input() -> anyhow::Result<()> {
    assert!(matches!(
        decrypt_chunk(b"key", &mut []),
        Err(DecryptError::BadPadding(0))
    ));
    assert!(matches!(
        decrypt_chunk(b"key", &mut [0; 12]),
        Err(DecryptError::BadPadding(12))
    ));
    assert!(matches!(
        decrypt_chunk(b"", &mut [0; 8]),
        Err(DecryptError::Key(_))
    ));

    // A trailer claiming more data than the padding allows
    let mut buf = vec![0u8; 16];
    buf[12..].copy_from_slice(&9u32.to_be_bytes());
    crate::blowfish::Blowfish::new(b"key")?.encrypt_in_place(&mut buf);
    assert!(matches!(
        decrypt_chunk(b"key", &mut buf),
        Err(DecryptError::LengthMismatch {
            padded: 16,
            original: 9
        })
    ));

    // ...whereas exactly `padded - 8` is fine
    let mut buf = vec![0u8; 16];
    buf[12..].copy_from_slice(&8u32.to_be_bytes());
    crate::blowfish::Blowfish::new(b"key")?.encrypt_in_place(&mut buf);
    assert_eq!(decrypt_chunk(b"key", &mut buf)?, 8);
    Ok(())
}

#[test]
fn test_decrypt_long_key() -> anyhow::Result<()> {
    let key = [0x5A; 60];
    let mut buf = encrypt_chunk(&key, b"payload")?;
    assert_eq!(decrypt_chunk(&key, &mut buf)?, 7);
    assert_eq!(&buf[..7], b"payload");
    Ok(())
}
