// Frame codec - length-prefixed, Blowfish-encrypted, checksummed packets
//
// Wire layout: u16 total length (little-endian, includes itself) followed
// by the encrypted body. The plaintext body carries the payload, zero
// padding up to a multiple of 8, and a 4-byte XOR-word checksum trailer.
// Codec failures are fatal to the connection that produced them.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::blowfish::{BLOCK_SIZE, L2Blowfish};
use super::xor::enc_xor_pass;
use crate::MAX_FRAME_BODY;

/// Length prefix size.
pub const HEADER_SIZE: usize = 2;

/// Classified codec failures. All of them close the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("short read: {0}")]
    ShortRead(#[source] std::io::Error),
    #[error("frame body of {0} bytes exceeds the read buffer")]
    Oversize(usize),
    #[error("malformed frame length {0}")]
    Malformed(usize),
    #[error("frame body of {0} bytes cannot be block-decrypted")]
    DecryptError(usize),
    #[error("frame checksum mismatch")]
    ChecksumMismatch,
    #[error("socket write failed: {0}")]
    Io(#[source] std::io::Error),
}

/// XOR of all little-endian 32-bit words in `data`.
pub fn compute_checksum(data: &[u8]) -> u32 {
    data.chunks_exact(4)
        .fold(0u32, |acc, word| acc ^ u32::from_le_bytes(word.try_into().unwrap()))
}

/// A decrypted body is valid when the XOR of every word, checksum trailer
/// included, is zero.
pub fn verify_checksum(body: &[u8]) -> bool {
    if body.len() < 8 || body.len() % 4 != 0 {
        return false;
    }
    compute_checksum(body) == 0
}

/// Read one frame into `buf`, decrypt and verify it, and return the
/// payload length (checksum trailer dropped). The payload is `buf[..n]`.
///
/// No body bytes are consumed when the header announces a body larger
/// than `buf`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    cipher: &L2Blowfish,
    buf: &mut [u8],
) -> Result<usize, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .await
        .map_err(FrameError::ShortRead)?;

    let total_len = u16::from_le_bytes(header) as usize;
    if total_len < HEADER_SIZE {
        return Err(FrameError::Malformed(total_len));
    }
    let body_len = total_len - HEADER_SIZE;
    if body_len == 0 {
        return Err(FrameError::Malformed(total_len));
    }
    if body_len > buf.len() {
        return Err(FrameError::Oversize(body_len));
    }

    reader
        .read_exact(&mut buf[..body_len])
        .await
        .map_err(FrameError::ShortRead)?;

    if body_len % BLOCK_SIZE != 0 {
        return Err(FrameError::DecryptError(body_len));
    }
    cipher.decrypt_in_place(&mut buf[..body_len]);

    if !verify_checksum(&buf[..body_len]) {
        return Err(FrameError::ChecksumMismatch);
    }
    Ok(body_len - 4)
}

/// Frame, checksum, pad, encrypt and send a payload the caller has placed
/// in `buf[HEADER_SIZE..HEADER_SIZE + payload_len]`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cipher: &L2Blowfish,
    buf: &mut [u8],
    payload_len: usize,
) -> Result<(), FrameError> {
    let padded = (payload_len + 4).next_multiple_of(BLOCK_SIZE);
    if padded > MAX_FRAME_BODY || HEADER_SIZE + padded > buf.len() {
        return Err(FrameError::Oversize(padded));
    }

    buf[HEADER_SIZE + payload_len..HEADER_SIZE + padded].fill(0);
    let checksum = compute_checksum(&buf[HEADER_SIZE..HEADER_SIZE + padded - 4]);
    buf[HEADER_SIZE + padded - 4..HEADER_SIZE + padded].copy_from_slice(&checksum.to_le_bytes());

    cipher.encrypt_in_place(&mut buf[HEADER_SIZE..HEADER_SIZE + padded]);

    let total = (HEADER_SIZE + padded) as u16;
    buf[..HEADER_SIZE].copy_from_slice(&total.to_le_bytes());
    writer
        .write_all(&buf[..HEADER_SIZE + padded])
        .await
        .map_err(FrameError::Io)
}

/// Send an unencrypted frame: length prefix plus raw payload. Used only
/// for the game server's first outgoing Key frame.
pub async fn write_plain_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &mut [u8],
    payload_len: usize,
) -> Result<(), FrameError> {
    if HEADER_SIZE + payload_len > buf.len() || payload_len > MAX_FRAME_BODY {
        return Err(FrameError::Oversize(payload_len));
    }
    let total = (HEADER_SIZE + payload_len) as u16;
    buf[..HEADER_SIZE].copy_from_slice(&total.to_le_bytes());
    writer
        .write_all(&buf[..HEADER_SIZE + payload_len])
        .await
        .map_err(FrameError::Io)
}

/// Send the Init frame: the payload is zero-padded to `block_len`, the
/// XOR accumulator pass keyed by `xor_key` is applied, and the whole
/// block is encrypted. The client reverses the two layers in the same
/// order: Blowfish first, then the XOR pass.
pub async fn write_xor_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cipher: &L2Blowfish,
    buf: &mut [u8],
    payload_len: usize,
    block_len: usize,
    xor_key: u32,
) -> Result<(), FrameError> {
    if block_len % BLOCK_SIZE != 0 || block_len > MAX_FRAME_BODY {
        return Err(FrameError::Malformed(block_len));
    }
    // the XOR pass needs 8 trailing bytes past the payload
    if payload_len + 8 > block_len || HEADER_SIZE + block_len > buf.len() {
        return Err(FrameError::Oversize(block_len));
    }

    buf[HEADER_SIZE + payload_len..HEADER_SIZE + block_len].fill(0);
    enc_xor_pass(&mut buf[HEADER_SIZE..HEADER_SIZE + block_len], block_len, xor_key);
    cipher.encrypt_in_place(&mut buf[HEADER_SIZE..HEADER_SIZE + block_len]);

    let total = (HEADER_SIZE + block_len) as u16;
    buf[..HEADER_SIZE].copy_from_slice(&total.to_le_bytes());
    writer
        .write_all(&buf[..HEADER_SIZE + block_len])
        .await
        .map_err(FrameError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::xor::dec_xor_pass;

    fn test_cipher() -> L2Blowfish {
        L2Blowfish::new(&[
            0x04, 0xA1, 0xC3, 0x42, 0xAD, 0xAA, 0xF2, 0x34,
            0x30, 0x78, 0x9F, 0x61, 0xB8, 0x92, 0x53, 0x32,
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let cipher = test_cipher();
        let payload = [0x07u8, 0x78, 0x56, 0x34, 0x12, 0x00, 0x00];

        let mut out: Vec<u8> = Vec::new();
        let mut buf = [0u8; 256];
        buf[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(&payload);
        write_frame(&mut out, &cipher, &mut buf, payload.len())
            .await
            .unwrap();

        // body length multiple of 8, within bounds
        let total = u16::from_le_bytes([out[0], out[1]]) as usize;
        assert_eq!((total - HEADER_SIZE) % 8, 0);
        assert!(total - HEADER_SIZE <= crate::MAX_FRAME_BODY);

        let mut read_buf = [0u8; 256];
        let mut reader = &out[..];
        let n = read_frame(&mut reader, &cipher, &mut read_buf).await.unwrap();
        assert!(n >= payload.len());
        assert_eq!(&read_buf[..payload.len()], &payload);
        // padding region decodes to zero
        assert!(read_buf[payload.len()..n].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_oversize_reads_no_body() {
        let cipher = test_cipher();
        // announce a 1024-byte frame, supply only the header
        let wire = 1026u16.to_le_bytes().to_vec();
        let mut small = [0u8; 64];
        let mut reader = &wire[..];
        match read_frame(&mut reader, &cipher, &mut small).await {
            Err(FrameError::Oversize(n)) => assert_eq!(n, 1024),
            other => panic!("expected Oversize, got {other:?}"),
        }
        // nothing past the header was consumed
        assert_eq!(reader.len(), 0);
    }

    #[tokio::test]
    async fn test_zero_length_body_malformed() {
        let cipher = test_cipher();
        let wire = 2u16.to_le_bytes();
        let mut buf = [0u8; 64];
        let mut reader = &wire[..];
        assert!(matches!(
            read_frame(&mut reader, &cipher, &mut buf).await,
            Err(FrameError::Malformed(2))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_frame_fails_checksum() {
        let cipher = test_cipher();
        let mut out: Vec<u8> = Vec::new();
        let mut buf = [0u8; 64];
        buf[2..6].copy_from_slice(&[1, 2, 3, 4]);
        write_frame(&mut out, &cipher, &mut buf, 4).await.unwrap();

        let last = out.len() - 1;
        out[last] ^= 0xFF;

        let mut read_buf = [0u8; 64];
        let mut reader = &out[..];
        match read_frame(&mut reader, &cipher, &mut read_buf).await {
            Err(FrameError::ChecksumMismatch) | Err(FrameError::DecryptError(_)) => {}
            other => panic!("expected a crypto failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_key_fails_checksum() {
        let cipher = test_cipher();
        let other = L2Blowfish::static_client();
        let mut out: Vec<u8> = Vec::new();
        let mut buf = [0u8; 64];
        buf[2..7].copy_from_slice(&[9, 8, 7, 6, 5]);
        write_frame(&mut out, &cipher, &mut buf, 5).await.unwrap();

        let mut read_buf = [0u8; 64];
        let mut reader = &out[..];
        assert!(matches!(
            read_frame(&mut reader, &other, &mut read_buf).await,
            Err(FrameError::ChecksumMismatch)
        ));
    }

    #[tokio::test]
    async fn test_xor_frame_client_decode() {
        // what the client does to the Init frame: Blowfish decrypt, then
        // unwind the XOR pass
        let cipher = L2Blowfish::static_client();
        let payload: Vec<u8> = (0u8..170).collect();
        let block_len = 192;

        let mut out: Vec<u8> = Vec::new();
        let mut buf = [0u8; 256];
        buf[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(&payload);
        write_xor_frame(&mut out, &cipher, &mut buf, payload.len(), block_len, 0x0BCD_EF01)
            .await
            .unwrap();

        assert_eq!(out.len(), HEADER_SIZE + block_len);
        assert_eq!(u16::from_le_bytes([out[0], out[1]]) as usize, HEADER_SIZE + block_len);

        let mut body = out[HEADER_SIZE..].to_vec();
        cipher.decrypt_in_place(&mut body);
        dec_xor_pass(&mut body, block_len);
        assert_eq!(&body[..4], &payload[..4]);
        assert_eq!(&body[4..170], &payload[4..170]);
    }

    #[test]
    fn test_checksum_xor_words() {
        let mut body = vec![0u8; 16];
        body[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let sum = compute_checksum(&body[..12]);
        body[12..16].copy_from_slice(&sum.to_le_bytes());
        assert!(verify_checksum(&body));
        body[0] ^= 1;
        assert!(!verify_checksum(&body));
    }
}
