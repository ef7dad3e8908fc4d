//! LoRaWAN 1.0.x payload cipher and message integrity code
//!
//! FRMPayload is encrypted by XOR with a keystream of AES-128 encrypted
//! counter blocks:
//!
//!   Ai = 0x01 | 0x00000000 | Dir | DevAddr(LE) | FCnt(LE,4) | 0x00 | i
//!
//! The MIC is the first 4 bytes of AES-CMAC(NwkSKey, B0 | MHDR | MACPayload):
//!
//!   B0 = 0x49 | 0x00000000 | Dir | DevAddr(LE) | FCnt(LE,4) | 0x00 | len(msg)

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::error::CodecError;

/// Uplink / downlink direction byte in the Ai and B0 blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

const BLOCK_LEN: usize = 16;

/// The block counter in Ai is a single byte starting at 1
pub const MAX_FRM_PAYLOAD_LEN: usize = 255 * BLOCK_LEN;

fn counter_block(tag: u8, dir: Direction, dev_addr_le: &[u8; 4], fcnt: u32, last: u8) -> [u8; 16] {
    let mut block = [0u8; BLOCK_LEN];
    block[0] = tag;
    block[5] = dir as u8;
    block[6..10].copy_from_slice(dev_addr_le);
    block[10..14].copy_from_slice(&fcnt.to_le_bytes());
    block[15] = last;
    block
}

/// Apply the FRMPayload keystream. Encryption and decryption are the same operation.
pub fn apply_frm_keystream(
    key: &[u8; 16],
    dev_addr_le: &[u8; 4],
    fcnt: u32,
    dir: Direction,
    data: &[u8],
) -> Result<Vec<u8>, CodecError> {
    if data.len() > MAX_FRM_PAYLOAD_LEN {
        return Err(CodecError::InvalidFrame(format!(
            "FRMPayload of {} bytes exceeds {} blocks",
            data.len(),
            MAX_FRM_PAYLOAD_LEN / BLOCK_LEN
        )));
    }

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = Vec::with_capacity(data.len());

    for (i, chunk) in data.chunks(BLOCK_LEN).enumerate() {
        let a = counter_block(0x01, dir, dev_addr_le, fcnt, (i + 1) as u8);
        let mut s = GenericArray::clone_from_slice(&a);
        cipher.encrypt_block(&mut s);
        out.extend(chunk.iter().zip(s.iter()).map(|(b, k)| b ^ k));
    }

    Ok(out)
}

pub fn decrypt_frm_payload(
    key: &[u8; 16],
    dev_addr_le: &[u8; 4],
    fcnt: u32,
    ciphertext: &[u8],
    dir: Direction,
) -> Result<Vec<u8>, CodecError> {
    apply_frm_keystream(key, dev_addr_le, fcnt, dir, ciphertext)
}

pub fn encrypt_frm_payload(
    key: &[u8; 16],
    dev_addr_le: &[u8; 4],
    fcnt: u32,
    plaintext: &[u8],
    dir: Direction,
) -> Result<Vec<u8>, CodecError> {
    apply_frm_keystream(key, dev_addr_le, fcnt, dir, plaintext)
}

/// Compute the 4-byte MIC over `msg` (MHDR | MACPayload)
pub fn compute_mic(
    nwk_s_key: &[u8; 16],
    dev_addr_le: &[u8; 4],
    fcnt: u32,
    dir: Direction,
    msg: &[u8],
) -> Result<[u8; 4], CodecError> {
    let len = u8::try_from(msg.len()).map_err(|_| {
        CodecError::InvalidFrame(format!("{} byte message is too long to sign", msg.len()))
    })?;
    let b0 = counter_block(0x49, dir, dev_addr_le, fcnt, len);

    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(nwk_s_key));
    mac.update(&b0);
    mac.update(msg);
    let tag = mac.finalize().into_bytes();

    let mut mic = [0u8; 4];
    mic.copy_from_slice(&tag[..4]);
    Ok(mic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const APP_S_KEY: [u8; 16] = [
        0xF0, 0xE0, 0xD0, 0xC0, 0xB0, 0xA0, 0x90, 0x80, 0x70, 0x60, 0x50, 0x40, 0x30, 0x20, 0x10,
        0x00,
    ];
    const DEV_ADDR_LE: [u8; 4] = [0xDA, 0x1B, 0x01, 0x26];

    fn encrypt(fcnt: u32, data: &[u8], dir: Direction) -> Vec<u8> {
        encrypt_frm_payload(&APP_S_KEY, &DEV_ADDR_LE, fcnt, data, dir).unwrap()
    }

    #[test]
    fn test_empty_payload() {
        let out = decrypt_frm_payload(&APP_S_KEY, &DEV_ADDR_LE, 0, &[], Direction::Uplink).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_multi_block_roundtrip() {
        let plain: Vec<u8> = (0..40).collect();
        let enc = encrypt(7, &plain, Direction::Uplink);
        assert_eq!(enc.len(), 40);
        assert_ne!(enc, plain);
        let dec = decrypt_frm_payload(&APP_S_KEY, &DEV_ADDR_LE, 7, &enc, Direction::Uplink).unwrap();
        assert_eq!(dec, plain);
    }

    #[test]
    fn test_direction_and_fcnt_change_keystream() {
        let plain = [0u8; 16];
        let up = encrypt(1, &plain, Direction::Uplink);
        let down = encrypt(1, &plain, Direction::Downlink);
        let next = encrypt(2, &plain, Direction::Uplink);
        assert_ne!(up, down);
        assert_ne!(up, next);
    }

    #[test]
    fn test_short_last_block_is_prefix_of_full() {
        let full = encrypt(3, &[0u8; 32], Direction::Uplink);
        let short = encrypt(3, &[0u8; 20], Direction::Uplink);
        assert_eq!(&full[..20], &short[..]);
    }

    #[test]
    fn test_block_counter_limit() {
        let largest = vec![0u8; MAX_FRM_PAYLOAD_LEN];
        assert_eq!(encrypt(0, &largest, Direction::Uplink).len(), MAX_FRM_PAYLOAD_LEN);

        // A 256th block would need counter byte 0x00 again
        let oversized = vec![0u8; MAX_FRM_PAYLOAD_LEN + 1];
        let err = decrypt_frm_payload(&APP_S_KEY, &DEV_ADDR_LE, 0, &oversized, Direction::Uplink)
            .unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrame(_)));
    }

    #[test]
    fn test_mic_depends_on_message() {
        let mic = |msg: &[u8]| compute_mic(&APP_S_KEY, &DEV_ADDR_LE, 0, Direction::Uplink, msg);
        let a = mic(&[0x40, 0x01]).unwrap();
        let b = mic(&[0x40, 0x02]).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, mic(&[0x40, 0x01]).unwrap());
    }

    #[test]
    fn test_mic_rejects_message_over_255_bytes() {
        let mic = |len: usize| {
            compute_mic(&APP_S_KEY, &DEV_ADDR_LE, 0, Direction::Uplink, &vec![0u8; len])
        };
        assert!(mic(255).is_ok());
        assert!(matches!(mic(256), Err(CodecError::InvalidFrame(_))));
    }

    proptest! {
        #[test]
        fn encrypt_is_deterministic_and_reversible(
            key in any::<[u8; 16]>(),
            dev_addr in any::<[u8; 4]>(),
            fcnt in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let a = encrypt_frm_payload(&key, &dev_addr, fcnt, &payload, Direction::Uplink).unwrap();
            let b = encrypt_frm_payload(&key, &dev_addr, fcnt, &payload, Direction::Uplink).unwrap();
            prop_assert_eq!(&a, &b);
            let back = decrypt_frm_payload(&key, &dev_addr, fcnt, &a, Direction::Uplink).unwrap();
            prop_assert_eq!(back, payload);
        }
    }
}
