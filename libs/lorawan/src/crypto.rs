//! Frame cryptography
//!
//! AES-128 and AES-CMAC primitives behind the network-server processing
//! path: data/join MIC computation, FRMPayload CTR encryption, the
//! join-accept ECB transform and the LoRaWAN 1.0 session-key derivation.
//!
//! The CTR keystream construction makes `encrypt_frame_payload` its own
//! inverse, so the same call decrypts uplinks and encrypts downlinks.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::types::{AesKey, AppNonce, DevAddr, DevNonce, NetId};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

const BLOCK_SIZE: usize = 16;

/// Direction byte used in the B0 block and the CTR counter blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to network
    Up = 0,
    /// Network to device
    Down = 1,
}

fn cipher(key: &AesKey) -> Aes128 {
    // 16-byte key by construction, new_from_slice cannot fail
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

fn cmac_tag(key: &AesKey, chunks: &[&[u8]]) -> [u8; MIC_SIZE] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key.as_bytes()));
    for chunk in chunks {
        mac.update(chunk);
    }
    let tag = mac.finalize().into_bytes();
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    mic
}

/// Compute the MIC of a data frame (B0 block prepended, CMAC, first 4 bytes)
///
/// `msg` is the frame from MHDR up to but excluding the MIC.
pub fn compute_data_mic(
    key: &AesKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    msg: &[u8],
) -> [u8; MIC_SIZE] {
    let mut b0 = [0u8; BLOCK_SIZE];
    b0[0] = 0x49;
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = msg.len() as u8;
    cmac_tag(key, &[&b0, msg])
}

/// Verify a data-frame MIC in constant structure (compute then compare)
pub fn check_data_mic(
    key: &AesKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    msg: &[u8],
    mic: &[u8; MIC_SIZE],
) -> bool {
    compute_data_mic(key, dev_addr, fcnt, dir, msg) == *mic
}

/// Compute the MIC of a join request or join accept
///
/// `msg` covers MHDR plus the (plaintext) join fields.
pub fn compute_join_mic(app_key: &AesKey, msg: &[u8]) -> [u8; MIC_SIZE] {
    cmac_tag(app_key, &[msg])
}

/// Encrypt or decrypt a FRMPayload with the AES-CTR keystream construction
///
/// Self-inverse: applying it twice with the same parameters yields the
/// original payload.
pub fn encrypt_frame_payload(
    key: &AesKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    payload: &[u8],
) -> Vec<u8> {
    let cipher = cipher(key);
    let mut out = Vec::with_capacity(payload.len());

    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        let mut a = [0u8; BLOCK_SIZE];
        a[0] = 0x01;
        a[5] = dir as u8;
        a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
        a[10..14].copy_from_slice(&fcnt.to_le_bytes());
        a[15] = (i + 1) as u8;

        cipher.encrypt_block(GenericArray::from_mut_slice(&mut a));
        for (j, &b) in chunk.iter().enumerate() {
            out.push(b ^ a[j]);
        }
    }
    out
}

/// Encrypt join-accept fields for transmission
///
/// The network applies AES *decrypt* so that the device can recover the
/// plaintext with a plain encrypt operation. `plain` must be a multiple of
/// 16 bytes (join-accept body plus MIC).
pub fn wrap_join_accept(app_key: &AesKey, plain: &[u8]) -> Vec<u8> {
    let cipher = cipher(app_key);
    let mut out = Vec::with_capacity(plain.len());
    for chunk in plain.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
        out.extend_from_slice(&block[..chunk.len()]);
    }
    out
}

/// Device-side recovery of join-accept fields (used by tests)
pub fn unwrap_join_accept(app_key: &AesKey, wrapped: &[u8]) -> Vec<u8> {
    let cipher = cipher(app_key);
    let mut out = Vec::with_capacity(wrapped.len());
    for chunk in wrapped.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        out.extend_from_slice(&block[..chunk.len()]);
    }
    out
}

fn derive_block(
    app_key: &AesKey,
    tag: u8,
    app_nonce: AppNonce,
    net_id: NetId,
    dev_nonce: DevNonce,
) -> [u8; BLOCK_SIZE] {
    let cipher = cipher(app_key);
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = tag;
    block[1..4].copy_from_slice(&app_nonce.0);
    block[4..7].copy_from_slice(&net_id.0);
    block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
    block
}

/// Derive (NwkSKey, AppSKey) per the LoRaWAN 1.0 construction
pub fn derive_session_keys(
    app_key: &AesKey,
    app_nonce: AppNonce,
    net_id: NetId,
    dev_nonce: DevNonce,
) -> (AesKey, AesKey) {
    let nwk = derive_block(app_key, 0x01, app_nonce, net_id, dev_nonce);
    let app = derive_block(app_key, 0x02, app_nonce, net_id, dev_nonce);
    (AesKey::new(nwk), AesKey::new(app))
}

/// Derive a deterministic DevAddr for a joining device
///
/// The low 25 bits come from an AES block over the join parameters; the
/// 7-bit NwkID prefix from the network identifier is forced into the top
/// bits so the address stays inside this network's block.
pub fn derive_dev_addr(
    app_key: &AesKey,
    app_nonce: AppNonce,
    net_id: NetId,
    dev_nonce: DevNonce,
) -> DevAddr {
    let block = derive_block(app_key, 0x03, app_nonce, net_id, dev_nonce);
    let raw = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    let addr = (u32::from(net_id.nwk_id()) << 25) | (raw & 0x01FF_FFFF);
    DevAddr::new(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> AesKey {
        AesKey::new([b; 16])
    }

    #[test]
    fn frame_payload_encryption_is_self_inverse() {
        let k = key(0x2B);
        let addr = DevAddr::new(0x2601_1F22);
        let payload = b"temperature=21.5;humidity=60";
        let encrypted = encrypt_frame_payload(&k, addr, 100, Direction::Up, payload);
        assert_ne!(&encrypted[..], &payload[..]);
        let decrypted = encrypt_frame_payload(&k, addr, 100, Direction::Up, &encrypted);
        assert_eq!(&decrypted[..], &payload[..]);
    }

    #[test]
    fn frame_payload_keystream_depends_on_fcnt() {
        let k = key(0x2B);
        let addr = DevAddr::new(0x2601_1F22);
        let a = encrypt_frame_payload(&k, addr, 1, Direction::Up, b"payload");
        let b = encrypt_frame_payload(&k, addr, 2, Direction::Up, b"payload");
        assert_ne!(a, b);
    }

    #[test]
    fn data_mic_changes_with_direction() {
        let k = key(0x11);
        let addr = DevAddr::new(1);
        let up = compute_data_mic(&k, addr, 5, Direction::Up, b"frame");
        let down = compute_data_mic(&k, addr, 5, Direction::Down, b"frame");
        assert_ne!(up, down);
        assert!(check_data_mic(&k, addr, 5, Direction::Up, b"frame", &up));
        assert!(!check_data_mic(&k, addr, 6, Direction::Up, b"frame", &up));
    }

    #[test]
    fn join_accept_wrap_unwrap_roundtrip() {
        let k = key(0x7E);
        let plain: Vec<u8> = (0..16).collect();
        let wrapped = wrap_join_accept(&k, &plain);
        assert_eq!(unwrap_join_accept(&k, &wrapped), plain);
    }

    #[test]
    fn session_keys_are_distinct_and_deterministic() {
        let k = key(0x01);
        let nonce = AppNonce([1, 2, 3]);
        let net_id = NetId([0, 0, 0x13]);
        let dev_nonce = DevNonce(0xABCD);
        let (nwk1, app1) = derive_session_keys(&k, nonce, net_id, dev_nonce);
        let (nwk2, app2) = derive_session_keys(&k, nonce, net_id, dev_nonce);
        assert_eq!(nwk1, nwk2);
        assert_eq!(app1, app2);
        assert_ne!(nwk1, app1);
    }

    #[test]
    fn derived_dev_addr_carries_nwk_id_prefix() {
        let addr = derive_dev_addr(
            &key(0x42),
            AppNonce([9, 9, 9]),
            NetId([0, 0, 0x13]),
            DevNonce(7),
        );
        assert_eq!(addr.nwk_id(), 0x13);
    }
}
