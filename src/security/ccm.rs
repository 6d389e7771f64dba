//! Hand-rolled AES-128-CCM primitives for Data Secure.
//!
//! KNX Data Secure's CCM instantiation doesn't match the `ccm` crate's
//! generic AEAD framing (custom Block0/Ctr_i layout keyed off KNX addresses
//! rather than a plain nonce), so this builds CBC-MAC and CTR mode directly
//! on top of the raw AES-128 block cipher.

use crate::security::keys::AesKey;

use aes::{Aes128, Block};
use cipher::{BlockEncrypt, KeyInit};

fn aes_encrypt_block(key: &AesKey, mut block: [u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new_from_slice(key.bytes()).expect("AesKey is always 16 bytes");
    let generic_block = Block::from_mut_slice(&mut block);
    cipher.encrypt_block(generic_block);
    block
}

/// `AT` byte of Block0: group/individual destination flag plus the
/// extended-frame-format low nibble.
#[must_use]
pub const fn address_type_byte(is_group: bool, extended_frame_format: u8) -> u8 {
    let group_bit = if is_group { 0x80 } else { 0 };
    group_bit | (extended_frame_format & 0x0F)
}

/// Build Block0, the first CBC-MAC input block.
///
/// Layout: `seqOrRand(6) | src(2) | dst(2) | 0 | AT(1) | tpci(1) | apci(1) | 0 | payloadLen(1)`.
#[must_use]
pub fn block0(
    seq_or_rand: [u8; 6],
    src: u16,
    dst: u16,
    at: u8,
    tpci_byte: u8,
    apci_byte: u8,
    payload_len: u8,
) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..6].copy_from_slice(&seq_or_rand);
    block[6..8].copy_from_slice(&src.to_be_bytes());
    block[8..10].copy_from_slice(&dst.to_be_bytes());
    block[10] = 0;
    block[11] = at;
    block[12] = tpci_byte;
    block[13] = apci_byte;
    block[14] = 0;
    block[15] = payload_len;
    block
}

/// Build the `counter`-th CTR block.
///
/// Layout: `seqOrRand(6) | src(2) | dst(2) | 0 | 0x00 0x00 0x00 0x00 | counter(1)`.
/// `counter = 1` produces the block used to mask the transmitted MAC;
/// `counter >= 2` masks successive 16-byte chunks of the payload.
#[must_use]
pub fn ctr_block(seq_or_rand: [u8; 6], src: u16, dst: u16, counter: u8) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..6].copy_from_slice(&seq_or_rand);
    block[6..8].copy_from_slice(&src.to_be_bytes());
    block[8..10].copy_from_slice(&dst.to_be_bytes());
    block[10] = 0;
    block[11..15].copy_from_slice(&[0, 0, 0, 0]);
    block[15] = counter;
    block
}

/// Compute the raw (un-masked) 4-byte CBC-MAC tag over `block0` chained with
/// `len16(associated||payload) | associated | payload`, zero-padded to the
/// next 16-byte boundary.
#[must_use]
pub fn compute_mac(key: &AesKey, block0: [u8; 16], associated: &[u8], payload: &[u8]) -> [u8; 4] {
    let mut message = Vec::with_capacity(2 + associated.len() + payload.len());
    let len16 = (associated.len() + payload.len()) as u16;
    message.extend_from_slice(&len16.to_be_bytes());
    message.extend_from_slice(associated);
    message.extend_from_slice(payload);

    let padding = (16 - message.len() % 16) % 16;
    message.extend(std::iter::repeat(0u8).take(padding));

    let mut chained = aes_encrypt_block(key, block0);
    for chunk in message.chunks(16) {
        let mut block = [0u8; 16];
        block.copy_from_slice(chunk);
        for (b, c) in block.iter_mut().zip(chained.iter()) {
            *b ^= c;
        }
        chained = aes_encrypt_block(key, block);
    }

    let mut mac = [0u8; 4];
    mac.copy_from_slice(&chained[..4]);
    mac
}

/// Mask (encrypt-to-transmit, or unmask-on-receive — XOR is its own
/// inverse) the 4-byte MAC with the keystream from `ctr_block(..., 1)`.
#[must_use]
pub fn mask_mac(key: &AesKey, seq_or_rand: [u8; 6], src: u16, dst: u16, mac: [u8; 4]) -> [u8; 4] {
    let keystream = aes_encrypt_block(key, ctr_block(seq_or_rand, src, dst, 1));
    let mut masked = mac;
    for (b, k) in masked.iter_mut().zip(keystream.iter()) {
        *b ^= k;
    }
    masked
}

/// XOR `data` in place with the CTR keystream, starting at `starting_counter`
/// and incrementing once per 16-byte chunk. Used for auth+conf payload
/// (en/de)cryption; the caller is responsible for placing the masked MAC in
/// front of the plaintext per the wire layout before calling this on the
/// combined buffer (counter starts at 1 so the first 4 bytes overlap the MAC
/// mask computed by [`mask_mac`]).
pub fn ctr_crypt(
    key: &AesKey,
    seq_or_rand: [u8; 6],
    src: u16,
    dst: u16,
    starting_counter: u8,
    data: &mut [u8],
) {
    let mut counter = starting_counter;
    for chunk in data.chunks_mut(16) {
        let keystream = aes_encrypt_block(key, ctr_block(seq_or_rand, src, dst, counter));
        for (b, k) in chunk.iter_mut().zip(keystream.iter()) {
            *b ^= k;
        }
        counter = counter.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AesKey {
        AesKey::new([0x42; 16])
    }

    #[test]
    fn mac_is_deterministic_for_same_input() {
        let k = key();
        let b0 = block0([0, 0, 0, 0, 0, 1], 0x1101, 0x0A03, 0x80, 0xBC, 0x80, 1);
        let mac1 = compute_mac(&k, b0, &[0x1F], &[0x42]);
        let mac2 = compute_mac(&k, b0, &[0x1F], &[0x42]);
        assert_eq!(mac1, mac2);
    }

    #[test]
    fn mac_changes_with_sequence() {
        let k = key();
        let b0a = block0([0, 0, 0, 0, 0, 1], 0x1101, 0x0A03, 0x80, 0xBC, 0x80, 1);
        let b0b = block0([0, 0, 0, 0, 0, 2], 0x1101, 0x0A03, 0x80, 0xBC, 0x80, 1);
        let mac_a = compute_mac(&k, b0a, &[0x1F], &[0x42]);
        let mac_b = compute_mac(&k, b0b, &[0x1F], &[0x42]);
        assert_ne!(mac_a, mac_b);
    }

    #[test]
    fn mask_mac_is_involutive() {
        let k = key();
        let seq = [0, 0, 0, 0, 0, 1];
        let mac = [0x11, 0x22, 0x33, 0x44];
        let masked = mask_mac(&k, seq, 0x1101, 0x0A03, mac);
        let unmasked = mask_mac(&k, seq, 0x1101, 0x0A03, masked);
        assert_eq!(unmasked, mac);
    }

    #[test]
    fn ctr_crypt_round_trips() {
        let k = key();
        let seq = [0, 0, 0, 0, 0, 7];
        let mut data = b"hello data secure world!".to_vec();
        let original = data.clone();

        ctr_crypt(&k, seq, 0x1101, 0x0A03, 1, &mut data);
        assert_ne!(data, original);

        ctr_crypt(&k, seq, 0x1101, 0x0A03, 1, &mut data);
        assert_eq!(data, original);
    }
}
