//! Packet protection: AEAD sealing, header masks, key schedule
//! (draft-27 TLS mapping).
//!
//! A [`Seal`] holds one direction's keys for one encryption level: AEAD
//! key and IV, the header-protection key, and the traffic secret it was
//! derived from (kept so `update` can walk the key-update chain). Payload
//! protection and header protection operate in place on the packet buffer.

pub mod tls;

pub use tls::{HandshakeStatus, Level, TlsEvent, TlsSession};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit as BlockKeyInit};
use aes::{Aes128, Aes256};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use ccm::consts::{U12, U16};
use ccm::Ccm;
use hkdf::Hkdf;
use sha2::{Sha256, Sha384};

use crate::error::{Error, Result, TransportError};

type Aes128Ccm = Ccm<Aes128, U16, U12>;

/// AEAD authentication tag length; identical for every supported suite.
pub const TAG_LEN: usize = 16;

/// Header-protection sample length.
pub const SAMPLE_LEN: usize = 16;

/// Initial secret salt published for drafts 23 through 28.
const INITIAL_SALT: [u8; 20] = [
    0xc3, 0xee, 0xf7, 0x12, 0xc7, 0x2e, 0xbb, 0x5a, 0x11, 0xa7, 0xd2, 0x43, 0x2b, 0xb4, 0x63,
    0x65, 0xbe, 0xf9, 0xf5, 0x02,
];

/// Supported AEAD algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Aes128Gcm,
    Aes128Ccm,
    Aes256Gcm,
}

impl Algorithm {
    /// Map a TLS 1.3 cipher suite to its packet-protection algorithm.
    pub fn from_cipher_suite(suite: u16) -> Option<Self> {
        match suite {
            0x1301 => Some(Algorithm::Aes128Gcm),
            0x1302 => Some(Algorithm::Aes256Gcm),
            0x1304 => Some(Algorithm::Aes128Ccm),
            _ => None,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Algorithm::Aes128Gcm | Algorithm::Aes128Ccm => 16,
            Algorithm::Aes256Gcm => 32,
        }
    }

    /// Output length of the suite's hash, which is also the length of
    /// derived traffic secrets.
    pub fn hash_len(self) -> usize {
        match self {
            Algorithm::Aes128Gcm | Algorithm::Aes128Ccm => 32,
            Algorithm::Aes256Gcm => 48,
        }
    }

    fn expand_label(self, secret: &[u8], label: &str, out: &mut [u8]) -> Result<()> {
        match self {
            Algorithm::Aes128Gcm | Algorithm::Aes128Ccm => {
                expand_label_sha256(secret, label, out)
            }
            Algorithm::Aes256Gcm => expand_label_sha384(secret, label, out),
        }
    }
}

fn internal() -> Error {
    Error::transport(TransportError::InternalError)
}

/// Build the HkdfLabel structure of RFC 8446 §7.1 ("tls13 " prefix,
/// empty context).
fn hkdf_label(label: &str, out_len: usize) -> Vec<u8> {
    let mut info = Vec::with_capacity(2 + 1 + 6 + label.len() + 1);
    info.extend_from_slice(&(out_len as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label.as_bytes());
    info.push(0);
    info
}

fn expand_label_sha256(secret: &[u8], label: &str, out: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::from_prk(secret).map_err(|_| internal())?;
    hk.expand(&hkdf_label(label, out.len()), out)
        .map_err(|_| internal())
}

fn expand_label_sha384(secret: &[u8], label: &str, out: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha384>::from_prk(secret).map_err(|_| internal())?;
    hk.expand(&hkdf_label(label, out.len()), out)
        .map_err(|_| internal())
}

enum AeadKey {
    Aes128Gcm(Box<Aes128Gcm>),
    Aes128Ccm(Box<Aes128Ccm>),
    Aes256Gcm(Box<Aes256Gcm>),
}

enum HpKey {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl HpKey {
    /// 5-byte mask from a 16-byte ciphertext sample: a single AES-ECB
    /// block encryption of the sample.
    fn mask(&self, sample: &[u8]) -> [u8; 5] {
        let mut block = GenericArray::clone_from_slice(&sample[..SAMPLE_LEN]);
        match self {
            HpKey::Aes128(c) => c.encrypt_block(&mut block),
            HpKey::Aes256(c) => c.encrypt_block(&mut block),
        }
        let mut mask = [0u8; 5];
        mask.copy_from_slice(&block[..5]);
        mask
    }
}

/// One direction's packet protection state for one encryption level.
pub struct Seal {
    alg: Algorithm,
    aead: AeadKey,
    hp: HpKey,
    iv: [u8; 12],
    secret: Vec<u8>,
}

impl Seal {
    /// Derive key, IV and header-protection key from a traffic secret.
    pub fn from_secret(alg: Algorithm, secret: &[u8]) -> Result<Self> {
        let mut hp_key = vec![0u8; alg.key_len()];
        alg.expand_label(secret, "quic hp", &mut hp_key)?;
        Self::with_hp(alg, secret, &hp_key)
    }

    fn with_hp(alg: Algorithm, secret: &[u8], hp_key: &[u8]) -> Result<Self> {
        let mut key = vec![0u8; alg.key_len()];
        alg.expand_label(secret, "quic key", &mut key)?;
        let mut iv = [0u8; 12];
        alg.expand_label(secret, "quic iv", &mut iv)?;

        let aead = match alg {
            Algorithm::Aes128Gcm => AeadKey::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(&key).map_err(|_| internal())?,
            )),
            Algorithm::Aes128Ccm => AeadKey::Aes128Ccm(Box::new(
                Aes128Ccm::new_from_slice(&key).map_err(|_| internal())?,
            )),
            Algorithm::Aes256Gcm => AeadKey::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(&key).map_err(|_| internal())?,
            )),
        };
        let hp = match alg {
            Algorithm::Aes128Gcm | Algorithm::Aes128Ccm => {
                HpKey::Aes128(Aes128::new_from_slice(hp_key).map_err(|_| internal())?)
            }
            Algorithm::Aes256Gcm => {
                HpKey::Aes256(Aes256::new_from_slice(hp_key).map_err(|_| internal())?)
            }
        };

        Ok(Self {
            alg,
            aead,
            hp,
            iv,
            secret: secret.to_vec(),
        })
    }

    /// Next key generation: fresh traffic secret via
    /// HKDF-Expand-Label(secret, "quic ku"), fresh key and IV, header
    /// protection key retained.
    pub fn update(&self) -> Result<Self> {
        let mut next_secret = vec![0u8; self.alg.hash_len()];
        self.alg
            .expand_label(&self.secret, "quic ku", &mut next_secret)?;

        let mut key = vec![0u8; self.alg.key_len()];
        self.alg.expand_label(&next_secret, "quic key", &mut key)?;
        let mut iv = [0u8; 12];
        self.alg.expand_label(&next_secret, "quic iv", &mut iv)?;

        let aead = match self.alg {
            Algorithm::Aes128Gcm => AeadKey::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(&key).map_err(|_| internal())?,
            )),
            Algorithm::Aes128Ccm => AeadKey::Aes128Ccm(Box::new(
                Aes128Ccm::new_from_slice(&key).map_err(|_| internal())?,
            )),
            Algorithm::Aes256Gcm => AeadKey::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(&key).map_err(|_| internal())?,
            )),
        };
        let hp = match &self.hp {
            HpKey::Aes128(c) => HpKey::Aes128(c.clone()),
            HpKey::Aes256(c) => HpKey::Aes256(c.clone()),
        };

        Ok(Self {
            alg: self.alg,
            aead,
            hp,
            iv,
            secret: next_secret,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.alg
    }

    fn nonce(&self, pn: u64) -> [u8; 12] {
        let mut nonce = self.iv;
        for (i, b) in pn.to_be_bytes().iter().enumerate() {
            nonce[4 + i] ^= b;
        }
        nonce
    }

    /// Encrypt `buf[header_len..header_len + payload_len]` in place with
    /// `buf[..header_len]` as AAD and append the tag. Returns the total
    /// packet length.
    pub fn encrypt_packet(
        &self,
        buf: &mut [u8],
        header_len: usize,
        payload_len: usize,
        pn: u64,
    ) -> Result<usize> {
        let total = header_len + payload_len + TAG_LEN;
        if buf.len() < total {
            return Err(Error::BufferTooSmall);
        }
        let nonce = self.nonce(pn);
        let (header, rest) = buf.split_at_mut(header_len);
        let (payload, tail) = rest.split_at_mut(payload_len);

        let tag = match &self.aead {
            AeadKey::Aes128Gcm(c) => c
                .encrypt_in_place_detached(GenericArray::from_slice(&nonce), header, payload)
                .map_err(|_| Error::CryptoFail)?,
            AeadKey::Aes128Ccm(c) => c
                .encrypt_in_place_detached(GenericArray::from_slice(&nonce), header, payload)
                .map_err(|_| Error::CryptoFail)?,
            AeadKey::Aes256Gcm(c) => c
                .encrypt_in_place_detached(GenericArray::from_slice(&nonce), header, payload)
                .map_err(|_| Error::CryptoFail)?,
        };
        tail[..TAG_LEN].copy_from_slice(&tag);
        Ok(total)
    }

    /// Decrypt in place. `ciphertext_len` includes the tag. Returns the
    /// plaintext length; failure means the packet is silently dropped by
    /// the caller.
    pub fn decrypt_packet(
        &self,
        buf: &mut [u8],
        header_len: usize,
        ciphertext_len: usize,
        pn: u64,
    ) -> Result<usize> {
        if ciphertext_len < TAG_LEN || buf.len() < header_len + ciphertext_len {
            return Err(Error::CryptoFail);
        }
        let payload_len = ciphertext_len - TAG_LEN;
        let nonce = self.nonce(pn);
        let (header, rest) = buf.split_at_mut(header_len);
        let (payload, tail) = rest.split_at_mut(payload_len);
        let tag = GenericArray::clone_from_slice(&tail[..TAG_LEN]);

        let res = match &self.aead {
            AeadKey::Aes128Gcm(c) => {
                c.decrypt_in_place_detached(GenericArray::from_slice(&nonce), header, payload, &tag)
            }
            AeadKey::Aes128Ccm(c) => {
                c.decrypt_in_place_detached(GenericArray::from_slice(&nonce), header, payload, &tag)
            }
            AeadKey::Aes256Gcm(c) => {
                c.decrypt_in_place_detached(GenericArray::from_slice(&nonce), header, payload, &tag)
            }
        };
        res.map_err(|_| Error::CryptoFail)?;
        Ok(payload_len)
    }

    /// Apply header protection. The mask is derived from the ciphertext
    /// sampled four bytes past the start of the packet number field; the
    /// first byte keeps its form bits (long: high 4, short: high 3
    /// unmasked).
    pub fn protect_header(&self, pkt: &mut [u8], pn_offset: usize, pn_len: usize) -> Result<()> {
        let sample_at = pn_offset + 4;
        if pkt.len() < sample_at + SAMPLE_LEN {
            return Err(Error::BufferTooSmall);
        }
        let mut sample = [0u8; SAMPLE_LEN];
        sample.copy_from_slice(&pkt[sample_at..sample_at + SAMPLE_LEN]);
        let mask = self.hp.mask(&sample);

        if pkt[0] & 0x80 != 0 {
            pkt[0] ^= mask[0] & 0x0f;
        } else {
            pkt[0] ^= mask[0] & 0x1f;
        }
        for i in 0..pn_len {
            pkt[pn_offset + i] ^= mask[1 + i];
        }
        Ok(())
    }

    /// Remove header protection; recovers the true first byte and returns
    /// the packet number length read from it.
    pub fn unprotect_header(&self, pkt: &mut [u8], pn_offset: usize) -> Result<usize> {
        let sample_at = pn_offset + 4;
        if pkt.len() < sample_at + SAMPLE_LEN {
            return Err(Error::CryptoFail);
        }
        let mut sample = [0u8; SAMPLE_LEN];
        sample.copy_from_slice(&pkt[sample_at..sample_at + SAMPLE_LEN]);
        let mask = self.hp.mask(&sample);

        if pkt[0] & 0x80 != 0 {
            pkt[0] ^= mask[0] & 0x0f;
        } else {
            pkt[0] ^= mask[0] & 0x1f;
        }
        let pn_len = (pkt[0] & 0x03) as usize + 1;
        if pkt.len() < pn_offset + pn_len {
            return Err(Error::CryptoFail);
        }
        for i in 0..pn_len {
            pkt[pn_offset + i] ^= mask[1 + i];
        }
        Ok(pn_len)
    }
}

impl core::fmt::Debug for Seal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("Seal").field("alg", &self.alg).finish()
    }
}

/// Derive both Initial seals from the client's destination connection id.
/// Returns `(send, recv)` for the given side.
pub fn initial_seals(dcid: &[u8], is_client: bool) -> Result<(Seal, Seal)> {
    let (initial_secret, _) = Hkdf::<Sha256>::extract(Some(&INITIAL_SALT), dcid);

    let mut client_secret = [0u8; 32];
    expand_label_sha256(&initial_secret, "client in", &mut client_secret)?;
    let mut server_secret = [0u8; 32];
    expand_label_sha256(&initial_secret, "server in", &mut server_secret)?;

    let client = Seal::from_secret(Algorithm::Aes128Gcm, &client_secret)?;
    let server = Seal::from_secret(Algorithm::Aes128Gcm, &server_secret)?;
    if is_client {
        Ok((client, server))
    } else {
        Ok((server, client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_seal(alg: Algorithm) -> Seal {
        let secret = vec![0x42u8; alg.hash_len()];
        Seal::from_secret(alg, &secret).unwrap()
    }

    #[test]
    fn aead_round_trip_all_suites() {
        for alg in [
            Algorithm::Aes128Gcm,
            Algorithm::Aes128Ccm,
            Algorithm::Aes256Gcm,
        ] {
            let seal = test_seal(alg);
            let header = b"\x40\x01\x02\x03";
            let payload = b"the quick brown fox";
            let mut buf = vec![0u8; header.len() + payload.len() + TAG_LEN];
            buf[..header.len()].copy_from_slice(header);
            buf[header.len()..header.len() + payload.len()].copy_from_slice(payload);

            let total = seal
                .encrypt_packet(&mut buf, header.len(), payload.len(), 7)
                .unwrap();
            assert_eq!(total, buf.len());
            assert_ne!(&buf[header.len()..header.len() + payload.len()], payload);

            let plain_len = seal
                .decrypt_packet(&mut buf, header.len(), total - header.len(), 7)
                .unwrap();
            assert_eq!(&buf[header.len()..header.len() + plain_len], payload);
        }
    }

    #[test]
    fn bit_flip_fails_authentication() {
        let seal = test_seal(Algorithm::Aes128Gcm);
        let header = [0x40u8, 9, 9, 9];
        let payload = [0xaau8; 32];
        let mut buf = vec![0u8; header.len() + payload.len() + TAG_LEN];
        buf[..4].copy_from_slice(&header);
        buf[4..36].copy_from_slice(&payload);
        let total = seal.encrypt_packet(&mut buf, 4, 32, 0).unwrap();

        // Flip one ciphertext bit.
        let mut tampered = buf.clone();
        tampered[10] ^= 0x01;
        assert_eq!(
            seal.decrypt_packet(&mut tampered, 4, total - 4, 0),
            Err(Error::CryptoFail)
        );

        // Flip one header (AAD) bit.
        let mut tampered = buf.clone();
        tampered[1] ^= 0x80;
        assert_eq!(
            seal.decrypt_packet(&mut tampered, 4, total - 4, 0),
            Err(Error::CryptoFail)
        );
    }

    #[test]
    fn wrong_packet_number_fails() {
        let seal = test_seal(Algorithm::Aes128Gcm);
        let mut buf = vec![0u8; 4 + 8 + TAG_LEN];
        let total = seal.encrypt_packet(&mut buf, 4, 8, 3).unwrap();
        assert!(seal.decrypt_packet(&mut buf, 4, total - 4, 4).is_err());
    }

    #[test]
    fn header_protection_round_trip() {
        let seal = test_seal(Algorithm::Aes128Gcm);
        // Short header, 2-byte packet number at offset 5, then ciphertext.
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x41; // 0|1|S|R|R|K|P|P with pn_len=2
        for (i, b) in pkt.iter_mut().enumerate().skip(1) {
            *b = i as u8;
        }
        let original = pkt.clone();

        seal.protect_header(&mut pkt, 5, 2).unwrap();
        assert_ne!(pkt[..7], original[..7]);
        let pn_len = seal.unprotect_header(&mut pkt, 5).unwrap();
        assert_eq!(pn_len, 2);
        assert_eq!(pkt, original);
    }

    #[test]
    fn initial_seals_pair_up() {
        let dcid = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];
        let (client_send, client_recv) = initial_seals(&dcid, true).unwrap();
        let (server_send, server_recv) = initial_seals(&dcid, false).unwrap();

        let mut buf = vec![0u8; 4 + 11 + TAG_LEN];
        buf[4..15].copy_from_slice(b"hello quic!");
        let total = client_send.encrypt_packet(&mut buf, 4, 11, 0).unwrap();
        let len = server_recv
            .decrypt_packet(&mut buf, 4, total - 4, 0)
            .unwrap();
        assert_eq!(&buf[4..4 + len], b"hello quic!");

        // And the reverse direction uses the other secret.
        let mut buf = vec![0u8; 4 + 2 + TAG_LEN];
        let total = server_send.encrypt_packet(&mut buf, 4, 2, 1).unwrap();
        assert!(client_recv.decrypt_packet(&mut buf, 4, total - 4, 1).is_ok());
    }

    #[test]
    fn key_update_changes_keys_keeps_hp() {
        let seal = test_seal(Algorithm::Aes128Gcm);
        let next = seal.update().unwrap();

        // Same plaintext, same nonce input: different ciphertext.
        let mut a = vec![0u8; 2 + 8 + TAG_LEN];
        let mut b = vec![0u8; 2 + 8 + TAG_LEN];
        seal.encrypt_packet(&mut a, 2, 8, 0).unwrap();
        next.encrypt_packet(&mut b, 2, 8, 0).unwrap();
        assert_ne!(a, b);

        // Header protection is unchanged across the update.
        let sample = [7u8; SAMPLE_LEN];
        assert_eq!(seal.hp.mask(&sample), next.hp.mask(&sample));

        // The update chain is deterministic.
        let next2 = seal.update().unwrap();
        assert_eq!(next.secret, next2.secret);
    }
}
