// SPDX-License-Identifier: GPL-3.0-or-later

//! Block cipher primitives used by [`crate::device::merkle`].
//!
//! The actual AES-GCM/SHA-256 hardware paths are, per `spec.md` §1, an external collaborator in
//! the real enclave runtime; this module is the pure-software reference implementation this
//! crate ships so the Merkle device and its tests are self-contained. `aes-gcm`/`aes`/`sha2` are
//! the same pure-Rust, `force-soft`-style crates other TEE-adjacent Rust codebases in this
//! neighborhood reach for (see `asterinas`'s and `HiSA-Team`'s dependency manifests).

use aes::{
	cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
	Aes256,
};
use aes_gcm::{
	aead::{AeadInPlace, Tag},
	Aes256Gcm, Key, Nonce,
};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Size of a GCM authentication tag, also the size of a Merkle leaf's non-zero half.
pub const TAG_SIZE: usize = 16;
/// Size of the per-block IV derived for AES-GCM.
const IV_SIZE: usize = 12;

/// Computes the SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(data);
	hasher.finalize().into()
}

/// Hashes two 32-byte Merkle node values into their parent: `SHA-256(left ‖ right)`.
pub fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(left);
	hasher.update(right);
	hasher.finalize().into()
}

/// Derives the per-block IV as `AES-ECB(SHA256(key))(blkno ‖ 0…)`, truncated to 12 bytes.
///
/// This binds the IV to `blkno` deterministically without storing it anywhere on disk
/// (`spec.md` §4.E).
fn derive_iv(key: &[u8; 32], blkno: u32) -> [u8; IV_SIZE] {
	let ecb_key = sha256(key);
	let cipher = Aes256::new(GenericArray::from_slice(&ecb_key));
	let mut block = [0u8; 16];
	block[..4].copy_from_slice(&blkno.to_le_bytes());
	let mut ga = GenericArray::clone_from_slice(&block);
	cipher.encrypt_block(&mut ga);
	let mut iv = [0u8; IV_SIZE];
	iv.copy_from_slice(&ga[..IV_SIZE]);
	iv
}

/// Encrypts `plaintext` (exactly `BLOCK_SIZE` bytes) for block `blkno`, returning the ciphertext
/// (same size as the plaintext) and its 16-byte GCM tag.
pub fn encrypt_block(key: &[u8; 32], blkno: u32, plaintext: &[u8]) -> (Vec<u8>, [u8; TAG_SIZE]) {
	let iv = derive_iv(key, blkno);
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
	let mut buf = plaintext.to_vec();
	let tag = cipher
		.encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buf)
		.expect("in-place GCM encryption of a single fixed-size block cannot fail");
	let mut tag_bytes = [0u8; TAG_SIZE];
	tag_bytes.copy_from_slice(&tag);
	(buf, tag_bytes)
}

/// Decrypts `ciphertext` for block `blkno` using the stored `tag`. Returns
/// [`Error::Tamper`] if the tag does not authenticate.
pub fn decrypt_block(
	key: &[u8; 32],
	blkno: u32,
	ciphertext: &[u8],
	tag: &[u8; TAG_SIZE],
) -> Result<Vec<u8>> {
	let iv = derive_iv(key, blkno);
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
	let mut buf = ciphertext.to_vec();
	cipher
		.decrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buf, Tag::<Aes256Gcm>::from_slice(tag))
		.map_err(|_| Error::Tamper)?;
	Ok(buf)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip() {
		let key = [0x42u8; 32];
		let plain = vec![7u8; 1024];
		let (ct, tag) = encrypt_block(&key, 5, &plain);
		let back = decrypt_block(&key, 5, &ct, &tag).unwrap();
		assert_eq!(back, plain);
	}

	#[test]
	fn wrong_key_fails() {
		let k1 = [0x11u8; 32];
		let k2 = [0x22u8; 32];
		let plain = vec![1u8; 1024];
		let (ct, tag) = encrypt_block(&k1, 0, &plain);
		assert_eq!(decrypt_block(&k2, 0, &ct, &tag), Err(Error::Tamper));
	}

	#[test]
	fn tampered_ciphertext_fails() {
		let key = [0x99u8; 32];
		let plain = vec![3u8; 1024];
		let (mut ct, tag) = encrypt_block(&key, 0, &plain);
		ct[0] ^= 0xff;
		assert_eq!(decrypt_block(&key, 0, &ct, &tag), Err(Error::Tamper));
	}

	#[test]
	fn different_blkno_gives_different_iv_and_ciphertext() {
		let key = [0x33u8; 32];
		let plain = vec![4u8; 1024];
		let (ct0, _) = encrypt_block(&key, 0, &plain);
		let (ct1, _) = encrypt_block(&key, 1, &plain);
		assert_ne!(ct0, ct1);
	}
}
