//! Checksum and identity helpers
//!
//! Content digests for the firmware artifact and the FNV-1a token hash
//! devices derive from the shared secret and their MAC address.

use md5::{Digest, Md5};
use std::{fs::File, io::Read, path::Path};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const DIGEST_BLOCK_SIZE: usize = 8192;

/// 64-bit FNV-1a over raw bytes, identical to the device side implementation
pub fn fnv1a_64(data: &[u8]) -> u64 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Token hash a device sends: FNV-1a of `secret ‖ identity`, as 16 lowercase hex digits
pub fn token_hash(secret: &str, identity: &str) -> String {
    let mut input = Vec::with_capacity(secret.len() + identity.len());
    input.extend_from_slice(secret.as_bytes());
    input.extend_from_slice(identity.as_bytes());

    format!("{:016x}", fnv1a_64(&input))
}

/// MD5 of a file, streamed in fixed-size blocks
pub fn md5_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = [0u8; DIGEST_BLOCK_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
