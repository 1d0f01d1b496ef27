use std::fmt::Write;

use sha2::{Digest as ShaDigest, Sha256};

pub type Digest = [u8; 32];

pub trait Hashable {
    fn hash(&self) -> Digest;
}

pub fn digest_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Digest {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn short_hex(digest: &Digest) -> String {
    digest[..8].iter().fold(String::with_capacity(16), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
