use std::{fs, io};

use base16ct::lower::encode_string;
use sha2::{Digest, Sha256};

pub mod anchor;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod hash;
pub mod ledger;
pub mod lock;
pub mod notify;
pub mod progress;
pub mod status;
pub mod store;
pub mod sync;

/// Format of the human-readable timestamps written to the bucket.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

pub fn hash_file(mut file: fs::File) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    let rv: [u8; 32] = hasher.finalize().into();
    Ok(encode_string(&rv))
}

pub fn hash_bytes(data: &[u8]) -> String {
    let rv: [u8; 32] = Sha256::digest(data).into();
    encode_string(&rv)
}
