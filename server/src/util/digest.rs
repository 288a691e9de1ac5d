use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    pub size_bytes: i64,
}

pub fn compute_digest(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let hash = hex::encode(hasher.finalize());

    Digest {
        hash,
        size_bytes: data.len() as i64,
    }
}

pub fn format_digest(digest: &Digest) -> String {
    format!("{}:{}", digest.hash, digest.size_bytes)
}
