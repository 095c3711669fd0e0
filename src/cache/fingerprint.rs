use sha2::{Digest, Sha256};

/// Strong ETag for a published body: the quoted hex SHA-256 of its bytes.
pub fn etag_for(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{}\"", hex::encode(digest))
}
