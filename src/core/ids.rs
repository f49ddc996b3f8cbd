use sha2::{Digest, Sha256};

/// Generate a process-unique job identifier: 6 lowercase base58 characters
/// derived from SHA-256 over the current epoch time and 4 random bytes.
pub fn generate_job_id() -> String {
    let timestamp = format!("{}", super::now_ts());
    let randomness: [u8; 4] = rand::random();

    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(randomness);
    let digest = hasher.finalize();

    // 8 digest bytes always encode to at least 8 base58 characters.
    bs58::encode(&digest[..8])
        .into_string()
        .to_lowercase()
        .chars()
        .take(6)
        .collect()
}

/// Content key of an artifact: hex SHA-256 of the uploaded bytes.
pub fn artifact_id(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
