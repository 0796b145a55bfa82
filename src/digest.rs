//! SHA-256 helpers shared by checksums and serving tokens.

use std::path::Path;

use ring::digest::{Context, SHA256};
use tokio::io::AsyncReadExt;

const CHUNK: usize = 64 * 1024;

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(ring::digest::digest(&SHA256, data))
}

/// Hex SHA-256 and byte length of a file, read in chunks.
pub async fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = Context::new(&SHA256);
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        context.update(&buf[..read]);
        total += read as u64;
    }

    Ok((hex::encode(context.finish()), total))
}
