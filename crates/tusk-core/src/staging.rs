//! Append-only staging files
//!
//! A stream that ends with `UnexpectedEof` is a client pause: whatever was
//! copied stays in the file and counts as written.

use std::io;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Copy buffer size (32 KB)
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Create an empty staging file, leaving an existing one untouched
pub(crate) async fn create(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map(|_| ())
}

/// Append `reader` to the staging file at `path`, reading at most `limit` bytes.
///
/// On failure the error comes with the number of bytes already appended.
pub(crate) async fn append<R>(
    path: &Path,
    reader: &mut R,
    limit: Option<u64>,
) -> Result<u64, (u64, io::Error)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .map_err(|e| (0, e))?;

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let want = match limit {
            Some(limit) => (limit - written).min(buf.len() as u64) as usize,
            None => buf.len(),
        };
        if want == 0 {
            break;
        }

        let n = match reader.read(&mut buf[..want]).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(written, "stream ended early, treating as pause");
                break;
            }
            Err(e) => {
                file.flush().await.map_err(|e| (written, e))?;
                return Err((written, e));
            }
        };

        file.write_all(&buf[..n]).await.map_err(|e| (written, e))?;
        written += n as u64;
    }

    file.flush().await.map_err(|e| (written, e))?;
    Ok(written)
}

/// Remove a staging file; a missing file is not an error
pub(crate) async fn remove(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
