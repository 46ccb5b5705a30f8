//! One relayed connection.

use tracing::trace;

use crate::conn::StreamConn;
use crate::error::Result;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Copy `from` into `to` until `from` reaches EOF, then shut down `to`.
///
/// Returns the number of bytes copied.
pub async fn copy_stream(from: &dyn StreamConn, to: &dyn StreamConn) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            to.shutdown().await?;
            return Ok(total);
        }

        let mut offset = 0;
        while offset < n {
            let written = to.write(&buf[offset..n]).await?;
            if written == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            offset += written;
        }
        total += n as u64;
        trace!(bytes = n, total = total, "Relayed chunk");
    }
}
