//! Byte copy from a source reader to a target writer.

use std::io::{self, Read, Write};

use tokio_util::sync::CancellationToken;

use super::TransferSettings;

#[derive(Debug, thiserror::Error)]
pub(crate) enum CopyError {
    #[error("reading source failed: {0}")]
    Read(io::Error),
    #[error("writing target failed: {0}")]
    Write(io::Error),
    #[error("copy cancelled")]
    Cancelled,
}

/// Copy `reader` into `writer`, calling `on_bytes` after every write.
///
/// Items whose expected size is at most `stream_threshold` are read whole
/// and written in one call. The whole read never buffers more than
/// `stream_threshold + 1` bytes: an item that grew past its listed size
/// falls through to streaming. Larger items move in `chunk_size` chunks and
/// stop between chunks once `cancel` fires.
pub(crate) fn copy_item(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    expected_size: u64,
    settings: &TransferSettings,
    cancel: &CancellationToken,
    on_bytes: &mut dyn FnMut(u64),
) -> Result<u64, CopyError> {
    if cancel.is_cancelled() {
        return Err(CopyError::Cancelled);
    }

    let mut total = 0u64;
    if expected_size <= settings.stream_threshold {
        let limit = settings.stream_threshold.saturating_add(1);
        let mut buf = Vec::with_capacity(usize::try_from(expected_size).unwrap_or(0));
        Read::take(&mut *reader, limit)
            .read_to_end(&mut buf)
            .map_err(CopyError::Read)?;
        writer.write_all(&buf).map_err(CopyError::Write)?;
        total = buf.len() as u64;
        on_bytes(total);
        if total <= settings.stream_threshold {
            writer.flush().map_err(CopyError::Write)?;
            return Ok(total);
        }
        tracing::debug!(
            expected = expected_size,
            threshold = settings.stream_threshold,
            "Item outgrew its listed size, streaming the rest"
        );
    }

    let mut buf = vec![0u8; settings.chunk_size.max(1)];
    loop {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        writer.write_all(&buf[..n]).map_err(CopyError::Write)?;
        total += n as u64;
        on_bytes(n as u64);
    }
    writer.flush().map_err(CopyError::Write)?;
    Ok(total)
}
