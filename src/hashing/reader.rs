use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use super::ContentHasher;

/// Pass-through reader feeding every byte read into a set of hashers.
///
/// Lets one streaming pass compute the destination hash, the size and the
/// source-comparable hash at the same time as the content is written.
pub struct HashingReader<R> {
    inner: R,
    hashers: Vec<Box<dyn ContentHasher>>,
    bytes_read: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R, hashers: Vec<Box<dyn ContentHasher>>) -> Self {
        Self {
            inner,
            hashers,
            bytes_read: 0,
        }
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Raw digest of hasher `index`, in construction order.
    #[must_use]
    pub fn sum(&self, index: usize) -> Option<Vec<u8>> {
        self.hashers.get(index).map(|h| h.sum())
    }

    #[must_use]
    pub fn hex_sums(&self) -> Vec<String> {
        self.hashers.iter().map(|h| h.hex_sum()).collect()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        for hasher in &mut this.hashers {
            hasher.update(fresh);
        }
        this.bytes_read += fresh.len() as u64;
        Poll::Ready(Ok(()))
    }
}
