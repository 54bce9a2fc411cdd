//! Byte stream underneath a session

use embedded_io_async::{Read, ReadReady, Write};

/// A reliable, ordered byte stream to the peer.
///
/// `read_ready` reports whether a read would complete without waiting; the
/// forwarding loop uses it to poll the peer between shell reads.
#[allow(async_fn_in_trait)]
pub trait Transport: Read + Write + ReadReady {
    /// Close the endpoint. The session calls this at most once.
    async fn shutdown(&mut self) {}

    /// Whether the stream has gone unused past its idle limit. Polled by the
    /// forwarding loop, which never blocks in `read`.
    fn idle_expired(&self) -> bool {
        false
    }
}
