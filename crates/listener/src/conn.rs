//! Connection tracking for invalidation on certificate change.
//!
//! Every accepted connection is wrapped in a [`ListenerConn`]. When tracking
//! is enabled the wrapper registers a [`ConnHandle`] in the [`ConnTable`];
//! closing a handle makes reads return EOF and writes fail with
//! `ConnectionAborted`, waking any task parked on the connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::listener::Connection;

/// Shared state of one tracked connection.
#[derive(Debug, Default)]
pub struct ConnHandle {
    id: u64,
    ready: AtomicBool,
    closed: AtomicBool,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
}

impl ConnHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Mark the handshake as complete; only ready connections get closed.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.read_waker.wake();
        self.write_waker.wake();
    }
}

/// Live tracked connections.
#[derive(Debug, Default)]
pub struct ConnTable {
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, Arc<ConnHandle>>>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Arc<ConnHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnHandle {
            id,
            ..Default::default()
        });
        self.conns.lock().insert(id, handle.clone());
        handle
    }

    pub fn remove(&self, id: u64) {
        self.conns.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every ready connection except `keep`; returns how many closed.
    pub fn close_ready_except(&self, keep: Option<u64>) -> usize {
        let conns = self.conns.lock();
        let mut closed = 0;
        for handle in conns.values() {
            if Some(handle.id) == keep || !handle.is_ready() || handle.is_closed() {
                continue;
            }
            handle.close();
            closed += 1;
        }
        closed
    }
}

/// An accepted connection, optionally tracked for invalidation.
#[derive(Debug)]
pub struct ListenerConn<C> {
    inner: C,
    tracked: Option<(Arc<ConnHandle>, Arc<ConnTable>)>,
}

impl<C: Connection> ListenerConn<C> {
    pub(crate) fn new(inner: C, table: Option<&Arc<ConnTable>>) -> Self {
        let tracked = table.map(|table| (table.register(), table.clone()));
        Self { inner, tracked }
    }

    pub fn handle(&self) -> Option<&Arc<ConnHandle>> {
        self.tracked.as_ref().map(|(handle, _)| handle)
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl<C> Drop for ListenerConn<C> {
    fn drop(&mut self) {
        if let Some((handle, table)) = &self.tracked {
            table.remove(handle.id);
        }
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for ListenerConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some((handle, _)) = &this.tracked {
            handle.read_waker.register(cx.waker());
            if handle.is_closed() {
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed after certificate change")
}

impl<C: AsyncWrite + Unpin> AsyncWrite for ListenerConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some((handle, _)) = &this.tracked {
            handle.write_waker.register(cx.waker());
            if handle.is_closed() {
                return Poll::Ready(Err(aborted()));
            }
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some((handle, _)) = &this.tracked {
            if handle.is_closed() {
                return Poll::Ready(Err(aborted()));
            }
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn setup_pair(table: &Arc<ConnTable>) -> (ListenerConn<TcpStream>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (ListenerConn::new(server, Some(table)), client)
    }

    #[tokio::test]
    async fn test_table_tracks_and_removes() {
        let table = Arc::new(ConnTable::new());
        let (conn, _client) = setup_pair(&table).await;
        assert_eq!(table.len(), 1);

        drop(conn);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_close_only_ready_connections() {
        let table = Arc::new(ConnTable::new());
        let (ready, _c1) = setup_pair(&table).await;
        let (handshaking, _c2) = setup_pair(&table).await;
        let (current, _c3) = setup_pair(&table).await;

        ready.handle().unwrap().mark_ready();
        current.handle().unwrap().mark_ready();

        let closed = table.close_ready_except(Some(current.handle().unwrap().id()));

        assert_eq!(closed, 1);
        assert!(ready.handle().unwrap().is_closed());
        assert!(!handshaking.handle().unwrap().is_closed());
        assert!(!current.handle().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_closed_conn_reads_eof_and_aborts_writes() {
        let table = Arc::new(ConnTable::new());
        let (mut conn, mut client) = setup_pair(&table).await;
        client.write_all(b"x").await.unwrap();

        conn.handle().unwrap().close();

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        let err = conn.write_all(b"y").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_close_wakes_parked_reader() {
        let table = Arc::new(ConnTable::new());
        let (mut conn, _client) = setup_pair(&table).await;
        let handle = conn.handle().unwrap().clone();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            conn.read(&mut buf).await.unwrap()
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.close();

        let n = tokio::time::timeout(std::time::Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_untracked_conn() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let conn = ListenerConn::new(server, None);
        assert!(conn.handle().is_none());
        assert_eq!(conn.peer_addr().unwrap(), client.local_addr().unwrap());
    }
}
