// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::error::Error;
use crate::util::{ld_write, verify_cid};
use crate::CarHeader;
use futures::lock::Mutex;
use futures::{AsyncWrite, AsyncWriteExt};
use ipld_core::cid::Cid;

type DynWrite = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, PartialEq, Eq)]
enum State {
    PreHeader,
    PostHeader,
    Closed,
}

struct Inner {
    sink: DynWrite,
    state: State,
}

/// Streaming, append-only CAR encoder. The header is written exactly once:
/// explicitly through [`CarWriter::set_roots`], or implicitly with empty
/// roots on the first [`CarWriter::put`]. A sink error is fatal; the writer
/// moves to closed and every later call fails with [`Error::AlreadyClosed`].
///
/// All operations serialise on an internal lock and write whole frames, so
/// callers may issue a batch of `put`s without awaiting each one, as long as
/// `close` is awaited last.
pub struct CarWriter {
    inner: Mutex<Inner>,
}

impl CarWriter {
    pub fn new<W>(sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Mutex::new(Inner {
                sink: Box::new(sink),
                state: State::PreHeader,
            }),
        }
    }

    /// Fixes the archive roots and writes the header. Legal only before any
    /// `put`; later calls fail with [`Error::HeaderAlreadyWritten`].
    pub async fn set_roots(&self, roots: &[Cid]) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            State::Closed => Err(Error::AlreadyClosed),
            State::PostHeader => Err(Error::HeaderAlreadyWritten),
            State::PreHeader => {
                for root in roots {
                    verify_cid(root)?;
                }
                match write_header(&mut inner.sink, roots).await {
                    Ok(()) => {
                        inner.state = State::PostHeader;
                        Ok(())
                    }
                    Err(e) => {
                        inner.state = State::Closed;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Appends one block frame, writing an empty-roots header first if none
    /// has been written yet.
    pub async fn put(&self, cid: &Cid, payload: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.state == State::Closed {
            return Err(Error::AlreadyClosed);
        }
        verify_cid(cid)?;
        if inner.state == State::PreHeader {
            match write_header(&mut inner.sink, &[]).await {
                Ok(()) => inner.state = State::PostHeader,
                Err(e) => {
                    inner.state = State::Closed;
                    return Err(e);
                }
            }
        }
        let frame = [cid.to_bytes(), payload.to_vec()].concat();
        if let Err(e) = ld_write(&mut inner.sink, &frame).await {
            inner.state = State::Closed;
            return Err(e);
        }
        Ok(())
    }

    /// Archives are append-only; always fails with
    /// [`Error::UnsupportedOperation`].
    pub async fn delete(&self, _cid: &Cid) -> Result<(), Error> {
        Err(Error::UnsupportedOperation("delete"))
    }

    /// Flushes and closes the sink, writing the empty-roots header first if
    /// nothing was ever written. A second call fails with
    /// [`Error::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.state == State::Closed {
            return Err(Error::AlreadyClosed);
        }
        let header_result = if inner.state == State::PreHeader {
            write_header(&mut inner.sink, &[]).await
        } else {
            Ok(())
        };
        inner.state = State::Closed;
        header_result?;
        inner.sink.flush().await?;
        inner.sink.close().await?;
        Ok(())
    }
}

async fn write_header(sink: &mut DynWrite, roots: &[Cid]) -> Result<(), Error> {
    let header = CarHeader::from(roots.to_vec());
    ld_write(sink, &header.encode()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipld_core::cid::multihash::Multihash;
    use sha2::{Digest, Sha256};
    use std::pin::Pin;
    use std::sync::{Arc, Mutex as SyncMutex};
    use std::task::{Context, Poll};

    fn test_cid(data: &[u8]) -> Cid {
        let mh = Multihash::wrap(0x12, &Sha256::digest(data)).unwrap();
        Cid::new_v1(0x71, mh)
    }

    /// Write buffer that stays readable after the writer consumes the sink.
    #[derive(Clone, Default)]
    pub(crate) struct SharedSink(pub(crate) Arc<SyncMutex<Vec<u8>>>);

    impl AsyncWrite for SharedSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[async_std::test]
    async fn set_roots_after_put_fails() {
        let writer = CarWriter::new(SharedSink::default());
        let cid = test_cid(b"block");
        writer.put(&cid, b"block").await.unwrap();
        assert!(matches!(
            writer.set_roots(&[cid]).await,
            Err(Error::HeaderAlreadyWritten)
        ));
    }

    #[async_std::test]
    async fn set_roots_twice_fails() {
        let writer = CarWriter::new(SharedSink::default());
        let cid = test_cid(b"root");
        writer.set_roots(&[cid]).await.unwrap();
        assert!(matches!(
            writer.set_roots(&[cid]).await,
            Err(Error::HeaderAlreadyWritten)
        ));
    }

    #[async_std::test]
    async fn close_twice_fails() {
        let writer = CarWriter::new(SharedSink::default());
        writer.close().await.unwrap();
        assert!(matches!(writer.close().await, Err(Error::AlreadyClosed)));
    }

    #[async_std::test]
    async fn delete_unsupported() {
        let writer = CarWriter::new(SharedSink::default());
        assert!(matches!(
            writer.delete(&test_cid(b"x")).await,
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[async_std::test]
    async fn empty_archive_is_header_only() {
        let sink = SharedSink::default();
        let writer = CarWriter::new(sink.clone());
        writer.close().await.unwrap();

        let bytes = sink.0.lock().unwrap().clone();
        let header_bytes = CarHeader::from(Vec::new()).encode().unwrap();
        // one varint length prefix, then the header map
        assert_eq!(bytes.len(), 1 + header_bytes.len());
        assert_eq!(bytes[0] as usize, header_bytes.len());
        assert_eq!(&bytes[1..], &header_bytes);
    }

    #[async_std::test]
    async fn rejects_v0_roots() {
        let writer = CarWriter::new(SharedSink::default());
        let mh = Multihash::wrap(0x12, &Sha256::digest(b"v0")).unwrap();
        let v0 = Cid::new_v0(mh).unwrap();
        assert!(matches!(
            writer.set_roots(&[v0]).await,
            Err(Error::UnsupportedCidVersion(0))
        ));
    }

    #[async_std::test]
    async fn unawaited_puts_land_in_submission_order() {
        let sink = SharedSink::default();
        let writer = CarWriter::new(sink.clone());
        let blocks: Vec<(Cid, Vec<u8>)> = (0u8..8)
            .map(|i| {
                let payload = vec![i; 16];
                (test_cid(&payload), payload)
            })
            .collect();

        futures::future::try_join_all(
            blocks
                .iter()
                .map(|(cid, payload)| writer.put(cid, payload)),
        )
        .await
        .unwrap();
        writer.close().await.unwrap();

        let bytes = sink.0.lock().unwrap().clone();
        let datastore = crate::read_buffer(&bytes).await;
        let mut datastore = datastore.unwrap();
        let mut queried = Vec::new();
        {
            use futures::StreamExt;
            let mut stream = datastore.query(None).unwrap();
            while let Some(item) = stream.next().await {
                queried.push(item.unwrap());
            }
        }
        let expected: Vec<_> = blocks
            .iter()
            .map(|(cid, payload)| (crate::util::cid_key(cid), payload.clone()))
            .collect();
        assert_eq!(queried, expected);
    }
}
