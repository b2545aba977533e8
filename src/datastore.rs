// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::error::Error;
use crate::reader::{BufferReader, FileReader, StreamingReader};
use crate::util::cid_key;
use crate::writer::CarWriter;
use futures::future;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use ipld_core::cid::Cid;

/// The reader half of a datastore. Modes without read capability carry
/// [`Reader::Inert`], which rejects everything.
enum Reader {
    Buffer(BufferReader),
    Streaming(StreamingReader),
    File(FileReader),
    Inert,
}

/// The writer half. Read modes carry [`Writer::Inert`].
enum Writer {
    Stream(CarWriter),
    Inert,
}

/// Uniform datastore facade over one CAR archive. Which operations are
/// legal depends on the access mode the store was opened with (see the
/// crate-level constructors); illegal operations fail with
/// [`Error::UnsupportedOperation`]. `close` releases the underlying source
/// and sink exactly once; everything afterwards fails with
/// [`Error::AlreadyClosed`].
pub struct CarDatastore {
    reader: Reader,
    writer: Writer,
    closed: bool,
}

impl CarDatastore {
    pub(crate) fn read_complete(reader: BufferReader) -> Self {
        Self {
            reader: Reader::Buffer(reader),
            writer: Writer::Inert,
            closed: false,
        }
    }

    pub(crate) fn read_streaming(reader: StreamingReader) -> Self {
        Self {
            reader: Reader::Streaming(reader),
            writer: Writer::Inert,
            closed: false,
        }
    }

    pub(crate) fn read_file(reader: FileReader) -> Self {
        Self {
            reader: Reader::File(reader),
            writer: Writer::Inert,
            closed: false,
        }
    }

    pub(crate) fn write(writer: CarWriter) -> Self {
        Self {
            reader: Reader::Inert,
            writer: Writer::Stream(writer),
            closed: false,
        }
    }

    /// Returns the root CIDs fixed in the archive header.
    pub async fn get_roots(&self) -> Result<Vec<Cid>, Error> {
        self.check_open()?;
        match &self.reader {
            Reader::Buffer(r) => Ok(r.roots().to_vec()),
            Reader::Streaming(r) => Ok(r.roots().to_vec()),
            Reader::File(r) => Ok(r.roots().to_vec()),
            Reader::Inert => Err(Error::UnsupportedOperation("getRoots")),
        }
    }

    /// Returns the payload stored under `cid`, or [`Error::NotFound`].
    pub async fn get(&mut self, cid: &Cid) -> Result<Vec<u8>, Error> {
        self.check_open()?;
        match &mut self.reader {
            Reader::Buffer(r) => r.get(cid),
            Reader::File(r) => r.get(cid).await,
            Reader::Streaming(_) => Err(Error::UnsupportedOperation("get")),
            Reader::Inert => Err(Error::UnsupportedOperation("get")),
        }
    }

    /// Whether the archive contains a block under `cid`.
    pub async fn has(&self, cid: &Cid) -> Result<bool, Error> {
        self.check_open()?;
        match &self.reader {
            Reader::Buffer(r) => Ok(r.has(cid)),
            Reader::File(r) => Ok(r.has(cid)),
            Reader::Streaming(_) => Err(Error::UnsupportedOperation("has")),
            Reader::Inert => Err(Error::UnsupportedOperation("has")),
        }
    }

    /// Lazy sequence of `(key, payload)` pairs in archive order, with `key`
    /// the base58btc rendering of the block CID. An optional `prefix`
    /// restricts the keys yielded; the filter runs over the stream, it is
    /// never pushed into an index. On the streaming mode the sequence can be
    /// taken exactly once.
    pub fn query(
        &mut self,
        prefix: Option<String>,
    ) -> Result<BoxStream<'_, Result<(String, Vec<u8>), Error>>, Error> {
        self.check_open()?;
        let blocks: BoxStream<'_, Result<(Cid, Vec<u8>), Error>> = match &mut self.reader {
            Reader::Buffer(r) => r.query().boxed(),
            Reader::File(r) => r.query().boxed(),
            Reader::Streaming(r) => r.query()?.boxed(),
            Reader::Inert => return Err(Error::UnsupportedOperation("query")),
        };
        let keyed = blocks.map_ok(|(cid, payload)| (cid_key(&cid), payload));
        Ok(match prefix {
            Some(prefix) => keyed
                .try_filter(move |(key, _)| future::ready(key.starts_with(&prefix)))
                .boxed(),
            None => keyed.boxed(),
        })
    }

    /// Fixes the archive roots; write mode only, and only before any `put`.
    pub async fn set_roots(&self, roots: &[Cid]) -> Result<(), Error> {
        self.check_open()?;
        match &self.writer {
            Writer::Stream(w) => w.set_roots(roots).await,
            Writer::Inert => Err(Error::UnsupportedOperation("setRoots")),
        }
    }

    /// Appends one block; write mode only.
    pub async fn put(&self, cid: &Cid, payload: &[u8]) -> Result<(), Error> {
        self.check_open()?;
        match &self.writer {
            Writer::Stream(w) => w.put(cid, payload).await,
            Writer::Inert => Err(Error::UnsupportedOperation("put")),
        }
    }

    /// Archives are append-only; always fails with
    /// [`Error::UnsupportedOperation`].
    pub async fn delete(&self, cid: &Cid) -> Result<(), Error> {
        self.check_open()?;
        match &self.writer {
            Writer::Stream(w) => w.delete(cid).await,
            Writer::Inert => Err(Error::UnsupportedOperation("delete")),
        }
    }

    /// Closes the underlying reader and writer. A second call fails with
    /// [`Error::AlreadyClosed`].
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.closed = true;
        // dropping the reader releases its source
        self.reader = Reader::Inert;
        if let Writer::Stream(w) = &self.writer {
            w.close().await?;
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(())
    }
}
