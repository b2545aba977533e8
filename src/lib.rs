// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Reading and writing of CAR (Content ARchive) files: a dag-cbor header
//! naming the root CIDs, followed by length-prefixed `(CID, payload)`
//! frames. Archives are exposed through [`CarDatastore`] access modes for
//! buffered, streaming and random-access consumption, plus a streaming
//! writer and a recursive graph walker.

mod datastore;
mod error;
mod index;
mod reader;
mod util;
mod walker;
mod writer;

pub use datastore::CarDatastore;
pub use error::Error;
pub use index::{read_raw, IndexEntry, Indexer, DEFAULT_BUFFER_SIZE};
pub use reader::{BufferReader, CarReader, FileReader};
pub use walker::{complete_graph, LinkEnumerator};
pub use writer::CarWriter;

use futures::{AsyncRead, AsyncWrite};
use ipld_core::cid::Cid;
use serde::{Deserialize, Serialize};
use std::path::Path;
use util::verify_cid;

/// CAR file header
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CarHeader {
    pub roots: Vec<Cid>,
    pub version: u64,
}

impl CarHeader {
    /// Creates a new CAR file header
    pub fn new(roots: Vec<Cid>, version: u64) -> Self {
        Self { roots, version }
    }

    /// Canonical dag-cbor encoding of the header map.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| Error::Cbor(e.to_string()))
    }

    /// Decodes and validates a header: version must be 1 and no root may be
    /// a version 0 CID.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let header: CarHeader = serde_ipld_dagcbor::from_slice(bytes)
            .map_err(|e| Error::MalformedHeader(e.to_string()))?;
        if header.version != 1 {
            return Err(Error::UnsupportedVersion(header.version));
        }
        for root in &header.roots {
            verify_cid(root)?;
        }
        Ok(header)
    }
}

impl From<Vec<Cid>> for CarHeader {
    fn from(roots: Vec<Cid>) -> Self {
        Self { roots, version: 1 }
    }
}

/// Opens a datastore over a complete archive already resident in memory.
pub async fn read_buffer(data: &[u8]) -> Result<CarDatastore, Error> {
    let reader = BufferReader::load(futures::io::Cursor::new(data)).await?;
    Ok(CarDatastore::read_complete(reader))
}

/// Reads a whole archive file into memory and opens a datastore over it.
pub async fn read_file_complete(path: impl AsRef<Path>) -> Result<CarDatastore, Error> {
    let file = async_std::fs::File::open(path.as_ref()).await?;
    let reader = BufferReader::load(async_std::io::BufReader::new(file)).await?;
    Ok(CarDatastore::read_complete(reader))
}

/// Scans an archive file once to build a CID → byte-range index, then
/// serves `get` by reading only the needed slice from the file.
pub async fn read_file_indexed(path: impl AsRef<Path>) -> Result<CarDatastore, Error> {
    read_file_indexed_with_buffer(path, DEFAULT_BUFFER_SIZE).await
}

/// As [`read_file_indexed`], with an explicit scan buffer size.
pub async fn read_file_indexed_with_buffer(
    path: impl AsRef<Path>,
    buffer_size: usize,
) -> Result<CarDatastore, Error> {
    let reader = FileReader::open(path, buffer_size).await?;
    Ok(CarDatastore::read_file(reader))
}

/// Drains a byte stream to completion and opens a datastore with the full
/// read surface over the buffered blocks.
pub async fn read_stream_complete<R>(stream: R) -> Result<CarDatastore, Error>
where
    R: AsyncRead + Send + Unpin,
{
    let reader = BufferReader::load(stream).await?;
    Ok(CarDatastore::read_complete(reader))
}

/// Opens a datastore that consumes the stream lazily: only the header is
/// read up front, and blocks surface through a single `query` pass.
pub async fn read_streaming<R>(stream: R) -> Result<CarDatastore, Error>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let reader = reader::StreamingReader::new(Box::new(stream)).await?;
    Ok(CarDatastore::read_streaming(reader))
}

/// Opens a write-mode datastore emitting an archive to the sink.
pub fn write_stream<W>(sink: W) -> CarDatastore
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    CarDatastore::write(CarWriter::new(sink))
}

/// Lazily scans an archive file, yielding one [`IndexEntry`] per block
/// without materialising payloads or building a map.
pub async fn indexer(path: impl AsRef<Path>) -> Result<Indexer<async_std::fs::File>, Error> {
    let file = async_std::fs::File::open(path.as_ref()).await?;
    Indexer::new(file, DEFAULT_BUFFER_SIZE).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipld_core::cid::multihash::Multihash;
    use sha2::{Digest, Sha256};

    fn test_cid(data: &[u8]) -> Cid {
        let mh = Multihash::wrap(0x12, &Sha256::digest(data)).unwrap();
        Cid::new_v1(0x55, mh)
    }

    #[test]
    fn symmetric_header() {
        let header = CarHeader {
            roots: vec![test_cid(b"test")],
            version: 1,
        };

        let bytes = header.encode().unwrap();
        assert_eq!(CarHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn empty_roots_allowed() {
        let header = CarHeader::from(Vec::new());
        let bytes = header.encode().unwrap();
        let decoded = CarHeader::decode(&bytes).unwrap();
        assert!(decoded.roots.is_empty());
        assert_eq!(decoded.version, 1);
    }

    #[test]
    fn version_must_be_one() {
        let header = CarHeader::new(vec![], 2);
        let bytes = header.encode().unwrap();
        assert!(matches!(
            CarHeader::decode(&bytes),
            Err(Error::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn garbage_header_rejected() {
        assert!(matches!(
            CarHeader::decode(b"not cbor at all"),
            Err(Error::MalformedHeader(_))
        ));
    }
}
