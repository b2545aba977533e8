// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::error::Error;
use crate::index::{read_raw, IndexEntry, Indexer};
use crate::util::{cid_key, ld_read, read_node};
use crate::CarHeader;
use futures::{AsyncRead, Stream};
use ipld_core::cid::Cid;
use std::collections::HashMap;
use std::path::Path;

pub(crate) type DynRead = Box<dyn AsyncRead + Send + Unpin>;

/// Reads CAR archives frame by frame from a byte stream. The header is
/// parsed on construction; blocks are surfaced lazily through
/// [`CarReader::next_block`] or [`CarReader::stream`].
pub struct CarReader<R> {
    reader: R,
    header: CarHeader,
}

impl<R> CarReader<R>
where
    R: AsyncRead + Send + Unpin,
{
    /// Creates a new `CarReader` and parses the [`CarHeader`]
    pub async fn new(mut reader: R) -> Result<Self, Error> {
        let buf = ld_read(&mut reader).await?.ok_or(Error::UnexpectedEnd)?;
        let header = CarHeader::decode(&buf)?;
        Ok(CarReader { reader, header })
    }

    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// Returns the next block in the archive, or `None` once the stream is
    /// exhausted at a frame boundary.
    pub async fn next_block(&mut self) -> Result<Option<(Cid, Vec<u8>)>, Error> {
        read_node(&mut self.reader).await
    }

    /// Converts the reader into a single-pass stream of blocks.
    pub fn stream(self) -> impl Stream<Item = Result<(Cid, Vec<u8>), Error>> + Send {
        futures::stream::try_unfold(self, |mut this| async move {
            let block = this.next_block().await?;
            Ok(block.map(|block| (block, this)))
        })
    }
}

/// Holds a fully decoded archive in memory: an ordered block list for
/// `query` replay plus a last-wins key map for `get`/`has`.
pub struct BufferReader {
    roots: Vec<Cid>,
    blocks: Vec<(Cid, Vec<u8>)>,
    by_key: HashMap<String, usize>,
}

impl BufferReader {
    /// Drains `reader` to the end of the archive and indexes every block.
    /// Duplicate CIDs are kept in order; the last occurrence wins for `get`.
    pub async fn load<R>(reader: R) -> Result<Self, Error>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut car = CarReader::new(reader).await?;
        let mut blocks = Vec::new();
        let mut by_key = HashMap::new();
        while let Some((cid, payload)) = car.next_block().await? {
            by_key.insert(cid_key(&cid), blocks.len());
            blocks.push((cid, payload));
        }
        Ok(Self {
            roots: car.header().roots.clone(),
            blocks,
            by_key,
        })
    }

    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.by_key.contains_key(&cid_key(cid))
    }

    pub fn get(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
        self.by_key
            .get(&cid_key(cid))
            .map(|&i| self.blocks[i].1.clone())
            .ok_or(Error::NotFound(*cid))
    }

    /// Replays the blocks in archive order. Restartable.
    pub fn query(&self) -> impl Stream<Item = Result<(Cid, Vec<u8>), Error>> + Send + '_ {
        futures::stream::iter(
            self.blocks
                .iter()
                .map(|(cid, payload)| Ok::<_, Error>((*cid, payload.clone()))),
        )
    }
}

/// Stream-incremental reader: the header is read eagerly so roots stay
/// available, while the block stream can be taken exactly once.
pub(crate) struct StreamingReader {
    roots: Vec<Cid>,
    inner: Option<CarReader<DynRead>>,
}

impl StreamingReader {
    pub(crate) async fn new(stream: DynRead) -> Result<Self, Error> {
        let reader = CarReader::new(stream).await?;
        Ok(Self {
            roots: reader.header().roots.clone(),
            inner: Some(reader),
        })
    }

    pub(crate) fn roots(&self) -> &[Cid] {
        &self.roots
    }

    /// Takes the one-shot block stream. The source is forward-only, so any
    /// second call fails with [`Error::ConcurrentIteration`].
    pub(crate) fn query(
        &mut self,
    ) -> Result<impl Stream<Item = Result<(Cid, Vec<u8>), Error>> + Send, Error> {
        let reader = self.inner.take().ok_or(Error::ConcurrentIteration)?;
        Ok(reader.stream())
    }
}

/// Random-access reader over an archive file. Construction scans the file
/// once to build an index of payload byte ranges; `get` then reads exactly
/// one block's bytes from disk.
pub struct FileReader {
    file: async_std::fs::File,
    roots: Vec<Cid>,
    entries: Vec<IndexEntry>,
    by_key: HashMap<String, usize>,
}

impl FileReader {
    /// Opens `path` and scans it with a sliding window of `buffer_size`
    /// bytes (clamped to a minimum of 1).
    pub async fn open(path: impl AsRef<Path>, buffer_size: usize) -> Result<Self, Error> {
        let mut file = async_std::fs::File::open(path.as_ref()).await?;
        let mut indexer = Indexer::new(&mut file, buffer_size).await?;
        let roots = indexer.header().roots.clone();
        let mut entries = Vec::new();
        while let Some(entry) = indexer.next_entry().await? {
            entries.push(entry);
        }
        drop(indexer);
        let mut by_key = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            by_key.insert(entry.key.clone(), i);
        }
        log::debug!(
            "indexed {} blocks from {}",
            entries.len(),
            path.as_ref().display()
        );
        Ok(Self {
            file,
            roots,
            entries,
            by_key,
        })
    }

    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.by_key.contains_key(&cid_key(cid))
    }

    /// Reads one block payload from the file by index lookup.
    pub async fn get(&mut self, cid: &Cid) -> Result<Vec<u8>, Error> {
        let i = *self
            .by_key
            .get(&cid_key(cid))
            .ok_or(Error::NotFound(*cid))?;
        let entry = self.entries[i].clone();
        read_raw(&mut self.file, &entry).await
    }

    /// Replays the index in archive order, reading each payload on demand.
    pub fn query(&mut self) -> impl Stream<Item = Result<(Cid, Vec<u8>), Error>> + Send + '_ {
        let FileReader { file, entries, .. } = self;
        let entries: &Vec<IndexEntry> = entries;
        futures::stream::try_unfold((file, 0usize), move |(file, i)| async move {
            match entries.get(i) {
                Some(entry) => {
                    let payload = read_raw(&mut *file, entry).await?;
                    Ok(Some(((entry.cid, payload), (file, i + 1))))
                }
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ld_write;
    use futures::StreamExt;
    use ipld_core::cid::multihash::Multihash;
    use sha2::{Digest, Sha256};

    fn test_cid(data: &[u8]) -> Cid {
        let mh = Multihash::wrap(0x12, &Sha256::digest(data)).unwrap();
        Cid::new_v1(0x71, mh)
    }

    async fn test_archive(roots: Vec<Cid>, blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
        let mut buffer = Vec::new();
        let header = CarHeader::from(roots);
        ld_write(&mut buffer, &header.encode().unwrap())
            .await
            .unwrap();
        for (cid, payload) in blocks {
            ld_write(&mut buffer, &[cid.to_bytes(), payload.clone()].concat())
                .await
                .unwrap();
        }
        buffer
    }

    #[async_std::test]
    async fn buffer_reader_round_trip() {
        let cid_a = test_cid(b"aaaa");
        let cid_b = test_cid(b"bbbb");
        let blocks = vec![
            (cid_a, b"aaaa".to_vec()),
            (cid_b, b"bbbb".to_vec()),
        ];
        let bytes = test_archive(vec![cid_a], &blocks).await;

        let reader = BufferReader::load(futures::io::Cursor::new(bytes))
            .await
            .unwrap();
        assert_eq!(reader.roots(), &[cid_a]);
        assert!(reader.has(&cid_b));
        assert!(!reader.has(&test_cid(b"missing")));
        assert_eq!(reader.get(&cid_a).unwrap(), b"aaaa");

        let queried: Vec<_> = reader.query().map(|r| r.unwrap()).collect().await;
        assert_eq!(queried, blocks);
        // restartable
        let again: Vec<_> = reader.query().map(|r| r.unwrap()).collect().await;
        assert_eq!(again, blocks);
    }

    #[async_std::test]
    async fn duplicate_cid_last_wins() {
        let cid = test_cid(b"dup");
        let blocks = vec![(cid, b"first".to_vec()), (cid, b"second".to_vec())];
        let bytes = test_archive(vec![], &blocks).await;

        let reader = BufferReader::load(futures::io::Cursor::new(bytes))
            .await
            .unwrap();
        assert_eq!(reader.get(&cid).unwrap(), b"second");
        let queried: Vec<_> = reader.query().map(|r| r.unwrap()).collect().await;
        assert_eq!(queried.len(), 2);
        assert_eq!(queried[0].1, b"first");
        assert_eq!(queried[1].1, b"second");
    }

    #[async_std::test]
    async fn truncated_archive() {
        let cid = test_cid(b"data");
        let bytes = test_archive(vec![cid], &[(cid, b"data".to_vec())]).await;
        let truncated = &bytes[..bytes.len() - 10];
        let result = BufferReader::load(futures::io::Cursor::new(truncated)).await;
        assert!(matches!(result, Err(Error::UnexpectedEnd)));
    }

    #[async_std::test]
    async fn streaming_reader_single_pass() {
        let cid = test_cid(b"stream");
        let bytes = test_archive(vec![cid], &[(cid, b"stream".to_vec())]).await;
        let mut reader = StreamingReader::new(Box::new(futures::io::Cursor::new(bytes)))
            .await
            .unwrap();
        assert_eq!(reader.roots(), &[cid]);

        let stream = reader.query().unwrap();
        let collected: Vec<_> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(collected, vec![(cid, b"stream".to_vec())]);

        assert!(matches!(reader.query(), Err(Error::ConcurrentIteration)));
    }
}
