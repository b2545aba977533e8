// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::error::Error;
use crate::util::{cid_key, decode_varint_prefix, parse_block_cid, read_varint};
use crate::CarHeader;
use futures::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, Stream};
use ipld_core::cid::Cid;
use std::io::SeekFrom;

/// Default sliding-window size for archive scans.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Locates one block's payload inside an archive. `block_offset` and
/// `block_length` cover the payload only, excluding the frame varint and
/// the CID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub cid: Cid,
    /// Base58btc rendering of the CID, the datastore key.
    pub key: String,
    pub block_offset: u64,
    pub block_length: u64,
}

/// Lazily scans an archive, yielding one [`IndexEntry`] per frame. Frames
/// are parsed out of a sliding window of `buffer_size` bytes; payload bytes
/// are skipped, never retained, so memory use is bounded by the window (and
/// a frame's CID prefix) rather than the archive.
pub struct Indexer<R> {
    reader: R,
    buffer_size: usize,
    /// Unparsed bytes; `position` is the absolute offset of `window[0]`.
    window: Vec<u8>,
    position: u64,
    eof: bool,
    header: CarHeader,
}

impl<R> Indexer<R>
where
    R: AsyncRead + Send + Unpin,
{
    /// Reads and validates the header, leaving the scanner positioned at
    /// the first block frame. `buffer_size` is clamped to a minimum of 1.
    pub async fn new(mut reader: R, buffer_size: usize) -> Result<Self, Error> {
        let (header_len, varint_size) = read_varint(&mut reader)
            .await?
            .ok_or(Error::UnexpectedEnd)?;
        if header_len == 0 {
            return Err(Error::MalformedHeader("zero length header".to_string()));
        }
        let mut buf = vec![0u8; header_len as usize];
        reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::UnexpectedEnd
            } else {
                Error::Io(e)
            }
        })?;
        let header = CarHeader::decode(&buf)?;
        Ok(Self {
            reader,
            buffer_size: buffer_size.max(1),
            window: Vec::new(),
            position: varint_size as u64 + header_len,
            eof: false,
            header,
        })
    }

    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    async fn fill(&mut self) -> Result<(), Error> {
        let mut chunk = vec![0u8; self.buffer_size];
        let n = self.reader.read(&mut chunk).await?;
        if n == 0 {
            self.eof = true;
        } else {
            self.window.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Returns the next block's index entry, or `None` at the end of the
    /// archive.
    pub async fn next_entry(&mut self) -> Result<Option<IndexEntry>, Error> {
        // Frame length varint, refilling the window until it terminates.
        let (frame_len, varint_size) = loop {
            match decode_varint_prefix(&self.window)? {
                Some(decoded) => break decoded,
                None => {
                    if self.eof {
                        if self.window.is_empty() {
                            return Ok(None);
                        }
                        return Err(Error::UnexpectedEnd);
                    }
                    self.fill().await?;
                }
            }
        };
        if frame_len == 0 {
            return Err(Error::MalformedFrame("zero length frame".to_string()));
        }
        let frame_end = varint_size + frame_len as usize;

        // CID at the head of the frame. The parse only needs the CID prefix,
        // so a frame larger than the window is fine; grow the window only
        // while the parse keeps failing short of the full frame.
        let (cid, cid_size) = loop {
            let avail_end = frame_end.min(self.window.len());
            match parse_block_cid(&self.window[varint_size..avail_end]) {
                Ok(parsed) => break parsed,
                Err(e) => {
                    if self.window.len() >= frame_end {
                        return Err(e);
                    }
                    if self.eof {
                        return Err(Error::UnexpectedEnd);
                    }
                    self.fill().await?;
                }
            }
        };

        let entry = IndexEntry {
            cid,
            key: cid_key(&cid),
            block_offset: self.position + varint_size as u64 + cid_size as u64,
            block_length: frame_len - cid_size as u64,
        };

        // Advance past the whole frame, discarding payload bytes.
        let total = varint_size as u64 + frame_len;
        if self.window.len() as u64 >= total {
            self.window.drain(..total as usize);
        } else {
            let mut remaining = total - self.window.len() as u64;
            self.window.clear();
            while remaining > 0 {
                let want = remaining.min(self.buffer_size as u64) as usize;
                let mut chunk = vec![0u8; want];
                let n = self.reader.read(&mut chunk).await?;
                if n == 0 {
                    self.eof = true;
                    return Err(Error::UnexpectedEnd);
                }
                remaining -= n as u64;
            }
        }
        self.position += total;
        Ok(Some(entry))
    }

    /// Converts the scanner into a lazy stream of entries.
    pub fn stream(self) -> impl Stream<Item = Result<IndexEntry, Error>> + Send {
        futures::stream::try_unfold(self, |mut this| async move {
            let entry = this.next_entry().await?;
            Ok(entry.map(|entry| (entry, this)))
        })
    }
}

/// Reads a single block payload out of a seekable archive, given an entry
/// produced by a prior scan.
pub async fn read_raw<R>(file: &mut R, entry: &IndexEntry) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + AsyncSeek + Send + Unpin,
{
    file.seek(SeekFrom::Start(entry.block_offset)).await?;
    let mut payload = vec![0u8; entry.block_length as usize];
    file.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEnd
        } else {
            Error::Io(e)
        }
    })?;
    Ok(payload)
}
