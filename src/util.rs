// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::error::Error;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use ipld_core::cid::{Cid, Version};
use multibase::Base;
use unsigned_varint::{decode, encode};

/// Decodes an unsigned LEB128 varint from the front of `buf`, returning the
/// value and the number of bytes it occupied. `Ok(None)` means more bytes are
/// needed. Bounded to 9 bytes (63 bits) as the multiformats spec requires.
pub(crate) fn decode_varint_prefix(buf: &[u8]) -> Result<Option<(u64, usize)>, Error> {
    for (i, byte) in buf.iter().enumerate().take(9) {
        if byte & 0x80 == 0 {
            let (value, _) = decode::u64(&buf[..=i]).map_err(|e| match e {
                decode::Error::Overflow => Error::VarintOverflow,
                other => Error::MalformedFrame(other.to_string()),
            })?;
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 9 {
        return Err(Error::VarintOverflow);
    }
    Ok(None)
}

/// Reads one varint from the source. `Ok(None)` signals a clean end of input
/// at a frame boundary; running dry mid-varint is [`Error::UnexpectedEnd`].
pub(crate) async fn read_varint<R>(reader: &mut R) -> Result<Option<(u64, usize)>, Error>
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = [0u8; 9];
    for i in 0..buf.len() {
        let mut byte = [0u8; 1];
        if let Err(e) = reader.read_exact(&mut byte).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                if i == 0 {
                    return Ok(None);
                }
                return Err(Error::UnexpectedEnd);
            }
            return Err(Error::Io(e));
        }
        buf[i] = byte[0];
        if let Some(decoded) = decode_varint_prefix(&buf[..=i])? {
            return Ok(Some(decoded));
        }
    }
    Err(Error::VarintOverflow)
}

/// Reads one length-delimited frame. `Ok(None)` at a clean end of input.
pub(crate) async fn ld_read<R>(reader: &mut R) -> Result<Option<Vec<u8>>, Error>
where
    R: AsyncRead + Send + Unpin,
{
    let len = match read_varint(reader).await? {
        Some((len, _)) => len,
        None => return Ok(None),
    };
    if len == 0 {
        return Err(Error::MalformedFrame("zero length frame".to_string()));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEnd
        } else {
            Error::Io(e)
        }
    })?;
    Ok(Some(buf))
}

/// Writes one length-delimited frame: `varint(len)` then the bytes.
pub(crate) async fn ld_write<W>(writer: &mut W, bytes: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Send + Unpin,
{
    let mut len_buf = encode::u64_buffer();
    writer
        .write_all(encode::u64(bytes.len() as u64, &mut len_buf))
        .await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Splits a block frame into its CID and the consumed prefix length. The
/// payload is whatever follows. Version 0 CIDs are rejected in both their
/// explicit (`0x00` version varint) and implicit (`0x12 0x20` multihash)
/// binary forms.
pub(crate) fn parse_block_cid(frame: &[u8]) -> Result<(Cid, usize), Error> {
    match frame {
        [] => return Err(Error::MalformedFrame("empty block frame".to_string())),
        [0x00, ..] => return Err(Error::UnsupportedCidVersion(0)),
        [0x12, 0x20, ..] => return Err(Error::UnsupportedCidVersion(0)),
        _ => {}
    }
    let mut cursor = std::io::Cursor::new(frame);
    let cid = Cid::read_bytes(&mut cursor).map_err(|e| Error::MalformedFrame(e.to_string()))?;
    if cid.version() == Version::V0 {
        return Err(Error::UnsupportedCidVersion(0));
    }
    Ok((cid, cursor.position() as usize))
}

/// Reads one block frame. `Ok(None)` at a clean end of input.
pub(crate) async fn read_node<R>(reader: &mut R) -> Result<Option<(Cid, Vec<u8>)>, Error>
where
    R: AsyncRead + Send + Unpin,
{
    match ld_read(reader).await? {
        Some(buf) => {
            let (cid, used) = parse_block_cid(&buf)?;
            Ok(Some((cid, buf[used..].to_vec())))
        }
        None => Ok(None),
    }
}

pub(crate) fn verify_cid(cid: &Cid) -> Result<(), Error> {
    if cid.version() == Version::V0 {
        return Err(Error::UnsupportedCidVersion(0));
    }
    Ok(())
}

/// Base58btc rendering of a CID, used as the datastore key.
pub(crate) fn cid_key(cid: &Cid) -> String {
    multibase::encode(Base::Base58Btc, cid.to_bytes())
}
