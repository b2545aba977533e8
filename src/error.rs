// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use ipld_core::cid::Cid;
use thiserror::Error;

/// Car datastore error
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unexpected end of data")]
    UnexpectedEnd,
    #[error("Varint exceeds the 9 byte maximum")]
    VarintOverflow,
    #[error("Invalid CAR header: {0}")]
    MalformedHeader(String),
    #[error("Unsupported CAR version: {0}")]
    UnsupportedVersion(u64),
    #[error("Unsupported CID version: {0}")]
    UnsupportedCidVersion(u64),
    #[error("Malformed block frame: {0}")]
    MalformedFrame(String),
    #[error("CAR header has already been written")]
    HeaderAlreadyWritten,
    #[error("Already closed")]
    AlreadyClosed,
    #[error("Operation not supported in this access mode: {0}")]
    UnsupportedOperation(&'static str),
    #[error("A block iterator is already active")]
    ConcurrentIteration,
    #[error("Block not found: {0}")]
    NotFound(Cid),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cbor encoding error: {0}")]
    Cbor(String),
}
