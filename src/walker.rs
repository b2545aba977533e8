// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::datastore::CarDatastore;
use crate::error::Error;
use crate::util::cid_key;
use futures::future::{self, FutureExt, LocalBoxFuture};
use ipld_core::cid::Cid;
use std::collections::HashSet;
use std::future::Future;

/// Multicodec tag for opaque payloads; raw blocks carry no links.
const IPLD_RAW: u64 = 0x55;

/// External capability enumerating the CIDs embedded in a block, given the
/// block's codec tag. Only the graph walker needs it.
pub trait LinkEnumerator {
    fn links(&self, codec: u64, payload: &[u8]) -> Result<Vec<Cid>, Error>;
}

/// Writes the full graph reachable from `root` into a write-mode datastore:
/// the root becomes the archive's single root, every reachable block is
/// written exactly once, and the datastore is closed when the walk is done.
///
/// Traversal is depth-first with links taken in enumeration order; within a
/// chunk of `concurrency` links (minimum 1) the fetches run in parallel but
/// recursion stays in order, so output is deterministic for a given `root`
/// and `get`.
pub async fn complete_graph<F, Fut, L>(
    root: Cid,
    get: F,
    links: &L,
    car: &mut CarDatastore,
    concurrency: usize,
) -> Result<(), Error>
where
    F: Fn(Cid) -> Fut,
    Fut: Future<Output = Result<Vec<u8>, Error>>,
    L: LinkEnumerator,
{
    let concurrency = concurrency.max(1);
    car.set_roots(&[root]).await?;
    let payload = get(root).await?;
    car.put(&root, &payload).await?;
    let mut seen = HashSet::new();
    seen.insert(cid_key(&root));
    walk(
        root.codec(),
        payload,
        &mut seen,
        &get,
        links,
        car,
        concurrency,
    )
    .await?;
    log::debug!("complete graph written: {} blocks", seen.len());
    car.close().await
}

fn walk<'a, F, Fut, L>(
    codec: u64,
    payload: Vec<u8>,
    seen: &'a mut HashSet<String>,
    get: &'a F,
    links: &'a L,
    car: &'a CarDatastore,
    concurrency: usize,
) -> LocalBoxFuture<'a, Result<(), Error>>
where
    F: Fn(Cid) -> Fut,
    Fut: Future<Output = Result<Vec<u8>, Error>>,
    L: LinkEnumerator,
{
    async move {
        if codec == IPLD_RAW {
            return Ok(());
        }
        let targets: Vec<Cid> = links
            .links(codec, &payload)?
            .into_iter()
            .filter(|cid| !seen.contains(&cid_key(cid)))
            .collect();
        for chunk in targets.chunks(concurrency) {
            let fetched = future::try_join_all(chunk.iter().map(|cid| get(*cid))).await?;
            for (cid, payload) in chunk.iter().zip(fetched) {
                // a deeper branch may have written it since the chunk was cut
                if !seen.insert(cid_key(cid)) {
                    continue;
                }
                car.put(cid, &payload).await?;
                walk(cid.codec(), payload, seen, get, links, car, concurrency).await?;
            }
        }
        Ok(())
    }
    .boxed_local()
}
