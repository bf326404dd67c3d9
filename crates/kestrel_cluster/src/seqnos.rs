//! Current-seqnos fetch for session consistency.
//!
//! A session-consistent scan must reach the upstream's position at request
//! arrival; the dispatcher asks this provider for the current per-vb sequence
//! numbers and plans the request against the resulting timestamp.

use std::time::Duration;

use async_trait::async_trait;

use kestrel_common::error::ClusterError;
use kestrel_common::timestamp::TsVector;
use kestrel_common::types::KeyspaceId;
use kestrel_common::KestrelResult;

use crate::admin::ClusterManager;

#[async_trait]
pub trait SeqnoProvider: Send + Sync {
    /// The upstream's current sequence numbers for every vb of `keyspace`.
    async fn current_seqnos(&self, keyspace: &KeyspaceId, num_vbuckets: usize)
        -> KestrelResult<TsVector>;
}

pub struct HttpSeqnoProvider {
    manager: ClusterManager,
    retries: u32,
}

impl HttpSeqnoProvider {
    pub fn new(manager: ClusterManager, retries: u32) -> Self {
        HttpSeqnoProvider { manager, retries }
    }
}

/// Decode a seqnos response body (`[seq0, seq1, ...]`).
pub fn parse_seqnos(body: &str, keyspace: &KeyspaceId, num_vbuckets: usize) -> KestrelResult<TsVector> {
    let seqnos: Vec<u64> = serde_json::from_str(body)
        .map_err(|e| ClusterError::UpstreamUnavailable(format!("seqnos decode: {e}")))?;
    if seqnos.len() != num_vbuckets {
        return Err(ClusterError::UpstreamUnavailable(format!(
            "seqnos response has {} vbs, expected {num_vbuckets}",
            seqnos.len()
        ))
        .into());
    }
    let mut ts = TsVector::new(keyspace.clone(), num_vbuckets);
    ts.seqnos = seqnos;
    Ok(ts)
}

#[async_trait]
impl SeqnoProvider for HttpSeqnoProvider {
    async fn current_seqnos(
        &self,
        keyspace: &KeyspaceId,
        num_vbuckets: usize,
    ) -> KestrelResult<TsVector> {
        let bucket = keyspace.bucket().to_string();
        let mut last_err = None;
        for attempt in 1..=self.retries.max(1) {
            match self
                .manager
                .get_raw(&format!("pools/default/buckets/{bucket}/seqnos"))
                .await
            {
                Ok(body) => return parse_seqnos(&body, keyspace, num_vbuckets),
                Err(e) => {
                    tracing::warn!(bucket, attempt, error = %e, "seqnos fetch failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ClusterError::UpstreamUnavailable("seqnos fetch exhausted retries".into()).into()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seqnos() {
        let ts = parse_seqnos("[5,9,0,12]", &KeyspaceId::new("travel"), 4).unwrap();
        assert_eq!(ts.seqnos, vec![5, 9, 0, 12]);
        assert_eq!(ts.vbuuids, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_seqnos_wrong_width() {
        assert!(parse_seqnos("[1,2]", &KeyspaceId::new("travel"), 4).is_err());
    }
}
