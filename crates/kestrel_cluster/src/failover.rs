//! Failover-log fetch over the cluster manager's REST surface.
//!
//! The rollback engine validates restart timestamps against the upstream's
//! per-vb branch history; this adapter fetches that history as JSON
//! (`[[ [vbuuid, seqno], ... ], ...]`, one list per vb, newest first).

use async_trait::async_trait;

use kestrel_common::error::ClusterError;
use kestrel_common::KestrelResult;
use kestrel_storage::rollback::{FailoverLog, FailoverLogProvider};

use crate::admin::ClusterManager;

pub struct HttpFailoverLog {
    manager: ClusterManager,
}

impl HttpFailoverLog {
    pub fn new(manager: ClusterManager) -> Self {
        HttpFailoverLog { manager }
    }
}

/// Decode a failover-log response body.
pub fn parse_failover_log(body: &str, num_vbuckets: usize) -> KestrelResult<FailoverLog> {
    let parsed: Vec<Vec<(u64, u64)>> = serde_json::from_str(body)
        .map_err(|e| ClusterError::UpstreamUnavailable(format!("failover log decode: {e}")))?;
    if parsed.len() != num_vbuckets {
        return Err(ClusterError::UpstreamUnavailable(format!(
            "failover log has {} vbs, expected {num_vbuckets}",
            parsed.len()
        ))
        .into());
    }
    Ok(FailoverLog { vbs: parsed })
}

#[async_trait]
impl FailoverLogProvider for HttpFailoverLog {
    async fn failover_log(&self, bucket: &str, num_vbuckets: usize) -> KestrelResult<FailoverLog> {
        let body = self
            .manager
            .get_raw(&format!("pools/default/buckets/{bucket}/failoverLogs"))
            .await?;
        parse_failover_log(&body, num_vbuckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failover_log() {
        let body = "[[[30,100],[20,50],[10,0]],[[7,0]]]";
        let flog = parse_failover_log(body, 2).unwrap();
        assert_eq!(flog.vbs[0].len(), 3);
        assert_eq!(flog.lowest_vbuuid(0, 60), Some(10));
        assert_eq!(flog.lowest_vbuuid(1, 5), Some(7));
    }

    #[test]
    fn test_parse_failover_log_wrong_width() {
        let err = parse_failover_log("[[[1,0]]]", 4).unwrap_err();
        assert!(err.to_string().contains("expected 4"));
    }

    #[test]
    fn test_parse_failover_log_bad_body() {
        assert!(parse_failover_log("nope", 1).is_err());
    }
}
