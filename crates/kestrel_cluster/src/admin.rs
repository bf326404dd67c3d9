//! Cluster-management REST client.
//!
//! Thin wrapper over the cluster manager's administration endpoints: node
//! add/remove, failover, recovery type, and rebalance with completion
//! polling. Requests are form-encoded with basic auth; self-signed TLS is
//! trusted because admin endpoints commonly run with provisional
//! certificates during cluster bring-up.

use std::time::{Duration, Instant};

use kestrel_common::config::ClusterConfig;
use kestrel_common::error::ClusterError;
use kestrel_common::KestrelResult;

/// Plaintext admin ports map to their TLS counterparts at a fixed offset.
pub const TLS_PORT_OFFSET: u16 = 10000;

pub fn tls_port(port: u16) -> u16 {
    port + TLS_PORT_OFFSET
}

/// Replace the port in `host:port` with its TLS counterpart.
pub fn tls_host(host: &str) -> String {
    match host.rsplit_once(':') {
        Some((h, p)) => match p.parse::<u16>() {
            Ok(port) => format!("{h}:{}", tls_port(port)),
            Err(_) => host.to_string(),
        },
        None => host.to_string(),
    }
}

/// Observed state of the cluster's rebalance task.
#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceStatus {
    Running(f64),
    NotRunning,
    Failed(String),
}

/// Parse the `pools/default/tasks` response for rebalance state.
pub fn parse_rebalance_status(body: &str) -> KestrelResult<RebalanceStatus> {
    let tasks: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ClusterError::Http(format!("tasks response: {e}")))?;
    let Some(tasks) = tasks.as_array() else {
        return Err(ClusterError::Http("tasks response is not a list".into()).into());
    };
    for task in tasks {
        if task.get("type").and_then(|t| t.as_str()) != Some("rebalance") {
            continue;
        }
        if let Some(msg) = task.get("errorMessage").and_then(|m| m.as_str()) {
            return Ok(RebalanceStatus::Failed(msg.to_string()));
        }
        match task.get("status").and_then(|s| s.as_str()) {
            Some("running") => {
                let progress = task.get("progress").and_then(|p| p.as_f64()).unwrap_or(0.0);
                return Ok(RebalanceStatus::Running(progress));
            }
            _ => return Ok(RebalanceStatus::NotRunning),
        }
    }
    Ok(RebalanceStatus::NotRunning)
}

/// REST client for cluster administration.
pub struct ClusterManager {
    cfg: ClusterConfig,
    client: reqwest::Client,
    use_tls: bool,
}

impl ClusterManager {
    pub fn new(cfg: ClusterConfig, use_tls: bool) -> KestrelResult<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClusterError::Http(format!("client build: {e}")))?;
        Ok(ClusterManager {
            cfg,
            client,
            use_tls,
        })
    }

    fn base_url(&self) -> String {
        if self.use_tls {
            format!("https://{}", tls_host(&self.cfg.cluster_addr))
        } else {
            format!("http://{}", self.cfg.cluster_addr)
        }
    }

    async fn get(&self, path: &str) -> KestrelResult<String> {
        let url = format!("{}/{}", self.base_url(), path);
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .send()
            .await
            .map_err(|e| ClusterError::Http(format!("GET {path}: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClusterError::Http(format!("GET {path}: {}", resp.status())).into());
        }
        resp.text()
            .await
            .map_err(|e| ClusterError::Http(format!("GET {path}: {e}")).into())
    }

    async fn post_form(&self, path: &str, params: &[(&str, &str)]) -> KestrelResult<String> {
        let url = format!("{}/{}", self.base_url(), path);
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .form(params)
            .send()
            .await
            .map_err(|e| ClusterError::Http(format!("POST {path}: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClusterError::Http(format!("POST {path}: {}", resp.status())).into());
        }
        resp.text()
            .await
            .map_err(|e| ClusterError::Http(format!("POST {path}: {e}")).into())
    }

    pub async fn setup_services(&self, services: &str) -> KestrelResult<()> {
        self.post_form("node/controller/setupServices", &[("services", services)])
            .await?;
        Ok(())
    }

    pub async fn set_web_settings(&self, port: u16) -> KestrelResult<()> {
        let port = port.to_string();
        self.post_form(
            "settings/web",
            &[
                ("username", self.cfg.username.as_str()),
                ("password", self.cfg.password.as_str()),
                ("port", port.as_str()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn pools_default(&self) -> KestrelResult<String> {
        self.get("pools/default").await
    }

    /// GET an arbitrary path, returning the raw body. Used by the sibling
    /// adapters that read JSON off the same surface.
    pub async fn get_raw(&self, path: &str) -> KestrelResult<String> {
        self.get(path).await
    }

    /// Add a node to the cluster. TLS clusters register the node through its
    /// TLS-mapped admin port.
    pub async fn add_node(&self, hostname: &str, services: &str) -> KestrelResult<()> {
        let hostname = if self.use_tls {
            format!("https://{}", tls_host(hostname))
        } else {
            hostname.to_string()
        };
        self.post_form(
            "controller/addNode",
            &[
                ("hostname", hostname.as_str()),
                ("user", self.cfg.username.as_str()),
                ("password", self.cfg.password.as_str()),
                ("services", services),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn rebalance(&self, known_nodes: &str, ejected_nodes: &str) -> KestrelResult<()> {
        self.post_form(
            "controller/rebalance",
            &[("knownNodes", known_nodes), ("ejectedNodes", ejected_nodes)],
        )
        .await?;
        Ok(())
    }

    pub async fn failover(&self, otp_node: &str) -> KestrelResult<()> {
        self.post_form("controller/failOver", &[("otpNode", otp_node)])
            .await?;
        Ok(())
    }

    pub async fn set_recovery_type(&self, otp_node: &str, recovery_type: &str) -> KestrelResult<()> {
        self.post_form(
            "controller/setRecoveryType",
            &[("otpNode", otp_node), ("recoveryType", recovery_type)],
        )
        .await?;
        Ok(())
    }

    /// Poll until the running rebalance finishes. Polls every
    /// `rebalance_poll_secs`, gives up at `rebalance_timeout_secs`.
    pub async fn wait_rebalance_complete(&self) -> KestrelResult<()> {
        let deadline = Instant::now() + Duration::from_secs(self.cfg.rebalance_timeout_secs);
        loop {
            let body = self.get("pools/default/tasks").await?;
            match parse_rebalance_status(&body)? {
                RebalanceStatus::NotRunning => return Ok(()),
                RebalanceStatus::Failed(msg) => {
                    return Err(ClusterError::RebalanceFailed(msg).into());
                }
                RebalanceStatus::Running(progress) => {
                    tracing::info!(progress, "rebalance in progress");
                }
            }
            if Instant::now() >= deadline {
                return Err(
                    ClusterError::RebalanceTimedOut(self.cfg.rebalance_timeout_secs).into(),
                );
            }
            tokio::time::sleep(Duration::from_secs(self.cfg.rebalance_poll_secs)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_port_offset() {
        assert_eq!(tls_port(8091), 18091);
        assert_eq!(tls_host("node1:8091"), "node1:18091");
        assert_eq!(tls_host("node1"), "node1");
        assert_eq!(tls_host("node1:abc"), "node1:abc");
    }

    #[test]
    fn test_parse_rebalance_running() {
        let body = r#"[{"type":"rebalance","status":"running","progress":42.5}]"#;
        assert_eq!(
            parse_rebalance_status(body).unwrap(),
            RebalanceStatus::Running(42.5)
        );
    }

    #[test]
    fn test_parse_rebalance_not_running() {
        let body = r#"[{"type":"rebalance","status":"notRunning"}]"#;
        assert_eq!(
            parse_rebalance_status(body).unwrap(),
            RebalanceStatus::NotRunning
        );
        assert_eq!(
            parse_rebalance_status("[]").unwrap(),
            RebalanceStatus::NotRunning
        );
    }

    #[test]
    fn test_parse_rebalance_failure() {
        let body = r#"[{"type":"rebalance","status":"notRunning","errorMessage":"node down"}]"#;
        assert_eq!(
            parse_rebalance_status(body).unwrap(),
            RebalanceStatus::Failed("node down".into())
        );
    }

    #[test]
    fn test_parse_rebalance_bad_body() {
        assert!(parse_rebalance_status("not json").is_err());
        assert!(parse_rebalance_status("{}").is_err());
    }
}
