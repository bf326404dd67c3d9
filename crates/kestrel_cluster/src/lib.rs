pub mod admin;
pub mod failover;
pub mod seqnos;

pub use admin::{ClusterManager, RebalanceStatus};
pub use failover::HttpFailoverLog;
pub use seqnos::{HttpSeqnoProvider, SeqnoProvider};
