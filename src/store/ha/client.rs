//! Slave side: connects to the master's HA port, reports its current
//! write tail, then receives framed commit-log bytes and appends them
//! verbatim, validating contiguity before each append.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::store::commit_log::CommitLog;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct HaClient {
    master_addr: String,
    commit_log: Arc<CommitLog>,
}

impl HaClient {
    pub fn new(master_addr: impl Into<String>, commit_log: Arc<CommitLog>) -> HaClient {
        HaClient {
            master_addr: master_addr.into(),
            commit_log,
        }
    }

    /// Runs the connect/receive loop forever, reconnecting with a fixed
    /// backoff on any I/O error (network partition, master restart).
    pub async fn run(self) {
        loop {
            match self.connect_and_drain().await {
                Ok(()) => {}
                Err(e) => log::warn!("HA client to {}: {}", self.master_addr, e),
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn connect_and_drain(&self) -> io::Result<()> {
        let mut sock = TcpStream::connect(&self.master_addr).await?;
        let reported_offset = self.commit_log.max_offset();
        sock.write_i64(reported_offset).await?;
        sock.flush().await?;
        log::info!("HA client connected to {}, reporting offset {}", self.master_addr, reported_offset);

        loop {
            let start_offset = sock.read_i64().await?;
            let body_len = sock.read_i32().await?;
            let mut body = vec![0u8; body_len as usize];
            sock.read_exact(&mut body).await?;

            let expected = self.commit_log.max_offset();
            if start_offset != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("HA contiguity break: expected {}, got {}", expected, start_offset),
                ));
            }
            self.commit_log
                .append_raw(&body)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::commit_log::{CommitLogConfig, FlushDiskType};
    use crate::store::dispatch::dispatch_channel;
    use crate::store::ha::master::HaMaster;
    use tempfile::tempdir;

    #[tokio::test]
    async fn slave_replicates_master_appends() {
        let master_dir = tempdir().unwrap();
        let slave_dir = tempdir().unwrap();

        let (tx_m, _rx_m) = dispatch_channel(1024);
        let mut cfg_m = CommitLogConfig::default();
        cfg_m.flush_disk_type = FlushDiskType::AsyncFlush;
        let master_log = Arc::new(CommitLog::new(master_dir.path(), cfg_m, tx_m));

        for body in [&b"a"[..], &b"b"[..], &b"c"[..]] {
            let msg = crate::message::MessageExtBrokerInner::new("T", 0, body.to_vec());
            assert!(master_log.put_message(msg).is_ok());
        }

        let ha_master = Arc::new(HaMaster::new(master_log.clone()));
        let addr = ha_master.serve("127.0.0.1:0").await.unwrap();

        let (tx_s, _rx_s) = dispatch_channel(1024);
        let cfg_s = CommitLogConfig::default();
        let slave_log = Arc::new(CommitLog::new(slave_dir.path(), cfg_s, tx_s));
        slave_log.set_role(crate::store::commit_log::BrokerRole::Slave);

        let client = HaClient::new(addr.to_string(), slave_log.clone());
        tokio::spawn(client.run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while slave_log.max_offset() < master_log.max_offset() {
            if tokio::time::Instant::now() > deadline {
                panic!("slave did not catch up in time");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(slave_log.max_offset(), master_log.max_offset());
    }
}
