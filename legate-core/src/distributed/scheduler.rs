//! Scheduler-cluster startup: the coordinator runs a scheduler process and
//! publishes its address through remote storage; workers poll for the
//! address, then join as worker processes.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::info;

use super::{
    persist_output, pool_number, run_task, DistributedError, COORDINATOR_ADDR_FILENAME,
};
use crate::storage::{self, Storage, StorageError};
use crate::task::Task;

fn default_port() -> u16 {
    8786
}

fn default_scheduler_program() -> String {
    "dask-scheduler".to_string()
}

fn default_worker_program() -> String {
    "dask-worker".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_poll_attempts() -> u32 {
    36
}

/// Configuration for a scheduler-manager cluster.
///
/// The coordinator starts `scheduler_program` listening on `port`, writes
/// `ip:port` to the well-known address file, then runs the task and persists
/// its output. Each worker polls for the address file (fixed interval,
/// bounded attempts) and runs `worker_program` pointed at the scheduler.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerJob {
    pub port: u16,
    pub scheduler_program: String,
    pub scheduler_args: Vec<String>,
    pub worker_program: String,
    pub worker_args: Vec<String>,
    pub poll_interval_secs: u64,
    pub max_poll_attempts: u32,
}

impl Default for SchedulerJob {
    fn default() -> Self {
        Self {
            port: default_port(),
            scheduler_program: default_scheduler_program(),
            scheduler_args: Vec::new(),
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl SchedulerJob {
    fn address_path(&self, storage_path: &str) -> String {
        storage::join(storage_path, COORDINATOR_ADDR_FILENAME)
    }

    pub async fn run<T: Task>(
        &self,
        task: T,
        storage: Arc<dyn Storage>,
        storage_path: &str,
    ) -> Result<(), DistributedError> {
        match pool_number()? {
            Some(0) | None => self.run_coordinator(task, storage, storage_path).await,
            Some(_) => self.run_worker(&storage, storage_path).await,
        }
    }

    async fn run_coordinator<T: Task>(
        &self,
        task: T,
        storage: Arc<dyn Storage>,
        storage_path: &str,
    ) -> Result<(), DistributedError> {
        let address = format!("{}:{}", local_ip()?, self.port);
        storage
            .write(&self.address_path(storage_path), address.clone().into_bytes().into())
            .await?;
        info!(%address, "published scheduler address");

        // The scheduler keeps running for the lifetime of the job; it is not
        // awaited.
        Command::new(&self.scheduler_program)
            .arg("--port")
            .arg(self.port.to_string())
            .args(&self.scheduler_args)
            .spawn()?;

        let output = run_task(task).await?;
        persist_output(&storage, storage_path, &output).await
    }

    async fn run_worker(
        &self,
        storage: &Arc<dyn Storage>,
        storage_path: &str,
    ) -> Result<(), DistributedError> {
        let address = self.wait_for_coordinator(storage, storage_path).await?;
        info!(%address, "joining scheduler");

        let status = Command::new(&self.worker_program)
            .arg(&address)
            .args(&self.worker_args)
            .status()
            .await?;
        if !status.success() {
            return Err(DistributedError::ProcessFailed {
                command: self.worker_program.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }

    /// Polls for the coordinator's address file: fixed interval, fixed
    /// attempt budget, then a timeout error.
    async fn wait_for_coordinator(
        &self,
        storage: &Arc<dyn Storage>,
        storage_path: &str,
    ) -> Result<String, DistributedError> {
        let path = self.address_path(storage_path);
        let mut attempts = 0;
        loop {
            match storage.read(&path).await {
                Ok(bytes) => {
                    let address = String::from_utf8_lossy(&bytes).trim().to_string();
                    return Ok(address);
                }
                Err(StorageError::NotFound { .. }) => {
                    attempts += 1;
                    if attempts > self.max_poll_attempts {
                        return Err(DistributedError::CoordinatorTimeout { path });
                    }
                    info!(%path, attempts, "waiting for the scheduler address file");
                    tokio::time::sleep(Duration::from_secs(self.poll_interval_secs)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// This host's address on the local network, discovered through a routable
/// (but never sent) datagram.
fn local_ip() -> std::io::Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorage;

    #[tokio::test]
    async fn worker_times_out_waiting_for_the_coordinator() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let job = SchedulerJob {
            poll_interval_secs: 0,
            max_poll_attempts: 3,
            ..Default::default()
        };
        let err = job
            .wait_for_coordinator(&storage, "mem://jobs/run-1")
            .await
            .unwrap_err();
        assert!(matches!(err, DistributedError::CoordinatorTimeout { .. }));
    }

    #[tokio::test]
    async fn worker_picks_up_a_published_address() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        storage
            .write(
                "mem://jobs/run-1/coordinator.addr",
                bytes::Bytes::from_static(b"10.1.2.3:8786\n"),
            )
            .await
            .unwrap();
        let job = SchedulerJob::default();
        let address = job
            .wait_for_coordinator(&storage, "mem://jobs/run-1")
            .await
            .unwrap();
        assert_eq!(address, "10.1.2.3:8786");
    }
}
