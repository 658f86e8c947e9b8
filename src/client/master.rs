//! Control-plane client
//!
//! Best-effort HTTP client for the master. Clients read the volume
//! descriptor, statistics and partition map; metanodes register themselves
//! and fetch the partitions they are expected to host. Requests rotate
//! through the configured master addresses until one answers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::partition::Partition;
use crate::error::{Error, Result};

/// Lifecycle state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum VolStatus {
    ReadWrite,
    MarkDeleted,
    ReadOnly,
}

impl TryFrom<u8> for VolStatus {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(VolStatus::ReadWrite),
            2 => Ok(VolStatus::MarkDeleted),
            3 => Ok(VolStatus::ReadOnly),
            other => Err(format!("unknown volume status {}", other)),
        }
    }
}

impl From<VolStatus> for u8 {
    fn from(status: VolStatus) -> Self {
        match status {
            VolStatus::ReadWrite => 1,
            VolStatus::MarkDeleted => 2,
            VolStatus::ReadOnly => 3,
        }
    }
}

/// Volume descriptor from `/admin/getVol`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub s3_endpoint: String,
    pub status: VolStatus,
}

/// Capacity figures from `/client/volStat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolStat {
    pub total_size: u64,
    pub used_size: u64,
    #[serde(default)]
    pub inode_count: u64,
    pub status: VolStatus,
}

/// Partition map from `/client/vol`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeView {
    pub name: String,
    pub status: VolStatus,
    pub partitions: Vec<Partition>,
}

/// Cluster identity from `/admin/getIp`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster: String,
    /// Address of the caller as seen by the master
    pub ip: String,
}

/// A metanode's record on the master, from `/metaNode/get`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaNodeInfo {
    pub addr: String,
    #[serde(default)]
    pub persistence_meta_partitions: Vec<u64>,
}

/// Outcome of registering a metanode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub cluster: String,
    pub node_id: u64,
}

/// HTTP client for the master
pub struct MasterClient {
    hosts: Vec<String>,
    /// Index of the host that answered last
    leader: AtomicUsize,
    http: reqwest::Client,
}

impl MasterClient {
    /// Create a client for the given master addresses
    pub fn new(hosts: Vec<String>, timeout: Duration) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::Config("no master address configured".into()));
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let hosts = hosts
            .into_iter()
            .map(|host| {
                if host.starts_with("http://") || host.starts_with("https://") {
                    host.trim_end_matches('/').to_string()
                } else {
                    format!("http://{}", host.trim_end_matches('/'))
                }
            })
            .collect();

        Ok(Self {
            hosts,
            leader: AtomicUsize::new(0),
            http,
        })
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub async fn get_volume(&self, name: &str) -> Result<VolumeInfo> {
        self.get_json("/admin/getVol", &[("name", name)]).await
    }

    pub async fn vol_stat(&self, name: &str) -> Result<VolStat> {
        self.get_json("/client/volStat", &[("name", name)]).await
    }

    pub async fn volume_view(&self, name: &str) -> Result<VolumeView> {
        self.get_json("/client/vol", &[("name", name)]).await
    }

    pub async fn cluster_info(&self) -> Result<ClusterInfo> {
        self.get_json("/admin/getIp", &[]).await
    }

    /// Register the metanode serving at `addr`
    ///
    /// An `addr` without a host (`":17210"`) is completed with the address
    /// the master sees this node at.
    pub async fn register_meta_node(&self, addr: &str) -> Result<Registration> {
        let cluster = self.cluster_info().await?;
        let addr = match addr.strip_prefix(':') {
            Some(port) => format!("{}:{}", cluster.ip, port),
            None => addr.to_string(),
        };

        let response = self
            .call(reqwest::Method::POST, "/metaNode/add", &[("addr", addr.as_str())])
            .await?;
        let body = response.text().await?;
        let body = body.trim();
        if body.is_empty() {
            return Err(Error::Master("/metaNode/add returned an empty body".into()));
        }
        let node_id = body
            .parse()
            .map_err(|_| Error::Master(format!("/metaNode/add returned {:?}, not a node id", body)))?;

        Ok(Registration {
            cluster: cluster.cluster,
            node_id,
        })
    }

    /// Partitions the master expects the metanode at `addr` to host
    pub async fn assigned_partitions(&self, addr: &str) -> Result<Vec<u64>> {
        let info: MetaNodeInfo = self.get_json("/metaNode/get", &[("addr", addr)]).await?;
        Ok(info.persistence_meta_partitions)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self.call(reqwest::Method::GET, path, query).await?;
        Ok(response.json().await?)
    }

    /// Send to each master in turn, starting with the last one that answered
    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let start = self.leader.load(Ordering::Relaxed);
        let mut last_error = None;

        for i in 0..self.hosts.len() {
            let index = (start + i) % self.hosts.len();
            let url = format!("{}{}", self.hosts[index], path);

            match self.send(method.clone(), &url, query).await {
                Ok(response) => {
                    self.leader.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!("Master request {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(Error::Master(match last_error {
            Some(e) => format!("{} failed on every master: {}", path, e),
            None => format!("{} has no master to ask", path),
        }))
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let response = self
            .http
            .request(method, url)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }
}
