//! Metadata service seam
//!
//! Volumes are opened against a metadata service that returns the shard
//! table. [`ConductorClient`] talks to the conductor over HTTP;
//! [`StaticMetadata`] serves a fixed in-memory directory.

use blockio_common::config::ConductorConfig;
use blockio_common::{Error, HealthStatus, Result};
use blockio_transport::ShardRoute;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub index: usize,
    /// Comma-separated store addresses, preferred first
    pub store_ips: String,
    #[serde(default)]
    pub status: HealthStatus,
}

impl ShardInfo {
    /// Split the address list, dropping blanks
    #[must_use]
    pub fn parsed_store_ips(&self) -> Vec<String> {
        self.store_ips
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

/// Reply of an `open_volume` query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    #[serde(default)]
    pub status: String,
    pub volume_name: String,
    pub volume_size: u64,
    pub volume_id: u64,
    pub shard_count: usize,
    pub rep_count: usize,
    pub meta_ver: u16,
    #[serde(default)]
    pub snap_seq: u32,
    pub shards: Vec<ShardInfo>,
    #[serde(default)]
    pub ret_code: i32,
    #[serde(default)]
    pub reason: Option<String>,
}

impl VolumeInfo {
    /// Shard routes in shard order
    pub fn routes(&self) -> Result<Vec<ShardRoute>> {
        if self.shards.len() != self.shard_count {
            return Err(Error::metadata(format!(
                "volume {} lists {} shards, expected {}",
                self.volume_name,
                self.shards.len(),
                self.shard_count
            )));
        }
        let mut shards: Vec<&ShardInfo> = self.shards.iter().collect();
        shards.sort_by_key(|s| s.index);
        shards
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                let ips = s.parsed_store_ips();
                if s.index != i || ips.is_empty() {
                    return Err(Error::metadata(format!(
                        "volume {} shard {} has no usable store",
                        self.volume_name, s.index
                    )));
                }
                Ok(ShardRoute::new(i, ips))
            })
            .collect()
    }
}

/// Source of volume layouts
pub trait MetadataService: Send + Sync {
    fn open_volume(&self, volume: &str, snapshot: Option<&str>) -> Result<VolumeInfo>;
}

/// HTTP client of the conductor's `/s5c/` API
pub struct ConductorClient {
    base_url: String,
    http: reqwest::blocking::Client,
    retries: u32,
}

impl ConductorClient {
    pub fn new(config: &ConductorConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::configuration(format!("conductor client: {e}")))?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            http,
            retries: config.retries.max(1),
        })
    }

    fn query(&self, volume: &str, snapshot: Option<&str>) -> Result<VolumeInfo> {
        let url = format!("{}/s5c/", self.base_url);
        let reply: VolumeInfo = self
            .http
            .get(&url)
            .query(&[
                ("op", "open_volume"),
                ("volume_name", volume),
                ("snapshot_name", snapshot.unwrap_or("")),
            ])
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|e| Error::metadata(format!("{url}: {e}")))?
            .json()
            .map_err(|e| Error::metadata(format!("bad open_volume reply: {e}")))?;

        if reply.ret_code != 0 {
            let reason = reply.reason.clone().unwrap_or_default();
            return Err(Error::metadata(format!(
                "open_volume {volume} failed, code {}: {reason}",
                reply.ret_code
            )));
        }
        Ok(reply)
    }
}

impl MetadataService for ConductorClient {
    fn open_volume(&self, volume: &str, snapshot: Option<&str>) -> Result<VolumeInfo> {
        let mut last = Error::metadata("no attempt made");
        for attempt in 1..=self.retries {
            match self.query(volume, snapshot) {
                Ok(info) => {
                    debug!(
                        "Conductor returned {} shards for {}, meta_ver {}",
                        info.shard_count, volume, info.meta_ver
                    );
                    return Ok(info);
                }
                Err(e) => {
                    warn!("open_volume {} attempt {} failed: {}", volume, attempt, e);
                    last = e;
                }
            }
        }
        Err(last)
    }
}

/// In-memory volume directory
#[derive(Default)]
pub struct StaticMetadata {
    volumes: RwLock<HashMap<String, VolumeInfo>>,
}

impl StaticMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: VolumeInfo) {
        self.volumes.write().insert(info.volume_name.clone(), info);
    }

    /// Apply `f` to a registered volume
    pub fn update(&self, volume: &str, f: impl FnOnce(&mut VolumeInfo)) -> bool {
        self.volumes.write().get_mut(volume).map(f).is_some()
    }

    /// Describe a single-shard-per-64GiB volume placed on `stores`
    #[must_use]
    pub fn simple_volume(name: &str, volume_id: u64, size: u64, stores: &[&str]) -> VolumeInfo {
        let shard_count = usize::try_from(size.div_ceil(1 << blockio_common::SHARD_SIZE_ORDER))
            .unwrap_or(1)
            .max(1);
        VolumeInfo {
            status: "OK".into(),
            volume_name: name.into(),
            volume_size: size,
            volume_id,
            shard_count,
            rep_count: stores.len(),
            meta_ver: 0,
            snap_seq: 0,
            shards: (0..shard_count)
                .map(|index| ShardInfo {
                    index,
                    store_ips: stores.join(","),
                    status: HealthStatus::Ok,
                })
                .collect(),
            ret_code: 0,
            reason: None,
        }
    }
}

impl MetadataService for StaticMetadata {
    fn open_volume(&self, volume: &str, _snapshot: Option<&str>) -> Result<VolumeInfo> {
        self.volumes
            .read()
            .get(volume)
            .cloned()
            .ok_or_else(|| Error::VolumeNotFound(volume.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conductor_reply() {
        let json = r#"{
            "status": "OK", "volume_name": "vol1", "volume_size": 68719476736,
            "volume_id": 65536, "shard_count": 1, "rep_count": 3, "meta_ver": 2,
            "snap_seq": 0, "ret_code": 0,
            "shards": [{"index": 0, "store_ips": "10.0.0.1, 10.0.0.2,,10.0.0.3", "status": "OK"}]
        }"#;
        let info: VolumeInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.meta_ver, 2);
        let routes = info.routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].store_ips, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(routes[0].current_ip, 0);
    }

    #[test]
    fn test_routes_reject_missing_shard() {
        let mut info = StaticMetadata::simple_volume("v", 1, 2 << 36, &["a"]);
        assert_eq!(info.shard_count, 2);
        info.shards.pop();
        assert!(matches!(info.routes(), Err(Error::Metadata(_))));
    }

    #[test]
    fn test_static_directory() {
        let meta = StaticMetadata::new();
        meta.insert(StaticMetadata::simple_volume("v", 1, 1 << 30, &["a", "b"]));
        assert!(meta.update("v", |v| v.meta_ver = 4));
        assert_eq!(meta.open_volume("v", None).unwrap().meta_ver, 4);
        assert!(matches!(
            meta.open_volume("missing", None),
            Err(Error::VolumeNotFound(_))
        ));
    }
}
