//! Distribution of reconstruction jobs over device slots with limited memory.
//!
//! Each device can hold `floor(free_mb / job_mb)` jobs. When the request exceeds the total
//! capacity every slot is used; otherwise the load is balanced: one job per device with room,
//! proportional shares of what is still needed, then single jobs until the request is met.
//!
//! Memory figures come from a [`DeviceInventory`] for the local host and a [`HostProbe`] per
//! cluster host. The probes run in parallel, one scoped thread per host. The only probe shipped
//! here is [`StaticInventory`], which reports the configured `device_memory_mb` for every device
//! of every host; querying live device memory on remote hosts is left to other probe
//! implementations.

use super::config::ReconstructionConfig;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::thread;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("No device has room for a job of {job_mb:.1} MB")]
    NoCapacity { job_mb: f64 },

    #[error("Invalid allocation request: {0}")]
    InvalidRequest(String),

    #[error("Probing host '{host}' failed: {reason}")]
    Probe { host: String, reason: String },

    #[error("Failed to write hostfile: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemory {
    pub device: i32,
    pub free_mb: u64,
}

/// Source of free-memory figures for the devices of the local host.
pub trait DeviceInventory {
    fn free_memory(&self) -> Result<Vec<DeviceMemory>, AllocationError>;
}

/// Source of free-memory figures for the devices of a remote host.
pub trait HostProbe: Sync {
    fn probe(&self, host: &str, devices: &[i32]) -> Result<Vec<DeviceMemory>, AllocationError>;
}

/// Inventory that reports the same configured amount of free memory for every device, locally
/// and on every probed host.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticInventory {
    devices: Vec<i32>,
    free_mb: u64,
}

impl StaticInventory {
    pub fn new(devices: Vec<i32>, free_mb: u64) -> Self {
        Self { devices, free_mb }
    }

    pub fn from_config(config: &ReconstructionConfig) -> Self {
        Self::new(config.devices.clone(), config.device_memory_mb)
    }
}

impl DeviceInventory for StaticInventory {
    fn free_memory(&self) -> Result<Vec<DeviceMemory>, AllocationError> {
        Ok(self
            .devices
            .iter()
            .map(|&device| DeviceMemory {
                device,
                free_mb: self.free_mb,
            })
            .collect())
    }
}

impl HostProbe for StaticInventory {
    fn probe(&self, _host: &str, devices: &[i32]) -> Result<Vec<DeviceMemory>, AllocationError> {
        Ok(devices
            .iter()
            .map(|&device| DeviceMemory {
                device,
                free_mb: self.free_mb,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Single,
    FastGa,
    PopulousGa,
}

impl JobMode {
    pub fn for_config(config: &ReconstructionConfig) -> Self {
        match &config.ga {
            None => JobMode::Single,
            Some(ga) if ga.fast => JobMode::FastGa,
            Some(_) => JobMode::PopulousGa,
        }
    }

    fn factors(self) -> (f64, f64) {
        match self {
            JobMode::Single => (170.0, 100.0),
            JobMode::FastGa => (184.0, 428.0),
            JobMode::PopulousGa => (250.0, 0.0),
        }
    }
}

/// Memory in MB needed by one job over a dataset of `voxels` elements.
pub fn estimate_job_size(voxels: usize, mode: JobMode, coherence: bool) -> f64 {
    let (factor, constant) = mode.factors();
    let size = voxels as f64 * factor / 1e6 + constant;
    if coherence { size * 2.0 } else { size }
}

fn capacity(free_mb: u64, job_mb: f64) -> usize {
    if job_mb <= 0.0 {
        return 0;
    }
    (free_mb as f64 / job_mb).floor() as usize
}

/// Jobs per slot for `request` jobs over slots with the given capacities.
pub fn balanced_load(capacities: &[usize], request: usize) -> Vec<usize> {
    let total: usize = capacities.iter().sum();
    if total <= request {
        return capacities.to_vec();
    }

    let mut load = vec![0usize; capacities.len()];
    let mut remaining: Vec<usize> = capacities.to_vec();
    let mut need = request;
    let mut available = total;

    for (slot, room) in remaining.iter_mut().enumerate() {
        if need == 0 {
            return load;
        }
        if *room > 0 {
            load[slot] = 1;
            *room -= 1;
            need -= 1;
            available -= 1;
        }
    }
    if need == 0 {
        return load;
    }

    let ratio = need as f64 / available as f64;
    for (slot, room) in remaining.iter_mut().enumerate() {
        let share = ((*room as f64) * ratio).floor() as usize;
        let share = share.min(*room).min(need);
        load[slot] += share;
        *room -= share;
        need -= share;
    }

    while need > 0 {
        let mut placed = false;
        for (slot, room) in remaining.iter_mut().enumerate() {
            if need == 0 {
                break;
            }
            if *room > 0 {
                load[slot] += 1;
                *room -= 1;
                need -= 1;
                placed = true;
            }
        }
        if !placed {
            break;
        }
    }
    load
}

fn unpack<T: Clone>(keys: &[T], load: &[usize]) -> Vec<T> {
    keys.iter()
        .zip(load)
        .flat_map(|(key, &count)| std::iter::repeat_n(key.clone(), count))
        .collect()
}

/// Realized local assignment: one device entry per job, grouped by device.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub jobs: usize,
    pub devices: Vec<i32>,
}

pub fn allocate_local(
    inventory: &impl DeviceInventory,
    request: usize,
    job_mb: f64,
) -> Result<Allocation, AllocationError> {
    if request == 0 {
        return Err(AllocationError::InvalidRequest(
            "at least one job must be requested".into(),
        ));
    }
    let memory = inventory.free_memory()?;
    let capacities: Vec<usize> = memory.iter().map(|m| capacity(m.free_mb, job_mb)).collect();
    let load = balanced_load(&capacities, request);
    let keys: Vec<i32> = memory.iter().map(|m| m.device).collect();
    let devices = unpack(&keys, &load);
    if devices.is_empty() {
        return Err(AllocationError::NoCapacity { job_mb });
    }
    if devices.len() < request {
        warn!(
            requested = request,
            realized = devices.len(),
            "Device memory limits the number of jobs."
        );
    }
    debug!(?devices, "Local allocation.");
    Ok(Allocation {
        jobs: devices.len(),
        devices,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostAssignment {
    pub host: String,
    /// One entry per job placed on this host.
    pub devices: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAllocation {
    pub jobs: usize,
    pub hosts: Vec<HostAssignment>,
}

impl ClusterAllocation {
    /// `host:count` lines for the process launcher.
    pub fn hostfile_contents(&self) -> String {
        self.hosts
            .iter()
            .map(|h| format!("{}:{}\n", h.host, h.devices.len()))
            .collect()
    }

    pub fn write_hostfile(&self, path: &Path) -> Result<(), AllocationError> {
        fs::write(path, self.hostfile_contents())?;
        Ok(())
    }
}

/// Probes every host concurrently, balances the request over the combined host+device slots,
/// then regroups the result by host. Hosts whose probe fails contribute no slots.
pub fn allocate_cluster(
    probe: &impl HostProbe,
    hosts: &BTreeMap<String, Vec<i32>>,
    request: usize,
    job_mb: f64,
) -> Result<ClusterAllocation, AllocationError> {
    if request == 0 {
        return Err(AllocationError::InvalidRequest(
            "at least one job must be requested".into(),
        ));
    }
    let probed: Vec<(String, Vec<DeviceMemory>)> = thread::scope(|scope| {
        let handles: Vec<_> = hosts
            .iter()
            .map(|(host, devices)| {
                (
                    host.clone(),
                    scope.spawn(move || probe.probe(host, devices)),
                )
            })
            .collect();
        handles
            .into_iter()
            .map(|(host, handle)| {
                let memory = match handle.join() {
                    Ok(Ok(memory)) => memory,
                    Ok(Err(e)) => {
                        warn!(%host, error = %e, "Host probe failed; skipping host.");
                        Vec::new()
                    }
                    Err(_) => {
                        warn!(%host, "Host probe panicked; skipping host.");
                        Vec::new()
                    }
                };
                (host, memory)
            })
            .collect()
    });

    let mut slots: Vec<(String, i32)> = Vec::new();
    let mut capacities = Vec::new();
    for (host, memory) in &probed {
        for m in memory {
            slots.push((host.clone(), m.device));
            capacities.push(capacity(m.free_mb, job_mb));
        }
    }
    let load = balanced_load(&capacities, request);
    let picked = unpack(&slots, &load);
    if picked.is_empty() {
        return Err(AllocationError::NoCapacity { job_mb });
    }

    let mut grouped: Vec<HostAssignment> = Vec::new();
    for (host, device) in picked {
        match grouped.last_mut() {
            Some(last) if last.host == host => last.devices.push(device),
            _ => grouped.push(HostAssignment {
                host,
                devices: vec![device],
            }),
        }
    }
    let jobs = grouped.iter().map(|h| h.devices.len()).sum();
    info!(jobs, hosts = grouped.len(), "Cluster allocation.");
    Ok(ClusterAllocation {
        jobs,
        hosts: grouped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn request_beyond_capacity_uses_every_slot() {
        assert_eq!(balanced_load(&[2, 1, 0], 5), vec![2, 1, 0]);
        let inventory = StaticInventory::new(vec![0], 300);
        let allocation = allocate_local(&inventory, 5, 100.0).unwrap();
        assert_eq!(allocation.jobs, 3);
        assert_eq!(allocation.devices, vec![0, 0, 0]);
    }

    #[test]
    fn load_is_spread_before_being_stacked() {
        assert_eq!(balanced_load(&[4, 4, 4], 3), vec![1, 1, 1]);
        assert_eq!(balanced_load(&[4, 4, 4], 2), vec![1, 1, 0]);
    }

    #[test]
    fn remainder_is_shared_proportionally() {
        let load = balanced_load(&[10, 2, 0], 6);
        assert_eq!(load, vec![5, 1, 0]);
        assert_eq!(load.iter().sum::<usize>(), 6);
    }

    #[test]
    fn balanced_load_never_exceeds_capacity() {
        let capacities = [7, 3, 5, 1, 9];
        for request in 1..=25 {
            let load = balanced_load(&capacities, request);
            let total: usize = load.iter().sum();
            assert_eq!(total, request.min(25));
            assert!(load.iter().zip(&capacities).all(|(l, c)| l <= c));
        }
    }

    #[test]
    fn zero_capacity_is_an_error() {
        let inventory = StaticInventory::new(vec![0, 1], 50);
        let result = allocate_local(&inventory, 2, 100.0);
        assert!(matches!(result, Err(AllocationError::NoCapacity { .. })));
    }

    #[test]
    fn job_size_follows_mode_factors() {
        assert!((estimate_job_size(1_000_000, JobMode::Single, false) - 270.0).abs() < 1e-9);
        assert!((estimate_job_size(1_000_000, JobMode::FastGa, false) - 612.0).abs() < 1e-9);
        assert!((estimate_job_size(1_000_000, JobMode::PopulousGa, true) - 500.0).abs() < 1e-9);
    }

    struct FailingProbe;

    impl HostProbe for FailingProbe {
        fn probe(&self, host: &str, devices: &[i32]) -> Result<Vec<DeviceMemory>, AllocationError> {
            if host == "down" {
                return Err(AllocationError::Probe {
                    host: host.into(),
                    reason: "unreachable".into(),
                });
            }
            Ok(devices
                .iter()
                .map(|&device| DeviceMemory {
                    device,
                    free_mb: 200,
                })
                .collect())
        }
    }

    #[test]
    fn static_inventory_answers_every_host_from_configuration() {
        let inventory = StaticInventory::new(vec![0], 300);
        let memory = inventory.probe("node7", &[2, 5]).unwrap();
        assert_eq!(
            memory,
            [
                DeviceMemory { device: 2, free_mb: 300 },
                DeviceMemory { device: 5, free_mb: 300 },
            ]
        );

        let mut hosts = BTreeMap::new();
        hosts.insert("a".to_string(), vec![0]);
        hosts.insert("b".to_string(), vec![0, 1]);
        let allocation = allocate_cluster(&inventory, &hosts, 10, 100.0).unwrap();
        assert_eq!(allocation.jobs, 9);
    }

    #[test]
    fn cluster_allocation_groups_by_host_and_writes_hostfile() {
        let mut hosts = BTreeMap::new();
        hosts.insert("alpha".to_string(), vec![0, 1]);
        hosts.insert("beta".to_string(), vec![3]);
        hosts.insert("down".to_string(), vec![0]);

        let allocation = allocate_cluster(&FailingProbe, &hosts, 4, 100.0).unwrap();
        assert_eq!(allocation.jobs, 4);
        assert_eq!(allocation.hosts.len(), 2);
        assert_eq!(allocation.hosts[0].host, "alpha");
        assert_eq!(allocation.hosts[1].devices, vec![3]);

        let dir = tempdir().unwrap();
        let path = dir.path().join("hostfile");
        allocation.write_hostfile(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "alpha:3\nbeta:1\n");
    }
}
