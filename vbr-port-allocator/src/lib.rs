//! NBD Port Allocator (§4.2): a bounded pool of TCP ports, default
//! 10100..=10200 (101 ports). Thread-safe; an O(N) scan at N=101 is cheap
//! enough that we don't need anything fancier than a guarded map.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use vbr_api_types::{CoreError, JobId, PortAllocation};

struct AllocatorState {
    allocations: HashMap<u16, PortAllocation>,
}

pub struct PortAllocator {
    range_start: u16,
    range_end: u16, // inclusive
    state: RwLock<AllocatorState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortAllocatorMetrics {
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
    pub utilization_percent: f64,
    pub range: (u16, u16),
}

impl PortAllocator {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        assert!(range_end >= range_start, "port range must not be empty");
        Self {
            range_start,
            range_end,
            state: RwLock::new(AllocatorState {
                allocations: HashMap::new(),
            }),
        }
    }

    pub fn total(&self) -> usize {
        (self.range_end - self.range_start) as usize + 1
    }

    /// Hand out the lowest free port in the configured range.
    pub fn allocate(
        &self,
        job_id: &JobId,
        vm_name: &str,
        disk_index: u32,
        export_name: &str,
    ) -> Result<u16, CoreError> {
        let mut state = self.state.write().expect("port allocator lock poisoned");

        for port in self.range_start..=self.range_end {
            if !state.allocations.contains_key(&port) {
                state.allocations.insert(
                    port,
                    PortAllocation {
                        port,
                        job_id: job_id.clone(),
                        disk_index,
                        vm_name: vm_name.to_string(),
                        allocated_at: Utc::now(),
                    },
                );
                info!(
                    "port allocator: allocated port {port} to job {job_id} vm '{vm_name}' disk {disk_index} export '{export_name}'"
                );
                return Ok(port);
            }
        }

        let available = self.total() - state.allocations.len();
        Err(CoreError::PortsExhausted {
            needed: 1,
            available,
        })
    }

    /// Allocate one port per disk, rolling back everything allocated so far
    /// on the first exhaustion (§8 property 10: N+1 disks against N free
    /// ports must leave no partial side effects on the pool).
    pub fn allocate_for_job(
        &self,
        job_id: &JobId,
        vm_name: &str,
        disk_count: u32,
        export_name_fn: impl Fn(u32) -> String,
    ) -> Result<Vec<(u32, u16)>, CoreError> {
        let mut granted = Vec::with_capacity(disk_count as usize);
        for disk_index in 0..disk_count {
            match self.allocate(job_id, vm_name, disk_index, &export_name_fn(disk_index)) {
                Ok(port) => granted.push((disk_index, port)),
                Err(err) => {
                    for (_, port) in &granted {
                        self.release(*port);
                    }
                    return Err(err);
                }
            }
        }
        Ok(granted)
    }

    /// Releasing an already-free port is a no-op (§8 property 8).
    pub fn release(&self, port: u16) -> bool {
        let mut state = self.state.write().expect("port allocator lock poisoned");
        match state.allocations.remove(&port) {
            Some(alloc) => {
                let held_for = Utc::now().signed_duration_since(alloc.allocated_at);
                info!(
                    "port allocator: released port {port} (job {}, held for {}ms)",
                    alloc.job_id,
                    held_for.num_milliseconds()
                );
                true
            }
            None => false,
        }
    }

    pub fn release_by_job_id(&self, job_id: &JobId) -> usize {
        let ports: Vec<u16> = {
            let state = self.state.read().expect("port allocator lock poisoned");
            state
                .allocations
                .values()
                .filter(|a| &a.job_id == job_id)
                .map(|a| a.port)
                .collect()
        };
        let count = ports.len();
        for port in ports {
            self.release(port);
        }
        count
    }

    pub fn metrics(&self) -> PortAllocatorMetrics {
        let state = self.state.read().expect("port allocator lock poisoned");
        let total = self.total();
        let allocated = state.allocations.len();
        PortAllocatorMetrics {
            total,
            allocated,
            available: total - allocated,
            utilization_percent: if total == 0 {
                0.0
            } else {
                100.0 * allocated as f64 / total as f64
            },
            range: (self.range_start, self.range_end),
        }
    }

    /// Current allocations, for diagnostics and for the REST metrics surface.
    pub fn snapshot(&self) -> Vec<PortAllocation> {
        let state = self.state.read().expect("port allocator lock poisoned");
        state.allocations.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(n: u32) -> JobId {
        format!("job-20260101-000000.{:03}-{:06x}", n % 1000, n)
            .parse()
            .unwrap()
    }

    #[test]
    fn allocates_lowest_free_port_first() {
        let allocator = PortAllocator::new(10100, 10101);
        let p1 = allocator.allocate(&job(1), "vm1", 0, "disk0").unwrap();
        let p2 = allocator.allocate(&job(1), "vm1", 1, "disk1").unwrap();
        assert_eq!(p1, 10100);
        assert_eq!(p2, 10101);
    }

    #[test]
    fn exhaustion_reports_no_duplicates_and_no_leak() {
        let allocator = PortAllocator::new(10100, 10101); // 2 ports
        let err = allocator
            .allocate_for_job(&job(2), "vm2", 3, |i| format!("disk{i}"))
            .unwrap_err();
        assert!(matches!(err, CoreError::PortsExhausted { .. }));
        // rollback must have released whatever got allocated before the failure
        assert_eq!(allocator.metrics().allocated, 0);
    }

    #[test]
    fn releasing_free_port_is_noop() {
        let allocator = PortAllocator::new(10100, 10110);
        assert!(!allocator.release(10105));
    }

    #[test]
    fn allocated_ports_are_subset_of_range_with_no_duplicates() {
        let allocator = PortAllocator::new(10100, 10102); // 3 ports
        let j = job(5);
        let granted = allocator
            .allocate_for_job(&j, "vm5", 3, |i| format!("disk{i}"))
            .unwrap();
        let mut ports: Vec<u16> = granted.iter().map(|(_, p)| *p).collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![10100, 10101, 10102]);

        let released = allocator.release_by_job_id(&j);
        assert_eq!(released, 3);
        assert_eq!(allocator.metrics().allocated, 0);
    }

    #[test]
    fn release_by_job_id_only_touches_that_job() {
        let allocator = PortAllocator::new(10100, 10103);
        let j1 = job(10);
        let j2 = job(11);
        allocator.allocate(&j1, "vm1", 0, "disk0").unwrap();
        allocator.allocate(&j2, "vm2", 0, "disk0").unwrap();
        assert_eq!(allocator.release_by_job_id(&j1), 1);
        assert_eq!(allocator.metrics().allocated, 1);
    }
}
