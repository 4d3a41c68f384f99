use crate::transport::CollectiveTransport;
use crate::types::Rank;
use std::collections::HashSet;

/// Identity of one worker in the collective group.
///
/// Only the local worker's `host` is resolved; peers are addressed by
/// rank alone and carry an empty host identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerDescriptor {
    pub rank: Rank,
    pub host: String,
}

impl std::fmt::Display for WorkerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.is_empty() {
            write!(f, "worker {}", self.rank)
        } else {
            write!(f, "worker {}@{}", self.rank, self.host)
        }
    }
}

/// Static membership table for the collective group, built once at
/// communicator construction. Never mutated afterwards.
#[derive(Debug, Clone)]
pub struct WorkerTopology {
    current: WorkerDescriptor,
    workers: HashSet<WorkerDescriptor>,
}

impl WorkerTopology {
    /// Build the membership table from the transport's view of the group.
    pub fn discover(transport: &dyn CollectiveTransport, host_override: Option<&str>) -> Self {
        let host = match host_override {
            Some(name) => name.to_owned(),
            None => transport.host_name(),
        };
        let current = WorkerDescriptor {
            rank: transport.rank(),
            host,
        };

        let world_size = transport.world_size();
        let mut workers = HashSet::with_capacity(world_size as usize);
        for rank in 0..world_size {
            if rank == current.rank {
                workers.insert(current.clone());
            } else {
                workers.insert(WorkerDescriptor {
                    rank,
                    host: String::new(),
                });
            }
        }

        Self { current, workers }
    }

    /// Snapshot of the full membership set.
    pub fn workers(&self) -> HashSet<WorkerDescriptor> {
        self.workers.clone()
    }

    /// The local worker's descriptor.
    pub fn current_worker(&self) -> &WorkerDescriptor {
        &self.current
    }

    /// Number of workers in the group.
    pub fn world_size(&self) -> u32 {
        self.workers.len() as u32
    }
}
