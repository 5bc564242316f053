//! NUMA-local assignment of receive queues to workers
//!
//! Every receive queue gets its own worker, and that worker must sit on the
//! same NUMA node as the device. The assignment is computed once at startup,
//! before any worker runs.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use thiserror::Error;
use tracing::info;

use crate::device::{DeviceId, DeviceQueues, QueueDescriptor};

/// A worker, identified by the CPU it is pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    pub id: WorkerId,
    pub numa_node: u32,
}

/// The queue a worker serves. Frames leave on the transmit queue with the
/// same index as the receive queue they arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub queue: QueueDescriptor,
    pub tx_queue: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignError {
    #[error("{device} is on unknown NUMA node {numa_node}")]
    InvalidDevice { device: DeviceId, numa_node: i32 },

    #[error("{device} has no receive queues")]
    NoQueues { device: DeviceId },

    #[error(
        "{device} needs {required} workers on NUMA node {numa_node}, only {available} available"
    )]
    NoLocalWorkers {
        device: DeviceId,
        numa_node: u32,
        required: usize,
        available: usize,
    },
}

/// Worker to queue bindings, ordered by worker id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueAssignment {
    bindings: BTreeMap<WorkerId, Binding>,
}

impl QueueAssignment {
    pub fn get(&self, worker: WorkerId) -> Option<&Binding> {
        self.bindings.get(&worker)
    }

    pub fn iter(&self) -> impl Iterator<Item = (WorkerId, &Binding)> {
        self.bindings.iter().map(|(&id, binding)| (id, binding))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Bind every receive queue of every device to a distinct worker on the
/// device's NUMA node.
///
/// Workers are taken per node in the order given; devices are served in
/// the order given. Either every queue is bound or an error is returned.
/// A worker id listed twice is only used once.
pub fn assign(
    devices: &[DeviceQueues],
    workers: &[WorkerContext],
) -> Result<QueueAssignment, AssignError> {
    let mut pools: BTreeMap<u32, VecDeque<WorkerId>> = BTreeMap::new();
    let mut seen = std::collections::BTreeSet::new();
    for worker in workers {
        if seen.insert(worker.id) {
            pools.entry(worker.numa_node).or_default().push_back(worker.id);
        }
    }

    let mut bindings = BTreeMap::new();
    let mut acquired = Vec::with_capacity(devices.len());

    for dev in devices {
        let Ok(numa_node) = u32::try_from(dev.numa_node) else {
            return Err(AssignError::InvalidDevice {
                device: dev.device,
                numa_node: dev.numa_node,
            });
        };
        // A node with no workers left is reported before a queueless device
        let required = dev.rx_queues as usize;
        let available = pools.get(&numa_node).map_or(0, VecDeque::len);
        if available == 0 {
            return Err(AssignError::NoLocalWorkers {
                device: dev.device,
                numa_node,
                required,
                available,
            });
        }
        if required == 0 {
            return Err(AssignError::NoQueues { device: dev.device });
        }
        if available < required {
            return Err(AssignError::NoLocalWorkers {
                device: dev.device,
                numa_node,
                required,
                available,
            });
        }

        let pool = pools.entry(numa_node).or_default();
        let mut lcores = Vec::with_capacity(required);
        for (queue, worker) in dev.descriptors().zip(pool.drain(..required)) {
            bindings.insert(
                worker,
                Binding {
                    queue,
                    tx_queue: queue.queue,
                },
            );
            lcores.push(worker.0);
        }
        acquired.push((dev.device, numa_node, lcores));
    }

    for (device, numa_node, lcores) in &acquired {
        info!(%device, numa_node, ?lcores, "Receive queues assigned");
    }

    Ok(QueueAssignment { bindings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn dev(id: u16, numa_node: i32, rx_queues: u16) -> DeviceQueues {
        DeviceQueues {
            device: DeviceId(id),
            numa_node,
            rx_queues,
        }
    }

    fn worker(cpu: usize, numa_node: u32) -> WorkerContext {
        WorkerContext {
            id: WorkerId(cpu),
            numa_node,
        }
    }

    #[test]
    fn test_single_node() {
        let devices = [dev(0, 0, 2)];
        let workers = [worker(1, 0), worker(2, 0), worker(3, 0)];
        let a = assign(&devices, &workers).unwrap();

        assert_eq!(a.len(), 2);
        assert_eq!(a.get(WorkerId(1)).unwrap().queue.queue, 0);
        assert_eq!(a.get(WorkerId(2)).unwrap().queue.queue, 1);
        assert_eq!(a.get(WorkerId(2)).unwrap().tx_queue, 1);
        assert!(a.get(WorkerId(3)).is_none());
    }

    #[test]
    fn test_two_nodes_stay_local() {
        let devices = [dev(0, 1, 2), dev(1, 0, 1)];
        let workers = [
            worker(1, 0),
            worker(2, 0),
            worker(8, 1),
            worker(9, 1),
        ];
        let a = assign(&devices, &workers).unwrap();

        assert_eq!(a.len(), 3);
        for (id, binding) in a.iter() {
            let node = workers.iter().find(|w| w.id == id).unwrap().numa_node;
            assert_eq!(node as i32, binding.queue.numa_node);
        }
        assert_eq!(a.get(WorkerId(8)).unwrap().queue.device, DeviceId(0));
        assert_eq!(a.get(WorkerId(1)).unwrap().queue.device, DeviceId(1));
    }

    #[test]
    fn test_every_queue_bound_exactly_once() {
        let devices = [dev(0, 0, 3), dev(1, 0, 2)];
        let workers: Vec<_> = (0..6).map(|cpu| worker(cpu, 0)).collect();
        let a = assign(&devices, &workers).unwrap();

        let queues: BTreeSet<_> = a.iter().map(|(_, b)| (b.queue.device, b.queue.queue)).collect();
        assert_eq!(queues.len(), 5);
        assert_eq!(a.len(), 5);
        let iter_order: Vec<_> = a.iter().map(|(id, _)| id.0).collect();
        assert_eq!(iter_order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_node() {
        let err = assign(&[dev(0, -1, 1)], &[worker(1, 0)]).unwrap_err();
        assert_eq!(
            err,
            AssignError::InvalidDevice {
                device: DeviceId(0),
                numa_node: -1
            }
        );
    }

    #[test]
    fn test_no_queues() {
        let err = assign(&[dev(2, 0, 0)], &[worker(1, 0)]).unwrap_err();
        assert_eq!(err, AssignError::NoQueues { device: DeviceId(2) });
    }

    #[test]
    fn test_not_enough_local_workers() {
        // Workers exist, but on the wrong node
        let err = assign(&[dev(0, 1, 2)], &[worker(1, 0), worker(2, 0), worker(3, 1)]).unwrap_err();
        assert_eq!(
            err,
            AssignError::NoLocalWorkers {
                device: DeviceId(0),
                numa_node: 1,
                required: 2,
                available: 1
            }
        );
    }

    #[test]
    fn test_pool_exhausted_by_earlier_device() {
        let err = assign(&[dev(0, 0, 2), dev(1, 0, 1)], &[worker(1, 0), worker(2, 0)]).unwrap_err();
        assert_eq!(
            err,
            AssignError::NoLocalWorkers {
                device: DeviceId(1),
                numa_node: 0,
                required: 1,
                available: 0
            }
        );
    }

    #[test]
    fn test_no_workers_on_node() {
        let err = assign(&[dev(0, 3, 1)], &[]).unwrap_err();
        assert!(matches!(
            err,
            AssignError::NoLocalWorkers {
                available: 0,
                required: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_queueless_device_on_empty_node() {
        let err = assign(&[dev(0, 3, 0)], &[]).unwrap_err();
        assert_eq!(
            err,
            AssignError::NoLocalWorkers {
                device: DeviceId(0),
                numa_node: 3,
                required: 0,
                available: 0
            }
        );
    }

    #[test]
    fn test_duplicate_worker_used_once() {
        let err = assign(&[dev(0, 0, 2)], &[worker(1, 0), worker(1, 0)]).unwrap_err();
        assert!(matches!(err, AssignError::NoLocalWorkers { available: 1, .. }));
    }

    #[test]
    fn test_no_devices() {
        let a = assign(&[], &[worker(1, 0)]).unwrap();
        assert!(a.is_empty());
    }
}
