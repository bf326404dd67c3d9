//! Process-wide coordinator state.
//!
//! Five read-mostly maps published as whole-map swaps: readers load the
//! current `Arc` and work against an immutable view; writers clone, mutate,
//! and publish under the single writers mutex. Everything hangs off an
//! explicit [`CoreContext`] handle passed to each component.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use kestrel_common::config::CoreConfig;
use kestrel_common::types::{IndexInstance, InstanceId, KeyspaceId, PartitionId, StreamId};

use crate::container::SnapshotContainer;
use crate::slice::Slice;
use crate::stats::CoreStats;
use crate::waiters::WaiterContainer;

/// One partition of an index instance with its storage slices.
#[derive(Clone)]
pub struct PartitionInstance {
    pub partition_id: PartitionId,
    pub slices: Vec<Arc<dyn Slice>>,
}

impl PartitionInstance {
    pub fn new(partition_id: PartitionId, slices: Vec<Arc<dyn Slice>>) -> Self {
        PartitionInstance {
            partition_id,
            slices,
        }
    }
}

pub type InstanceMap = HashMap<InstanceId, IndexInstance>;
/// Ordered by partition id so rollback walks partitions deterministically.
pub type PartitionMap = BTreeMap<PartitionId, PartitionInstance>;
pub type InstancePartitionMap = HashMap<InstanceId, PartitionMap>;
pub type SnapshotMap = HashMap<InstanceId, Arc<SnapshotContainer>>;
pub type WaiterMap = HashMap<InstanceId, Arc<WaiterContainer>>;

/// Derived routing: which instances each `(stream, keyspace)` feeds, flat and
/// bucketed per snapshot worker.
#[derive(Default, Clone)]
pub struct StreamRouting {
    pub inst_list: HashMap<(StreamId, KeyspaceId), Vec<InstanceId>>,
    pub insts_per_worker: HashMap<(StreamId, KeyspaceId), Vec<Vec<InstanceId>>>,
}

impl StreamRouting {
    /// Rebuild both routing maps from an instance map.
    pub fn rebuild(instances: &InstanceMap, num_workers: usize) -> Self {
        let mut inst_list: HashMap<(StreamId, KeyspaceId), Vec<InstanceId>> = HashMap::new();
        for inst in instances.values() {
            inst_list
                .entry((inst.stream, inst.defn.keyspace.clone()))
                .or_default()
                .push(inst.inst_id);
        }
        // Deterministic bucket assignment regardless of map iteration order.
        for list in inst_list.values_mut() {
            list.sort();
        }
        let insts_per_worker = inst_list
            .iter()
            .map(|(key, list)| {
                let mut buckets = vec![Vec::new(); num_workers.max(1)];
                for (i, inst) in list.iter().enumerate() {
                    buckets[i % num_workers.max(1)].push(*inst);
                }
                (key.clone(), buckets)
            })
            .collect();
        StreamRouting {
            inst_list,
            insts_per_worker,
        }
    }

    pub fn instances_for(&self, stream: StreamId, keyspace: &KeyspaceId) -> &[InstanceId] {
        self.inst_list
            .get(&(stream, keyspace.clone()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn worker_buckets(&self, stream: StreamId, keyspace: &KeyspaceId) -> Option<&Vec<Vec<InstanceId>>> {
        self.insts_per_worker.get(&(stream, keyspace.clone()))
    }
}

/// Shared coordinator state.
pub struct CoreContext {
    instances: RwLock<Arc<InstanceMap>>,
    partitions: RwLock<Arc<InstancePartitionMap>>,
    snapshots: RwLock<Arc<SnapshotMap>>,
    waiters: RwLock<Arc<WaiterMap>>,
    routing: RwLock<Arc<StreamRouting>>,
    config: RwLock<Arc<CoreConfig>>,
    /// Serialises writers across all five maps.
    maps_mu: Mutex<()>,
    pub stats: CoreStats,
    snap_id_counter: AtomicU64,
}

impl CoreContext {
    pub fn new(config: CoreConfig) -> Arc<Self> {
        Arc::new(CoreContext {
            instances: RwLock::new(Arc::new(HashMap::new())),
            partitions: RwLock::new(Arc::new(HashMap::new())),
            snapshots: RwLock::new(Arc::new(HashMap::new())),
            waiters: RwLock::new(Arc::new(HashMap::new())),
            routing: RwLock::new(Arc::new(StreamRouting::default())),
            config: RwLock::new(Arc::new(config)),
            maps_mu: Mutex::new(()),
            stats: CoreStats::new(),
            snap_id_counter: AtomicU64::new(0),
        })
    }

    /// Take the writers mutex. Held for the whole of any multi-map update.
    pub fn lock_maps(&self) -> MutexGuard<'_, ()> {
        self.maps_mu.lock()
    }

    pub fn instances(&self) -> Arc<InstanceMap> {
        self.instances.read().clone()
    }

    pub fn set_instances(&self, m: InstanceMap) {
        *self.instances.write() = Arc::new(m);
    }

    pub fn partitions(&self) -> Arc<InstancePartitionMap> {
        self.partitions.read().clone()
    }

    pub fn set_partitions(&self, m: InstancePartitionMap) {
        *self.partitions.write() = Arc::new(m);
    }

    pub fn snapshots(&self) -> Arc<SnapshotMap> {
        self.snapshots.read().clone()
    }

    pub fn set_snapshots(&self, m: SnapshotMap) {
        *self.snapshots.write() = Arc::new(m);
    }

    pub fn waiters(&self) -> Arc<WaiterMap> {
        self.waiters.read().clone()
    }

    pub fn set_waiters(&self, m: WaiterMap) {
        *self.waiters.write() = Arc::new(m);
    }

    pub fn routing(&self) -> Arc<StreamRouting> {
        self.routing.read().clone()
    }

    pub fn set_routing(&self, r: StreamRouting) {
        *self.routing.write() = Arc::new(r);
    }

    pub fn config(&self) -> Arc<CoreConfig> {
        self.config.read().clone()
    }

    pub fn set_config(&self, c: CoreConfig) {
        *self.config.write() = Arc::new(c);
    }

    pub fn next_snap_id(&self) -> u64 {
        self.snap_id_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn instance(&self, inst: InstanceId) -> Option<IndexInstance> {
        self.instances().get(&inst).cloned()
    }
}
