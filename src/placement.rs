/// Work-group placement policies.
///
/// Each call, the placement algorithm turns "next work-group" into "chosen
/// compute unit" against the shared resource ledger. Three policies are
/// implemented, matching those found in GPU command processors:
///   - RoundRobin — rotate over units, baseline load spreading
///   - Greedy     — pack unit 0 before touching unit 1
///   - Partition  — static grid split per unit, with work stealing
///
/// A policy is selected once at construction via `PlacementPolicy::build()`.
use crate::kernel::{GridBuilder, KernelLaunchInfo, WorkGroup};
use crate::port::PortId;
use crate::resource::{ConfigError, CuResourcePool, CuSpec, WfSlot};

/// A committed placement decision: which compute unit runs the work-group
/// and where each wavefront landed. Immutable until freed.
#[derive(Debug, Clone)]
pub struct Placement {
    pub cu_id: usize,
    pub cu_port: PortId,
    pub wg: WorkGroup,
    pub slots: Vec<WfSlot>,
}

/// Contract shared by all placement policies. The dispatcher drives one
/// instance per kernel lifecycle.
pub trait PlacementAlgorithm {
    /// Make a compute unit's resources available to this algorithm.
    fn register_cu(&mut self, spec: &CuSpec) -> Result<(), ConfigError>;

    /// Reset progress state and start walking a new kernel's grid.
    fn start_new_kernel(&mut self, info: KernelLaunchInfo);

    /// Work-groups in the currently-dispatching kernel.
    fn num_wg(&self) -> usize;

    /// Whether any work-group is still waiting to be placed.
    fn has_next(&self) -> bool;

    /// Place the next work-group, or None if nothing fits this call.
    fn next(&mut self) -> Option<Placement>;

    /// Release the resources a completed work-group held.
    fn free_resources(&mut self, placement: &Placement);

    /// The resource ledger, for occupancy reporting.
    fn cu_pool(&self) -> &CuResourcePool;
}

fn make_placement(
    pool: &CuResourcePool,
    cu_id: usize,
    wg: WorkGroup,
    slots: Vec<WfSlot>,
) -> Placement {
    Placement {
        cu_id,
        cu_port: pool.cu(cu_id).dispatching_port(),
        wg,
        slots,
    }
}

// ---------------------------------------------------------------------------
// Round-robin
// ---------------------------------------------------------------------------

/// Scans units starting at a persisted circular pointer, advancing it past
/// every successful placement, so equal-sized work-groups spread evenly.
/// A work-group that fits nowhere is held and retried on the next call.
#[derive(Default)]
pub struct RoundRobinPlacement {
    pool: CuResourcePool,
    grid: Option<GridBuilder>,
    pending: Option<WorkGroup>,
    num_wg: usize,
    num_dispatched: usize,
    next_cu: usize,
}

impl RoundRobinPlacement {
    pub fn new() -> Self {
        RoundRobinPlacement::default()
    }
}

impl PlacementAlgorithm for RoundRobinPlacement {
    fn register_cu(&mut self, spec: &CuSpec) -> Result<(), ConfigError> {
        self.pool.register_cu(spec)
    }

    fn start_new_kernel(&mut self, info: KernelLaunchInfo) {
        let grid = GridBuilder::new(info);
        self.num_wg = grid.num_wg();
        self.grid = Some(grid);
        self.pending = None;
        self.num_dispatched = 0;
    }

    fn num_wg(&self) -> usize {
        self.num_wg
    }

    fn has_next(&self) -> bool {
        self.num_dispatched < self.num_wg
    }

    fn next(&mut self) -> Option<Placement> {
        let wg = self
            .pending
            .take()
            .or_else(|| self.grid.as_mut()?.next_wg())?;

        let num_cus = self.pool.num_cus();
        for i in 0..num_cus {
            let cu_id = (self.next_cu + i) % num_cus;
            if let Some(slots) = self.pool.cu_mut(cu_id).reserve(&wg) {
                self.next_cu = (cu_id + 1) % num_cus;
                self.num_dispatched += 1;
                return Some(make_placement(&self.pool, cu_id, wg, slots));
            }
        }

        self.pending = Some(wg);
        None
    }

    fn free_resources(&mut self, placement: &Placement) {
        self.pool.cu_mut(placement.cu_id).free(placement.wg.flat_id);
    }

    fn cu_pool(&self) -> &CuResourcePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Greedy
// ---------------------------------------------------------------------------

/// Always scans from unit 0, packing one unit full before spilling onto the
/// next. Keeps later units idle for as long as possible.
#[derive(Default)]
pub struct GreedyPlacement {
    pool: CuResourcePool,
    grid: Option<GridBuilder>,
    pending: Option<WorkGroup>,
    num_wg: usize,
    num_dispatched: usize,
}

impl GreedyPlacement {
    pub fn new() -> Self {
        GreedyPlacement::default()
    }
}

impl PlacementAlgorithm for GreedyPlacement {
    fn register_cu(&mut self, spec: &CuSpec) -> Result<(), ConfigError> {
        self.pool.register_cu(spec)
    }

    fn start_new_kernel(&mut self, info: KernelLaunchInfo) {
        let grid = GridBuilder::new(info);
        self.num_wg = grid.num_wg();
        self.grid = Some(grid);
        self.pending = None;
        self.num_dispatched = 0;
    }

    fn num_wg(&self) -> usize {
        self.num_wg
    }

    fn has_next(&self) -> bool {
        self.num_dispatched < self.num_wg
    }

    fn next(&mut self) -> Option<Placement> {
        let wg = self
            .pending
            .take()
            .or_else(|| self.grid.as_mut()?.next_wg())?;

        for cu_id in 0..self.pool.num_cus() {
            if let Some(slots) = self.pool.cu_mut(cu_id).reserve(&wg) {
                self.num_dispatched += 1;
                return Some(make_placement(&self.pool, cu_id, wg, slots));
            }
        }

        self.pending = Some(wg);
        None
    }

    fn free_resources(&mut self, placement: &Placement) {
        self.pool.cu_mut(placement.cu_id).free(placement.wg.flat_id);
    }

    fn cu_pool(&self) -> &CuResourcePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Static partition with stealing
// ---------------------------------------------------------------------------

struct PartitionState {
    grid: GridBuilder,
    dispatched: usize,
}

/// Splits the grid into ⌈total/units⌉-sized contiguous partitions, one per
/// compute unit, each with its own pre-skipped grid cursor. Units scan
/// partitions from a rotating pointer; a unit whose own partition quota is
/// filled steals the oldest buffered work-group from another partition.
/// Each partition's dispatched count still equals its static quota, no
/// matter which unit ran the stolen groups.
#[derive(Default)]
pub struct PartitionPlacement {
    pool: CuResourcePool,
    partitions: Vec<PartitionState>,
    /// One-slot lookahead per partition, staging the next unplaced
    /// work-group. Stealing takes from here.
    lookahead: Vec<Option<WorkGroup>>,
    next_partition: usize,
    num_wg: usize,
    num_dispatched: usize,
    quota: usize,
}

impl PartitionPlacement {
    pub fn new() -> Self {
        PartitionPlacement::default()
    }

    fn quota_filled(&self, partition: usize) -> bool {
        self.partitions[partition].dispatched >= self.quota
    }

    /// Pick the work-group partition `i`'s unit should try next, together
    /// with the partition it came from. Refills the lookahead slot from the
    /// partition's own cursor; once the quota is filled, steals the oldest
    /// buffered group from any other partition instead.
    fn next_wg(&mut self, partition: usize) -> Option<(WorkGroup, usize)> {
        if self.quota_filled(partition) {
            for (from, slot) in self.lookahead.iter().enumerate() {
                if let Some(wg) = slot {
                    return Some((wg.clone(), from));
                }
            }
            return None;
        }

        if self.lookahead[partition].is_none() {
            self.lookahead[partition] = self.partitions[partition].grid.next_wg();
        }

        self.lookahead[partition]
            .as_ref()
            .map(|wg| (wg.clone(), partition))
    }
}

impl PlacementAlgorithm for PartitionPlacement {
    fn register_cu(&mut self, spec: &CuSpec) -> Result<(), ConfigError> {
        self.pool.register_cu(spec)
    }

    fn start_new_kernel(&mut self, info: KernelLaunchInfo) {
        self.num_dispatched = 0;

        let num_cus = self.pool.num_cus();
        self.num_wg = GridBuilder::new(info.clone()).num_wg();
        self.quota = self.num_wg.div_ceil(num_cus.max(1));

        self.partitions.clear();
        for i in 0..num_cus {
            let mut grid = GridBuilder::new(info.clone());
            grid.skip(i * self.quota);
            self.partitions.push(PartitionState { grid, dispatched: 0 });
        }

        // Drop any lookahead left over from the previous kernel; a buffered
        // work-group must never leak across a kernel switch.
        self.lookahead = vec![None; num_cus];
    }

    fn num_wg(&self) -> usize {
        self.num_wg
    }

    fn has_next(&self) -> bool {
        self.num_dispatched < self.num_wg
    }

    fn next(&mut self) -> Option<Placement> {
        if self.num_dispatched >= self.num_wg {
            return None;
        }

        for index in 0..self.partitions.len() {
            let cu_id = (index + self.next_partition) % self.partitions.len();

            let Some((wg, from)) = self.next_wg(cu_id) else {
                continue;
            };

            if let Some(slots) = self.pool.cu_mut(cu_id).reserve(&wg) {
                self.lookahead[from] = None;
                self.partitions[from].dispatched += 1;
                self.num_dispatched += 1;
                self.next_partition = (cu_id + 1) % self.partitions.len();
                return Some(make_placement(&self.pool, cu_id, wg, slots));
            }
        }

        None
    }

    fn free_resources(&mut self, placement: &Placement) {
        self.pool.cu_mut(placement.cu_id).free(placement.wg.flat_id);
    }

    fn cu_pool(&self) -> &CuResourcePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Policy selector
// ---------------------------------------------------------------------------

/// Selectable placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPolicy {
    RoundRobin,
    Greedy,
    Partition,
}

impl PlacementPolicy {
    pub fn build(self) -> Box<dyn PlacementAlgorithm> {
        match self {
            PlacementPolicy::RoundRobin => Box::new(RoundRobinPlacement::new()),
            PlacementPolicy::Greedy => Box::new(GreedyPlacement::new()),
            PlacementPolicy::Partition => Box::new(PartitionPlacement::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlacementPolicy::RoundRobin => "round-robin",
            PlacementPolicy::Greedy => "greedy",
            PlacementPolicy::Partition => "partition",
        }
    }
}
