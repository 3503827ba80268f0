/// Per-kernel dispatch state machine.
///
/// A dispatcher binds to one launch request at a time, pulls placements from
/// its algorithm, sends map-work-group requests to the chosen compute units,
/// and releases resources as completions drain back. Several dispatchers
/// share one dispatching port; a completion message is consumed only by the
/// dispatcher that issued every id it acknowledges.
use std::collections::HashMap;

use crate::placement::{Placement, PlacementAlgorithm, PlacementPolicy};
use crate::port::{Fabric, MsgId, PortId};
use crate::protocol::{Cycle, LaunchKernelReq, MapWgReq, MsgHeader, Payload, Pid};
use crate::resource::{ConfigError, CuSpec};

/// Cycles to issue one map request, indexed by the work-group's wavefront
/// count (GCN work-groups hold at most 16 wavefronts).
const MAP_LATENCY_TABLE: [u64; 17] = [1, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

/// Fixed end-of-kernel drain before the completion response goes out.
const KERNEL_OVERHEAD: u64 = 1600;

/// The launch request a dispatcher is currently bound to.
#[derive(Debug, Clone, Copy)]
struct BoundKernel {
    req_id: MsgId,
    /// Port the launch came from; the completion response goes back there.
    driver: PortId,
    pid: Pid,
}

pub struct Dispatcher {
    name: String,
    /// Source port for driver-facing responses
    responding_port: PortId,
    /// Port map requests leave from and completions arrive on; shared with
    /// sibling dispatchers
    dispatching_port: PortId,
    alg: Box<dyn PlacementAlgorithm>,
    dispatching: Option<BoundKernel>,
    curr_wg: Option<Placement>,
    cycle_left: u64,
    num_dispatched: usize,
    num_completed: usize,
    inflight: HashMap<MsgId, Placement>,
}

impl Dispatcher {
    pub fn new(
        name: &str,
        responding_port: PortId,
        dispatching_port: PortId,
        policy: PlacementPolicy,
    ) -> Self {
        Dispatcher {
            name: name.to_string(),
            responding_port,
            dispatching_port,
            alg: policy.build(),
            dispatching: None,
            curr_wg: None,
            cycle_left: 0,
            num_dispatched: 0,
            num_completed: 0,
            inflight: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make a compute unit available to this dispatcher's algorithm.
    pub fn register_cu(&mut self, spec: &CuSpec) -> Result<(), ConfigError> {
        self.alg.register_cu(spec)
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatching.is_some()
    }

    /// Bind to a launch request and start walking its grid.
    pub fn start_dispatching(&mut self, header: MsgHeader, req: &LaunchKernelReq) {
        if self.is_dispatching() {
            panic!("{}: dispatcher is already dispatching a kernel", self.name);
        }

        self.alg.start_new_kernel(crate::kernel::KernelLaunchInfo {
            code_object: req.code_object,
            packet: req.packet,
            packet_address: req.packet_address,
            wg_filter: req.wg_filter.clone(),
        });

        self.dispatching = Some(BoundKernel {
            req_id: header.id,
            driver: header.src,
            pid: req.pid,
        });
        self.num_dispatched = 0;
        self.num_completed = 0;
    }

    /// Total work-groups of the bound kernel.
    pub fn num_wg(&self) -> usize {
        self.alg.num_wg()
    }

    pub fn num_dispatched(&self) -> usize {
        self.num_dispatched
    }

    pub fn num_completed(&self) -> usize {
        self.num_completed
    }

    /// Wavefront slots currently held on each compute unit, by this
    /// dispatcher's ledger.
    pub fn wf_slots_used(&self) -> Vec<usize> {
        let pool = self.alg.cu_pool();
        (0..pool.num_cus())
            .map(|i| pool.cu(i).wf_slots_total() - pool.cu(i).wf_slots_free())
            .collect()
    }

    pub fn tick(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        if self.cycle_left > 0 {
            self.cycle_left -= 1;
            return true;
        }

        let mut made_progress = false;

        if let Some(kernel) = self.dispatching {
            if self.kernel_completed() {
                made_progress |= self.complete_kernel(kernel, fabric, now);
            } else {
                made_progress |= self.dispatch_next_wg(kernel, fabric, now);
            }
        }

        made_progress |= self.process_messages_from_cus(fabric);

        made_progress
    }

    fn kernel_completed(&self) -> bool {
        self.curr_wg.is_none() && !self.alg.has_next() && self.num_completed >= self.num_dispatched
    }

    fn complete_kernel(&mut self, kernel: BoundKernel, fabric: &mut Fabric, now: Cycle) -> bool {
        let rsp = fabric.make_msg(
            self.responding_port,
            kernel.driver,
            now,
            Payload::LaunchKernelRsp {
                rsp_to: kernel.req_id,
            },
        );

        // A full driver port just means we try again next tick.
        match fabric.try_send(rsp) {
            Ok(()) => {
                self.dispatching = None;
                true
            }
            Err(_) => false,
        }
    }

    fn dispatch_next_wg(&mut self, kernel: BoundKernel, fabric: &mut Fabric, now: Cycle) -> bool {
        if self.curr_wg.is_none() {
            if !self.alg.has_next() {
                return false;
            }
            self.curr_wg = self.alg.next();
        }

        let Some(placement) = self.curr_wg.take() else {
            return false;
        };

        let req = fabric.make_msg(
            self.dispatching_port,
            placement.cu_port,
            now,
            Payload::MapWgReq(MapWgReq {
                pid: kernel.pid,
                wg: placement.wg.clone(),
                slots: placement.slots.clone(),
            }),
        );
        let req_id = req.id();

        match fabric.try_send(req) {
            Ok(()) => {
                self.cycle_left =
                    MAP_LATENCY_TABLE[placement.slots.len().min(MAP_LATENCY_TABLE.len() - 1)];
                self.num_dispatched += 1;
                self.inflight.insert(req_id, placement);
                true
            }
            Err(_) => {
                // Destination full; hold the placement and retry next tick.
                self.curr_wg = Some(placement);
                false
            }
        }
    }

    /// Drain one completion message if its ids are all ours. Ids belonging to
    /// a sibling dispatcher on the shared port are left untouched; a message
    /// mixing ours with someone else's indicates a modeling defect.
    fn process_messages_from_cus(&mut self, fabric: &mut Fabric) -> bool {
        let Some(msg) = fabric.peek(self.dispatching_port) else {
            return false;
        };
        let Payload::WgCompletionMsg { rsp_to } = &msg.payload else {
            return false;
        };

        let known = rsp_to
            .iter()
            .filter(|id| self.inflight.contains_key(id))
            .count();
        if known == 0 {
            return false;
        }
        if known < rsp_to.len() {
            panic!(
                "{}: completion acknowledges ids issued by more than one dispatcher",
                self.name
            );
        }

        let ids = rsp_to.clone();
        let _ = fabric.recv(self.dispatching_port);

        for id in ids {
            let placement = self
                .inflight
                .remove(&id)
                .unwrap_or_else(|| panic!("{}: completion for unknown map request", self.name));
            self.alg.free_resources(&placement);
            self.num_completed += 1;
            if self.num_completed == self.alg.num_wg() {
                self.cycle_left = KERNEL_OVERHEAD;
            }
        }

        true
    }
}
