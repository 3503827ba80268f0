/// Command processor: the device's front door.
///
/// Receives driver requests, hands kernel launches to a pool of dispatchers,
/// and sequences the global drain protocols (plain cache flush, TLB
/// shootdown, device restart) as strictly ordered phases. Each phase fans a
/// request out to one component class, counts acknowledgments down to zero,
/// and only then starts the next phase.
use std::collections::HashMap;

use crate::dispatcher::Dispatcher;
use crate::placement::PlacementPolicy;
use crate::port::{Fabric, MsgId, OutBuffer, PortId};
use crate::protocol::{
    AtCtrlOp, CacheFlushReq, Cycle, Message, Payload, ShootDownCmd, TlbFlushReq,
};
use crate::resource::{ConfigError, CuSpec};

/// Outstanding acknowledgments per component class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckCounts {
    pub cu: usize,
    pub at: usize,
    pub cache: usize,
    pub tlb: usize,
}

pub struct CommandProcessor {
    // Ports this component owns.
    to_driver: PortId,
    to_cus: PortId,
    to_ats: PortId,
    to_caches: PortId,
    to_tlbs: PortId,
    to_dma: PortId,
    to_pmc: PortId,

    // Peer ports.
    driver: PortId,
    dma: Option<PortId>,
    pmc: Option<PortId>,
    cus: Vec<PortId>,
    address_translators: Vec<PortId>,
    l1i_caches: Vec<PortId>,
    l1s_caches: Vec<PortId>,
    l1v_caches: Vec<PortId>,
    l2_caches: Vec<PortId>,
    tlbs: Vec<PortId>,

    dispatchers: Vec<Dispatcher>,

    // Staged outbound traffic, drained first thing every tick.
    out_driver: OutBuffer,
    out_cus: OutBuffer,
    out_ats: OutBuffer,
    out_caches: OutBuffer,
    out_tlbs: OutBuffer,
    out_dma: OutBuffer,
    out_pmc: OutBuffer,

    // Drain-protocol state.
    curr_flush: Option<Message>,
    curr_shootdown: Option<ShootDownCmd>,
    shootdown_in_process: bool,
    num_cu_ack: usize,
    num_at_flush_ack: usize,
    num_at_restart_ack: usize,
    num_cache_ack: usize,
    num_tlb_ack: usize,

    /// Cloned mem-copy id -> original driver request.
    mem_copy_origins: HashMap<MsgId, Message>,
}

impl CommandProcessor {
    /// Create the command processor, its ports, and its dispatcher pool.
    pub fn new(
        fabric: &mut Fabric,
        driver: PortId,
        num_dispatchers: usize,
        policy: PlacementPolicy,
        port_capacity: usize,
    ) -> Self {
        let to_driver = fabric.add_port("cp.to_driver", port_capacity);
        let dispatching_port = fabric.add_port("cp.dispatch", port_capacity);
        let to_cus = fabric.add_port("cp.to_cus", port_capacity);
        let to_ats = fabric.add_port("cp.to_ats", port_capacity);
        let to_caches = fabric.add_port("cp.to_caches", port_capacity);
        let to_tlbs = fabric.add_port("cp.to_tlbs", port_capacity);
        let to_dma = fabric.add_port("cp.to_dma", port_capacity);
        let to_pmc = fabric.add_port("cp.to_pmc", port_capacity);

        let dispatchers = (0..num_dispatchers)
            .map(|i| {
                Dispatcher::new(
                    &format!("cp.dispatcher{i}"),
                    to_driver,
                    dispatching_port,
                    policy,
                )
            })
            .collect();

        CommandProcessor {
            to_driver,
            to_cus,
            to_ats,
            to_caches,
            to_tlbs,
            to_dma,
            to_pmc,
            driver,
            dma: None,
            pmc: None,
            cus: Vec::new(),
            address_translators: Vec::new(),
            l1i_caches: Vec::new(),
            l1s_caches: Vec::new(),
            l1v_caches: Vec::new(),
            l2_caches: Vec::new(),
            tlbs: Vec::new(),
            dispatchers,
            out_driver: OutBuffer::new(),
            out_cus: OutBuffer::new(),
            out_ats: OutBuffer::new(),
            out_caches: OutBuffer::new(),
            out_tlbs: OutBuffer::new(),
            out_dma: OutBuffer::new(),
            out_pmc: OutBuffer::new(),
            curr_flush: None,
            curr_shootdown: None,
            shootdown_in_process: false,
            num_cu_ack: 0,
            num_at_flush_ack: 0,
            num_at_restart_ack: 0,
            num_cache_ack: 0,
            num_tlb_ack: 0,
            mem_copy_origins: HashMap::new(),
        }
    }

    /// Port the driver sends requests to.
    pub fn driver_port(&self) -> PortId {
        self.to_driver
    }

    /// Register a compute unit: its control port for the drain protocol and
    /// its declared resources for every dispatcher.
    pub fn register_cu(&mut self, spec: &CuSpec, control_port: PortId) -> Result<(), ConfigError> {
        self.cus.push(control_port);
        for d in &mut self.dispatchers {
            d.register_cu(spec)?;
        }
        Ok(())
    }

    pub fn register_address_translator(&mut self, port: PortId) {
        self.address_translators.push(port);
    }

    pub fn register_l1i_cache(&mut self, port: PortId) {
        self.l1i_caches.push(port);
    }

    pub fn register_l1s_cache(&mut self, port: PortId) {
        self.l1s_caches.push(port);
    }

    pub fn register_l1v_cache(&mut self, port: PortId) {
        self.l1v_caches.push(port);
    }

    pub fn register_l2_cache(&mut self, port: PortId) {
        self.l2_caches.push(port);
    }

    pub fn register_tlb(&mut self, port: PortId) {
        self.tlbs.push(port);
    }

    pub fn connect_dma(&mut self, port: PortId) {
        self.dma = Some(port);
    }

    pub fn connect_pmc(&mut self, port: PortId) {
        self.pmc = Some(port);
    }

    pub fn dispatchers(&self) -> &[Dispatcher] {
        &self.dispatchers
    }

    pub fn shootdown_in_process(&self) -> bool {
        self.shootdown_in_process
    }

    pub fn flush_in_process(&self) -> bool {
        self.curr_flush.is_some()
    }

    pub fn outstanding_acks(&self) -> AckCounts {
        AckCounts {
            cu: self.num_cu_ack,
            at: self.num_at_flush_ack + self.num_at_restart_ack,
            cache: self.num_cache_ack,
            tlb: self.num_tlb_ack,
        }
    }

    /// Whether any drain phase, kernel, or staged message is still moving.
    pub fn busy(&self) -> bool {
        self.shootdown_in_process
            || self.curr_flush.is_some()
            || self.num_cu_ack > 0
            || self.num_at_flush_ack > 0
            || self.num_at_restart_ack > 0
            || self.num_cache_ack > 0
            || self.num_tlb_ack > 0
            || !self.mem_copy_origins.is_empty()
            || self.dispatchers.iter().any(|d| d.is_dispatching())
            || !self.out_driver.is_empty()
            || !self.out_cus.is_empty()
            || !self.out_ats.is_empty()
            || !self.out_caches.is_empty()
            || !self.out_tlbs.is_empty()
            || !self.out_dma.is_empty()
            || !self.out_pmc.is_empty()
    }

    pub fn tick(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let mut made_progress = false;

        made_progress |= self.send_msgs_out(fabric);
        made_progress |= self.tick_dispatchers(fabric, now);
        made_progress |= self.process_req_from_driver(fabric, now);
        made_progress |= self.process_rsp_from_internal(fabric, now);

        made_progress
    }

    fn send_msgs_out(&mut self, fabric: &mut Fabric) -> bool {
        let mut made_progress = false;

        made_progress |= self.out_driver.drain(fabric);
        made_progress |= self.out_cus.drain(fabric);
        made_progress |= self.out_ats.drain(fabric);
        made_progress |= self.out_caches.drain(fabric);
        made_progress |= self.out_tlbs.drain(fabric);
        made_progress |= self.out_dma.drain(fabric);
        made_progress |= self.out_pmc.drain(fabric);

        made_progress
    }

    fn tick_dispatchers(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let mut made_progress = false;
        for d in &mut self.dispatchers {
            made_progress |= d.tick(fabric, now);
        }
        made_progress
    }

    // -----------------------------------------------------------------------
    // Driver requests
    // -----------------------------------------------------------------------

    fn process_req_from_driver(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let Some(msg) = fabric.peek(self.to_driver) else {
            return false;
        };
        let msg = msg.clone();

        match &msg.payload {
            Payload::LaunchKernelReq(req) => {
                let Some(d) = self.dispatchers.iter_mut().find(|d| !d.is_dispatching()) else {
                    return false;
                };
                d.start_dispatching(msg.header, req);
                let _ = fabric.recv(self.to_driver);
                true
            }
            Payload::FlushReq => self.process_flush_req(fabric, msg.clone(), now),
            Payload::ShootDownCmd(cmd) => {
                self.process_shootdown_cmd(fabric, cmd.clone(), now)
            }
            Payload::GpuRestartReq => self.process_gpu_restart_req(fabric, now),
            Payload::MemCopyH2DReq(_) | Payload::MemCopyD2HReq(_) => {
                self.process_mem_copy_req(fabric, msg.clone(), now)
            }
            Payload::PageMigrationReq(req) => {
                let Some(pmc) = self.pmc else {
                    panic!("page migration requested with no migration controller connected");
                };
                let relay =
                    fabric.make_msg(self.to_pmc, pmc, now, Payload::PageMigrationReq(*req));
                self.out_pmc.stage(relay);
                let _ = fabric.recv(self.to_driver);
                true
            }
            other => panic!(
                "unexpected request on the command processor driver port: {}",
                other.kind()
            ),
        }
    }

    /// A plain flush waits until all earlier cache traffic is acknowledged,
    /// then fans a writeback flush out to every cache.
    fn process_flush_req(&mut self, fabric: &mut Fabric, msg: Message, now: Cycle) -> bool {
        if self.num_cache_ack > 0 {
            return false;
        }

        for port in self.all_cache_ports() {
            let req = fabric.make_msg(
                self.to_caches,
                port,
                now,
                Payload::CacheFlushReq(CacheFlushReq::default()),
            );
            self.out_caches.stage(req);
            self.num_cache_ack += 1;
        }

        if self.num_cache_ack == 0 {
            // No caches registered: answer immediately.
            let rsp = fabric.make_msg(
                self.to_driver,
                msg.src(),
                now,
                Payload::GeneralRsp { rsp_to: msg.id() },
            );
            self.out_driver.stage(rsp);
        } else {
            self.curr_flush = Some(msg);
        }

        let _ = fabric.recv(self.to_driver);
        true
    }

    /// Phase 1 of a shootdown: drain every compute unit's pipeline.
    fn process_shootdown_cmd(&mut self, fabric: &mut Fabric, cmd: ShootDownCmd, now: Cycle) -> bool {
        if self.shootdown_in_process {
            return false;
        }

        self.curr_shootdown = Some(cmd);
        self.shootdown_in_process = true;

        for i in 0..self.cus.len() {
            let req = fabric.make_msg(self.to_cus, self.cus[i], now, Payload::CuPipelineFlushReq);
            self.out_cus.stage(req);
            self.num_cu_ack += 1;
        }

        let _ = fabric.recv(self.to_driver);
        true
    }

    /// Phase 1 of a restart: bring the caches back, L2 before the L1s.
    fn process_gpu_restart_req(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let ports: Vec<PortId> = self
            .l2_caches
            .iter()
            .chain(&self.l1i_caches)
            .chain(&self.l1s_caches)
            .chain(&self.l1v_caches)
            .copied()
            .collect();
        for port in ports {
            let req = fabric.make_msg(self.to_caches, port, now, Payload::CacheRestartReq);
            self.out_caches.stage(req);
            self.num_cache_ack += 1;
        }

        let _ = fabric.recv(self.to_driver);
        true
    }

    /// Mem-copy requests are deferred behind cache flushes, then relayed to
    /// the DMA engine under a fresh id so the response can be matched back.
    fn process_mem_copy_req(&mut self, fabric: &mut Fabric, msg: Message, now: Cycle) -> bool {
        if self.num_cache_ack > 0 {
            return false;
        }
        let Some(dma) = self.dma else {
            panic!("mem copy requested with no DMA engine connected");
        };

        let cloned = fabric.make_msg(self.to_dma, dma, now, msg.payload.clone());
        self.mem_copy_origins.insert(cloned.id(), msg);
        self.out_dma.stage(cloned);

        let _ = fabric.recv(self.to_driver);
        true
    }

    // -----------------------------------------------------------------------
    // Acknowledgments from device components
    // -----------------------------------------------------------------------

    fn process_rsp_from_internal(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let mut made_progress = false;

        made_progress |= self.process_rsp_from_dma(fabric, now);
        made_progress |= self.process_rsp_from_cus(fabric, now);
        made_progress |= self.process_rsp_from_ats(fabric, now);
        made_progress |= self.process_rsp_from_caches(fabric, now);
        made_progress |= self.process_rsp_from_tlbs(fabric, now);
        made_progress |= self.process_rsp_from_pmc(fabric, now);

        made_progress
    }

    fn process_rsp_from_dma(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let Some(msg) = fabric.peek(self.to_dma) else {
            return false;
        };

        match msg.payload {
            Payload::GeneralRsp { rsp_to } => {
                let Some(original) = self.mem_copy_origins.remove(&rsp_to) else {
                    panic!("DMA response matches no outstanding mem copy");
                };
                let rsp = fabric.make_msg(
                    self.to_driver,
                    original.src(),
                    now,
                    Payload::GeneralRsp {
                        rsp_to: original.id(),
                    },
                );
                self.out_driver.stage(rsp);
                let _ = fabric.recv(self.to_dma);
                true
            }
            ref other => panic!("unexpected message from the DMA engine: {}", other.kind()),
        }
    }

    fn process_rsp_from_cus(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let Some(msg) = fabric.peek(self.to_cus) else {
            return false;
        };

        match msg.payload {
            Payload::CuPipelineFlushRsp => {
                if self.num_cu_ack == 0 {
                    panic!("compute-unit flush acknowledgment that was never requested");
                }
                self.num_cu_ack -= 1;
                if self.num_cu_ack == 0 {
                    // Phase 2: tell the address translators to drop
                    // everything in flight.
                    for i in 0..self.address_translators.len() {
                        let req = fabric.make_msg(
                            self.to_ats,
                            self.address_translators[i],
                            now,
                            Payload::AtControlMsg {
                                op: AtCtrlOp::Discard,
                            },
                        );
                        self.out_ats.stage(req);
                        self.num_at_flush_ack += 1;
                    }
                }
                let _ = fabric.recv(self.to_cus);
                true
            }
            Payload::CuPipelineRestartRsp => {
                if self.num_cu_ack == 0 {
                    panic!("compute-unit restart acknowledgment that was never requested");
                }
                self.num_cu_ack -= 1;
                if self.num_cu_ack == 0 {
                    // Final restart phase done: report back to the driver.
                    let rsp =
                        fabric.make_msg(self.to_driver, self.driver, now, Payload::GpuRestartRsp);
                    self.out_driver.stage(rsp);
                }
                let _ = fabric.recv(self.to_cus);
                true
            }
            _ => false,
        }
    }

    /// Both control directions share one message type; which phase this ack
    /// belongs to follows from which counter is outstanding.
    fn process_rsp_from_ats(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let Some(msg) = fabric.peek(self.to_ats) else {
            return false;
        };

        match msg.payload {
            Payload::AtControlMsg { .. } => {}
            ref other => panic!(
                "unexpected message from an address translator: {}",
                other.kind()
            ),
        }

        if self.num_at_flush_ack > 0 {
            self.num_at_flush_ack -= 1;
            if self.num_at_flush_ack == 0 {
                // Phase 3 of the shootdown: destructive cache teardown.
                let ports: Vec<PortId> = self
                    .l1i_caches
                    .iter()
                    .chain(&self.l1s_caches)
                    .chain(&self.l1v_caches)
                    .chain(&self.l2_caches)
                    .copied()
                    .collect();
                for port in ports {
                    let req = fabric.make_msg(
                        self.to_caches,
                        port,
                        now,
                        Payload::CacheFlushReq(CacheFlushReq {
                            pause_after_flush: true,
                            discard_inflight: true,
                            invalidate_all_lines: true,
                        }),
                    );
                    self.out_caches.stage(req);
                    self.num_cache_ack += 1;
                }
            }
        } else if self.num_at_restart_ack > 0 {
            self.num_at_restart_ack -= 1;
            if self.num_at_restart_ack == 0 {
                // Restart phase 4: bring the compute-unit pipelines back.
                for i in 0..self.cus.len() {
                    let req = fabric.make_msg(
                        self.to_cus,
                        self.cus[i],
                        now,
                        Payload::CuPipelineRestartReq,
                    );
                    self.out_cus.stage(req);
                    self.num_cu_ack += 1;
                }
            }
        } else {
            panic!("address-translator acknowledgment that was never requested");
        }

        let _ = fabric.recv(self.to_ats);
        true
    }

    fn process_rsp_from_caches(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let Some(msg) = fabric.peek(self.to_caches) else {
            return false;
        };

        match msg.payload {
            Payload::CacheFlushRsp { .. } => {
                if self.num_cache_ack == 0 {
                    panic!("cache flush acknowledgment that was never requested");
                }
                self.num_cache_ack -= 1;
                let _ = fabric.recv(self.to_caches);

                if self.num_cache_ack == 0 {
                    if self.shootdown_in_process {
                        self.start_tlb_flush_phase(fabric, now);
                    } else {
                        self.finish_plain_flush(fabric, now);
                    }
                }
                true
            }
            Payload::CacheRestartRsp { .. } => {
                if self.num_cache_ack == 0 {
                    panic!("cache restart acknowledgment that was never requested");
                }
                self.num_cache_ack -= 1;
                if self.num_cache_ack == 0 {
                    // Restart phase 2: TLBs.
                    for i in 0..self.tlbs.len() {
                        let req =
                            fabric.make_msg(self.to_tlbs, self.tlbs[i], now, Payload::TlbRestartReq);
                        self.out_tlbs.stage(req);
                        self.num_tlb_ack += 1;
                    }
                }
                let _ = fabric.recv(self.to_caches);
                true
            }
            ref other => panic!("unexpected message from a cache: {}", other.kind()),
        }
    }

    /// Phase 4 of the shootdown: flush the process's translations from every
    /// TLB.
    fn start_tlb_flush_phase(&mut self, fabric: &mut Fabric, now: Cycle) {
        self.curr_flush = None;

        let Some(cmd) = self.curr_shootdown.clone() else {
            panic!("shootdown cache phase finished with no shootdown command stored");
        };

        for i in 0..self.tlbs.len() {
            let req = fabric.make_msg(
                self.to_tlbs,
                self.tlbs[i],
                now,
                Payload::TlbFlushReq(TlbFlushReq {
                    pid: cmd.pid,
                    vaddrs: cmd.vaddrs.clone(),
                }),
            );
            self.out_tlbs.stage(req);
            self.num_tlb_ack += 1;
        }
    }

    /// All cache acks in: return the stored flush request to the driver with
    /// source and destination swapped.
    fn finish_plain_flush(&mut self, fabric: &mut Fabric, now: Cycle) {
        let Some(original) = self.curr_flush.take() else {
            panic!("cache flush finished with no flush request stored");
        };

        let rsp = fabric.make_msg(
            original.dst(),
            original.src(),
            now,
            Payload::GeneralRsp {
                rsp_to: original.id(),
            },
        );
        self.out_driver.stage(rsp);
    }

    fn process_rsp_from_tlbs(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let Some(msg) = fabric.peek(self.to_tlbs) else {
            return false;
        };

        match msg.payload {
            Payload::TlbFlushRsp { .. } => {
                if self.num_tlb_ack == 0 {
                    panic!("TLB flush acknowledgment that was never requested");
                }
                self.num_tlb_ack -= 1;
                if self.num_tlb_ack == 0 {
                    // Shootdown complete.
                    let rsp = fabric.make_msg(
                        self.to_driver,
                        self.driver,
                        now,
                        Payload::ShootDownCompleteRsp,
                    );
                    self.out_driver.stage(rsp);
                    self.shootdown_in_process = false;
                    self.curr_shootdown = None;
                }
                let _ = fabric.recv(self.to_tlbs);
                true
            }
            Payload::TlbRestartRsp { .. } => {
                if self.num_tlb_ack == 0 {
                    panic!("TLB restart acknowledgment that was never requested");
                }
                self.num_tlb_ack -= 1;
                if self.num_tlb_ack == 0 {
                    // Restart phase 3: resume the address translators.
                    for i in 0..self.address_translators.len() {
                        let req = fabric.make_msg(
                            self.to_ats,
                            self.address_translators[i],
                            now,
                            Payload::AtControlMsg { op: AtCtrlOp::Resume },
                        );
                        self.out_ats.stage(req);
                        self.num_at_restart_ack += 1;
                    }
                }
                let _ = fabric.recv(self.to_tlbs);
                true
            }
            ref other => panic!("unexpected message from a TLB: {}", other.kind()),
        }
    }

    fn process_rsp_from_pmc(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let Some(msg) = fabric.peek(self.to_pmc) else {
            return false;
        };

        match msg.payload {
            Payload::PageMigrationRsp => {
                let rsp =
                    fabric.make_msg(self.to_driver, self.driver, now, Payload::PageMigrationRsp);
                self.out_driver.stage(rsp);
                let _ = fabric.recv(self.to_pmc);
                true
            }
            ref other => panic!(
                "unexpected message from the page-migration controller: {}",
                other.kind()
            ),
        }
    }

    fn all_cache_ports(&self) -> Vec<PortId> {
        self.l1i_caches
            .iter()
            .chain(&self.l1s_caches)
            .chain(&self.l1v_caches)
            .chain(&self.l2_caches)
            .copied()
            .collect()
    }
}
