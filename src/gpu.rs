/// Top-level device assembly.
/// Wires a command processor to a pool of compute units and the memory-system
/// collaborators (caches, TLBs, address translators, DMA engine, migration
/// controller), owns the message fabric, and drives the shared tick loop.
use crate::cp::CommandProcessor;
use crate::cu::ComputeUnitModel;
use crate::kernel::{CodeObject, DispatchPacket, WgFilter};
use crate::memory::{
    AddressTranslatorModel, CacheModel, DmaEngineModel, PageMigrationModel, TlbModel,
};
use crate::metrics::{
    now_ms, write_metrics, DispatcherSnapshot, LiveMetrics, ProtocolSnapshot,
};
use crate::placement::PlacementPolicy;
use crate::port::{Fabric, MsgId, PortId};
use crate::protocol::{
    Cycle, LaunchKernelReq, MemCopyD2HReq, MemCopyH2DReq, Message, PageMigrationReq, Payload,
    Pid, ShootDownCmd,
};
use crate::resource::ConfigError;

/// Hardware shape of the simulated device.
#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub num_cus: usize,
    pub num_simds_per_cu: usize,
    pub wf_pool_size_per_simd: usize,
    pub sregs_per_cu: u32,
    pub vregs_per_simd: u32,
    pub lds_bytes_per_cu: u32,
    pub num_l1i_caches: usize,
    pub num_l1s_caches: usize,
    pub num_l1v_caches: usize,
    pub num_l2_caches: usize,
    pub num_tlbs: usize,
    pub num_address_translators: usize,
    pub num_dispatchers: usize,
    pub placement_policy: PlacementPolicy,
    /// Cycles a compute unit holds one mapped work-group
    pub cycles_per_wg: u64,
    pub port_capacity: usize,
    /// Cycles between live-metrics snapshots
    pub snapshot_interval: u64,
}

impl GpuConfig {
    /// R9-Nano-like configuration: 64 GCN3 compute units in 16 shader
    /// arrays, 4 SIMDs per unit, 10-deep wavefront pools.
    pub fn r9_nano() -> Self {
        GpuConfig {
            num_cus: 64,
            num_simds_per_cu: 4,
            wf_pool_size_per_simd: 10,
            sregs_per_cu: 3200,
            vregs_per_simd: 16384,
            lds_bytes_per_cu: 64 * 1024,
            num_l1i_caches: 16,
            num_l1s_caches: 16,
            num_l1v_caches: 64,
            num_l2_caches: 8,
            num_tlbs: 65,
            num_address_translators: 64,
            num_dispatchers: 8,
            placement_policy: PlacementPolicy::RoundRobin,
            cycles_per_wg: 256,
            port_capacity: 16,
            snapshot_interval: 1024,
        }
    }

    /// Small configuration for tests and quick experiments.
    pub fn small(num_cus: usize, placement_policy: PlacementPolicy) -> Self {
        GpuConfig {
            num_cus,
            num_simds_per_cu: 4,
            wf_pool_size_per_simd: 10,
            sregs_per_cu: 3200,
            vregs_per_simd: 16384,
            lds_bytes_per_cu: 64 * 1024,
            num_l1i_caches: 1,
            num_l1s_caches: 1,
            num_l1v_caches: num_cus,
            num_l2_caches: 2,
            num_tlbs: num_cus + 1,
            num_address_translators: num_cus,
            num_dispatchers: 2,
            placement_policy,
            cycles_per_wg: 32,
            port_capacity: 16,
            snapshot_interval: 256,
        }
    }
}

pub struct Gpu {
    fabric: Fabric,
    cp: CommandProcessor,
    cus: Vec<ComputeUnitModel>,
    caches: Vec<CacheModel>,
    tlbs: Vec<TlbModel>,
    ats: Vec<AddressTranslatorModel>,
    dma: DmaEngineModel,
    pmc: PageMigrationModel,
    /// The driver's own port; responses end up here.
    driver_port: PortId,
    cycle: Cycle,
    policy: PlacementPolicy,
    wf_slots_per_cu: usize,
    num_cus: usize,
    snapshot_interval: u64,
}

impl Gpu {
    pub fn new(config: GpuConfig) -> Result<Self, ConfigError> {
        if config.num_cus == 0 {
            return Err(ConfigError::Zero("compute unit count"));
        }
        if config.num_dispatchers == 0 {
            return Err(ConfigError::Zero("dispatcher count"));
        }

        let mut fabric = Fabric::new();
        let driver_port = fabric.add_port("driver", 64);

        let mut cp = CommandProcessor::new(
            &mut fabric,
            driver_port,
            config.num_dispatchers,
            config.placement_policy,
            config.port_capacity,
        );

        let mut cus = Vec::with_capacity(config.num_cus);
        for i in 0..config.num_cus {
            let cu = ComputeUnitModel::new(
                &mut fabric,
                &format!("cu{i}"),
                config.num_simds_per_cu,
                config.wf_pool_size_per_simd,
                config.vregs_per_simd,
                config.sregs_per_cu,
                config.lds_bytes_per_cu,
                config.cycles_per_wg,
                config.port_capacity,
            );
            cp.register_cu(&cu.spec(), cu.control_port())?;
            cus.push(cu);
        }

        let mut caches = Vec::new();
        for i in 0..config.num_l1i_caches {
            let cache = CacheModel::new(&mut fabric, &format!("l1i_{i}"), 8, config.port_capacity);
            cp.register_l1i_cache(cache.port());
            caches.push(cache);
        }
        for i in 0..config.num_l1s_caches {
            let cache = CacheModel::new(&mut fabric, &format!("l1s_{i}"), 8, config.port_capacity);
            cp.register_l1s_cache(cache.port());
            caches.push(cache);
        }
        for i in 0..config.num_l1v_caches {
            let cache = CacheModel::new(&mut fabric, &format!("l1v_{i}"), 8, config.port_capacity);
            cp.register_l1v_cache(cache.port());
            caches.push(cache);
        }
        for i in 0..config.num_l2_caches {
            let cache = CacheModel::new(&mut fabric, &format!("l2_{i}"), 8, config.port_capacity);
            cp.register_l2_cache(cache.port());
            caches.push(cache);
        }

        let mut tlbs = Vec::with_capacity(config.num_tlbs);
        for i in 0..config.num_tlbs {
            let tlb = TlbModel::new(&mut fabric, &format!("tlb{i}"), 8, config.port_capacity);
            cp.register_tlb(tlb.port());
            tlbs.push(tlb);
        }

        let mut ats = Vec::with_capacity(config.num_address_translators);
        for i in 0..config.num_address_translators {
            let at =
                AddressTranslatorModel::new(&mut fabric, &format!("at{i}"), 2, config.port_capacity);
            cp.register_address_translator(at.port());
            ats.push(at);
        }

        let dma = DmaEngineModel::new(&mut fabric, "dma", 16, 64, config.port_capacity);
        cp.connect_dma(dma.port());
        let pmc = PageMigrationModel::new(&mut fabric, "pmc", 64, config.port_capacity);
        cp.connect_pmc(pmc.port());

        Ok(Gpu {
            fabric,
            cp,
            cus,
            caches,
            tlbs,
            ats,
            dma,
            pmc,
            driver_port,
            cycle: 0,
            policy: config.placement_policy,
            wf_slots_per_cu: config.num_simds_per_cu * config.wf_pool_size_per_simd,
            num_cus: config.num_cus,
            snapshot_interval: config.snapshot_interval.max(1),
        })
    }

    // -----------------------------------------------------------------------
    // Driver-side request helpers
    // -----------------------------------------------------------------------

    fn send_from_driver(&mut self, payload: Payload) -> MsgId {
        let dst = self.cp.driver_port();
        let msg = self
            .fabric
            .make_msg(self.driver_port, dst, self.cycle, payload);
        let id = msg.id();
        if self.fabric.try_send(msg).is_err() {
            panic!("driver request queue overflow; drain responses before queueing more work");
        }
        id
    }

    /// Queue a kernel launch. The response arrives on the driver port once
    /// every work-group has completed.
    pub fn launch_kernel(
        &mut self,
        pid: Pid,
        code_object: CodeObject,
        packet: DispatchPacket,
        packet_address: u64,
        wg_filter: Option<WgFilter>,
    ) -> MsgId {
        self.send_from_driver(Payload::LaunchKernelReq(LaunchKernelReq {
            pid,
            code_object,
            packet,
            packet_address,
            wg_filter,
        }))
    }

    pub fn flush(&mut self) -> MsgId {
        self.send_from_driver(Payload::FlushReq)
    }

    pub fn shootdown(&mut self, pid: Pid, vaddrs: Vec<u64>) -> MsgId {
        self.send_from_driver(Payload::ShootDownCmd(ShootDownCmd { pid, vaddrs }))
    }

    pub fn restart(&mut self) -> MsgId {
        self.send_from_driver(Payload::GpuRestartReq)
    }

    pub fn mem_copy_h2d(&mut self, dst_address: u64, byte_size: u64) -> MsgId {
        self.send_from_driver(Payload::MemCopyH2DReq(MemCopyH2DReq {
            dst_address,
            byte_size,
        }))
    }

    pub fn mem_copy_d2h(&mut self, src_address: u64, byte_size: u64) -> MsgId {
        self.send_from_driver(Payload::MemCopyD2HReq(MemCopyD2HReq {
            src_address,
            byte_size,
        }))
    }

    pub fn migrate_page(&mut self, page_size: u64, read_from: u64, write_to: u64) -> MsgId {
        self.send_from_driver(Payload::PageMigrationReq(PageMigrationReq {
            page_size,
            read_from,
            write_to,
        }))
    }

    /// Drain every response that has reached the driver port.
    pub fn take_driver_responses(&mut self) -> Vec<Message> {
        let mut responses = Vec::new();
        while let Some(msg) = self.fabric.recv(self.driver_port) {
            responses.push(msg);
        }
        responses
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Advance the device one cycle. Returns whether anything moved.
    pub fn tick(&mut self) -> bool {
        let now = self.cycle;
        let mut made_progress = false;

        made_progress |= self.cp.tick(&mut self.fabric, now);
        for cu in &mut self.cus {
            made_progress |= cu.tick(&mut self.fabric, now);
        }
        for cache in &mut self.caches {
            made_progress |= cache.tick(&mut self.fabric, now);
        }
        for tlb in &mut self.tlbs {
            made_progress |= tlb.tick(&mut self.fabric, now);
        }
        for at in &mut self.ats {
            made_progress |= at.tick(&mut self.fabric, now);
        }
        made_progress |= self.dma.tick(&mut self.fabric, now);
        made_progress |= self.pmc.tick(&mut self.fabric, now);

        self.cycle += 1;
        if self.cycle % self.snapshot_interval == 0 {
            write_metrics(&self.snapshot());
        }

        made_progress
    }

    /// Tick until nothing makes progress or the cycle budget runs out.
    /// Returns the number of cycles consumed.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> u64 {
        let start = self.cycle;
        while self.cycle - start < max_cycles {
            if !self.tick() {
                break;
            }
        }
        write_metrics(&self.snapshot());
        self.cycle - start
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn num_cus(&self) -> usize {
        self.num_cus
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> LiveMetrics {
        let dispatchers: Vec<DispatcherSnapshot> = self
            .cp
            .dispatchers()
            .iter()
            .map(|d| DispatcherSnapshot {
                name: d.name().to_string(),
                active: d.is_dispatching(),
                wgs_total: if d.is_dispatching() { d.num_wg() } else { 0 },
                wgs_dispatched: d.num_dispatched(),
                wgs_completed: d.num_completed(),
            })
            .collect();

        // Slot usage summed across every dispatcher's ledger.
        let mut cu_wf_slots_used = vec![0usize; self.num_cus];
        for d in self.cp.dispatchers() {
            for (i, used) in d.wf_slots_used().into_iter().enumerate() {
                cu_wf_slots_used[i] += used;
            }
        }

        let acks = self.cp.outstanding_acks();
        let draining = self.cp.shootdown_in_process()
            || self.cp.flush_in_process()
            || acks != Default::default();
        let running = dispatchers.iter().any(|d| d.active);
        let status = if draining {
            "draining"
        } else if running {
            "running"
        } else {
            "idle"
        };

        LiveMetrics {
            status: status.to_string(),
            placement_policy: self.policy.name().to_string(),
            cycle: self.cycle,
            dispatchers,
            cu_wf_slots_used,
            cu_wf_slots_total: self.wf_slots_per_cu,
            protocol: ProtocolSnapshot {
                shootdown_active: self.cp.shootdown_in_process(),
                flush_active: self.cp.flush_in_process(),
                cu_acks: acks.cu,
                at_acks: acks.at,
                cache_acks: acks.cache,
                tlb_acks: acks.tlb,
            },
            timestamp_ms: now_ms(),
        }
    }
}
