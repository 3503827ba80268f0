//! Protocol-level scenarios: a real command processor wired to ports held by
//! the test, which plays the driver and every device component.

use gcnsim::cp::CommandProcessor;
use gcnsim::kernel::{CodeObject, Dim3, DispatchPacket};
use gcnsim::placement::PlacementPolicy;
use gcnsim::port::{Fabric, MsgId, PortId};
use gcnsim::protocol::{
    LaunchKernelReq, Message, Payload, Pid, ShootDownCmd,
};
use gcnsim::resource::CuSpec;

const CAP: usize = 16;

struct Bench {
    fabric: Fabric,
    cp: CommandProcessor,
    driver: PortId,
    cu_dispatch: Vec<PortId>,
    cu_ctrl: Vec<PortId>,
    ats: Vec<PortId>,
    caches: Vec<PortId>,
    tlbs: Vec<PortId>,
    dma: PortId,
    pmc: PortId,
    now: u64,
}

/// Wire a command processor to `num_cus` compute units, `num_ats` address
/// translators, caches (l1i, l1s, l1v, l2 counts), and `num_tlbs` TLBs, all
/// ports owned by the test.
fn bench(num_cus: usize, num_ats: usize, cache_counts: [usize; 4], num_tlbs: usize) -> Bench {
    let mut fabric = Fabric::new();
    let driver = fabric.add_port("driver", CAP);
    let mut cp = CommandProcessor::new(&mut fabric, driver, 4, PlacementPolicy::RoundRobin, CAP);

    let mut cu_dispatch = Vec::new();
    let mut cu_ctrl = Vec::new();
    for i in 0..num_cus {
        let dispatch = fabric.add_port(&format!("cu{i}.dispatch"), CAP);
        let ctrl = fabric.add_port(&format!("cu{i}.ctrl"), CAP);
        let spec = CuSpec {
            dispatching_port: dispatch,
            wf_pool_sizes: vec![10],
            vreg_counts: vec![16384],
            sreg_count: 3200,
            lds_bytes: 65536,
        };
        cp.register_cu(&spec, ctrl).unwrap();
        cu_dispatch.push(dispatch);
        cu_ctrl.push(ctrl);
    }

    let mut ats = Vec::new();
    for i in 0..num_ats {
        let port = fabric.add_port(&format!("at{i}"), CAP);
        cp.register_address_translator(port);
        ats.push(port);
    }

    let mut caches = Vec::new();
    let [l1i, l1s, l1v, l2] = cache_counts;
    for i in 0..l1i {
        let port = fabric.add_port(&format!("l1i_{i}"), CAP);
        cp.register_l1i_cache(port);
        caches.push(port);
    }
    for i in 0..l1s {
        let port = fabric.add_port(&format!("l1s_{i}"), CAP);
        cp.register_l1s_cache(port);
        caches.push(port);
    }
    for i in 0..l1v {
        let port = fabric.add_port(&format!("l1v_{i}"), CAP);
        cp.register_l1v_cache(port);
        caches.push(port);
    }
    for i in 0..l2 {
        let port = fabric.add_port(&format!("l2_{i}"), CAP);
        cp.register_l2_cache(port);
        caches.push(port);
    }

    let mut tlbs = Vec::new();
    for i in 0..num_tlbs {
        let port = fabric.add_port(&format!("tlb{i}"), CAP);
        cp.register_tlb(port);
        tlbs.push(port);
    }

    let dma = fabric.add_port("dma", CAP);
    cp.connect_dma(dma);
    let pmc = fabric.add_port("pmc", CAP);
    cp.connect_pmc(pmc);

    Bench {
        fabric,
        cp,
        driver,
        cu_dispatch,
        cu_ctrl,
        ats,
        caches,
        tlbs,
        dma,
        pmc,
        now: 0,
    }
}

impl Bench {
    fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.cp.tick(&mut self.fabric, self.now);
            self.now += 1;
        }
    }

    /// Send a driver request to the command processor.
    fn request(&mut self, payload: Payload) -> MsgId {
        let dst = self.cp.driver_port();
        let msg = self.fabric.make_msg(self.driver, dst, self.now, payload);
        let id = msg.id();
        self.fabric.try_send(msg).unwrap();
        id
    }

    /// Reply to `req` from the component that owns `from`.
    fn respond(&mut self, req: &Message, from: PortId, payload: Payload) {
        let msg = self.fabric.make_msg(from, req.src(), self.now, payload);
        self.fabric.try_send(msg).unwrap();
    }

    fn drain(&mut self, port: PortId) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Some(msg) = self.fabric.recv(port) {
            msgs.push(msg);
        }
        msgs
    }

    fn drain_all(&mut self, ports: &[PortId]) -> Vec<Message> {
        let mut msgs = Vec::new();
        for &port in ports {
            msgs.extend(self.drain(port));
        }
        msgs
    }

    fn assert_quiet(&mut self, ports: &[PortId]) {
        for &port in ports {
            assert!(
                self.fabric.peek(port).is_none(),
                "unexpected message waiting on a port"
            );
        }
    }
}

fn launch_payload(num_wgs: u32) -> Payload {
    Payload::LaunchKernelReq(LaunchKernelReq {
        pid: Pid(1),
        code_object: CodeObject {
            sregs_per_wf: 16,
            vregs_per_lane: 4,
            lds_bytes: 256,
        },
        packet: DispatchPacket::new(Dim3::x(num_wgs * 64), Dim3::x(64)),
        packet_address: 0x4000,
        wg_filter: None,
    })
}

// ---------------------------------------------------------------------------
// Kernel launch
// ---------------------------------------------------------------------------

#[test]
fn two_work_groups_on_one_unit_end_to_end() {
    let mut b = bench(1, 0, [0, 0, 0, 0], 0);

    let launch_id = b.request(launch_payload(2));
    b.run(20);

    // Exactly 2 map requests reach the unit.
    let mapped = b.drain(b.cu_dispatch[0]);
    assert_eq!(mapped.len(), 2);
    for msg in &mapped {
        assert!(matches!(msg.payload, Payload::MapWgReq(_)));
    }

    // No completion response before the unit acknowledges.
    assert!(b.fabric.peek(b.driver).is_none());

    // One completion message covering both ids.
    let ids: Vec<MsgId> = mapped.iter().map(|m| m.id()).collect();
    b.respond(
        &mapped[0],
        b.cu_dispatch[0],
        Payload::WgCompletionMsg { rsp_to: ids },
    );
    b.run(1700); // end-of-kernel overhead runs out inside this window

    let responses = b.drain(b.driver);
    assert_eq!(responses.len(), 1);
    assert!(matches!(
        responses[0].payload,
        Payload::LaunchKernelRsp { rsp_to } if rsp_to == launch_id
    ));

    // Zero resources left reserved on any dispatcher's ledger.
    for d in b.cp.dispatchers() {
        assert!(d.wf_slots_used().iter().all(|&n| n == 0));
    }
}

#[test]
fn concurrent_kernels_share_the_dispatching_port() {
    let mut b = bench(2, 0, [0, 0, 0, 0], 0);

    let first = b.request(launch_payload(1));
    let second = b.request(launch_payload(1));
    b.run(20);

    let mapped = b.drain_all(&[b.cu_dispatch[0], b.cu_dispatch[1]]);
    assert_eq!(mapped.len(), 2);

    // Acknowledge in reverse order; each dispatcher picks out its own ids
    // and leaves the sibling's message alone.
    for msg in mapped.iter().rev() {
        let from = msg.dst();
        b.respond(
            msg,
            from,
            Payload::WgCompletionMsg {
                rsp_to: vec![msg.id()],
            },
        );
    }
    b.run(1700);

    let mut done: Vec<MsgId> = b
        .drain(b.driver)
        .iter()
        .map(|m| match m.payload {
            Payload::LaunchKernelRsp { rsp_to } => rsp_to,
            ref other => panic!("unexpected driver response: {}", other.kind()),
        })
        .collect();
    done.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(done, expected);
}

// ---------------------------------------------------------------------------
// Plain cache flush
// ---------------------------------------------------------------------------

#[test]
fn flush_fans_out_and_responds_after_every_ack() {
    // 2 L1 caches (one scalar, one vector) + 1 L2.
    let mut b = bench(0, 0, [0, 1, 1, 1], 0);

    let flush_id = b.request(Payload::FlushReq);
    b.run(10);

    // Exactly 3 cache flush messages, all plain writeback flushes.
    let cache_ports = b.caches.clone();
    let reqs = b.drain_all(&cache_ports);
    assert_eq!(reqs.len(), 3);
    for msg in &reqs {
        match msg.payload {
            Payload::CacheFlushReq(req) => {
                assert!(!req.pause_after_flush);
                assert!(!req.discard_inflight);
                assert!(!req.invalidate_all_lines);
            }
            ref other => panic!("expected cache flush, got {}", other.kind()),
        }
    }

    // Two acks are not enough.
    for msg in reqs.iter().take(2) {
        let from = msg.dst();
        b.respond(msg, from, Payload::CacheFlushRsp { rsp_to: msg.id() });
    }
    b.run(10);
    assert!(b.fabric.peek(b.driver).is_none());

    // The third ack releases exactly one response, with source and
    // destination swapped relative to the stored request.
    let from = reqs[2].dst();
    b.respond(&reqs[2], from, Payload::CacheFlushRsp { rsp_to: reqs[2].id() });
    b.run(10);

    let responses = b.drain(b.driver);
    assert_eq!(responses.len(), 1);
    let rsp = &responses[0];
    assert!(matches!(rsp.payload, Payload::GeneralRsp { rsp_to } if rsp_to == flush_id));
    assert_eq!(rsp.src(), b.cp.driver_port());
    assert_eq!(rsp.dst(), b.driver);
}

#[test]
fn second_flush_waits_for_outstanding_cache_acks() {
    let mut b = bench(0, 0, [0, 0, 1, 1], 0);

    let first = b.request(Payload::FlushReq);
    b.run(10);
    let cache_ports = b.caches.clone();
    let first_reqs = b.drain_all(&cache_ports);
    assert_eq!(first_reqs.len(), 2);

    // A second flush arrives while acks are outstanding; it must wait.
    let second = b.request(Payload::FlushReq);
    b.run(10);
    b.assert_quiet(&cache_ports);

    for msg in &first_reqs {
        let from = msg.dst();
        b.respond(msg, from, Payload::CacheFlushRsp { rsp_to: msg.id() });
    }
    b.run(10);

    let responses = b.drain(b.driver);
    assert_eq!(responses.len(), 1);
    assert!(matches!(responses[0].payload, Payload::GeneralRsp { rsp_to } if rsp_to == first));

    // Now the deferred flush fans out in turn.
    let second_reqs = b.drain_all(&cache_ports);
    assert_eq!(second_reqs.len(), 2);
    for msg in &second_reqs {
        let from = msg.dst();
        b.respond(msg, from, Payload::CacheFlushRsp { rsp_to: msg.id() });
    }
    b.run(10);
    let responses = b.drain(b.driver);
    assert_eq!(responses.len(), 1);
    assert!(matches!(responses[0].payload, Payload::GeneralRsp { rsp_to } if rsp_to == second));
}

// ---------------------------------------------------------------------------
// Shootdown
// ---------------------------------------------------------------------------

#[test]
fn shootdown_phases_run_in_strict_order() {
    let mut b = bench(4, 2, [1, 1, 1, 1], 4);
    let cache_ports = b.caches.clone();
    let at_ports = b.ats.clone();
    let tlb_ports = b.tlbs.clone();
    let ctrl_ports = b.cu_ctrl.clone();

    b.request(Payload::ShootDownCmd(ShootDownCmd {
        pid: Pid(7),
        vaddrs: vec![0x1000, 0x2000],
    }));
    b.run(10);
    assert!(b.cp.shootdown_in_process());

    // Phase 1: pipeline flush to all 4 CUs, nothing else yet.
    let cu_reqs = b.drain_all(&ctrl_ports);
    assert_eq!(cu_reqs.len(), 4);
    for msg in &cu_reqs {
        assert!(matches!(msg.payload, Payload::CuPipelineFlushReq));
    }
    b.assert_quiet(&at_ports);
    b.assert_quiet(&cache_ports);
    b.assert_quiet(&tlb_ports);

    // Three acks hold the phase; the fourth advances it.
    for msg in cu_reqs.iter().take(3) {
        let from = msg.dst();
        b.respond(msg, from, Payload::CuPipelineFlushRsp);
    }
    b.run(10);
    b.assert_quiet(&at_ports);
    let from = cu_reqs[3].dst();
    b.respond(&cu_reqs[3], from, Payload::CuPipelineFlushRsp);
    b.run(10);

    // Phase 2: discard-in-flight to both address translators.
    let at_reqs = b.drain_all(&at_ports);
    assert_eq!(at_reqs.len(), 2);
    for msg in &at_reqs {
        assert!(matches!(
            msg.payload,
            Payload::AtControlMsg {
                op: gcnsim::protocol::AtCtrlOp::Discard
            }
        ));
    }
    b.assert_quiet(&cache_ports);

    // Echo both control messages back.
    for msg in &at_reqs {
        let from = msg.dst();
        let payload = msg.payload.clone();
        b.respond(msg, from, payload);
    }
    b.run(10);

    // Phase 3: destructive flush to every cache.
    let cache_reqs = b.drain_all(&cache_ports);
    assert_eq!(cache_reqs.len(), 4);
    for msg in &cache_reqs {
        match msg.payload {
            Payload::CacheFlushReq(req) => {
                assert!(req.pause_after_flush);
                assert!(req.discard_inflight);
                assert!(req.invalidate_all_lines);
            }
            ref other => panic!("expected cache flush, got {}", other.kind()),
        }
    }
    b.assert_quiet(&tlb_ports);

    for msg in &cache_reqs {
        let from = msg.dst();
        b.respond(msg, from, Payload::CacheFlushRsp { rsp_to: msg.id() });
    }
    b.run(10);

    // Phase 4: TLB flush carrying the pid and address list.
    let tlb_reqs = b.drain_all(&tlb_ports);
    assert_eq!(tlb_reqs.len(), 4);
    for msg in &tlb_reqs {
        match &msg.payload {
            Payload::TlbFlushReq(req) => {
                assert_eq!(req.pid, Pid(7));
                assert_eq!(req.vaddrs, vec![0x1000, 0x2000]);
            }
            other => panic!("expected TLB flush, got {}", other.kind()),
        }
    }

    // Three TLB acks are not enough; the fourth completes the shootdown.
    for msg in tlb_reqs.iter().take(3) {
        let from = msg.dst();
        b.respond(msg, from, Payload::TlbFlushRsp { rsp_to: msg.id() });
    }
    b.run(10);
    assert!(b.fabric.peek(b.driver).is_none());
    let from = tlb_reqs[3].dst();
    b.respond(&tlb_reqs[3], from, Payload::TlbFlushRsp { rsp_to: tlb_reqs[3].id() });
    b.run(10);

    let responses = b.drain(b.driver);
    assert_eq!(responses.len(), 1);
    assert!(matches!(responses[0].payload, Payload::ShootDownCompleteRsp));
    assert!(!b.cp.shootdown_in_process());
}

#[test]
fn second_shootdown_defers_until_the_first_completes() {
    let mut b = bench(1, 1, [0, 0, 0, 1], 1);
    let ctrl_ports = b.cu_ctrl.clone();

    b.request(Payload::ShootDownCmd(ShootDownCmd {
        pid: Pid(1),
        vaddrs: vec![0x1000],
    }));
    b.run(10);
    assert_eq!(b.drain_all(&ctrl_ports).len(), 1);

    // While active, a second command stays queued and triggers nothing.
    b.request(Payload::ShootDownCmd(ShootDownCmd {
        pid: Pid(2),
        vaddrs: vec![0x2000],
    }));
    b.run(10);
    b.assert_quiet(&ctrl_ports);
    assert!(b.cp.shootdown_in_process());
}

// ---------------------------------------------------------------------------
// Restart
// ---------------------------------------------------------------------------

#[test]
fn restart_walks_caches_tlbs_translators_then_pipelines() {
    let mut b = bench(4, 2, [1, 1, 1, 1], 4);
    let cache_ports = b.caches.clone();
    let at_ports = b.ats.clone();
    let tlb_ports = b.tlbs.clone();
    let ctrl_ports = b.cu_ctrl.clone();

    b.request(Payload::GpuRestartReq);
    b.run(10);

    // Phase 1: cache restarts everywhere, nothing else.
    let cache_reqs = b.drain_all(&cache_ports);
    assert_eq!(cache_reqs.len(), 4);
    for msg in &cache_reqs {
        assert!(matches!(msg.payload, Payload::CacheRestartReq));
    }
    b.assert_quiet(&tlb_ports);
    b.assert_quiet(&at_ports);
    b.assert_quiet(&ctrl_ports);

    for msg in &cache_reqs {
        let from = msg.dst();
        b.respond(msg, from, Payload::CacheRestartRsp { rsp_to: msg.id() });
    }
    b.run(10);

    // Phase 2: TLB restarts.
    let tlb_reqs = b.drain_all(&tlb_ports);
    assert_eq!(tlb_reqs.len(), 4);
    for msg in &tlb_reqs {
        assert!(matches!(msg.payload, Payload::TlbRestartReq));
    }
    b.assert_quiet(&at_ports);

    for msg in &tlb_reqs {
        let from = msg.dst();
        b.respond(msg, from, Payload::TlbRestartRsp { rsp_to: msg.id() });
    }
    b.run(10);

    // Phase 3: resume the address translators.
    let at_reqs = b.drain_all(&at_ports);
    assert_eq!(at_reqs.len(), 2);
    for msg in &at_reqs {
        assert!(matches!(
            msg.payload,
            Payload::AtControlMsg {
                op: gcnsim::protocol::AtCtrlOp::Resume
            }
        ));
    }
    b.assert_quiet(&ctrl_ports);

    for msg in &at_reqs {
        let from = msg.dst();
        let payload = msg.payload.clone();
        b.respond(msg, from, payload);
    }
    b.run(10);

    // Phase 4: pipeline restarts.
    let cu_reqs = b.drain_all(&ctrl_ports);
    assert_eq!(cu_reqs.len(), 4);
    for msg in &cu_reqs {
        assert!(matches!(msg.payload, Payload::CuPipelineRestartReq));
    }
    assert!(b.fabric.peek(b.driver).is_none());

    for msg in &cu_reqs {
        let from = msg.dst();
        b.respond(msg, from, Payload::CuPipelineRestartRsp);
    }
    b.run(10);

    let responses = b.drain(b.driver);
    assert_eq!(responses.len(), 1);
    assert!(matches!(responses[0].payload, Payload::GpuRestartRsp));
}

// ---------------------------------------------------------------------------
// DMA and page-migration relays
// ---------------------------------------------------------------------------

#[test]
fn mem_copy_is_cloned_to_dma_and_matched_back() {
    let mut b = bench(0, 0, [0, 0, 0, 0], 0);

    let req_id = b.request(Payload::MemCopyH2DReq(gcnsim::protocol::MemCopyH2DReq {
        dst_address: 0x8000,
        byte_size: 4096,
    }));
    b.run(10);

    let relayed = b.drain(b.dma);
    assert_eq!(relayed.len(), 1);
    let cloned = &relayed[0];
    // Fresh id, same payload.
    assert_ne!(cloned.id(), req_id);
    match cloned.payload {
        Payload::MemCopyH2DReq(req) => {
            assert_eq!(req.dst_address, 0x8000);
            assert_eq!(req.byte_size, 4096);
        }
        ref other => panic!("expected cloned copy request, got {}", other.kind()),
    }

    let from = cloned.dst();
    b.respond(cloned, from, Payload::GeneralRsp { rsp_to: cloned.id() });
    b.run(10);

    let responses = b.drain(b.driver);
    assert_eq!(responses.len(), 1);
    // The response is matched back to the driver's original id.
    assert!(matches!(responses[0].payload, Payload::GeneralRsp { rsp_to } if rsp_to == req_id));
}

#[test]
fn page_migration_is_relayed_verbatim() {
    let mut b = bench(0, 0, [0, 0, 0, 0], 0);

    b.request(Payload::PageMigrationReq(gcnsim::protocol::PageMigrationReq {
        page_size: 4096,
        read_from: 0x10_0000,
        write_to: 0x20_0000,
    }));
    b.run(10);

    let relayed = b.drain(b.pmc);
    assert_eq!(relayed.len(), 1);
    match relayed[0].payload {
        Payload::PageMigrationReq(req) => {
            assert_eq!(req.page_size, 4096);
            assert_eq!(req.read_from, 0x10_0000);
            assert_eq!(req.write_to, 0x20_0000);
        }
        ref other => panic!("expected migration request, got {}", other.kind()),
    }

    let from = relayed[0].dst();
    b.respond(&relayed[0], from, Payload::PageMigrationRsp);
    b.run(10);

    let responses = b.drain(b.driver);
    assert_eq!(responses.len(), 1);
    assert!(matches!(responses[0].payload, Payload::PageMigrationRsp));
}
