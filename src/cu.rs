/// Latency-only compute-unit model.
///
/// The real pipeline (fetch/decode/issue/execute) lives outside this
/// subsystem; this model only honors the dispatch and drain contracts: it
/// accepts mapped work-groups, holds each for a fixed number of cycles, then
/// acknowledges every work-group finishing on the same cycle with a single
/// completion message. Pipeline flush/restart pause and resume it.
use crate::port::{Fabric, MsgId, PortId};
use crate::protocol::{Cycle, Payload};
use crate::resource::CuSpec;

#[derive(Debug, Clone, Copy)]
struct InflightWg {
    done_at: Cycle,
    /// Dispatcher port the completion goes back to
    reply_to: PortId,
    rsp_to: MsgId,
}

pub struct ComputeUnitModel {
    name: String,
    dispatching_port: PortId,
    control_port: PortId,
    wf_pool_sizes: Vec<usize>,
    vreg_counts: Vec<u32>,
    sreg_count: u32,
    lds_bytes: u32,
    cycles_per_wg: u64,
    inflight: Vec<InflightWg>,
    paused: bool,
}

impl ComputeUnitModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fabric: &mut Fabric,
        name: &str,
        num_simds: usize,
        wf_pool_size_per_simd: usize,
        vregs_per_simd: u32,
        sreg_count: u32,
        lds_bytes: u32,
        cycles_per_wg: u64,
        port_capacity: usize,
    ) -> Self {
        let dispatching_port = fabric.add_port(&format!("{name}.dispatch"), port_capacity);
        let control_port = fabric.add_port(&format!("{name}.ctrl"), port_capacity);

        ComputeUnitModel {
            name: name.to_string(),
            dispatching_port,
            control_port,
            wf_pool_sizes: vec![wf_pool_size_per_simd; num_simds],
            vreg_counts: vec![vregs_per_simd; num_simds],
            sreg_count,
            lds_bytes,
            cycles_per_wg,
            inflight: Vec::new(),
            paused: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resources this unit declares to the command processor.
    pub fn spec(&self) -> CuSpec {
        CuSpec {
            dispatching_port: self.dispatching_port,
            wf_pool_sizes: self.wf_pool_sizes.clone(),
            vreg_counts: self.vreg_counts.clone(),
            sreg_count: self.sreg_count,
            lds_bytes: self.lds_bytes,
        }
    }

    pub fn control_port(&self) -> PortId {
        self.control_port
    }

    pub fn inflight_wgs(&self) -> usize {
        self.inflight.len()
    }

    pub fn tick(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let mut made_progress = false;

        made_progress |= self.process_control(fabric, now);
        if !self.paused {
            made_progress |= self.send_completions(fabric, now);
            made_progress |= self.accept_work(fabric, now);
            // Work counting down toward completion is forward progress.
            made_progress |= self.inflight.iter().any(|wg| wg.done_at > now);
        }

        made_progress
    }

    fn process_control(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let Some(msg) = fabric.peek(self.control_port) else {
            return false;
        };

        let rsp = match msg.payload {
            Payload::CuPipelineFlushReq => Payload::CuPipelineFlushRsp,
            Payload::CuPipelineRestartReq => Payload::CuPipelineRestartRsp,
            ref other => panic!(
                "{}: unexpected control message: {}",
                self.name,
                other.kind()
            ),
        };
        let reply_to = msg.src();

        let rsp = fabric.make_msg(self.control_port, reply_to, now, rsp);
        match fabric.try_send(rsp) {
            Ok(()) => {
                let consumed = fabric.recv(self.control_port);
                if let Some(msg) = consumed {
                    self.paused = matches!(msg.payload, Payload::CuPipelineFlushReq);
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Batch every work-group due by now into one completion per dispatcher
    /// port.
    fn send_completions(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let due: Vec<InflightWg> = self
            .inflight
            .iter()
            .copied()
            .filter(|wg| wg.done_at <= now)
            .collect();
        if due.is_empty() {
            return false;
        }

        let mut made_progress = false;
        let mut ports: Vec<PortId> = Vec::new();
        for wg in &due {
            if !ports.contains(&wg.reply_to) {
                ports.push(wg.reply_to);
            }
        }

        for port in ports {
            let ids: Vec<MsgId> = due
                .iter()
                .filter(|wg| wg.reply_to == port)
                .map(|wg| wg.rsp_to)
                .collect();
            let msg = fabric.make_msg(
                self.dispatching_port,
                port,
                now,
                Payload::WgCompletionMsg {
                    rsp_to: ids.clone(),
                },
            );
            if fabric.try_send(msg).is_ok() {
                self.inflight.retain(|wg| !ids.contains(&wg.rsp_to));
                made_progress = true;
            }
        }

        made_progress
    }

    fn accept_work(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let Some(msg) = fabric.peek(self.dispatching_port) else {
            return false;
        };

        match &msg.payload {
            Payload::MapWgReq(_) => {
                let entry = InflightWg {
                    done_at: now + self.cycles_per_wg,
                    reply_to: msg.src(),
                    rsp_to: msg.id(),
                };
                self.inflight.push(entry);
                let _ = fabric.recv(self.dispatching_port);
                true
            }
            other => panic!(
                "{}: unexpected message on the dispatching port: {}",
                self.name,
                other.kind()
            ),
        }
    }
}
