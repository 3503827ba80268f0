/// Memory-system collaborators of the command processor.
///
/// These are latency-only models: each one accepts the control messages the
/// drain protocol sends it, waits out a service latency, and acknowledges.
/// They exist so the protocol loops close end-to-end; cache lines, TLB
/// entries, and translation state are not modeled here.
use crate::port::{Fabric, PortId};
use crate::protocol::{AtCtrlOp, Cycle, Message, Payload};

/// One in-service request waiting out its latency.
struct PendingRsp {
    due_at: Cycle,
    rsp: Message,
}

/// Single-server service loop shared by all models: deliver the pending
/// reply once due, otherwise accept the head request and turn it into a
/// delayed reply. `reply` maps a request to its acknowledgment payload and
/// service latency.
fn serve_one(
    fabric: &mut Fabric,
    port: PortId,
    pending: &mut Option<PendingRsp>,
    now: Cycle,
    reply: impl FnOnce(&Message) -> (Payload, u64),
) -> bool {
    if let Some(p) = pending.take() {
        if p.due_at <= now {
            match fabric.try_send(p.rsp) {
                Ok(()) => return true,
                Err(rsp) => {
                    *pending = Some(PendingRsp { due_at: p.due_at, rsp });
                    return false;
                }
            }
        }
        // Still counting down.
        *pending = Some(p);
        return true;
    }

    let Some(msg) = fabric.peek(port) else {
        return false;
    };
    let (payload, latency) = reply(msg);
    let reply_to = msg.src();
    let rsp = fabric.make_msg(port, reply_to, now, payload);
    *pending = Some(PendingRsp {
        due_at: now + latency,
        rsp,
    });
    let _ = fabric.recv(port);
    true
}

// ---------------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------------

/// A cache as seen by the drain protocol: flushable, restartable, pausable.
pub struct CacheModel {
    name: String,
    port: PortId,
    latency: u64,
    paused: bool,
    pending: Option<PendingRsp>,
}

impl CacheModel {
    pub fn new(fabric: &mut Fabric, name: &str, latency: u64, port_capacity: usize) -> Self {
        let port = fabric.add_port(name, port_capacity);
        CacheModel {
            name: name.to_string(),
            port,
            latency,
            paused: false,
            pending: None,
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn tick(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let name = &self.name;
        let latency = self.latency;
        let paused = &mut self.paused;
        serve_one(fabric, self.port, &mut self.pending, now, |msg| {
            let payload = match msg.payload {
                Payload::CacheFlushReq(req) => {
                    if req.pause_after_flush {
                        *paused = true;
                    }
                    Payload::CacheFlushRsp { rsp_to: msg.id() }
                }
                Payload::CacheRestartReq => {
                    *paused = false;
                    Payload::CacheRestartRsp { rsp_to: msg.id() }
                }
                ref other => panic!("{name}: unexpected cache message: {}", other.kind()),
            };
            (payload, latency)
        })
    }
}

// ---------------------------------------------------------------------------
// TLBs
// ---------------------------------------------------------------------------

pub struct TlbModel {
    name: String,
    port: PortId,
    latency: u64,
    pending: Option<PendingRsp>,
}

impl TlbModel {
    pub fn new(fabric: &mut Fabric, name: &str, latency: u64, port_capacity: usize) -> Self {
        let port = fabric.add_port(name, port_capacity);
        TlbModel {
            name: name.to_string(),
            port,
            latency,
            pending: None,
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn tick(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let name = &self.name;
        let latency = self.latency;
        serve_one(fabric, self.port, &mut self.pending, now, |msg| {
            let payload = match msg.payload {
                Payload::TlbFlushReq(_) => Payload::TlbFlushRsp { rsp_to: msg.id() },
                Payload::TlbRestartReq => Payload::TlbRestartRsp { rsp_to: msg.id() },
                ref other => panic!("{name}: unexpected TLB message: {}", other.kind()),
            };
            (payload, latency)
        })
    }
}

// ---------------------------------------------------------------------------
// Address translators
// ---------------------------------------------------------------------------

/// Acknowledges control messages by echoing them back.
pub struct AddressTranslatorModel {
    name: String,
    port: PortId,
    latency: u64,
    paused: bool,
    pending: Option<PendingRsp>,
}

impl AddressTranslatorModel {
    pub fn new(fabric: &mut Fabric, name: &str, latency: u64, port_capacity: usize) -> Self {
        let port = fabric.add_port(name, port_capacity);
        AddressTranslatorModel {
            name: name.to_string(),
            port,
            latency,
            paused: false,
            pending: None,
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn tick(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let name = &self.name;
        let latency = self.latency;
        let paused = &mut self.paused;
        serve_one(fabric, self.port, &mut self.pending, now, |msg| {
            let payload = match msg.payload {
                Payload::AtControlMsg { op } => {
                    *paused = op == AtCtrlOp::Discard;
                    Payload::AtControlMsg { op }
                }
                ref other => panic!("{name}: unexpected control message: {}", other.kind()),
            };
            (payload, latency)
        })
    }
}

// ---------------------------------------------------------------------------
// DMA engine
// ---------------------------------------------------------------------------

/// Serves one memory copy at a time; latency scales with the copy size.
pub struct DmaEngineModel {
    name: String,
    port: PortId,
    base_latency: u64,
    bytes_per_cycle: u64,
    pending: Option<PendingRsp>,
}

impl DmaEngineModel {
    pub fn new(
        fabric: &mut Fabric,
        name: &str,
        base_latency: u64,
        bytes_per_cycle: u64,
        port_capacity: usize,
    ) -> Self {
        assert!(bytes_per_cycle > 0, "DMA bandwidth must be positive");
        let port = fabric.add_port(name, port_capacity);
        DmaEngineModel {
            name: name.to_string(),
            port,
            base_latency,
            bytes_per_cycle,
            pending: None,
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn tick(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let name = &self.name;
        let base = self.base_latency;
        let bw = self.bytes_per_cycle;
        serve_one(fabric, self.port, &mut self.pending, now, |msg| {
            let bytes = match msg.payload {
                Payload::MemCopyH2DReq(req) => req.byte_size,
                Payload::MemCopyD2HReq(req) => req.byte_size,
                ref other => panic!("{name}: unexpected DMA message: {}", other.kind()),
            };
            (
                Payload::GeneralRsp { rsp_to: msg.id() },
                base + bytes.div_ceil(bw),
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Page-migration controller
// ---------------------------------------------------------------------------

pub struct PageMigrationModel {
    name: String,
    port: PortId,
    latency: u64,
    pending: Option<PendingRsp>,
}

impl PageMigrationModel {
    pub fn new(fabric: &mut Fabric, name: &str, latency: u64, port_capacity: usize) -> Self {
        let port = fabric.add_port(name, port_capacity);
        PageMigrationModel {
            name: name.to_string(),
            port,
            latency,
            pending: None,
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn tick(&mut self, fabric: &mut Fabric, now: Cycle) -> bool {
        let name = &self.name;
        let latency = self.latency;
        serve_one(fabric, self.port, &mut self.pending, now, |msg| {
            let payload = match msg.payload {
                Payload::PageMigrationReq(_) => Payload::PageMigrationRsp,
                ref other => panic!("{name}: unexpected migration message: {}", other.kind()),
            };
            (payload, latency)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CacheFlushReq, MemCopyH2DReq};

    #[test]
    fn cache_acknowledges_after_latency_and_honors_pause() {
        let mut fabric = Fabric::new();
        let cp = fabric.add_port("cp.to_caches", 8);
        let mut cache = CacheModel::new(&mut fabric, "l2_0", 4, 8);

        let req = fabric.make_msg(
            cp,
            cache.port(),
            0,
            Payload::CacheFlushReq(CacheFlushReq {
                pause_after_flush: true,
                discard_inflight: true,
                invalidate_all_lines: true,
            }),
        );
        let req_id = req.id();
        fabric.try_send(req).unwrap();

        cache.tick(&mut fabric, 0);
        assert!(cache.is_paused());
        for now in 1..4 {
            cache.tick(&mut fabric, now);
            assert!(fabric.peek(cp).is_none());
        }
        cache.tick(&mut fabric, 4);
        let rsp = fabric.recv(cp).unwrap();
        assert!(matches!(rsp.payload, Payload::CacheFlushRsp { rsp_to } if rsp_to == req_id));

        let restart = fabric.make_msg(cp, cache.port(), 5, Payload::CacheRestartReq);
        fabric.try_send(restart).unwrap();
        for now in 5..12 {
            cache.tick(&mut fabric, now);
        }
        assert!(!cache.is_paused());
        assert!(matches!(
            fabric.recv(cp).map(|m| m.payload),
            Some(Payload::CacheRestartRsp { .. })
        ));
    }

    #[test]
    fn address_translator_echoes_control_messages() {
        let mut fabric = Fabric::new();
        let cp = fabric.add_port("cp.to_ats", 8);
        let mut at = AddressTranslatorModel::new(&mut fabric, "at0", 1, 8);

        let req = fabric.make_msg(
            cp,
            at.port(),
            0,
            Payload::AtControlMsg {
                op: AtCtrlOp::Discard,
            },
        );
        fabric.try_send(req).unwrap();

        at.tick(&mut fabric, 0);
        assert!(at.is_paused());
        at.tick(&mut fabric, 1);
        let rsp = fabric.recv(cp).unwrap();
        assert!(matches!(
            rsp.payload,
            Payload::AtControlMsg {
                op: AtCtrlOp::Discard
            }
        ));
    }

    #[test]
    fn dma_latency_scales_with_copy_size() {
        let mut fabric = Fabric::new();
        let cp = fabric.add_port("cp.to_dma", 8);
        let mut dma = DmaEngineModel::new(&mut fabric, "dma", 2, 64, 8);

        let req = fabric.make_msg(
            cp,
            dma.port(),
            0,
            Payload::MemCopyH2DReq(MemCopyH2DReq {
                dst_address: 0x1000,
                byte_size: 640,
            }),
        );
        fabric.try_send(req).unwrap();

        // 2 base + 640/64 = 12 cycles of service time.
        dma.tick(&mut fabric, 0);
        for now in 1..12 {
            dma.tick(&mut fabric, now);
            assert!(fabric.peek(cp).is_none());
        }
        dma.tick(&mut fabric, 12);
        assert!(matches!(
            fabric.recv(cp).map(|m| m.payload),
            Some(Payload::GeneralRsp { .. })
        ));
    }

    #[test]
    fn backpressured_reply_is_retried_not_dropped() {
        let mut fabric = Fabric::new();
        let cp = fabric.add_port("cp.to_tlbs", 1);
        let mut tlb = TlbModel::new(&mut fabric, "tlb0", 1, 8);

        let req = fabric.make_msg(cp, tlb.port(), 0, Payload::TlbRestartReq);
        fabric.try_send(req).unwrap();
        // Jam the reply path.
        let filler = fabric.make_msg(tlb.port(), cp, 0, Payload::TlbRestartReq);
        fabric.try_send(filler).unwrap();

        tlb.tick(&mut fabric, 0);
        tlb.tick(&mut fabric, 1);
        tlb.tick(&mut fabric, 2);
        // Only the filler is there; the reply is still held.
        assert!(matches!(
            fabric.recv(cp).map(|m| m.payload),
            Some(Payload::TlbRestartReq)
        ));

        tlb.tick(&mut fabric, 3);
        assert!(matches!(
            fabric.recv(cp).map(|m| m.payload),
            Some(Payload::TlbRestartRsp { .. })
        ));
    }
}
