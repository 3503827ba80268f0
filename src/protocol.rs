/// Messages exchanged between the driver, the command processor, and the
/// device components it coordinates.
///
/// Every message carries a fabric-unique id, explicit source/destination
/// ports, and the cycle it was sent. Payloads are a closed enum: a component
/// peeks its port and matches on the variants it understands.
use crate::kernel::{CodeObject, DispatchPacket, WgFilter, WorkGroup};
use crate::port::{MsgId, PortId};
use crate::resource::WfSlot;

/// Logical simulation time, in cycles.
pub type Cycle = u64;

/// Process id owning a virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

#[derive(Debug, Clone, Copy)]
pub struct MsgHeader {
    pub id: MsgId,
    pub src: PortId,
    pub dst: PortId,
    pub sent_at: Cycle,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub header: MsgHeader,
    pub payload: Payload,
}

impl Message {
    pub fn new(id: MsgId, src: PortId, dst: PortId, sent_at: Cycle, payload: Payload) -> Self {
        Message {
            header: MsgHeader { id, src, dst, sent_at },
            payload,
        }
    }

    pub fn id(&self) -> MsgId {
        self.header.id
    }

    pub fn src(&self) -> PortId {
        self.header.src
    }

    pub fn dst(&self) -> PortId {
        self.header.dst
    }
}

/// Request to run a kernel on this device.
#[derive(Debug, Clone)]
pub struct LaunchKernelReq {
    pub pid: Pid,
    pub code_object: CodeObject,
    pub packet: DispatchPacket,
    pub packet_address: u64,
    pub wg_filter: Option<WgFilter>,
}

/// Map one work-group onto a compute unit, with its committed wavefront
/// locations.
#[derive(Debug, Clone)]
pub struct MapWgReq {
    pub pid: Pid,
    pub wg: WorkGroup,
    pub slots: Vec<WfSlot>,
}

/// Invalidate cached translations for a process before its pages move.
#[derive(Debug, Clone)]
pub struct ShootDownCmd {
    pub pid: Pid,
    pub vaddrs: Vec<u64>,
}

/// Cache flush options. All false = plain writeback flush; a shootdown sets
/// all three to tear the cache down destructively.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheFlushReq {
    pub pause_after_flush: bool,
    pub discard_inflight: bool,
    pub invalidate_all_lines: bool,
}

#[derive(Debug, Clone)]
pub struct TlbFlushReq {
    pub pid: Pid,
    pub vaddrs: Vec<u64>,
}

/// Control operations understood by an address translator. The translator
/// echoes the message back as its acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtCtrlOp {
    Discard,
    Resume,
}

#[derive(Debug, Clone, Copy)]
pub struct MemCopyH2DReq {
    pub dst_address: u64,
    pub byte_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct MemCopyD2HReq {
    pub src_address: u64,
    pub byte_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PageMigrationReq {
    pub page_size: u64,
    pub read_from: u64,
    pub write_to: u64,
}

#[derive(Debug, Clone)]
pub enum Payload {
    // Driver <-> command processor
    LaunchKernelReq(LaunchKernelReq),
    LaunchKernelRsp { rsp_to: MsgId },
    FlushReq,
    GeneralRsp { rsp_to: MsgId },
    ShootDownCmd(ShootDownCmd),
    ShootDownCompleteRsp,
    GpuRestartReq,
    GpuRestartRsp,
    MemCopyH2DReq(MemCopyH2DReq),
    MemCopyD2HReq(MemCopyD2HReq),
    PageMigrationReq(PageMigrationReq),
    PageMigrationRsp,

    // Dispatcher <-> compute unit
    MapWgReq(MapWgReq),
    /// One completion may acknowledge several outstanding map requests.
    WgCompletionMsg { rsp_to: Vec<MsgId> },

    // Command processor <-> compute unit control
    CuPipelineFlushReq,
    CuPipelineFlushRsp,
    CuPipelineRestartReq,
    CuPipelineRestartRsp,

    // Command processor <-> caches
    CacheFlushReq(CacheFlushReq),
    CacheFlushRsp { rsp_to: MsgId },
    CacheRestartReq,
    CacheRestartRsp { rsp_to: MsgId },

    // Command processor <-> address translators (same type both directions)
    AtControlMsg { op: AtCtrlOp },

    // Command processor <-> TLBs
    TlbFlushReq(TlbFlushReq),
    TlbFlushRsp { rsp_to: MsgId },
    TlbRestartReq,
    TlbRestartRsp { rsp_to: MsgId },
}

impl Payload {
    /// Short tag for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::LaunchKernelReq(_) => "LaunchKernelReq",
            Payload::LaunchKernelRsp { .. } => "LaunchKernelRsp",
            Payload::FlushReq => "FlushReq",
            Payload::GeneralRsp { .. } => "GeneralRsp",
            Payload::ShootDownCmd(_) => "ShootDownCmd",
            Payload::ShootDownCompleteRsp => "ShootDownCompleteRsp",
            Payload::GpuRestartReq => "GpuRestartReq",
            Payload::GpuRestartRsp => "GpuRestartRsp",
            Payload::MemCopyH2DReq(_) => "MemCopyH2DReq",
            Payload::MemCopyD2HReq(_) => "MemCopyD2HReq",
            Payload::PageMigrationReq(_) => "PageMigrationReq",
            Payload::PageMigrationRsp => "PageMigrationRsp",
            Payload::MapWgReq(_) => "MapWgReq",
            Payload::WgCompletionMsg { .. } => "WgCompletionMsg",
            Payload::CuPipelineFlushReq => "CuPipelineFlushReq",
            Payload::CuPipelineFlushRsp => "CuPipelineFlushRsp",
            Payload::CuPipelineRestartReq => "CuPipelineRestartReq",
            Payload::CuPipelineRestartRsp => "CuPipelineRestartRsp",
            Payload::CacheFlushReq(_) => "CacheFlushReq",
            Payload::CacheFlushRsp { .. } => "CacheFlushRsp",
            Payload::CacheRestartReq => "CacheRestartReq",
            Payload::CacheRestartRsp { .. } => "CacheRestartRsp",
            Payload::AtControlMsg { .. } => "AtControlMsg",
            Payload::TlbFlushReq(_) => "TlbFlushReq",
            Payload::TlbFlushRsp { .. } => "TlbFlushRsp",
            Payload::TlbRestartReq => "TlbRestartReq",
            Payload::TlbRestartRsp { .. } => "TlbRestartRsp",
        }
    }
}
