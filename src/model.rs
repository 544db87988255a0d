//! Typed object graph produced by the dump decoder and consumed by the
//! restore pipeline.
//!
//! Every type here is the in-memory counterpart of a record the kernel's
//! dump ioctl writes into a flat buffer (see [`crate::decode`]), or of the
//! image-container entry the host framework eventually serializes. None of
//! it talks to the kernel directly.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Sentinel recorded for `srq_handle` and `comp_channel` when the feature
/// is absent, matching the kernel uAPI's own sentinels.
pub const NO_SRQ: u32 = u32::MAX;
pub const NO_COMP_CHANNEL: i32 = -1;

/// Discriminant for the four verbs object kinds the kernel dump ioctl can
/// emit. Mirrors `enum ib_uverbs_object_type` restricted to the subset this
/// core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectKind {
    Pd = 0,
    Mr = 1,
    Cq = 2,
    Qp = 3,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 4] = [ObjectKind::Pd, ObjectKind::Mr, ObjectKind::Cq, ObjectKind::Qp];

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Pd => "PD",
            ObjectKind::Mr => "MR",
            ObjectKind::Cq => "CQ",
            ObjectKind::Qp => "QP",
        }
    }
}

bitflags! {
    /// Mirrors `enum ibv_access_flags` (the bits this core needs to carry
    /// through a dump/restore round trip verbatim).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MrAccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
        const MW_BIND = 1 << 4;
        const ZERO_BASED = 1 << 5;
        const ON_DEMAND = 1 << 6;
    }
}

impl Default for MrAccessFlags {
    fn default() -> Self {
        MrAccessFlags::empty()
    }
}

/// A captured `rxe_queue` ring: producer/consumer indices plus the element
/// layout needed to reinterpret the backing memory. Captured and restored
/// verbatim, never interpreted by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RxeQueueSnapshot {
    pub log2_elem_size: u32,
    pub index_mask: u32,
    pub producer_index: u32,
    pub consumer_index: u32,
}

/// A virtual memory range backing a queue (CQ ring, QP send/recv ring).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VmRange {
    pub vm_start: u64,
    pub vm_size: u64,
}

impl VmRange {
    pub fn is_empty(&self) -> bool {
        self.vm_size == 0
    }

    pub fn end(&self) -> u64 {
        self.vm_start + self.vm_size
    }
}

/// Protection domain: no attributes beyond its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PdRecord {
    pub handle: u32,
}

/// Memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrRecord {
    pub handle: u32,
    pub address: u64,
    pub length: u64,
    pub access: MrAccessFlags,
    pub pd_handle: u32,
    pub lkey: u32,
    pub rkey: u32,
    /// rxe-internal MR number; the value forced into `last_mrn` minus one
    /// just before `reg_mr` so the kernel re-issues this exact number.
    pub mrn: u32,
}

impl MrRecord {
    pub fn range(&self) -> (u64, u64) {
        (self.address, self.address + self.length)
    }
}

/// Completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqRecord {
    pub handle: u32,
    pub cqe: u32,
    pub comp_vector: u32,
    /// Always [`NO_COMP_CHANNEL`]; completion channels are unsupported.
    pub comp_channel: i32,
    pub queue: VmRange,
    pub rxe: RxeQueueSnapshot,
}

/// Transport type of a queue pair. Only `Rc` is restorable; the others
/// decode fine but fail restore with `CrError::UnsupportedFeature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum QpType {
    Rc = 2,
    Uc = 3,
    Ud = 4,
    Other(u8),
}

impl QpType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            2 => QpType::Rc,
            3 => QpType::Uc,
            4 => QpType::Ud,
            other => QpType::Other(other),
        }
    }
}

/// Target state a dumped QP must be driven to during restore. Only the
/// four states the rxe restore path understands are representable; any
/// other recorded state is a decode-time `unsupported-feature` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum QpState {
    Reset = 0,
    Init = 1,
    Rtr = 2,
    Rts = 3,
}

impl QpState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(QpState::Reset),
            1 => Some(QpState::Init),
            2 => Some(QpState::Rtr),
            3 => Some(QpState::Rts),
            _ => None,
        }
    }
}

/// Send/receive queue capacities and inline-data limit, carried verbatim
/// into `ibv_qp_init_attr.cap` during restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

/// Address-handle attributes for an RC connection's remote end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AhAttr {
    pub dgid: [u8; 16],
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub static_rate: u8,
    pub is_global: u8,
    pub port_num: u8,
}

impl Default for AhAttr {
    fn default() -> Self {
        AhAttr {
            dgid: [0; 16],
            flow_label: 0,
            sgid_index: 0,
            hop_limit: 0,
            traffic_class: 0,
            dlid: 0,
            sl: 0,
            src_path_bits: 0,
            static_rate: 0,
            is_global: 0,
            port_num: 1,
        }
    }
}

/// rxe-internal QP progress state: send/recv ring snapshots plus the
/// scalar fields the kernel's QP_REFILL restore op needs to resume the
/// protocol state machine exactly where the dump found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RxeQpSnapshot {
    pub sq: RxeQueueSnapshot,
    pub rq: RxeQueueSnapshot,
    pub wqe_index: u32,
    pub req_opcode: i32,
    pub comp_psn: u32,
    pub comp_opcode: i32,
    pub msn: u32,
    pub resp_opcode: i32,
}

/// Queue pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QpRecord {
    pub handle: u32,
    pub pd_handle: u32,
    pub scq_handle: u32,
    pub rcq_handle: u32,
    /// Always [`NO_SRQ`]; SRQs are unsupported.
    pub srq_handle: u32,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
    pub qp_num: u32,
    pub qp_state: QpState,
    pub caps: QpCaps,

    pub pkey_index: u16,
    pub port_num: u8,
    pub qp_access_flags: MrAccessFlags,

    pub path_mtu: u32,
    pub dest_qp_num: u32,
    pub rq_psn: u32,
    pub max_dest_rd_atomic: u8,
    /// Copy-paste bug preserved from the original dump routine: this is
    /// assigned `path_mtu` at dump time rather than a real timer value.
    pub min_rnr_timer: u8,
    pub ah_attr: AhAttr,

    pub sq_psn: u32,
    pub max_rd_atomic: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub timeout: u8,

    pub rq: VmRange,
    pub sq: VmRange,

    pub rxe: RxeQpSnapshot,
}

/// Discriminated union over the four kinds of verbs objects a context can
/// own, as produced by the decoder and consumed by the restore pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObjectRecord {
    Pd(PdRecord),
    Mr(MrRecord),
    Cq(CqRecord),
    Qp(QpRecord),
}

impl ObjectRecord {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectRecord::Pd(_) => ObjectKind::Pd,
            ObjectRecord::Mr(_) => ObjectKind::Mr,
            ObjectRecord::Cq(_) => ObjectKind::Cq,
            ObjectRecord::Qp(_) => ObjectKind::Qp,
        }
    }

    pub fn handle(&self) -> u32 {
        match self {
            ObjectRecord::Pd(pd) => pd.handle,
            ObjectRecord::Mr(mr) => mr.handle,
            ObjectRecord::Cq(cq) => cq.handle,
            ObjectRecord::Qp(qp) => qp.handle,
        }
    }

    /// Handles this object must already be in the catalog before it can be
    /// restored; the restore queue's topo-sort walks these edges.
    pub fn depends_on(&self) -> Vec<(ObjectKind, u32)> {
        match self {
            ObjectRecord::Pd(_) => Vec::new(),
            ObjectRecord::Mr(mr) => vec![(ObjectKind::Pd, mr.pd_handle)],
            ObjectRecord::Cq(_) => Vec::new(),
            ObjectRecord::Qp(qp) => {
                let mut deps = vec![(ObjectKind::Pd, qp.pd_handle), (ObjectKind::Cq, qp.scq_handle)];
                if qp.rcq_handle != qp.scq_handle {
                    deps.push((ObjectKind::Cq, qp.rcq_handle));
                }
                deps
            }
        }
    }
}

/// Image-container entry for an opened ibverbs file: the `id`/`flags`/
/// `fown` triple every `FileEntry` carries, plus the decoded object graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbverbsEntry {
    pub id: u32,
    pub flags: u32,
    pub fown: FOwner,
    pub objs: Vec<ObjectRecord>,
}

/// Image-container entry for the sibling async-event file descriptor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IbeventEntry {
    pub id: u32,
    pub flags: u32,
    pub fown: FOwner,
}

/// File-owner metadata (SIGIO target); opaque to this core, carried
/// through verbatim for the host framework's fd-restore machinery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FOwner {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
    pub signum: u32,
}
