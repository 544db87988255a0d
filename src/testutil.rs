//! Test-only fixtures: in-memory fakes for the kernel/procfs boundary
//! traits, and raw-buffer encoders mirroring the kernel dump ABI the
//! decoder parses. Public so a host framework building on this crate can
//! reuse the same fakes in its own integration tests, keeping
//! `#[cfg(test)] mod tests` colocated with the code under test.

use crate::device::{RestoreArgs, VerbsDevice};
use crate::error::{CrError, CrResult};
use crate::knobs::ProcFile;
use crate::model::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// A procfs knob backed by an in-memory cell instead of a real file.
#[derive(Debug)]
pub struct FakeProcFile {
    value: u32,
}

impl FakeProcFile {
    pub fn new(initial: u32) -> Self {
        FakeProcFile { value: initial }
    }
}

impl ProcFile for FakeProcFile {
    fn read_decimal(&mut self) -> CrResult<u32> {
        Ok(self.value)
    }

    fn write_decimal(&mut self, value: u32) -> CrResult<()> {
        self.value = value;
        Ok(())
    }
}

/// An in-memory stand-in for an open verbs context: hands out dense
/// handles/qp_nums/mr keys starting from whatever `last_*` value is
/// forced, exactly like a real rxe device would.
pub struct FakeVerbsDevice {
    next_handle: [AtomicU32; 4],
    next_qpn: AtomicU32,
    next_mrn: AtomicU32,
    pub alloc_pd_calls: std::cell::Cell<u32>,
    pub modify_qp_calls: std::cell::RefCell<Vec<(u32, u32)>>,
    pub restore_object_calls: std::cell::RefCell<Vec<(ObjectKind, &'static str)>>,
    mr_keys: HashMap<u32, (u32, u32)>,
}

impl FakeVerbsDevice {
    pub fn new() -> Self {
        FakeVerbsDevice {
            next_handle: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
            next_qpn: AtomicU32::new(0),
            next_mrn: AtomicU32::new(0),
            alloc_pd_calls: std::cell::Cell::new(0),
            modify_qp_calls: std::cell::RefCell::new(Vec::new()),
            restore_object_calls: std::cell::RefCell::new(Vec::new()),
            mr_keys: HashMap::new(),
        }
    }

    /// Force the next handle issued for `kind` (mirrors how forcing
    /// `last_qpn`/`last_mrn` on the real kernel determines the next
    /// allocation).
    pub fn set_next_handle(&self, kind: ObjectKind, handle: u32) {
        self.next_handle[kind as usize].store(handle, Ordering::SeqCst);
    }

    pub fn set_next_qpn(&self, qpn: u32) {
        self.next_qpn.store(qpn, Ordering::SeqCst);
    }

    pub fn set_next_mrn(&self, mrn: u32) {
        self.next_mrn.store(mrn, Ordering::SeqCst);
    }
}

impl Default for FakeVerbsDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VerbsDevice for FakeVerbsDevice {
    fn alloc_pd(&self) -> CrResult<u32> {
        self.alloc_pd_calls.set(self.alloc_pd_calls.get() + 1);
        let h = self.next_handle[ObjectKind::Pd as usize].fetch_add(1, Ordering::SeqCst);
        Ok(h)
    }

    fn reg_mr(&self, _pd_handle: u32, _address: u64, _length: u64, _access: MrAccessFlags) -> CrResult<u32> {
        let h = self.next_handle[ObjectKind::Mr as usize].fetch_add(1, Ordering::SeqCst);
        Ok(h)
    }

    fn restore_mr_keys(&mut self, handle: u32, lkey: u32, rkey: u32) -> CrResult<()> {
        self.mr_keys.insert(handle, (lkey, rkey));
        self.restore_object_calls.borrow_mut().push((ObjectKind::Mr, "MR_KEYS"));
        Ok(())
    }

    fn create_cq(&self, _args: &crate::device::CqCreateArgs) -> CrResult<u32> {
        let h = self.next_handle[ObjectKind::Cq as usize].fetch_add(1, Ordering::SeqCst);
        self.restore_object_calls.borrow_mut().push((ObjectKind::Cq, "CQ_CREATE"));
        Ok(h)
    }

    fn refill_cq(&mut self, _handle: u32, _snapshot: RxeQueueSnapshot) -> CrResult<()> {
        self.restore_object_calls.borrow_mut().push((ObjectKind::Cq, "CQ_REFILL"));
        Ok(())
    }

    fn create_qp(&self, _args: &crate::device::QpCreateArgs) -> CrResult<(u32, u32)> {
        let handle = self.next_handle[ObjectKind::Qp as usize].fetch_add(1, Ordering::SeqCst);
        let qpn = self.next_qpn.load(Ordering::SeqCst);
        self.restore_object_calls.borrow_mut().push((ObjectKind::Qp, "QP_CREATE"));
        Ok((handle, qpn))
    }

    fn modify_qp(&mut self, qp_handle: u32, _args: &RestoreArgs) -> CrResult<()> {
        self.modify_qp_calls.borrow_mut().push((qp_handle, 0));
        Ok(())
    }

    fn refill_qp(&mut self, _handle: u32, _snapshot: RxeQpSnapshot) -> CrResult<()> {
        self.restore_object_calls.borrow_mut().push((ObjectKind::Qp, "QP_REFILL"));
        Ok(())
    }
}

/// Raw dump-buffer encoders mirroring [`crate::decode`]'s expectations,
/// field for field, so tests can build a believable kernel dump by hand.
pub mod encode {
    use crate::model::*;
    use crate::wire::Builder;

    pub fn pd_record(handle: u32) -> Vec<u8> {
        let mut b = Builder::new();
        b.u32(0).u32(12).u32(handle);
        b.into_vec()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn mr_record(
        handle: u32,
        address: u64,
        length: u64,
        access: MrAccessFlags,
        pd_handle: u32,
        lkey: u32,
        rkey: u32,
        mrn: u32,
    ) -> Vec<u8> {
        let mut b = Builder::new();
        b.u32(1).u32(48).u32(handle);
        b.u64(address).u64(length).u32(access.bits()).u32(pd_handle).u32(lkey).u32(rkey).u32(mrn);
        b.into_vec()
    }

    /// Overridable fixture for building a CQ record; defaults describe a
    /// modestly sized ring with a few entries already consumed.
    pub struct CqFixture {
        pub handle: u32,
        pub cqe: u32,
        pub comp_vector: u32,
        pub comp_channel: i32,
        pub vm_start: u64,
        pub vm_size: u64,
        pub rxe: RxeQueueSnapshot,
    }

    impl Default for CqFixture {
        fn default() -> Self {
            CqFixture {
                handle: 1,
                cqe: 128,
                comp_vector: 0,
                comp_channel: NO_COMP_CHANNEL,
                vm_start: 0x7f0000000000,
                vm_size: 0x4000,
                rxe: RxeQueueSnapshot {
                    log2_elem_size: 5,
                    index_mask: 0x7f,
                    producer_index: 7,
                    consumer_index: 3,
                },
            }
        }
    }

    pub fn cq_record(f: CqFixture) -> Vec<u8> {
        let mut b = Builder::new();
        b.u32(2).u32(56).u32(f.handle);
        b.u32(f.cqe).u32(f.comp_vector).i32(f.comp_channel).u64(f.vm_start).u64(f.vm_size);
        b.u32(f.rxe.log2_elem_size).u32(f.rxe.index_mask).u32(f.rxe.producer_index).u32(f.rxe.consumer_index);
        b.into_vec()
    }

    /// Overridable fixture for building a QP record; defaults describe a
    /// fully connected RC queue pair at RTS.
    pub struct QpFixture {
        pub handle: u32,
        pub pd_handle: u32,
        pub scq_handle: u32,
        pub rcq_handle: u32,
        pub srq_handle: u32,
        pub qp_type: u32,
        pub sq_sig_all: bool,
        pub qp_num: u32,
        pub qp_state: u32,
        pub caps: QpCaps,
        pub pkey_index: u32,
        pub port_num: u32,
        pub qp_access_flags: u32,
        pub path_mtu: u32,
        pub dest_qp_num: u32,
        pub rq_psn: u32,
        pub max_dest_rd_atomic: u32,
        pub ah_attr: AhAttr,
        pub sq_psn: u32,
        pub max_rd_atomic: u32,
        pub retry_cnt: u32,
        pub rnr_retry: u32,
        pub timeout: u32,
        pub rq_start: u64,
        pub rq_size: u64,
        pub sq_start: u64,
        pub sq_size: u64,
        pub rxe_sq: RxeQueueSnapshot,
        pub rxe_rq: RxeQueueSnapshot,
        pub wqe_index: u32,
        pub req_opcode: i32,
        pub comp_psn: u32,
        pub comp_opcode: i32,
        pub msn: u32,
        pub resp_opcode: i32,
    }

    impl Default for QpFixture {
        fn default() -> Self {
            QpFixture {
                handle: 3,
                pd_handle: 0,
                scq_handle: 1,
                rcq_handle: 2,
                srq_handle: NO_SRQ,
                qp_type: 2, // RC
                sq_sig_all: true,
                qp_num: 0x100,
                qp_state: 3, // RTS
                caps: QpCaps {
                    max_send_wr: 16,
                    max_recv_wr: 16,
                    max_send_sge: 1,
                    max_recv_sge: 1,
                    max_inline_data: 0,
                },
                pkey_index: 0,
                port_num: 1,
                qp_access_flags: MrAccessFlags::LOCAL_WRITE.bits(),
                path_mtu: 3,
                dest_qp_num: 0x200,
                rq_psn: 0,
                max_dest_rd_atomic: 1,
                ah_attr: AhAttr::default(),
                sq_psn: 0,
                max_rd_atomic: 1,
                retry_cnt: 7,
                rnr_retry: 7,
                timeout: 14,
                rq_start: 0,
                rq_size: 0,
                sq_start: 0,
                sq_size: 0,
                rxe_sq: RxeQueueSnapshot::default(),
                rxe_rq: RxeQueueSnapshot::default(),
                wqe_index: 0,
                req_opcode: -1,
                comp_psn: 0,
                comp_opcode: -1,
                msn: 0,
                resp_opcode: -1,
            }
        }
    }

    pub fn qp_record(f: QpFixture) -> Vec<u8> {
        let mut b = Builder::new();
        b.u32(3).u32(260).u32(f.handle);
        b.u32(f.pd_handle).u32(f.scq_handle).u32(f.rcq_handle).u32(f.srq_handle);
        b.u32(f.qp_type).u32(f.sq_sig_all as u32).u32(f.qp_num).u32(f.qp_state);
        b.u32(f.caps.max_send_wr).u32(f.caps.max_recv_wr).u32(f.caps.max_send_sge).u32(f.caps.max_recv_sge).u32(f.caps.max_inline_data);
        b.u32(f.pkey_index).u32(f.port_num).u32(f.qp_access_flags);
        // min_rnr_timer is written but ignored by the decoder, which
        // reproduces the original's path_mtu copy-paste bug instead.
        b.u32(f.path_mtu).u32(f.dest_qp_num).u32(f.rq_psn).u32(f.max_dest_rd_atomic).u32(0);
        b.bytes16(f.ah_attr.dgid).u32(f.ah_attr.flow_label).u32(f.ah_attr.sgid_index as u32);
        b.u32(f.ah_attr.hop_limit as u32).u32(f.ah_attr.traffic_class as u32).u32(f.ah_attr.dlid as u32);
        b.u32(f.ah_attr.sl as u32).u32(f.ah_attr.src_path_bits as u32).u32(f.ah_attr.static_rate as u32);
        b.u32(f.ah_attr.is_global as u32).u32(f.ah_attr.port_num as u32);
        b.u32(f.sq_psn).u32(f.max_rd_atomic).u32(f.retry_cnt).u32(f.rnr_retry).u32(f.timeout);
        b.u64(f.rq_start).u64(f.rq_size).u64(f.sq_start).u64(f.sq_size);
        b.u32(f.rxe_sq.log2_elem_size).u32(f.rxe_sq.index_mask).u32(f.rxe_sq.producer_index).u32(f.rxe_sq.consumer_index);
        b.u32(f.rxe_rq.log2_elem_size).u32(f.rxe_rq.index_mask).u32(f.rxe_rq.producer_index).u32(f.rxe_rq.consumer_index);
        b.u32(f.wqe_index).i32(f.req_opcode).u32(f.comp_psn).i32(f.comp_opcode).u32(f.msn).i32(f.resp_opcode);
        b.into_vec()
    }
}

/// Build a [`CrError`] quickly in test assertions without importing the
/// whole error module.
pub fn io_err(msg: &str) -> CrError {
    CrError::io("test", std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
}
