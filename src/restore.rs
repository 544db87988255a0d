//! Restore pipeline.
//!
//! Drains a dependency-ordered queue of decoded objects, re-creating each
//! one against a [`VerbsDevice`] and driving queue pairs through the
//! RESET→INIT→RTR→RTS state machine. One failure aborts the whole restore;
//! there is no partial success, since a half-restored context leaves
//! handles, keys, and QP numbers that don't match what was dumped.

use crate::catalog::Catalog;
use crate::device::{CqCreateArgs, QpCreateArgs, RestoreArgs, VerbsDevice};
use crate::error::{CrError, CrResult};
use crate::knobs::KernelParams;
use crate::model::*;
use crate::vma::VmaKeeper;
use std::collections::HashSet;

/// An opaque live handle for a restored PD, carried in the catalog purely
/// so MRs and QPs can assert their dependency exists; PDs have no other
/// restorable state.
pub struct LivePd {
    pub handle: u32,
}

pub struct LiveMr {
    pub handle: u32,
}

pub struct LiveCq {
    pub handle: u32,
}

pub struct LiveQp {
    pub handle: u32,
    pub qp_num: u32,
}

/// Per-restore catalogs, one per object kind. Kept separate (rather than a
/// single `Catalog<enum>`) so each restore function only borrows the
/// tables it actually needs.
#[derive(Default)]
pub struct RestoreCatalogs {
    pub pds: Catalog<LivePd>,
    pub mrs: Catalog<LiveMr>,
    pub cqs: Catalog<LiveCq>,
    pub qps: Catalog<LiveQp>,
}

/// Stably topo-sort `objects` so every entry appears after the objects
/// named by its [`ObjectRecord::depends_on`] edges. Entries with no
/// dependency edge keep their original relative order, so restore order
/// doesn't depend on which direction the dump happened to list things in.
pub fn topo_sort(objects: Vec<ObjectRecord>) -> CrResult<Vec<ObjectRecord>> {
    let n = objects.len();
    let mut placed: HashSet<(ObjectKind, u32)> = HashSet::new();
    let mut remaining: Vec<ObjectRecord> = objects;
    let mut ordered = Vec::with_capacity(n);

    while !remaining.is_empty() {
        let mut progressed = false;
        let mut next_round = Vec::new();
        for obj in remaining.into_iter() {
            let ready = obj.depends_on().iter().all(|dep| placed.contains(dep));
            if ready {
                placed.insert((obj.kind(), obj.handle()));
                ordered.push(obj);
                progressed = true;
            } else {
                next_round.push(obj);
            }
        }
        remaining = next_round;
        if !progressed && !remaining.is_empty() {
            return Err(CrError::DecodeMismatch(
                "restore queue has an unresolved or cyclic dependency".into(),
            ));
        }
    }

    Ok(ordered)
}

/// Restore one PD: allocate it and assert the kernel handed back the
/// recorded handle.
pub fn restore_pd(device: &dyn VerbsDevice, catalogs: &mut RestoreCatalogs, pd: &PdRecord) -> CrResult<()> {
    let handle = device.alloc_pd()?;
    if handle != pd.handle {
        return Err(CrError::IdentityMismatch {
            what: "PD handle",
            expected: pd.handle,
            actual: handle,
        });
    }
    catalogs.pds.remember(ObjectKind::Pd, pd.handle, LivePd { handle })?;
    log::info!("restored PD handle={}", pd.handle);
    Ok(())
}

/// Restore one MR: look up its PD, force `last_mrn`, register the memory,
/// then install the exact lkey/rkey.
pub fn restore_mr(
    device: &mut dyn VerbsDevice,
    params: &mut KernelParams,
    catalogs: &mut RestoreCatalogs,
    mr: &MrRecord,
) -> CrResult<()> {
    catalogs
        .pds
        .lookup(ObjectKind::Pd, mr.pd_handle)
        .ok_or(CrError::CatalogClash {
            kind: ObjectKind::Pd,
            handle: mr.pd_handle,
            reason: "MR references a PD that was never restored",
        })?;

    let handle = {
        let _forced = params.force_last_mrn(mr.mrn)?;
        device.reg_mr(mr.pd_handle, mr.address, mr.length, mr.access)?
    };

    device.restore_mr_keys(handle, mr.lkey, mr.rkey)?;
    catalogs.mrs.remember(ObjectKind::Mr, mr.handle, LiveMr { handle })?;
    log::info!("restored MR handle={} lkey=0x{:x} rkey=0x{:x}", mr.handle, mr.lkey, mr.rkey);
    Ok(())
}

/// Restore one CQ: create it, claim its ring VMA range, then refill the
/// ring contents.
pub fn restore_cq(
    device: &mut dyn VerbsDevice,
    catalogs: &mut RestoreCatalogs,
    keeper: &mut VmaKeeper,
    cq: &CqRecord,
) -> CrResult<()> {
    if cq.comp_channel != NO_COMP_CHANNEL {
        return Err(CrError::UnsupportedFeature("completion channels are not supported"));
    }

    let args = CqCreateArgs {
        cqe: cq.cqe,
        comp_vector: cq.comp_vector,
        queue: cq.queue,
    };
    let handle = device.create_cq(&args)?;

    if !cq.queue.is_empty() {
        keeper.keep_address_range(cq.queue.vm_start, cq.queue.vm_size)?;
    }

    catalogs.cqs.remember(ObjectKind::Cq, cq.handle, LiveCq { handle })?;
    device.refill_cq(handle, cq.rxe)?;
    log::info!("restored CQ handle={} cqe={}", cq.handle, cq.cqe);
    Ok(())
}

/// Drive a QP already created at RESET through to `target`, issuing one
/// `modify_qp` per transition with exactly the attribute subset each
/// transition in the rxe state machine needs. Only RC is implemented.
pub fn drive_qp_state_machine(
    device: &mut dyn VerbsDevice,
    qp_handle: u32,
    qp: &QpRecord,
    target: QpState,
) -> CrResult<()> {
    if !matches!(qp.qp_type, QpType::Rc) {
        return Err(CrError::UnsupportedFeature("only RC queue pairs are restorable"));
    }

    let mut current = QpState::Reset;
    if target < current {
        return Err(CrError::UnsupportedFeature("QP target state precedes RESET"));
    }

    if target == QpState::Reset {
        return Ok(());
    }

    // RESET -> INIT
    let mut args = RestoreArgs {
        pkey_index: qp.pkey_index,
        port_num: qp.port_num,
        qp_access_flags: qp.qp_access_flags,
        ..Default::default()
    };
    device.modify_qp(qp_handle, &args)?;
    current = QpState::Init;
    log::debug!("QP handle={} RESET->INIT", qp.handle);
    if target == current {
        return Ok(());
    }

    // INIT -> RTR
    args = RestoreArgs {
        ah_attr: qp.ah_attr.clone(),
        path_mtu: qp.path_mtu,
        dest_qp_num: qp.dest_qp_num,
        rq_psn: qp.rq_psn,
        max_dest_rd_atomic: qp.max_dest_rd_atomic,
        min_rnr_timer: qp.min_rnr_timer,
        ..Default::default()
    };
    device.modify_qp(qp_handle, &args)?;
    current = QpState::Rtr;
    log::debug!("QP handle={} INIT->RTR", qp.handle);
    if target == current {
        return Ok(());
    }

    // RTR -> RTS
    args = RestoreArgs {
        sq_psn: qp.sq_psn,
        max_rd_atomic: qp.max_rd_atomic,
        retry_cnt: qp.retry_cnt,
        rnr_retry: qp.rnr_retry,
        timeout: qp.timeout,
        ..Default::default()
    };
    device.modify_qp(qp_handle, &args)?;
    log::debug!("QP handle={} RTR->RTS", qp.handle);

    Ok(())
}

/// Restore one QP end to end: create, assert `qp_num`, claim ring VMAs,
/// drive the state machine, then refill.
pub fn restore_qp(
    device: &mut dyn VerbsDevice,
    params: &mut KernelParams,
    catalogs: &mut RestoreCatalogs,
    keeper: &mut VmaKeeper,
    qp: &QpRecord,
) -> CrResult<()> {
    if qp.srq_handle != NO_SRQ {
        return Err(CrError::UnsupportedFeature("shared receive queues are not supported"));
    }

    catalogs
        .pds
        .lookup(ObjectKind::Pd, qp.pd_handle)
        .ok_or(CrError::CatalogClash {
            kind: ObjectKind::Pd,
            handle: qp.pd_handle,
            reason: "QP references a PD that was never restored",
        })?;
    catalogs
        .cqs
        .lookup(ObjectKind::Cq, qp.scq_handle)
        .ok_or(CrError::CatalogClash {
            kind: ObjectKind::Cq,
            handle: qp.scq_handle,
            reason: "QP references a send CQ that was never restored",
        })?;
    catalogs
        .cqs
        .lookup(ObjectKind::Cq, qp.rcq_handle)
        .ok_or(CrError::CatalogClash {
            kind: ObjectKind::Cq,
            handle: qp.rcq_handle,
            reason: "QP references a recv CQ that was never restored",
        })?;

    let create_args = QpCreateArgs {
        pd_handle: qp.pd_handle,
        send_cq_handle: qp.scq_handle,
        recv_cq_handle: qp.rcq_handle,
        qp_type_rc: matches!(qp.qp_type, QpType::Rc),
        sq_sig_all: qp.sq_sig_all,
        caps: qp.caps,
        rq: qp.rq,
        sq: qp.sq,
    };

    let (handle, qp_num) = {
        let _forced = params.force_last_qpn(qp.qp_num)?;
        device.create_qp(&create_args)?
    };

    if qp_num != qp.qp_num {
        return Err(CrError::IdentityMismatch {
            what: "QP number",
            expected: qp.qp_num,
            actual: qp_num,
        });
    }

    if !qp.rq.is_empty() {
        keeper.keep_address_range(qp.rq.vm_start, qp.rq.vm_size)?;
    }
    if !qp.sq.is_empty() {
        keeper.keep_address_range(qp.sq.vm_start, qp.sq.vm_size)?;
    }

    catalogs.qps.remember(ObjectKind::Qp, qp.handle, LiveQp { handle, qp_num })?;

    drive_qp_state_machine(device, handle, qp, qp.qp_state)?;
    device.refill_qp(handle, qp.rxe)?;
    log::info!("restored QP handle={} qp_num=0x{:x} state={:?}", qp.handle, qp.qp_num, qp.qp_state);
    Ok(())
}

/// Drain a dump's object list in dependency order, restoring each entry
/// against `device`. Returns the populated catalogs so the caller can
/// inspect live handles (or just discard them once restore succeeds).
pub fn restore_all(
    device: &mut dyn VerbsDevice,
    params: &mut KernelParams,
    keeper: &mut VmaKeeper,
    objects: Vec<ObjectRecord>,
) -> CrResult<RestoreCatalogs> {
    let ordered = topo_sort(objects)?;
    let mut catalogs = RestoreCatalogs::default();

    for obj in &ordered {
        let result = match obj {
            ObjectRecord::Pd(pd) => restore_pd(device, &mut catalogs, pd),
            ObjectRecord::Mr(mr) => restore_mr(device, params, &mut catalogs, mr),
            ObjectRecord::Cq(cq) => restore_cq(device, &mut catalogs, keeper, cq),
            ObjectRecord::Qp(qp) => restore_qp(device, params, &mut catalogs, keeper, qp),
        };
        if let Err(e) = result {
            log::error!("aborting restore: {:?} handle={} failed: {}", obj.kind(), obj.handle(), e);
            return Err(e);
        }
    }

    Ok(catalogs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeProcFile, FakeVerbsDevice};

    fn fresh_params() -> KernelParams {
        KernelParams::new(Box::new(FakeProcFile::new(0)), Box::new(FakeProcFile::new(0)))
    }

    #[test]
    fn restore_pd_only() {
        let mut device = FakeVerbsDevice::new();
        let mut params = fresh_params();
        let mut keeper = VmaKeeper::new();
        let objs = vec![ObjectRecord::Pd(PdRecord { handle: 0 })];
        let catalogs = restore_all(&mut device, &mut params, &mut keeper, objs).unwrap();
        assert!(catalogs.pds.contains(ObjectKind::Pd, 0));
        assert_eq!(device.alloc_pd_calls.get(), 1);
    }

    #[test]
    fn restore_pd_and_mr_links_identity() {
        let mut device = FakeVerbsDevice::new();
        let mut params = fresh_params();
        let mut keeper = VmaKeeper::new();
        let objs = vec![
            ObjectRecord::Pd(PdRecord { handle: 0 }),
            ObjectRecord::Mr(MrRecord {
                handle: 1,
                address: 0x400000,
                length: 0x1000,
                access: MrAccessFlags::LOCAL_WRITE,
                pd_handle: 0,
                lkey: 0xAAAA,
                rkey: 0xBBBB,
                mrn: 5,
            }),
        ];
        let catalogs = restore_all(&mut device, &mut params, &mut keeper, objs).unwrap();
        assert!(catalogs.mrs.contains(ObjectKind::Mr, 1));
        assert_eq!(
            *device.restore_object_calls.borrow(),
            vec![(ObjectKind::Mr, "MR_KEYS")]
        );
    }

    #[test]
    fn restore_cq_ring_claims_vma_range() {
        let mut device = FakeVerbsDevice::new();
        let mut params = fresh_params();
        let mut keeper = VmaKeeper::new();
        let objs = vec![ObjectRecord::Cq(CqRecord {
            handle: 1,
            cqe: 128,
            comp_vector: 0,
            comp_channel: NO_COMP_CHANNEL,
            queue: VmRange { vm_start: 0x7f0000000000, vm_size: 0x4000 },
            rxe: RxeQueueSnapshot::default(),
        })];
        restore_all(&mut device, &mut params, &mut keeper, objs).unwrap();
        assert!(keeper.is_kept(0x7f0000000000));
    }

    #[test]
    fn restore_cq_with_comp_channel_fails() {
        let mut device = FakeVerbsDevice::new();
        let mut params = fresh_params();
        let mut keeper = VmaKeeper::new();
        let objs = vec![ObjectRecord::Cq(CqRecord {
            handle: 1,
            cqe: 128,
            comp_vector: 0,
            comp_channel: 3,
            queue: VmRange::default(),
            rxe: RxeQueueSnapshot::default(),
        })];
        let err = restore_all(&mut device, &mut params, &mut keeper, objs).unwrap_err();
        assert!(matches!(err, CrError::UnsupportedFeature(_)));
    }

    fn full_qp_objects() -> Vec<ObjectRecord> {
        vec![
            ObjectRecord::Pd(PdRecord { handle: 0 }),
            ObjectRecord::Cq(CqRecord {
                handle: 1,
                cqe: 128,
                comp_vector: 0,
                comp_channel: NO_COMP_CHANNEL,
                queue: VmRange::default(),
                rxe: RxeQueueSnapshot::default(),
            }),
            ObjectRecord::Cq(CqRecord {
                handle: 2,
                cqe: 128,
                comp_vector: 0,
                comp_channel: NO_COMP_CHANNEL,
                queue: VmRange::default(),
                rxe: RxeQueueSnapshot::default(),
            }),
            ObjectRecord::Qp(QpRecord {
                handle: 3,
                pd_handle: 0,
                scq_handle: 1,
                rcq_handle: 2,
                srq_handle: NO_SRQ,
                qp_type: QpType::Rc,
                sq_sig_all: true,
                qp_num: 0x100,
                qp_state: QpState::Rts,
                caps: QpCaps::default(),
                pkey_index: 0,
                port_num: 1,
                qp_access_flags: MrAccessFlags::LOCAL_WRITE,
                path_mtu: 3,
                dest_qp_num: 0x200,
                rq_psn: 0,
                max_dest_rd_atomic: 1,
                min_rnr_timer: 3,
                ah_attr: AhAttr::default(),
                sq_psn: 0,
                max_rd_atomic: 1,
                retry_cnt: 7,
                rnr_retry: 7,
                timeout: 14,
                rq: VmRange::default(),
                sq: VmRange::default(),
                rxe: RxeQpSnapshot::default(),
            }),
        ]
    }

    #[test]
    fn full_rc_qp_round_trip_to_rts_issues_three_modify_calls() {
        let mut device = FakeVerbsDevice::new();
        device.set_next_qpn(0x100);
        let mut params = fresh_params();
        let mut keeper = VmaKeeper::new();
        restore_all(&mut device, &mut params, &mut keeper, full_qp_objects()).unwrap();
        assert_eq!(device.modify_qp_calls.borrow().len(), 3);
        assert_eq!(
            *device.restore_object_calls.borrow(),
            vec![
                (ObjectKind::Cq, "CQ_CREATE"),
                (ObjectKind::Cq, "CQ_REFILL"),
                (ObjectKind::Cq, "CQ_CREATE"),
                (ObjectKind::Cq, "CQ_REFILL"),
                (ObjectKind::Qp, "QP_CREATE"),
                (ObjectKind::Qp, "QP_REFILL"),
            ]
        );
    }

    #[test]
    fn qp_with_srq_is_rejected() {
        let mut device = FakeVerbsDevice::new();
        let mut params = fresh_params();
        let mut keeper = VmaKeeper::new();
        let mut objs = full_qp_objects();
        if let ObjectRecord::Qp(qp) = objs.last_mut().unwrap() {
            qp.srq_handle = 0;
        }
        let err = restore_all(&mut device, &mut params, &mut keeper, objs).unwrap_err();
        assert!(matches!(err, CrError::UnsupportedFeature(_)));
    }

    #[test]
    fn qp_num_mismatch_is_identity_error() {
        let mut device = FakeVerbsDevice::new();
        device.set_next_qpn(0x999);
        let mut params = fresh_params();
        let mut keeper = VmaKeeper::new();
        let err = restore_all(&mut device, &mut params, &mut keeper, full_qp_objects()).unwrap_err();
        assert!(matches!(err, CrError::IdentityMismatch { .. }));
    }

    #[test]
    fn scrambled_dump_order_still_restores_dependency_first() {
        let mut device = FakeVerbsDevice::new();
        device.set_next_qpn(0x100);
        let mut params = fresh_params();
        let mut keeper = VmaKeeper::new();
        let mut objs = full_qp_objects();
        objs.reverse();
        let catalogs = restore_all(&mut device, &mut params, &mut keeper, objs).unwrap();
        assert!(catalogs.qps.contains(ObjectKind::Qp, 3));
    }

    #[test]
    fn unresolved_dependency_fails_cleanly() {
        let mut device = FakeVerbsDevice::new();
        let mut params = fresh_params();
        let mut keeper = VmaKeeper::new();
        let objs = vec![ObjectRecord::Mr(MrRecord {
            handle: 1,
            address: 0,
            length: 0x1000,
            access: MrAccessFlags::LOCAL_WRITE,
            pd_handle: 9,
            lkey: 1,
            rkey: 1,
            mrn: 1,
        })];
        let err = restore_all(&mut device, &mut params, &mut keeper, objs).unwrap_err();
        assert!(matches!(err, CrError::DecodeMismatch(_)));
    }
}
