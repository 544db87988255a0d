//! Dump decoder.
//!
//! Parses the kernel dump ioctl's flat buffer — a sequence of `count`
//! tagged, fixed-size records — into a typed [`ObjectRecord`] list, and
//! flags the VMAs backing any decoded MR as VERBS-owned. Unknown record
//! types and size mismatches are both fatal to the whole dump: there is no
//! partial decode, since a half-decoded object graph can't be restored
//! safely on the other end.

use crate::error::{CrError, CrResult};
use crate::model::*;
use crate::vma::VmaArea;
use crate::wire::Cursor;

/// Common header every record begins with: `{ type, size, handle }`.
const HEADER_SIZE: usize = 12;

const PD_RECORD_SIZE: usize = HEADER_SIZE;
const MR_RECORD_SIZE: usize = HEADER_SIZE + 36;
const CQ_RECORD_SIZE: usize = HEADER_SIZE + 44;
const QP_RECORD_SIZE: usize = HEADER_SIZE + 248;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordHeader {
    raw_type: u32,
    size: u32,
    handle: u32,
}

fn read_header(cur: &mut Cursor<'_>) -> CrResult<RecordHeader> {
    let raw_type = cur.u32()?;
    let size = cur.u32()?;
    let handle = cur.u32()?;
    Ok(RecordHeader { raw_type, size, handle })
}

fn expected_size(raw_type: u32) -> CrResult<usize> {
    match raw_type {
        0 => Ok(PD_RECORD_SIZE),
        1 => Ok(MR_RECORD_SIZE),
        2 => Ok(CQ_RECORD_SIZE),
        3 => Ok(QP_RECORD_SIZE),
        other => Err(CrError::DecodeMismatch(format!("unknown object type {}", other))),
    }
}

fn decode_pd(header: RecordHeader) -> CrResult<ObjectRecord> {
    Ok(ObjectRecord::Pd(PdRecord { handle: header.handle }))
}

fn decode_mr(cur: &mut Cursor<'_>, header: RecordHeader, vmas: &mut [VmaArea]) -> CrResult<ObjectRecord> {
    let address = cur.u64()?;
    let length = cur.u64()?;
    let access = MrAccessFlags::from_bits_truncate(cur.u32()?);
    let pd_handle = cur.u32()?;
    let lkey = cur.u32()?;
    let rkey = cur.u32()?;
    let mrn = cur.u32()?;

    crate::vma::VmaKeeper::flag_overlapping(vmas, address, length);

    log::trace!("decoded MR handle={} @0x{:x}+0x{:x}", header.handle, address, length);

    Ok(ObjectRecord::Mr(MrRecord {
        handle: header.handle,
        address,
        length,
        access,
        pd_handle,
        lkey,
        rkey,
        mrn,
    }))
}

fn decode_cq(cur: &mut Cursor<'_>, header: RecordHeader) -> CrResult<ObjectRecord> {
    let cqe = cur.u32()?;
    let comp_vector = cur.u32()?;
    let comp_channel = cur.i32()?;
    let vm_start = cur.u64()?;
    let vm_size = cur.u64()?;
    let rxe = RxeQueueSnapshot {
        log2_elem_size: cur.u32()?,
        index_mask: cur.u32()?,
        producer_index: cur.u32()?,
        consumer_index: cur.u32()?,
    };

    Ok(ObjectRecord::Cq(CqRecord {
        handle: header.handle,
        cqe,
        comp_vector,
        comp_channel,
        queue: VmRange { vm_start, vm_size },
        rxe,
    }))
}

fn decode_qp(cur: &mut Cursor<'_>, header: RecordHeader) -> CrResult<ObjectRecord> {
    let pd_handle = cur.u32()?;
    let scq_handle = cur.u32()?;
    let rcq_handle = cur.u32()?;
    let srq_handle = cur.u32()?;
    let qp_type = QpType::from_raw(cur.u32()? as u8);
    let sq_sig_all = cur.u32()? != 0;
    let qp_num = cur.u32()?;
    let qp_state_raw = cur.u32()?;

    let caps = QpCaps {
        max_send_wr: cur.u32()?,
        max_recv_wr: cur.u32()?,
        max_send_sge: cur.u32()?,
        max_recv_sge: cur.u32()?,
        max_inline_data: cur.u32()?,
    };

    let pkey_index = cur.u32()? as u16;
    let port_num = cur.u32()? as u8;
    let qp_access_flags = MrAccessFlags::from_bits_truncate(cur.u32()?);

    let path_mtu = cur.u32()?;
    let dest_qp_num = cur.u32()?;
    let rq_psn = cur.u32()?;
    let max_dest_rd_atomic = cur.u32()? as u8;
    // Preserved bug: the original dump routine assigns `path_mtu` here
    // instead of a captured timer value, so the field on the wire is
    // already wrong by the time it reaches us. We read it for offset
    // bookkeeping and discard it rather than compound the mistake.
    let _min_rnr_timer_raw = cur.u32()?;
    let min_rnr_timer = path_mtu as u8;
    log::warn!(
        "QP handle={}: min_rnr_timer recorded as path_mtu ({}), not a real timer value (known upstream bug)",
        header.handle,
        min_rnr_timer
    );

    let ah_attr = AhAttr {
        dgid: cur.bytes16()?,
        flow_label: cur.u32()?,
        sgid_index: cur.u32()? as u8,
        hop_limit: cur.u32()? as u8,
        traffic_class: cur.u32()? as u8,
        dlid: cur.u32()? as u16,
        sl: cur.u32()? as u8,
        src_path_bits: cur.u32()? as u8,
        static_rate: cur.u32()? as u8,
        is_global: cur.u32()? as u8,
        port_num: cur.u32()? as u8,
    };

    let sq_psn = cur.u32()?;
    let max_rd_atomic = cur.u32()? as u8;
    let retry_cnt = cur.u32()? as u8;
    let rnr_retry = cur.u32()? as u8;
    let timeout = cur.u32()? as u8;

    let rq_start = cur.u64()?;
    let rq_size = cur.u64()?;
    let sq_start = cur.u64()?;
    let sq_size = cur.u64()?;

    let rxe_sq = RxeQueueSnapshot {
        log2_elem_size: cur.u32()?,
        index_mask: cur.u32()?,
        producer_index: cur.u32()?,
        consumer_index: cur.u32()?,
    };
    let rxe_rq = RxeQueueSnapshot {
        log2_elem_size: cur.u32()?,
        index_mask: cur.u32()?,
        producer_index: cur.u32()?,
        consumer_index: cur.u32()?,
    };
    let wqe_index = cur.u32()?;
    let req_opcode = cur.i32()?;
    let comp_psn = cur.u32()?;
    let comp_opcode = cur.i32()?;
    let msn = cur.u32()?;
    let resp_opcode = cur.i32()?;

    let qp_state = QpState::from_raw(qp_state_raw)
        .ok_or_else(|| CrError::UnsupportedFeature("qp target state outside RESET/INIT/RTR/RTS"))?;

    log::debug!("decoded QP handle={} qp_num=0x{:x} type={:?}", header.handle, qp_num, qp_type);

    Ok(ObjectRecord::Qp(QpRecord {
        handle: header.handle,
        pd_handle,
        scq_handle,
        rcq_handle,
        srq_handle,
        qp_type,
        sq_sig_all,
        qp_num,
        qp_state,
        caps,
        pkey_index,
        port_num,
        qp_access_flags,
        path_mtu,
        dest_qp_num,
        rq_psn,
        max_dest_rd_atomic,
        min_rnr_timer,
        ah_attr,
        sq_psn,
        max_rd_atomic,
        retry_cnt,
        rnr_retry,
        timeout,
        rq: VmRange { vm_start: rq_start, vm_size: rq_size },
        sq: VmRange { vm_start: sq_start, vm_size: sq_size },
        rxe: RxeQpSnapshot {
            sq: rxe_sq,
            rq: rxe_rq,
            wqe_index,
            req_opcode,
            comp_psn,
            comp_opcode,
            msn,
            resp_opcode,
        },
    }))
}

/// Decode `count` records from `buf`, flagging any VMA in `vmas` that an MR
/// record overlaps. Returns the decoded objects in dump order.
///
/// Fails the whole dump (no partial result) on the first unknown type or
/// size mismatch; there is no recovery path once the record stream is out
/// of sync with what we expect.
pub fn decode_dump(buf: &[u8], count: u32, vmas: &mut [VmaArea]) -> CrResult<Vec<ObjectRecord>> {
    let mut cur = Cursor::new(buf);
    let mut objects = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let record_start = cur.position();
        let header = read_header(&mut cur)?;
        let expected = expected_size(header.raw_type)?;
        if header.size as usize != expected {
            log::error!(
                "aborting dump decode: object type {} declared size {}, expected {}",
                header.raw_type, header.size, expected
            );
            return Err(CrError::DecodeMismatch(format!(
                "object type {} declared size {}, expected {}",
                header.raw_type, header.size, expected
            )));
        }

        let obj = match header.raw_type {
            0 => decode_pd(header)?,
            1 => decode_mr(&mut cur, header, vmas)?,
            2 => decode_cq(&mut cur, header)?,
            3 => decode_qp(&mut cur, header)?,
            other => {
                log::error!("aborting dump decode: unknown object type {}", other);
                return Err(CrError::DecodeMismatch(format!("unknown object type {}", other)));
            }
        };
        objects.push(obj);

        cur.seek_to(record_start + expected)?;
    }

    if cur.position() > buf.len() {
        return Err(CrError::DecodeMismatch("decoded past end of dump buffer".into()));
    }

    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::encode;

    #[test]
    fn decodes_pd_only_dump() {
        let buf = encode::pd_record(0);
        let mut vmas = Vec::new();
        let objs = decode_dump(&buf, 1, &mut vmas).unwrap();
        assert_eq!(objs.len(), 1);
        assert!(matches!(&objs[0], ObjectRecord::Pd(pd) if pd.handle == 0));
    }

    #[test]
    fn size_mismatch_fails_whole_dump() {
        let mut buf = encode::pd_record(0);
        // Corrupt the declared size field (second u32 in the header).
        buf[4..8].copy_from_slice(&0u32.to_ne_bytes());
        let mut vmas = Vec::new();
        let err = decode_dump(&buf, 1, &mut vmas).unwrap_err();
        assert!(matches!(err, CrError::DecodeMismatch(_)));
    }

    #[test]
    fn unknown_type_is_fatal() {
        let mut buf = encode::pd_record(0);
        buf[0..4].copy_from_slice(&99u32.to_ne_bytes());
        let mut vmas = Vec::new();
        assert!(decode_dump(&buf, 1, &mut vmas).is_err());
    }

    #[test]
    fn mr_decode_flags_overlapping_vma() {
        let buf = encode::mr_record(1, 0x400000, 0x2000, MrAccessFlags::LOCAL_WRITE, 0, 0xAAAA, 0xBBBB, 42);
        let mut vmas = vec![VmaArea {
            start: 0x400000,
            end: 0x402000,
            fd: -1,
            pgoff: 0,
            prot: 0,
            flags: 0,
            is_ibverbs: false,
        }];
        let objs = decode_dump(&buf, 1, &mut vmas).unwrap();
        assert!(matches!(&objs[0], ObjectRecord::Mr(mr) if mr.lkey == 0xAAAA && mr.rkey == 0xBBBB));
        assert!(vmas[0].is_ibverbs);
    }

    #[test]
    fn decode_totality_offset_matches_consumed_bytes() {
        let pd = encode::pd_record(0);
        let cq = encode::cq_record(encode::CqFixture::default());
        let mut buf = pd.clone();
        buf.extend_from_slice(&cq);
        let mut vmas = Vec::new();
        decode_dump(&buf, 2, &mut vmas).unwrap();
        assert_eq!(pd.len() + cq.len(), buf.len());
    }

    #[test]
    fn min_rnr_timer_mirrors_path_mtu_bug() {
        let _ = env_logger::try_init();
        let buf = encode::qp_record(encode::QpFixture::default());
        let mut vmas = Vec::new();
        let objs = decode_dump(&buf, 1, &mut vmas).unwrap();
        match &objs[0] {
            ObjectRecord::Qp(qp) => assert_eq!(qp.min_rnr_timer as u32, qp.path_mtu),
            _ => panic!("expected QP"),
        }
    }
}
