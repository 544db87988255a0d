//! Kernel parameter knobs.
//!
//! Two procfs files, `last_qpn` and `last_mrn`, let the restorer coerce the
//! rxe driver into re-issuing the exact QP number / MR key a dump recorded.
//! The kernel internally rounds `last_qpn` up by 16 when allocating, so
//! forcing `qpn - 16` makes the *next* allocation land on `qpn`.

use crate::error::{CrError, CrResult};
use std::fmt;

/// One procfs-backed decimal knob. Implementations read the current value
/// (when asked) and write a new one, both as ASCII decimal with a trailing
/// newline, matching `rxe_set_parameter` in the original C source.
pub trait ProcFile: fmt::Debug {
    /// Read the current decimal value.
    fn read_decimal(&mut self) -> CrResult<u32>;
    /// Write a new decimal value, trailing newline included.
    fn write_decimal(&mut self, value: u32) -> CrResult<()>;
}

/// A real procfs file opened once and reused for the life of the process,
/// matching the service-fd pattern the original installs at init time.
#[derive(Debug)]
pub struct LiveProcFile {
    path: &'static str,
    file: std::fs::File,
}

impl LiveProcFile {
    pub fn open(path: &'static str) -> CrResult<Self> {
        use std::fs::OpenOptions;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CrError::io(path, e))?;
        Ok(LiveProcFile { path, file })
    }
}

impl ProcFile for LiveProcFile {
    fn read_decimal(&mut self) -> CrResult<u32> {
        use std::io::{Read, Seek, SeekFrom};
        let mut buf = String::new();
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| CrError::io(self.path, e))?;
        self.file
            .read_to_string(&mut buf)
            .map_err(|e| CrError::io(self.path, e))?;
        buf.trim()
            .parse::<u32>()
            .map_err(|_| CrError::DecodeMismatch(format!("non-decimal contents of {}", self.path)))
    }

    fn write_decimal(&mut self, value: u32) -> CrResult<()> {
        use std::io::{Seek, SeekFrom, Write};
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| CrError::io(self.path, e))?;
        write!(self.file, "{}\n", value).map_err(|e| CrError::io(self.path, e))
    }
}

/// Standard procfs paths for the two rxe knobs.
pub const LAST_QPN_PATH: &str = "/proc/sys/net/rdma_rxe/last_qpn";
pub const LAST_MRN_PATH: &str = "/proc/sys/net/rdma_rxe/last_mrn";

/// Owns the two opened knob files for the lifetime of the subsystem.
#[derive(Debug)]
pub struct KernelParams {
    last_qpn: Box<dyn ProcFile + Send>,
    last_mrn: Box<dyn ProcFile + Send>,
}

impl KernelParams {
    pub fn new(last_qpn: Box<dyn ProcFile + Send>, last_mrn: Box<dyn ProcFile + Send>) -> Self {
        KernelParams { last_qpn, last_mrn }
    }

    pub fn open_live() -> CrResult<Self> {
        Ok(KernelParams::new(
            Box::new(LiveProcFile::open(LAST_QPN_PATH)?),
            Box::new(LiveProcFile::open(LAST_MRN_PATH)?),
        ))
    }

    /// Force `last_qpn` so the next QP allocation lands on `qpn`, returning
    /// a guard that restores the previous value on drop. `qpn - 16` is
    /// written because the kernel rounds allocations up by 16.
    pub fn force_last_qpn(&mut self, qpn: u32) -> CrResult<ForcedQpn<'_>> {
        let old = self.last_qpn.read_decimal()?;
        self.last_qpn.write_decimal(qpn.wrapping_sub(16))?;
        log::debug!("forced last_qpn to {} (target qp_num {})", qpn.wrapping_sub(16), qpn);
        Ok(ForcedQpn {
            knob: &mut *self.last_qpn,
            // We write the knob directly on drop, so the raw pre-force
            // value goes back; no further +16 adjustment is needed here
            // (that adjustment only applies when handing `old` back through
            // another call to `rxe_set_last_qpn`, which this guard doesn't).
            restore_to: old,
        })
    }

    /// Force `last_mrn` so the next MR registration lands on `mrn`,
    /// returning a guard that restores the previous value on drop.
    pub fn force_last_mrn(&mut self, mrn: u32) -> CrResult<ForcedMrn<'_>> {
        let old = self.last_mrn.read_decimal()?;
        self.last_mrn.write_decimal(mrn.wrapping_sub(1))?;
        log::debug!("forced last_mrn to {} (target mrn {})", mrn.wrapping_sub(1), mrn);
        Ok(ForcedMrn {
            knob: &mut *self.last_mrn,
            restore_to: old,
        })
    }
}

/// RAII guard restoring `last_qpn` to its pre-force value on drop. The
/// "set, create, restore" idiom needs to guarantee reversion on every exit
/// path including failure, so restoration happens here instead of
/// requiring every call site to remember to undo it.
pub struct ForcedQpn<'a> {
    knob: &'a mut (dyn ProcFile + Send),
    restore_to: u32,
}

impl Drop for ForcedQpn<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.knob.write_decimal(self.restore_to) {
            log::error!("failed to restore last_qpn to {}: {}", self.restore_to, e);
        }
    }
}

/// RAII guard restoring `last_mrn` to its pre-force value on drop.
pub struct ForcedMrn<'a> {
    knob: &'a mut (dyn ProcFile + Send),
    restore_to: u32,
}

impl Drop for ForcedMrn<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.knob.write_decimal(self.restore_to) {
            log::error!("failed to restore last_mrn to {}: {}", self.restore_to, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeProcFile;

    #[test]
    fn force_qpn_then_restore_is_neutral() {
        let mut params = KernelParams::new(
            Box::new(FakeProcFile::new(100)),
            Box::new(FakeProcFile::new(0)),
        );
        {
            let _guard = params.force_last_qpn(0x100).unwrap();
            // While forced, the knob holds qpn - 16.
        }
        // After the guard drops, the knob is back to its original value.
        assert_eq!(params.last_qpn.read_decimal().unwrap(), 100);
    }

    #[test]
    fn force_mrn_then_restore_is_neutral() {
        let mut params = KernelParams::new(
            Box::new(FakeProcFile::new(0)),
            Box::new(FakeProcFile::new(41)),
        );
        {
            let _guard = params.force_last_mrn(42).unwrap();
        }
        assert_eq!(params.last_mrn.read_decimal().unwrap(), 41);
    }
}
