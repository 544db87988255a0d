//! Subsystem lifecycle.
//!
//! `VerbsSubsystem` is the single owner of what used to be a handful of
//! process-local globals: the resolved device, the parameter-knob service
//! fds, the catalog, the restore queue, the context-fd list, and the
//! last-seen event fd. One instance per process, constructed once, driven
//! through `init` → (`collect_context` | `prepare_restore`) → `teardown`.

use crate::catalog::DEFAULT_CEILING;
use crate::decode::decode_dump;
use crate::device::{reopen_device, DeviceBinding, DeviceList, VerbsContext, VerbsDevice};
use crate::error::{CrError, CrResult};
use crate::event::EventFdShim;
use crate::knobs::KernelParams;
use crate::model::ObjectRecord;
use crate::restore::{restore_all, RestoreCatalogs};
use crate::vma::{VmaArea, VmaKeeper};
use std::cell::Cell;
use std::marker::PhantomData;

/// Command fds of every context this process has restored, in restore
/// order. The host framework copies this into its own restore-args region
/// once restore completes.
#[derive(Debug, Default)]
pub struct ContextFdList(Vec<i32>);

impl ContextFdList {
    pub fn push(&mut self, fd: i32) {
        self.0.push(fd);
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }
}

/// Owns the full lifecycle of one process's verbs subsystem. Not `Sync`:
/// a `VerbsSubsystem` must not be shared across threads, enforced here
/// rather than left as a comment, since dump and restore are both
/// single-threaded and sequential.
pub struct VerbsSubsystem {
    device_binding: Option<DeviceBinding>,
    params: Option<KernelParams>,
    restore_queue: Vec<ObjectRecord>,
    context_fds: ContextFdList,
    event_shim: EventFdShim,
    vma_keeper: VmaKeeper,
    _not_sync: PhantomData<Cell<()>>,
}

impl VerbsSubsystem {
    /// Construct with no I/O performed, matching the crate's convention
    /// of `new` never touching the kernel or procfs.
    pub fn new() -> Self {
        VerbsSubsystem {
            device_binding: None,
            params: None,
            restore_queue: Vec::with_capacity(DEFAULT_CEILING),
            context_fds: ContextFdList::default(),
            event_shim: EventFdShim::new(),
            vma_keeper: VmaKeeper::new(),
            _not_sync: PhantomData,
        }
    }

    /// Resolve the target device and take ownership of already-opened
    /// parameter-knob files. This is the only place I/O happens before a
    /// dump or restore actually starts.
    pub fn init(&mut self, list: &dyn DeviceList, name: Option<&str>, params: KernelParams) -> CrResult<()> {
        let binding = crate::device::find_ibdev(list, name)?;
        self.device_binding = Some(binding);
        self.params = Some(params);
        Ok(())
    }

    pub fn device_binding(&self) -> Option<&DeviceBinding> {
        self.device_binding.as_ref()
    }

    /// Decode a kernel dump buffer into the in-memory object graph, flag
    /// the VMAs it overlaps, and note the context's async fd for later
    /// event-file restore.
    pub fn collect_context(&mut self, ctx: VerbsContext, buf: &[u8], count: u32, vmas: &mut [VmaArea]) -> CrResult<()> {
        let mut objects = decode_dump(buf, count, vmas)?;
        self.event_shim.note_context_opened(ctx.async_fd);
        self.restore_queue.append(&mut objects);
        Ok(())
    }

    /// Wrap an already-open fd as a dump-time context, aliasing the
    /// async-event fd per the documented workaround.
    pub fn reopen_context(existing_fd: i32) -> VerbsContext {
        reopen_device(existing_fd)
    }

    /// Open a fresh restore-time context against the bound device.
    /// `init` must have run first so a device is bound.
    pub fn open_restore_context(&self) -> CrResult<VerbsContext> {
        let binding = self
            .device_binding
            .as_ref()
            .ok_or(CrError::UnsupportedFeature("VerbsSubsystem::init must run before opening a restore context"))?;
        crate::device::open_device(binding)
    }

    /// Drain the accumulated restore queue against `device`, in dependency
    /// order, then record the context's command fd and async-event fd.
    pub fn prepare_restore(&mut self, device: &mut dyn VerbsDevice, ctx: VerbsContext) -> CrResult<RestoreCatalogs> {
        let mut params = self.params.take().ok_or(CrError::UnsupportedFeature(
            "VerbsSubsystem::init must run before prepare_restore",
        ))?;
        let objects = std::mem::take(&mut self.restore_queue);
        let result = restore_all(device, &mut params, &mut self.vma_keeper, objects);
        self.params = Some(params);
        let catalogs = result?;
        self.context_fds.push(ctx.cmd_fd);
        self.event_shim.note_context_opened(ctx.async_fd);
        Ok(catalogs)
    }

    pub fn context_fds(&self) -> &ContextFdList {
        &self.context_fds
    }

    pub fn event_shim(&self) -> &EventFdShim {
        &self.event_shim
    }

    pub fn vma_keeper(&self) -> &VmaKeeper {
        &self.vma_keeper
    }

    /// Release owned resources. The knob fds close when `self.params` is
    /// dropped; this just makes that point explicit and logs it.
    pub fn teardown(mut self) {
        self.params = None;
        log::debug!("verbs subsystem torn down, {} context(s) restored", self.context_fds.0.len());
    }
}

impl Default for VerbsSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{encode, FakeProcFile, FakeVerbsDevice};

    struct OneDevice;
    impl DeviceList for OneDevice {
        fn devices(&self) -> CrResult<Vec<DeviceBinding>> {
            Ok(vec![DeviceBinding { name: "rxe0".into(), list_index: 0 }])
        }
    }

    #[test]
    fn full_lifecycle_pd_only() {
        let mut sub = VerbsSubsystem::new();
        let params = KernelParams::new(Box::new(FakeProcFile::new(0)), Box::new(FakeProcFile::new(0)));
        sub.init(&OneDevice, None, params).unwrap();
        assert_eq!(sub.device_binding().unwrap().name, "rxe0");

        let dump_ctx = VerbsSubsystem::reopen_context(42);
        let buf = encode::pd_record(0);
        let mut vmas = Vec::new();
        sub.collect_context(dump_ctx, &buf, 1, &mut vmas).unwrap();

        let mut device = FakeVerbsDevice::new();
        let restore_ctx = VerbsContext { cmd_fd: 7, async_fd: 8 };
        let catalogs = sub.prepare_restore(&mut device, restore_ctx).unwrap();
        assert!(catalogs.pds.contains(crate::model::ObjectKind::Pd, 0));
        assert_eq!(sub.context_fds().as_slice(), &[7]);
        assert_eq!(sub.event_shim().resolve().unwrap(), 8);
        sub.teardown();
    }
}
