//! The core of the core: argument marshalling, device selection, coarse-fences assembly and
//! the Invocation scheduling state machine.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use fiberflow_core::{pending_future, CoreError, CoreResult, Device, DeviceAffinity, Fiber, Future};

use crate::function::{Function, InvocationModel};
use crate::vm::{Fence, Hal, Semaphore, VmList, VmRef};

/// Whether, and how, a marshalled argument participates in the queue wait-fence protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    None,
    Read,
    Write,
}

/// An object that can append itself to an [`Invocation`]'s argument list and, if marshalled
/// with a non-`None` barrier, implicate its device into device selection and the wait fence.
pub trait Marshalable {
    fn device(&self) -> Option<&DeviceAffinity>;
    fn marshal(&self, invocation: &mut Invocation, barrier: Barrier) -> CoreResult<VmRef>;
}

struct QueueTimeline {
    tip: Cell<u64>,
    semaphore: Arc<dyn Semaphore>,
}

/// Per-`(Device, queue)` timeline bookkeeping. Conceptually owned by the `Fiber`, but kept on
/// [`Program`](crate::program::Program) instead: queue timelines are keyed on the engine's
/// `Semaphore` trait, which `fiberflow_core::Fiber` has no knowledge of, and a Program already
/// lives with its Fiber, so this doesn't change anyone's lifetime story.
pub(crate) struct Timelines {
    hal: Arc<dyn Hal>,
    // `Mutex`, not `RefCell`: `Program` is reached through `Arc<Program>` from `Function`, and
    // `Invocation` must stay `Send` so it can cross the VM completion callback's thread boundary
    // into `Completer::complete`. `Arc<T>` is `Send` only when `T: Send + Sync`, and `RefCell`
    // is never `Sync`.
    entries: Mutex<HashMap<String, QueueTimeline>>,
}

impl Timelines {
    pub(crate) fn new(hal: Arc<dyn Hal>) -> Self {
        Self {
            hal,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the queue's semaphore and recorded tip, lazily creating the semaphore (and
    /// seeding the recorded tip from its current value) the first time this queue is touched.
    fn touch(&self, device: &Arc<Device>) -> CoreResult<(Arc<dyn Semaphore>, u64)> {
        let mut entries = self.entries.lock().expect("timelines mutex poisoned");
        if let Some(timeline) = entries.get(&device.name()) {
            return Ok((Arc::clone(&timeline.semaphore), timeline.tip.get()));
        }
        let semaphore = self.hal.semaphore_create(device)?;
        let tip = semaphore.query()?;
        entries.insert(
            device.name(),
            QueueTimeline {
                tip: Cell::new(tip),
                semaphore: Arc::clone(&semaphore),
            },
        );
        Ok((semaphore, tip))
    }

    fn advance(&self, device: &Arc<Device>, new_tip: u64) {
        if let Some(timeline) = self.entries.lock().expect("timelines mutex poisoned").get(&device.name()) {
            timeline.tip.set(new_tip);
        }
    }
}

struct QueueWait {
    semaphore: Arc<dyn Semaphore>,
    tip: u64,
}

enum InvocationState {
    Built {
        args: VmList,
        device_selection: DeviceAffinity,
        queue_waits: HashMap<String, QueueWait>,
    },
    Scheduled {
        coarse_signal: Option<(Arc<dyn Semaphore>, u64)>,
    },
    Resolved {
        results: VmList,
        coarse_signal: Option<(Arc<dyn Semaphore>, u64)>,
    },
}

/// One call into the VM. Heap-allocated and uniquely owned: ownership transfers to the
/// Worker's async bookkeeping on [`invoke`](Invocation::invoke) and is handed back to the
/// observer once the returned [`Future`] resolves.
pub struct Invocation {
    fiber: Arc<Fiber>,
    function: Function,
    state: InvocationState,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            InvocationState::Built { .. } => "Built",
            InvocationState::Scheduled { .. } => "Scheduled",
            InvocationState::Resolved { .. } => "Resolved",
        };
        write!(f, "Invocation({state})")
    }
}

impl Invocation {
    pub fn new(function: Function) -> Box<Invocation> {
        let fiber = Arc::clone(function.fiber());
        Box::new(Invocation {
            fiber,
            function,
            state: InvocationState::Built {
                args: VmList::new(),
                device_selection: DeviceAffinity::empty(),
                queue_waits: HashMap::new(),
            },
        })
    }

    pub fn fiber(&self) -> &Arc<Fiber> {
        &self.fiber
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    fn check_not_scheduled(&self) -> CoreResult<()> {
        match &self.state {
            InvocationState::Built { .. } => Ok(()),
            _ => Err(CoreError::logic_error(
                "invocation already scheduled or resolved",
            )),
        }
    }

    /// Unions `affinity` into the current device selection. Fails if the union collapses
    /// across `(system_class, instance_ordinal)`.
    pub fn device_select(&mut self, affinity: DeviceAffinity) -> CoreResult<()> {
        match &mut self.state {
            InvocationState::Built {
                device_selection, ..
            } => {
                let current = std::mem::replace(device_selection, DeviceAffinity::empty());
                *device_selection = current.union(affinity)?;
                Ok(())
            }
            _ => Err(CoreError::logic_error(
                "invocation already scheduled or resolved",
            )),
        }
    }

    /// Records that `device`'s queue is implicated by an argument with the given barrier; a
    /// `Barrier::None` call is a no-op. Called by [`Marshalable::marshal`] implementations, not
    /// directly by `add_marshaled`.
    pub fn note_queue_wait(&mut self, device: &Arc<Device>, barrier: Barrier) -> CoreResult<()> {
        if barrier == Barrier::None {
            return Ok(());
        }
        self.check_not_scheduled()?;
        let (semaphore, tip) = self.function.program().engine_timelines().touch(device)?;
        match &mut self.state {
            InvocationState::Built { queue_waits, .. } => {
                queue_waits
                    .entry(device.name())
                    .and_modify(|w| {
                        if tip > w.tip {
                            w.tip = tip;
                        }
                    })
                    .or_insert(QueueWait { semaphore, tip });
                Ok(())
            }
            _ => unreachable!("checked above"),
        }
    }

    fn push_ref(&mut self, vref: VmRef) -> CoreResult<()> {
        match &mut self.state {
            InvocationState::Built { args, .. } => {
                args.append(vref);
                Ok(())
            }
            _ => Err(CoreError::logic_error(
                "invocation already scheduled or resolved",
            )),
        }
    }

    /// Marshals `value` and appends the ref it hands back: `value.marshal` performs the
    /// device-selection and queue-wait side effects.
    pub fn add_marshaled(&mut self, value: &dyn Marshalable, barrier: Barrier) -> CoreResult<()> {
        self.check_not_scheduled()?;
        let vref = value.marshal(self, barrier)?;
        self.push_ref(vref)
    }

    /// Appends `vref` unchanged, with no device or barrier effect.
    pub fn add_ref(&mut self, vref: VmRef) -> CoreResult<()> {
        self.check_not_scheduled()?;
        self.push_ref(vref)
    }

    /// Schedules the call. Consumes the Invocation; the returned [`Future`] resolves with the
    /// Invocation back (now `RESOLVED`) on success, or the VM/HAL failure status, never by
    /// unwinding.
    pub fn invoke(self: Box<Self>) -> CoreResult<Future<Box<Invocation>>> {
        let mut this = self;
        let (args, device_selection, queue_waits) = match std::mem::replace(
            &mut this.state,
            InvocationState::Scheduled {
                coarse_signal: None,
            },
        ) {
            InvocationState::Built {
                args,
                device_selection,
                queue_waits,
            } => (args, device_selection, queue_waits),
            _ => {
                return Err(CoreError::logic_error(
                    "invocation already scheduled or resolved",
                ))
            }
        };

        let model = this.function.invocation_model();
        let (final_args, wait_fence, signal_fence, coarse_signal) = match model {
            InvocationModel::CoarseFences => {
                if device_selection.is_empty() {
                    return Err(CoreError::invalid_argument(
                        "coarse-fences invocation requires a non-empty device selection",
                    ));
                }
                let waits: Vec<(Arc<dyn Semaphore>, u64)> = queue_waits
                    .into_values()
                    .map(|w| (w.semaphore, w.tip))
                    .collect();
                let wait_fence = Fence::from_waits(waits);

                let primary_device = device_selection
                    .device()
                    .expect("non-empty checked above")
                    .clone();
                let timelines = this.function.program().engine_timelines();
                let (primary_sem, primary_tip) = timelines.touch(&primary_device)?;
                let signal_timepoint = primary_tip + 1;
                timelines.advance(&primary_device, signal_timepoint);
                let signal_fence =
                    Fence::from_waits(vec![(Arc::clone(&primary_sem), signal_timepoint)]);

                (
                    args,
                    Some(wait_fence),
                    Some(signal_fence),
                    Some((primary_sem, signal_timepoint)),
                )
            }
            InvocationModel::None | InvocationModel::Unknown => (args, None, None, None),
        };

        this.state = InvocationState::Scheduled {
            coarse_signal: coarse_signal.clone(),
        };

        let worker = Arc::clone(this.function.fiber().worker());
        let (future, completer) = pending_future::<Box<Invocation>>(worker);
        let function_handle = this.function.vm_handle().clone();
        let program = Arc::clone(this.function.program());
        let mut invocation = this;

        program.vm_context().async_invoke(
            &function_handle,
            final_args,
            wait_fence,
            signal_fence,
            Box::new(move |outcome| match outcome {
                Ok(results) => {
                    invocation.state = InvocationState::Resolved {
                        results,
                        coarse_signal,
                    };
                    completer.complete(Ok(invocation));
                }
                Err(err) => completer.complete(Err(err)),
            }),
        );

        Ok(future)
    }

    pub fn results_size(&self) -> CoreResult<usize> {
        match &self.state {
            InvocationState::Resolved { results, .. } => Ok(results.len()),
            _ => Err(CoreError::logic_error("invocation not yet resolved")),
        }
    }

    pub fn result_ref(&self, index: usize) -> CoreResult<VmRef> {
        match &self.state {
            InvocationState::Resolved { results, .. } => results
                .get(index)
                .ok_or_else(|| CoreError::invalid_argument(format!("result index {index} out of range"))),
            _ => Err(CoreError::logic_error("invocation not yet resolved")),
        }
    }

    /// `(signal_sem, signal_timepoint)` for a `COARSE_FENCES` invocation, valid once scheduled;
    /// `None` for `NONE`/`UNKNOWN` models.
    pub fn coarse_signal(&self) -> CoreResult<Option<(Arc<dyn Semaphore>, u64)>> {
        match &self.state {
            InvocationState::Built { .. } => {
                Err(CoreError::logic_error("invocation not yet scheduled"))
            }
            InvocationState::Scheduled { coarse_signal }
            | InvocationState::Resolved { coarse_signal, .. } => Ok(coarse_signal.clone()),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invocation({})", self.function.vm_handle().qualified_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    use fiberflow_core::{Address, Worker, WorkerOptions};

    use crate::function::Function;
    use crate::program::{Program, ProgramLoadOptions};
    use crate::testutil::FakeVmContext;
    use crate::vm::{FunctionAttrs, VmContext, VmContextFactory, VmList, VmModule, VmRef};

    struct FakeFactory {
        ctx: Mutex<Option<FakeVmContext>>,
    }

    impl FakeFactory {
        fn new(ctx: FakeVmContext) -> Self {
            Self {
                ctx: Mutex::new(Some(ctx)),
            }
        }
    }

    impl VmContextFactory for FakeFactory {
        fn create_context(
            &self,
            _modules: &[Arc<dyn VmModule>],
            _trace_execution: bool,
        ) -> CoreResult<Box<dyn VmContext>> {
            Ok(Box::new(self.ctx.lock().expect("poisoned").take().expect(
                "FakeFactory::create_context called more than once in this test",
            )))
        }
    }

    fn started_worker() -> Arc<Worker> {
        let w = Worker::new(WorkerOptions {
            quantum: Duration::from_millis(5),
            ..WorkerOptions::default()
        });
        w.start().unwrap();
        w
    }

    fn device(instance: u32) -> Arc<Device> {
        fiberflow_core::Device::new(
            Address::new("gpu", "gpu", "test", instance, 0, vec![0]),
            Box::new(()),
            None,
            false,
        )
    }

    fn program_with(ctx: FakeVmContext, device: Arc<Device>, worker: Arc<Worker>) -> Arc<Program> {
        let system = fiberflow_core::SystemBuilder::new()
            .add_device(device.clone())
            .build()
            .unwrap();
        let fiber = Fiber::new(worker, system, [device]).unwrap();
        Program::load(
            fiber,
            &FakeFactory::new(ctx),
            Arc::new(crate::testutil::FakeHal),
            vec![],
            ProgramLoadOptions::default(),
        )
        .unwrap()
    }

    fn blank_invocation(model_fn_name: &str, ctx: FakeVmContext) -> (Box<Invocation>, Arc<Worker>, Arc<Device>) {
        let worker = started_worker();
        let device = device(0);
        let program = program_with(ctx, device.clone(), Arc::clone(&worker));
        let function = Function::lookup_required(&program, model_fn_name).unwrap();
        (Invocation::new(function), worker, device)
    }

    fn shutdown(worker: &Arc<Worker>) {
        worker.kill();
        worker.wait_for_shutdown().unwrap();
    }

    #[test]
    fn device_select_unions_same_instance_queues() {
        let ctx = FakeVmContext::new();
        ctx.register(
            "m.none",
            FunctionAttrs {
                trivially_synchronous: true,
                ..Default::default()
            },
            |_| Ok(VmList::new()),
        );
        let (mut invocation, worker, device) = blank_invocation("m.none", ctx);
        let other = fiberflow_core::Device::new(
            Address::new("gpu", "gpu", "test", 0, 1, vec![0]),
            Box::new(()),
            None,
            false,
        );
        invocation.device_select(device.self_affinity()).unwrap();
        invocation.device_select(other.self_affinity()).unwrap();
        shutdown(&worker);
    }

    #[test]
    fn device_select_rejects_cross_instance() {
        let ctx = FakeVmContext::new();
        ctx.register(
            "m.none",
            FunctionAttrs {
                trivially_synchronous: true,
                ..Default::default()
            },
            |_| Ok(VmList::new()),
        );
        let (mut invocation, worker, device) = blank_invocation("m.none", ctx);
        let other_instance = fiberflow_core::Device::new(
            Address::new("gpu", "gpu", "test", 1, 0, vec![0]),
            Box::new(()),
            None,
            false,
        );
        invocation.device_select(device.self_affinity()).unwrap();
        assert!(invocation.device_select(other_instance.self_affinity()).is_err());
        shutdown(&worker);
    }

    #[test]
    fn add_ref_appends_and_rejects_after_resolution() {
        let ctx = FakeVmContext::new();
        ctx.register(
            "m.identity",
            FunctionAttrs {
                trivially_synchronous: true,
                ..Default::default()
            },
            |args| Ok(args.clone()),
        );
        let (mut invocation, worker, _device) = blank_invocation("m.identity", ctx);
        invocation.add_ref(VmRef::from_raw(7)).unwrap();

        let future = invocation.invoke().unwrap();
        let (tx, rx) = mpsc::channel();
        future.on_complete(move |result| tx.send(result).unwrap());
        let mut resolved = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();

        assert_eq!(resolved.results_size().unwrap(), 1);
        assert_eq!(resolved.result_ref(0).unwrap(), VmRef::from_raw(7));
        assert!(resolved.add_ref(VmRef::from_raw(9)).is_err());

        shutdown(&worker);
    }

    #[test]
    fn none_model_invoke_does_not_require_device_selection() {
        let ctx = FakeVmContext::new();
        ctx.register(
            "m.none",
            FunctionAttrs {
                trivially_synchronous: true,
                ..Default::default()
            },
            |_| Ok(VmList::new()),
        );
        let (invocation, worker, _device) = blank_invocation("m.none", ctx);
        let future = invocation.invoke().unwrap();
        let (tx, rx) = mpsc::channel();
        future.on_complete(move |result| tx.send(result).unwrap());
        let resolved = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(resolved.is_ok());
        shutdown(&worker);
    }

    #[test]
    fn coarse_fences_invoke_requires_device_selection() {
        let ctx = FakeVmContext::new();
        ctx.register(
            "m.coarse",
            FunctionAttrs {
                coarse_fences_marker: true,
                ..Default::default()
            },
            |_| Ok(VmList::new()),
        );
        let (invocation, worker, _device) = blank_invocation("m.coarse", ctx);
        assert!(invocation.invoke().is_err());
        shutdown(&worker);
    }

    #[test]
    fn coarse_fences_invoke_advances_signal_tip_by_one() {
        let ctx = FakeVmContext::new();
        ctx.register(
            "m.coarse",
            FunctionAttrs {
                coarse_fences_marker: true,
                ..Default::default()
            },
            |_| Ok(VmList::new()),
        );
        let (mut invocation, worker, device) = blank_invocation("m.coarse", ctx);
        invocation.device_select(device.self_affinity()).unwrap();
        invocation.note_queue_wait(&device, Barrier::Write).unwrap();

        let future = invocation.invoke().unwrap();
        let (tx, rx) = mpsc::channel();
        future.on_complete(move |result| tx.send(result).unwrap());
        let resolved = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();

        let (signal_sem, signal_tip) = resolved.coarse_signal().unwrap().unwrap();
        assert_eq!(signal_tip, 1);
        assert_eq!(signal_sem.query().unwrap(), 1);

        shutdown(&worker);
    }
}
