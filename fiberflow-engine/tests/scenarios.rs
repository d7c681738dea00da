//! Black-box scenarios exercising end-to-end engine behavior, built entirely against
//! `fiberflow_engine`'s public API plus its `testutil` fakes (`test-util` feature).

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use fiberflow_core::{CoreResult, Device, DeviceAffinity, Fiber, Worker, WorkerOptions};

use fiberflow_engine::testutil::{
    single_device_system, two_instance_system, FakeHal, FakeSemaphore, FakeVmContext,
};
use fiberflow_engine::{
    Barrier, Function, FunctionAttrs, Hal, Invocation, Marshalable, Program, ProgramLoadOptions,
    Semaphore, VmContext, VmContextFactory, VmList, VmModule, VmRef,
};

/// A `VmContextFactory` handing out one pre-built `FakeVmContext`. `Program::load` only ever
/// calls `create_context` once, so a one-shot `Option` is enough.
struct OneShotFactory(Mutex<Option<FakeVmContext>>);

impl OneShotFactory {
    fn new(ctx: FakeVmContext) -> Self {
        Self(Mutex::new(Some(ctx)))
    }
}

impl VmContextFactory for OneShotFactory {
    fn create_context(
        &self,
        _modules: &[Arc<dyn VmModule>],
        _trace_execution: bool,
    ) -> CoreResult<Box<dyn VmContext>> {
        Ok(Box::new(
            self.0
                .lock()
                .expect("poisoned")
                .take()
                .expect("create_context called more than once"),
        ))
    }
}

fn started_worker() -> Arc<Worker> {
    let worker = Worker::new(WorkerOptions {
        quantum: Duration::from_millis(5),
        ..WorkerOptions::default()
    });
    worker.start().unwrap();
    worker
}

fn shutdown(worker: &Arc<Worker>) {
    worker.kill();
    worker.wait_for_shutdown().unwrap();
}

#[test]
fn trivial_none_invocation_resolves() {
    let (system, device) = single_device_system();
    let worker = started_worker();
    let fiber = Fiber::new(Arc::clone(&worker), system, [device]).unwrap();

    let ctx = FakeVmContext::new();
    ctx.register(
        "m.add",
        FunctionAttrs {
            trivially_synchronous: true,
            ..Default::default()
        },
        |args| {
            let sum = args.get(0).unwrap().raw() + args.get(1).unwrap().raw();
            Ok(VmList::from(vec![VmRef::from_raw(sum)]))
        },
    );

    let program = Program::load(
        fiber,
        &OneShotFactory::new(ctx),
        Arc::new(FakeHal),
        vec![],
        ProgramLoadOptions::default(),
    )
    .unwrap();
    let function = Function::lookup_required(&program, "m.add").unwrap();

    let mut invocation = Invocation::new(function);
    invocation.add_ref(VmRef::from_raw(42)).unwrap();
    invocation.add_ref(VmRef::from_raw(7)).unwrap();

    let future = invocation.invoke().unwrap();
    let (tx, rx) = mpsc::channel();
    future.on_complete(move |result| tx.send(result).unwrap());
    let resolved = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();

    assert_eq!(resolved.results_size().unwrap(), 1);
    assert_eq!(resolved.result_ref(0).unwrap().raw(), 49);

    shutdown(&worker);
}

/// A `Hal` that always hands back the same pre-signaled semaphore, standing in for storage
/// already at timepoint 3 when this invocation is built.
struct SeededHal {
    semaphore: Arc<dyn Semaphore>,
}

impl Hal for SeededHal {
    fn semaphore_create(&self, _device: &Device) -> CoreResult<Arc<dyn Semaphore>> {
        Ok(Arc::clone(&self.semaphore))
    }
}

/// A marshalable argument backed by one device's queue, standing in for two marshalables
/// backed by storage on the same device's queue.
struct StorageRef {
    vref: VmRef,
    device: Arc<Device>,
    affinity: DeviceAffinity,
}

impl StorageRef {
    fn new(raw: u64, device: Arc<Device>) -> Self {
        let affinity = device.self_affinity();
        Self {
            vref: VmRef::from_raw(raw),
            device,
            affinity,
        }
    }
}

impl Marshalable for StorageRef {
    fn device(&self) -> Option<&DeviceAffinity> {
        Some(&self.affinity)
    }

    fn marshal(&self, invocation: &mut Invocation, barrier: Barrier) -> CoreResult<VmRef> {
        invocation.device_select(self.affinity.clone())?;
        invocation.note_queue_wait(&self.device, barrier)?;
        Ok(self.vref)
    }
}

#[test]
fn coarse_fences_single_queue_advances_tip() {
    let (system, device) = single_device_system();
    let worker = started_worker();
    let fiber = Fiber::new(Arc::clone(&worker), system, [device.clone()]).unwrap();

    let semaphore = FakeSemaphore::new();
    semaphore.signal(3).unwrap();
    let hal: Arc<dyn Hal> = Arc::new(SeededHal {
        semaphore: semaphore.clone() as Arc<dyn Semaphore>,
    });

    let ctx = FakeVmContext::new();
    ctx.register(
        "m.op",
        FunctionAttrs {
            coarse_fences_marker: true,
            ..Default::default()
        },
        |_args| Ok(VmList::new()),
    );

    let program = Program::load(
        fiber,
        &OneShotFactory::new(ctx),
        hal,
        vec![],
        ProgramLoadOptions::default(),
    )
    .unwrap();
    let function = Function::lookup_required(&program, "m.op").unwrap();

    let mut invocation = Invocation::new(function);
    let a = StorageRef::new(1, device.clone());
    let b = StorageRef::new(2, device);
    invocation.add_marshaled(&a, Barrier::Read).unwrap();
    invocation.add_marshaled(&b, Barrier::Write).unwrap();

    let future = invocation.invoke().unwrap();
    let (tx, rx) = mpsc::channel();
    future.on_complete(move |result| tx.send(result).unwrap());
    let resolved = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();

    let (signal_sem, signal_tip) = resolved.coarse_signal().unwrap().unwrap();
    assert_eq!(signal_tip, 4);
    assert_eq!(signal_sem.query().unwrap(), 4);

    shutdown(&worker);
}

#[test]
fn cross_instance_union_is_rejected() {
    let (system, device_a, device_b) = two_instance_system();
    let worker = started_worker();
    let fiber = Fiber::new(Arc::clone(&worker), system, [device_a.clone(), device_b.clone()]).unwrap();

    let ctx = FakeVmContext::new();
    ctx.register(
        "m.noop",
        FunctionAttrs {
            trivially_synchronous: true,
            ..Default::default()
        },
        |_args| Ok(VmList::new()),
    );
    let program = Program::load(
        fiber,
        &OneShotFactory::new(ctx),
        Arc::new(FakeHal),
        vec![],
        ProgramLoadOptions::default(),
    )
    .unwrap();
    let function = Function::lookup_required(&program, "m.noop").unwrap();

    let mut invocation = Invocation::new(function);
    invocation.device_select(device_a.self_affinity()).unwrap();
    let result = invocation.device_select(device_b.self_affinity());
    assert!(result.is_err());

    shutdown(&worker);
}

#[test]
fn fifo_thunking_holds_under_contention() {
    let worker = started_worker();
    let seen: Arc<Mutex<std::collections::HashMap<usize, Vec<usize>>>> =
        Arc::new(Mutex::new(std::collections::HashMap::new()));
    let mut handles = Vec::new();
    for tid in 0..8 {
        let w = Arc::clone(&worker);
        let seen = Arc::clone(&seen);
        handles.push(std::thread::spawn(move || {
            for seq in 0..1000 {
                let seen = Arc::clone(&seen);
                w.call_threadsafe(move |_| {
                    seen.lock().unwrap().entry(tid).or_default().push(seq);
                });
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    std::thread::sleep(Duration::from_millis(500));
    shutdown(&worker);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 8);
    for (_, sequence) in seen.iter() {
        assert_eq!(sequence.len(), 1000);
        assert!(sequence.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

#[test]
fn kill_mid_flight_drains_in_flight_only() {
    let worker = started_worker();
    let started = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let finished = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    for _ in 0..100 {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        worker.call_threadsafe(move |_| {
            started.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            finished.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
    }
    while started.load(std::sync::atomic::Ordering::SeqCst) < 5 {
        std::thread::sleep(Duration::from_millis(1));
    }
    worker.kill();
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    worker.wait_for_shutdown().unwrap();
    assert!(std::time::Instant::now() <= deadline);
    assert!(started.load(std::sync::atomic::Ordering::SeqCst) < 100);
    assert_eq!(
        started.load(std::sync::atomic::Ordering::SeqCst),
        finished.load(std::sync::atomic::Ordering::SeqCst)
    );
}

#[test]
fn lookup_missing_function_errors() {
    let (system, device) = single_device_system();
    let worker = started_worker();
    let fiber = Fiber::new(Arc::clone(&worker), system, [device]).unwrap();

    let ctx = FakeVmContext::new();
    let program = Program::load(
        fiber,
        &OneShotFactory::new(ctx),
        Arc::new(FakeHal),
        vec![],
        ProgramLoadOptions::default(),
    )
    .unwrap();

    assert!(Function::lookup(&program, "m.absent").is_none());
    assert!(Function::lookup_required(&program, "m.absent").is_err());

    shutdown(&worker);
}
