//! End-to-end scenario coverage for the Driver pump loop, using a small
//! in-memory operator double instead of a real executor. Mirrors the
//! separate higher-level test crate pattern used for storage-layer
//! integration tests in the wider codebase.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use risingwave_driver::{
    Blocked, Driver, DriverContext, Operator, OperatorContext, Page, PlanNodeId, ScheduledSplit,
    SourceOperator, SplitId, SplitMetaData, TaskId, TaskSource, NOT_BLOCKED,
};

type Log = Arc<Mutex<Vec<String>>>;

fn page(rows: usize) -> Page {
    Page::new(rows, Bytes::new())
}

fn logged(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[derive(Debug)]
struct TestSplit(&'static str);

impl SplitMetaData for TestSplit {
    fn id(&self) -> SplitId {
        self.0.into()
    }
}

fn split(id: &'static str) -> ScheduledSplit {
    ScheduledSplit::new(Arc::new(TestSplit(id)), 0)
}

/// Becomes ready once a shared flag flips. Polled without ever registering a
/// waker, matching how `Blocked::is_ready` checks it — the driver's
/// synchronous pump loop never awaits one of these directly.
struct GatedReady(Arc<AtomicBool>);

impl std::future::Future for GatedReady {
    type Output = ();
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.0.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[derive(Clone, Copy)]
enum CloseBehavior {
    Ok,
    Err(&'static str),
    Panic(&'static str),
}

/// A source operator that hands a fixed queue of pages out one per
/// `get_output` call, optionally sleeping inside `get_output` to simulate a
/// slow scan holding the exclusive lock for a while.
struct SourceOp {
    id: PlanNodeId,
    ctx: OperatorContext,
    log: Log,
    outputs: VecDeque<Page>,
    stall: Option<Duration>,
    close_behavior: CloseBehavior,
}

impl SourceOp {
    fn new(id: PlanNodeId, log: Log, outputs: Vec<Page>) -> Self {
        Self {
            id,
            ctx: OperatorContext::new("src"),
            log,
            outputs: outputs.into(),
            stall: None,
            close_behavior: CloseBehavior::Ok,
        }
    }

    fn stalling(mut self, stall: Duration) -> Self {
        self.stall = Some(stall);
        self
    }
}

impl Operator for SourceOp {
    fn operator_context(&self) -> &OperatorContext {
        &self.ctx
    }

    fn needs_input(&self) -> bool {
        false
    }

    fn add_input(&mut self, _page: Page) -> anyhow::Result<()> {
        unreachable!("a source operator never receives input")
    }

    fn get_output(&mut self) -> anyhow::Result<Option<Page>> {
        if let Some(stall) = self.stall {
            thread::sleep(stall);
        }
        Ok(self.outputs.pop_front())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("src.finish".to_string());
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.outputs.is_empty()
    }

    fn is_blocked(&mut self) -> Blocked {
        NOT_BLOCKED()
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("src.close".to_string());
        match self.close_behavior {
            CloseBehavior::Ok => Ok(()),
            CloseBehavior::Err(msg) => anyhow::bail!(msg),
            CloseBehavior::Panic(msg) => panic!("{msg}"),
        }
    }

    fn as_source_operator_mut(&mut self) -> Option<&mut dyn SourceOperator> {
        Some(self)
    }
}

impl SourceOperator for SourceOp {
    fn source_id(&self) -> PlanNodeId {
        self.id
    }

    fn add_split(&mut self, split: ScheduledSplit) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("src.add_split({})", split.id()));
        Ok(())
    }

    fn no_more_splits(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("src.no_more_splits".to_string());
        Ok(())
    }
}

/// A middle-of-pipeline operator: buffers whatever it receives and emits it
/// back out one page at a time, optionally gated by a shared block flag.
struct PassOp {
    name: &'static str,
    ctx: OperatorContext,
    log: Log,
    buffer: VecDeque<Page>,
    finished: bool,
    gate: Option<Arc<AtomicBool>>,
    close_behavior: CloseBehavior,
}

impl PassOp {
    fn new(name: &'static str, log: Log) -> Self {
        Self {
            name,
            ctx: OperatorContext::new(name),
            log,
            buffer: VecDeque::new(),
            finished: false,
            gate: None,
            close_behavior: CloseBehavior::Ok,
        }
    }

    fn gated(name: &'static str, log: Log, gate: Arc<AtomicBool>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(name, log)
        }
    }

    fn closing(mut self, behavior: CloseBehavior) -> Self {
        self.close_behavior = behavior;
        self
    }
}

impl Operator for PassOp {
    fn operator_context(&self) -> &OperatorContext {
        &self.ctx
    }

    fn needs_input(&self) -> bool {
        !self.finished
    }

    fn add_input(&mut self, page: Page) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("{}.add_input({})", self.name, page.rows()));
        self.buffer.push_back(page);
        Ok(())
    }

    fn get_output(&mut self) -> anyhow::Result<Option<Page>> {
        Ok(self.buffer.pop_front())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("{}.finish", self.name));
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished && self.buffer.is_empty()
    }

    fn is_blocked(&mut self) -> Blocked {
        match &self.gate {
            Some(gate) if !gate.load(Ordering::Acquire) => Blocked::pending(GatedReady(gate.clone())),
            _ => NOT_BLOCKED(),
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("{}.close", self.name));
        match self.close_behavior {
            CloseBehavior::Ok => Ok(()),
            CloseBehavior::Err(msg) => anyhow::bail!(msg),
            CloseBehavior::Panic(msg) => panic!("{msg}"),
        }
    }
}

/// The terminal operator: records what it received but never drains its
/// buffer (there is nothing downstream to pull it), so `is_finished` only
/// tracks whether `finish()` ran.
struct SinkOp {
    ctx: OperatorContext,
    log: Log,
    finished: bool,
    close_behavior: CloseBehavior,
}

impl SinkOp {
    fn new(log: Log) -> Self {
        Self {
            ctx: OperatorContext::new("sink"),
            log,
            finished: false,
            close_behavior: CloseBehavior::Ok,
        }
    }

    fn closing(mut self, behavior: CloseBehavior) -> Self {
        self.close_behavior = behavior;
        self
    }
}

impl Operator for SinkOp {
    fn operator_context(&self) -> &OperatorContext {
        &self.ctx
    }

    fn needs_input(&self) -> bool {
        !self.finished
    }

    fn add_input(&mut self, page: Page) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("sink.add_input({})", page.rows()));
        Ok(())
    }

    fn get_output(&mut self) -> anyhow::Result<Option<Page>> {
        Ok(None)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("sink.finish".to_string());
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn is_blocked(&mut self) -> Blocked {
        NOT_BLOCKED()
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("sink.close".to_string());
        match self.close_behavior {
            CloseBehavior::Ok => Ok(()),
            CloseBehavior::Err(msg) => anyhow::bail!(msg),
            CloseBehavior::Panic(msg) => panic!("{msg}"),
        }
    }
}

fn new_context() -> Arc<DriverContext> {
    Arc::new(DriverContext::new(TaskId(1)))
}

/// Scenario A — happy path: `[Src, Id, Sink]`, source yields `p1, p2`, a
/// split and its terminal marker arrive before the first pump, three
/// `process()` calls drain everything, and the fourth observes completion.
#[test]
fn scenario_a_happy_path() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let src_id = PlanNodeId(1);

    let src = SourceOp::new(src_id, log.clone(), vec![page(1), page(1)]);
    let id_op = PassOp::new("id", log.clone());
    let sink = SinkOp::new(log.clone());

    let driver = Driver::new(
        new_context(),
        vec![Box::new(src), Box::new(id_op), Box::new(sink)],
    );

    driver.update_source(TaskSource::new(
        src_id,
        std::collections::HashSet::from([split("s1")]),
        true,
    ));

    assert_matches!(driver.process().unwrap(), Blocked::NotBlocked);
    assert_matches!(driver.process().unwrap(), Blocked::NotBlocked);
    assert_matches!(driver.process().unwrap(), Blocked::NotBlocked);

    assert!(driver.is_finished());

    let entries = logged(&log);
    assert!(entries.contains(&"src.add_split(s1)".to_string()));
    assert!(entries.contains(&"src.no_more_splits".to_string()));
    assert_eq!(entries.iter().filter(|e| e.starts_with("id.add_input")).count(), 2);
    assert_eq!(entries.iter().filter(|e| e.starts_with("sink.add_input")).count(), 2);
}

/// Scenario B — back-pressure: `Id.is_blocked()` reports an incomplete
/// future; `process()` returns it untouched instead of pumping further, and
/// the next `process()` after the gate opens resumes normally.
#[test]
fn scenario_b_back_pressure() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let src_id = PlanNodeId(1);
    let gate = Arc::new(AtomicBool::new(false));

    let src = SourceOp::new(src_id, log.clone(), vec![page(1)]);
    let id_op = PassOp::gated("id", log.clone(), gate.clone());
    let sink = SinkOp::new(log.clone());

    let driver = Driver::new(
        new_context(),
        vec![Box::new(src), Box::new(id_op), Box::new(sink)],
    );

    let blocked = driver.process().unwrap();
    assert_matches!(blocked, Blocked::Pending(_));
    assert!(logged(&log).is_empty(), "no data should move while Id is blocked");

    gate.store(true, Ordering::Release);
    assert_matches!(driver.process().unwrap(), Blocked::NotBlocked);

    let entries = logged(&log);
    assert!(entries.iter().any(|e| e == "id.add_input(1)"));
}

/// Scenario C — concurrent close: one thread is mid-pump against a source
/// that stalls inside `get_output`; a second thread's `close()` loses the
/// zero-wait lock race and sets the cooperative cancellation token instead.
/// The pumping thread's guard runs destruction on release, and `is_finished`
/// reports `true` afterward without anyone calling `process()` again.
#[test]
fn scenario_c_concurrent_close() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let src_id = PlanNodeId(1);

    let src = SourceOp::new(src_id, log.clone(), vec![page(1)]).stalling(Duration::from_millis(200));
    let id_op = PassOp::new("id", log.clone());
    let sink = SinkOp::new(log.clone());

    let driver = Arc::new(Driver::new(
        new_context(),
        vec![Box::new(src), Box::new(id_op), Box::new(sink)],
    ));

    let pump_driver = driver.clone();
    let pump_thread = thread::spawn(move || pump_driver.process());

    thread::sleep(Duration::from_millis(50));
    driver.close();

    pump_thread.join().expect("pump thread must not panic");

    assert!(driver.is_finished());
    let entries = logged(&log);
    assert!(entries.contains(&"src.close".to_string()));
    assert!(entries.contains(&"id.close".to_string()));
    assert!(entries.contains(&"sink.close".to_string()));
}

/// Scenario D — coalescing updates: two threads stage non-overlapping
/// updates for the same source id concurrently; a later `process()` applies
/// both splits exactly once each, in whatever order, and `no_more_splits`
/// fires exactly once even though only one of the two updates set it.
#[test]
fn scenario_d_coalescing_updates() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let src_id = PlanNodeId(1);

    let src = SourceOp::new(src_id, log.clone(), vec![]);
    let id_op = PassOp::new("id", log.clone());
    let sink = SinkOp::new(log.clone());

    let driver = Arc::new(Driver::new(
        new_context(),
        vec![Box::new(src), Box::new(id_op), Box::new(sink)],
    ));

    let d1 = driver.clone();
    let t1 = thread::spawn(move || {
        d1.update_source(TaskSource::new(src_id, std::collections::HashSet::from([split("s1")]), false));
    });
    let d2 = driver.clone();
    let t2 = thread::spawn(move || {
        d2.update_source(TaskSource::new(src_id, std::collections::HashSet::from([split("s2")]), true));
    });
    t1.join().unwrap();
    t2.join().unwrap();

    driver.process().unwrap();

    let entries = logged(&log);
    assert!(entries.contains(&"src.add_split(s1)".to_string()));
    assert!(entries.contains(&"src.add_split(s2)".to_string()));
    assert_eq!(entries.iter().filter(|e| *e == "src.no_more_splits").count(), 1);
}

/// Scenario E — destruction with a failing close: `Sink.close()` returns a
/// (non-fatal, by Rust convention) `Err`, `Id.close()` panics (the Rust
/// substitute for a fatal throwable). Every operator's `close()` is still
/// attempted, the panic's message escapes the driver, and `finished()` was
/// still called on the context.
#[test]
fn scenario_e_destruction_with_failing_close() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let src_id = PlanNodeId(1);
    let context = new_context();

    let src = SourceOp::new(src_id, log.clone(), vec![]);
    let id_op = PassOp::new("id", log.clone()).closing(CloseBehavior::Panic("id close exploded"));
    let sink = SinkOp::new(log.clone()).closing(CloseBehavior::Err("sink close failed"));

    let driver = Driver::new(context.clone(), vec![Box::new(src), Box::new(id_op), Box::new(sink)]);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| driver.close()));
    assert!(result.is_err(), "the fatal close failure must escape as a panic");

    let entries = logged(&log);
    assert!(entries.contains(&"src.close".to_string()));
    assert!(entries.contains(&"id.close".to_string()));
    assert!(entries.contains(&"sink.close".to_string()), "every operator's close must still be attempted");

    assert!(context.is_finished());
}

/// Scenario F — re-entry guard: an operator that calls back into the driver
/// from inside its own `get_output()`, on the same thread that is already
/// pumping it, trips the self-deadlock assertion instead of hanging.
#[test]
fn scenario_f_reentry_guard() {
    struct ReentrantOp {
        ctx: OperatorContext,
        driver: Arc<Mutex<Option<Arc<Driver>>>>,
    }

    impl Operator for ReentrantOp {
        fn operator_context(&self) -> &OperatorContext {
            &self.ctx
        }
        fn needs_input(&self) -> bool {
            false
        }
        fn add_input(&mut self, _page: Page) -> anyhow::Result<()> {
            unreachable!()
        }
        fn get_output(&mut self) -> anyhow::Result<Option<Page>> {
            let driver = self.driver.lock().unwrap().clone().expect("driver must be wired before use");
            let _ = driver.process();
            Ok(None)
        }
        fn finish(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn is_finished(&self) -> bool {
            false
        }
        fn is_blocked(&mut self) -> Blocked {
            NOT_BLOCKED()
        }
    }

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    // A side channel the operator reads its own owning driver back out of:
    // the operator is moved into the driver at construction time, so this is
    // the only way to hand it a same-driver handle after the fact.
    let back_reference: Arc<Mutex<Option<Arc<Driver>>>> = Arc::new(Mutex::new(None));

    let reentrant = ReentrantOp {
        ctx: OperatorContext::new("reentrant"),
        driver: back_reference.clone(),
    };
    let sink = SinkOp::new(log);

    let driver = Arc::new(Driver::new(new_context(), vec![Box::new(reentrant), Box::new(sink)]));
    *back_reference.lock().unwrap() = Some(driver.clone());

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| driver.process()));
    assert!(result.is_err(), "a same-thread callback into process() must panic rather than deadlock");
}
