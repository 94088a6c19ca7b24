//! Dispatches work items to a worker pool and funnels results through a
//! single coordinator that owns the writer.
use super::report::RunReport;
use super::work::{work_items, CancelFlag, Job, WorkItem, WorkerEvent};
use crate::analysis::units::UnitConverter;
use crate::compute::checks::check_chunk;
use crate::compute::Engine;
use crate::config::RunConfig;
use crate::error::{ConformError, WriterError};
use crate::io::{InputSource, OutputWriter};
use ndarray::ArrayD;
use rayon::ThreadPool;
use std::collections::BTreeMap;
use std::sync::mpsc;
use tracing::{debug, info_span, warn};

fn with_retries(
    variable: &str,
    action: &str,
    retries: u32,
    mut op: impl FnMut() -> Result<(), WriterError>,
) -> Result<(), ConformError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(variable, action, attempt, error = %e, "writer failed, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
struct JobState {
    opened: bool,
    next: usize,
    buffer: BTreeMap<usize, ArrayD<f64>>,
    terminal: bool,
    succeeded: bool,
}

/// What the coordinator wants from the producer of a job's chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobFlow {
    /// More chunks are expected.
    Continue,
    /// The job was written and closed.
    Done,
    /// The job failed or was cancelled; further work on it is wasted.
    Stop,
}

/// Runs on the caller's thread. Reorders chunks, writes them in index order,
/// and records exactly one status per job.
pub(crate) struct Coordinator<'a> {
    jobs: &'a [Job],
    writer: &'a mut dyn OutputWriter,
    report: &'a mut RunReport,
    retries: u32,
    states: Vec<JobState>,
}

impl<'a> Coordinator<'a> {
    pub(crate) fn new(jobs: &'a [Job], writer: &'a mut dyn OutputWriter, report: &'a mut RunReport, retries: u32) -> Self {
        let states = jobs.iter().map(|_| JobState::default()).collect();
        Self { jobs, writer, report, retries, states }
    }

    pub(crate) fn handle(&mut self, event: WorkerEvent) -> JobFlow {
        let job = match &event {
            WorkerEvent::Chunk { job, .. } | WorkerEvent::Failed { job, .. } | WorkerEvent::Cancelled { job } => *job,
        };
        match event {
            WorkerEvent::Chunk { index, data, .. } => {
                if !self.states[job].terminal {
                    self.states[job].buffer.insert(index, data);
                    if let Err(error) = self.flush(job) {
                        self.fail(job, &error);
                    }
                }
            }
            WorkerEvent::Failed { error, .. } => self.fail(job, &error),
            WorkerEvent::Cancelled { .. } => self.cancel(job),
        }
        let state = &self.states[job];
        match (state.terminal, state.succeeded) {
            (false, _) => JobFlow::Continue,
            (true, true) => JobFlow::Done,
            (true, false) => JobFlow::Stop,
        }
    }

    // Nothing written yet: skipped. Partially written: failed and abandoned.
    fn cancel(&mut self, job: usize) {
        if self.states[job].terminal {
            return;
        }
        if self.states[job].opened {
            self.fail(job, &ConformError::Cancelled);
        } else {
            self.abandon(job);
            self.report.skipped(self.jobs[job].name(), "cancelled");
        }
    }

    fn flush(&mut self, job: usize) -> Result<(), ConformError> {
        let jobs = self.jobs;
        let name = jobs[job].name();
        let expected = jobs[job].plan.output_chunks();
        loop {
            let state = &mut self.states[job];
            let Some(data) = state.buffer.remove(&state.next) else { break };
            let index = state.next;
            let writer = &mut *self.writer;
            if !state.opened {
                with_retries(name, "open", self.retries, || writer.open(&jobs[job].header))?;
                state.opened = true;
            }
            with_retries(name, "write", self.retries, || writer.write_chunk(name, index, &data))?;
            state.next += 1;
            for violation in check_chunk(&jobs[job].var.standard, &data) {
                warn!(variable = name, chunk = index, "valid range check: {}", violation);
            }
        }

        if self.states[job].next == expected {
            let writer = &mut *self.writer;
            with_retries(name, "close", self.retries, || writer.close(name))?;
            self.states[job].terminal = true;
            self.states[job].succeeded = true;
            self.report.succeeded(name, expected);
            debug!(variable = name, chunks = expected, "variable written");
        }
        Ok(())
    }

    fn fail(&mut self, job: usize, error: &ConformError) {
        if self.states[job].terminal {
            return;
        }
        self.abandon(job);
        let name = self.jobs[job].name();
        warn!(variable = name, kind = error.kind(), "variable failed: {}", error);
        self.report.fail(name, error);
    }

    fn abandon(&mut self, job: usize) {
        let name = self.jobs[job].name();
        let state = &mut self.states[job];
        state.terminal = true;
        state.buffer.clear();
        if state.opened {
            if let Err(e) = self.writer.abandon(name) {
                warn!(variable = name, error = %e, "abandon failed");
            }
        }
    }

    /// Reports every job that never reached a terminal state as failed.
    pub(crate) fn finish(mut self) {
        for job in 0..self.jobs.len() {
            if !self.states[job].terminal {
                let next = self.states[job].next;
                self.fail(job, &ConformError::chunk(next, "output incomplete"));
            }
        }
    }
}

/// Runs jobs on `workers` threads (or the caller's thread when `workers <= 1`).
///
/// Workers only read shared state; every writer call happens on the caller's
/// thread, so sequential and parallel runs write identical data.
pub struct Scheduler<'a> {
    source: &'a dyn InputSource,
    converter: &'a dyn UnitConverter,
    workers: usize,
    threshold: Option<usize>,
    retries: u32,
    cancel: CancelFlag,
}

impl<'a> Scheduler<'a> {
    pub fn new(source: &'a dyn InputSource, converter: &'a dyn UnitConverter, config: &RunConfig, cancel: CancelFlag) -> Self {
        Self {
            source,
            converter,
            workers: config.workers,
            threshold: config.chunk_granularity_threshold,
            retries: config.writer_retries,
            cancel,
        }
    }

    pub fn run(&self, jobs: &[Job], writer: &mut dyn OutputWriter, report: &mut RunReport) {
        let items = work_items(jobs, self.threshold);
        debug!(jobs = jobs.len(), items = items.len(), workers = self.workers, "dispatching");
        let mut coordinator = Coordinator::new(jobs, writer, report, self.retries);

        if self.workers > 1 {
            match rayon::ThreadPoolBuilder::new().num_threads(self.workers).build() {
                Ok(pool) => {
                    self.run_parallel(&pool, jobs, &items, &mut coordinator);
                    coordinator.finish();
                    return;
                }
                Err(e) => warn!(error = %e, "worker pool unavailable, running sequentially"),
            }
        }

        for &item in &items {
            if self.cancel.is_cancelled() {
                coordinator.handle(WorkerEvent::Cancelled { job: item.job() });
                continue;
            }
            let mut stopped = false;
            let result = self.execute(jobs, item, &mut |event| match coordinator.handle(event) {
                JobFlow::Continue | JobFlow::Done => Ok(()),
                JobFlow::Stop => {
                    stopped = true;
                    Err(ConformError::Cancelled)
                }
            });
            if let (Err(error), false) = (result, stopped) {
                coordinator.handle(WorkerEvent::Failed { job: item.job(), error });
            }
        }
        coordinator.finish();
    }

    fn run_parallel(&self, pool: &ThreadPool, jobs: &[Job], items: &[WorkItem], coordinator: &mut Coordinator) {
        let (tx, rx) = mpsc::channel::<WorkerEvent>();
        pool.in_place_scope(move |scope| {
            for &item in items {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let job = item.job();
                    if self.cancel.is_cancelled() {
                        self.deliver(&tx, WorkerEvent::Cancelled { job });
                        return;
                    }
                    let mut disconnected = false;
                    let result = self.execute(jobs, item, &mut |event| {
                        tx.send(event).map_err(|_| {
                            disconnected = true;
                            ConformError::Cancelled
                        })
                    });
                    if disconnected {
                        self.coordinator_lost(job);
                    } else if let Err(error) = result {
                        self.deliver(&tx, WorkerEvent::Failed { job, error });
                    }
                });
            }
            drop(tx);
            for event in rx {
                coordinator.handle(event);
            }
        });
    }

    fn deliver(&self, tx: &mpsc::Sender<WorkerEvent>, event: WorkerEvent) {
        let job = match &event {
            WorkerEvent::Chunk { job, .. } | WorkerEvent::Failed { job, .. } | WorkerEvent::Cancelled { job } => *job,
        };
        if tx.send(event).is_err() {
            self.coordinator_lost(job);
        }
    }

    // Without a coordinator no result can be recorded; stop dispatching.
    fn coordinator_lost(&self, job: usize) {
        warn!(job, "coordinator stopped receiving, cancelling the run");
        self.cancel.cancel();
    }

    /// Evaluates one item, handing every chunk to `send`. Returns the first
    /// evaluation or delivery error.
    fn execute(
        &self,
        jobs: &[Job],
        item: WorkItem,
        send: &mut dyn FnMut(WorkerEvent) -> Result<(), ConformError>,
    ) -> Result<(), ConformError> {
        let job = item.job();
        let j = &jobs[job];
        let span = info_span!("variable", name = %j.name(), item = ?item);
        let _guard = span.enter();

        let engine = Engine::new(&j.var, &j.plan, self.source, self.converter);
        match item {
            WorkItem::Whole { .. } => engine.run(&mut |index, data| send(WorkerEvent::Chunk { job, index, data })).map(drop),
            WorkItem::Chunk { chunk, .. } => engine
                .run_chunk(chunk)
                .and_then(|data| send(WorkerEvent::Chunk { job, index: chunk, data })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::units::LinearUnitConverter;
    use crate::compute::ChunkPlan;
    use crate::functions::FunctionRegistry;
    use crate::graph::GraphBuilder;
    use crate::io::{MemorySource, MemoryWriter};
    use crate::parse::Definitions;
    use crate::resolve::Resolver;
    use crate::schedule::VariableStatus;
    use crate::standard::StandardVariable;
    use crate::store::Unit;
    use ndarray::{arr1, IxDyn};

    fn source() -> MemorySource {
        let mut s = MemorySource::new();
        let tas = ArrayD::from_shape_fn(IxDyn(&[12, 3]), |ix| 260.0 + ix[0] as f64 * 1.5 - ix[1] as f64 * 0.25);
        s.insert("tas", &[("time", 12), ("lat", 3)], Unit::new("K"), tas);
        s
    }

    fn jobs(specs: &[(&str, &str, &[&str], &str)], source: &MemorySource, config: &RunConfig) -> Vec<Job> {
        let functions = FunctionRegistry::with_builtins();
        let defs: Definitions = specs.iter().map(|(n, e, _, _)| (n.to_string(), e.to_string())).collect();
        let graph = GraphBuilder::new(&functions, source).build(&defs);
        let conv = LinearUnitConverter::new();
        let map = Default::default();
        let resolver = Resolver::new(&functions, source, &conv, &map);
        specs
            .iter()
            .map(|(name, _, dims, unit)| {
                let var = resolver.resolve(graph.get(name).unwrap(), &StandardVariable::new(dims, unit)).unwrap();
                let plan = ChunkPlan::build(&var, &functions, config).unwrap();
                Job::new(var, plan, false)
            })
            .collect()
    }

    const SPECS: &[(&str, &str, &[&str], &str)] = &[
        ("tas_c", "tas", &["lat", "time"], "degC"),
        ("tas_mean", "mean(tas, dim='time')", &["lat"], "K"),
        ("anomaly", "tas - mean(tas, dim='time')", &["time", "lat"], "K"),
        ("running", "cumsum(tas, dim='time')", &["time", "lat"], "K"),
    ];

    fn run(config: &RunConfig, writer: &mut MemoryWriter, cancel: CancelFlag) -> RunReport {
        let src = source();
        let jobs = jobs(SPECS, &src, config);
        let conv = LinearUnitConverter::new();
        let mut report = RunReport::new();
        Scheduler::new(&src, &conv, config, cancel).run(&jobs, writer, &mut report);
        report
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let seq_cfg = RunConfig { chunk_length: Some(5), ..Default::default() };
        let par_cfg = RunConfig { workers: 4, chunk_granularity_threshold: Some(2), ..seq_cfg.clone() };

        let mut seq = MemoryWriter::new();
        let mut par = MemoryWriter::new();
        let seq_report = run(&seq_cfg, &mut seq, CancelFlag::new());
        let par_report = run(&par_cfg, &mut par, CancelFlag::new());

        assert!(!seq_report.has_failures());
        assert_eq!(seq_report, par_report);
        for name in ["tas_c", "tas_mean", "anomaly", "running"] {
            assert_eq!(seq.get(name).unwrap().data, par.get(name).unwrap().data, "{}", name);
        }
        assert_eq!(seq_report.get("tas_c"), Some(&VariableStatus::Succeeded { chunks: 3 }));
        assert_eq!(seq_report.get("tas_mean"), Some(&VariableStatus::Succeeded { chunks: 1 }));
    }

    #[test]
    fn test_out_of_order_chunks_are_written_in_order() {
        let src = source();
        let cfg = RunConfig { chunk_length: Some(5), ..Default::default() };
        let jobs = jobs(&SPECS[..1], &src, &cfg);
        let mut writer = MemoryWriter::new();
        let mut report = RunReport::new();
        let mut coord = Coordinator::new(&jobs, &mut writer, &mut report, 0);
        let chunk = |n: usize| ArrayD::zeros(IxDyn(&[3, n]));
        assert_eq!(coord.handle(WorkerEvent::Chunk { job: 0, index: 2, data: chunk(2) }), JobFlow::Continue);
        assert_eq!(coord.handle(WorkerEvent::Chunk { job: 0, index: 0, data: chunk(5) }), JobFlow::Continue);
        assert_eq!(coord.handle(WorkerEvent::Chunk { job: 0, index: 1, data: chunk(5) }), JobFlow::Done);
        coord.finish();
        assert_eq!(writer.events(), ["open tas_c", "chunk tas_c 0", "chunk tas_c 1", "chunk tas_c 2", "close tas_c"]);
        assert_eq!(report.get("tas_c"), Some(&VariableStatus::Succeeded { chunks: 3 }));
    }

    #[test]
    fn test_writer_failures_are_retried_then_isolated() {
        let cfg = RunConfig { chunk_length: Some(5), writer_retries: 2, ..Default::default() };
        let mut writer = MemoryWriter::new();
        writer.fail_writes("tas_c", 2);
        writer.fail_writes("running", 3);
        let report = run(&cfg, &mut writer, CancelFlag::new());

        assert_eq!(report.get("tas_c"), Some(&VariableStatus::Succeeded { chunks: 3 }));
        assert_eq!(report.failure_kind("running"), Some("WriterError"));
        assert_eq!(writer.abandoned(), ["running".to_string()]);
        assert!(writer.get("anomaly").is_some());
        assert!(writer.get("tas_mean").is_some());
    }

    #[test]
    fn test_cancelled_run_skips_everything() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut writer = MemoryWriter::new();
        let report = run(&RunConfig::default(), &mut writer, cancel);
        assert_eq!(report.counts(), (0, 0, 4));
        assert!(writer.events().is_empty());
        assert!(!report.has_failures());
    }

    #[test]
    fn test_failed_item_abandons_open_variable() {
        let src = source();
        let cfg = RunConfig { chunk_length: Some(5), ..Default::default() };
        let jobs = jobs(&SPECS[..1], &src, &cfg);
        let mut writer = MemoryWriter::new();
        let mut report = RunReport::new();
        let mut coord = Coordinator::new(&jobs, &mut writer, &mut report, 0);
        coord.handle(WorkerEvent::Chunk { job: 0, index: 0, data: ArrayD::zeros(IxDyn(&[3, 5])) });
        let error = ConformError::chunk(1, "boom");
        assert_eq!(coord.handle(WorkerEvent::Failed { job: 0, error }), JobFlow::Stop);
        // Late chunks of a failed job are dropped.
        assert_eq!(coord.handle(WorkerEvent::Chunk { job: 0, index: 1, data: arr1(&[0.0]).into_dyn() }), JobFlow::Stop);
        coord.finish();
        assert_eq!(report.failure_kind("tas_c"), Some("ChunkEvaluationError"));
        assert_eq!(writer.abandoned(), ["tas_c".to_string()]);
    }

    #[test]
    fn test_sequential_run_reports_every_variable() {
        let cfg = RunConfig { chunk_length: Some(5), workers: 1, ..Default::default() };
        let mut writer = MemoryWriter::new();
        let report = run(&cfg, &mut writer, CancelFlag::new());
        assert_eq!(report.counts(), (4, 0, 0));
        assert_eq!(report.get("tas_c"), Some(&VariableStatus::Succeeded { chunks: 3 }));
        assert_eq!(report.get("tas_mean"), Some(&VariableStatus::Succeeded { chunks: 1 }));
        assert_eq!(report.get("anomaly"), Some(&VariableStatus::Succeeded { chunks: 3 }));
        assert_eq!(report.get("running"), Some(&VariableStatus::Succeeded { chunks: 3 }));
        assert!(writer.abandoned().is_empty());
    }

    /// Cancels the run as soon as the first chunk lands.
    struct CancelOnFirstChunk {
        inner: MemoryWriter,
        cancel: CancelFlag,
    }

    impl OutputWriter for CancelOnFirstChunk {
        fn open(&mut self, header: &crate::io::VariableHeader) -> Result<(), WriterError> { self.inner.open(header) }

        fn write_chunk(&mut self, name: &str, index: usize, data: &ArrayD<f64>) -> Result<(), WriterError> {
            let written = self.inner.write_chunk(name, index, data);
            self.cancel.cancel();
            written
        }

        fn close(&mut self, name: &str) -> Result<(), WriterError> { self.inner.close(name) }

        fn abandon(&mut self, name: &str) -> Result<(), WriterError> { self.inner.abandon(name) }
    }

    #[test]
    fn test_cancel_after_partial_output_fails_the_variable() {
        let src = source();
        let cfg = RunConfig { chunk_length: Some(5), chunk_granularity_threshold: Some(1), ..Default::default() };
        let jobs = jobs(SPECS, &src, &cfg);
        assert!(matches!(work_items(&jobs, cfg.chunk_granularity_threshold)[..2], [WorkItem::Chunk { job: 0, .. }, WorkItem::Chunk { job: 0, .. }]));

        let cancel = CancelFlag::new();
        let mut writer = CancelOnFirstChunk { inner: MemoryWriter::new(), cancel: cancel.clone() };
        let conv = LinearUnitConverter::new();
        let mut report = RunReport::new();
        Scheduler::new(&src, &conv, &cfg, cancel).run(&jobs, &mut writer, &mut report);

        assert_eq!(report.failure_kind("tas_c"), Some("Cancelled"));
        assert_eq!(writer.inner.abandoned(), ["tas_c".to_string()]);
        assert!(writer.inner.get("tas_c").is_none());
        for name in ["tas_mean", "anomaly", "running"] {
            assert_eq!(report.get(name), Some(&VariableStatus::Skipped { reason: "cancelled".into() }));
        }
        assert_eq!(report.counts(), (0, 1, 3));
    }
}
