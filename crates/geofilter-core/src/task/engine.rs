//! Bounded worker pool running tasks off the owning thread

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::{
    CancelToken, Progress, StateCell, Task, TaskContext, TaskId, TaskKind, TaskResult, TaskState,
};
use crate::error::{FilterError, Result};

struct Job {
    task: Box<dyn Task>,
    ctx: TaskContext,
    state: StateCell,
}

/// Delivered to the owning thread when a task's `Running` phase is over
#[derive(Debug)]
pub struct Completion {
    pub id: TaskId,
    pub kind: TaskKind,
    pub description: String,
    pub result: TaskResult,
    pub elapsed: Duration,
}

/// Owning-thread view of a submitted task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: TaskId,
    pub kind: TaskKind,
    cancel: CancelToken,
    progress: Progress,
    state: StateCell,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn progress(&self) -> u32 {
        self.progress.get()
    }
}

pub struct TaskEngine {
    jobs: Option<Sender<Job>>,
    completions: Receiver<Completion>,
    workers: Vec<JoinHandle<()>>,
    handles: HashMap<TaskId, TaskHandle>,
    next_id: TaskId,
}

impl TaskEngine {
    /// Start `workers` worker threads
    pub fn new(workers: usize) -> Result<Self> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let (done_tx, done_rx) = unbounded::<Completion>();
        let mut threads = Vec::with_capacity(workers.max(1));
        for n in 0..workers.max(1) {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("geofilter-worker-{}", n))
                .spawn(move || worker_loop(jobs, done))?;
            threads.push(handle);
        }
        tracing::debug!(workers = threads.len(), "task engine started");
        Ok(Self {
            jobs: Some(job_tx),
            completions: done_rx,
            workers: threads,
            handles: HashMap::new(),
            next_id: 1,
        })
    }

    /// Queue a task for a worker
    pub fn submit(&mut self, task: Box<dyn Task>) -> Result<TaskHandle> {
        let id = self.next_id;
        self.next_id += 1;
        let handle = TaskHandle {
            id,
            kind: task.kind(),
            cancel: CancelToken::new(),
            progress: Progress::default(),
            state: StateCell::new(),
        };
        let job = Job {
            ctx: TaskContext::new(id, handle.cancel.clone(), handle.progress.clone()),
            state: handle.state.clone(),
            task,
        };
        handle.state.transition(TaskState::Queued)?;
        tracing::debug!(task = id, kind = %handle.kind, "task queued");

        let sender = self
            .jobs
            .as_ref()
            .ok_or_else(|| FilterError::Other("task engine is shut down".to_string()))?;
        sender
            .send(job)
            .map_err(|_| FilterError::Other("task workers are gone".to_string()))?;
        self.handles.insert(id, handle.clone());
        Ok(handle)
    }

    /// Next completion if one is ready (the task moves to `Finished`)
    pub fn try_next(&mut self) -> Option<Completion> {
        let completion = self.completions.try_recv().ok()?;
        Some(self.finish(completion))
    }

    /// Wait up to `timeout` for the next completion
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<Completion> {
        match self.completions.recv_timeout(timeout) {
            Ok(completion) => Some(self.finish(completion)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn finish(&mut self, completion: Completion) -> Completion {
        if let Some(handle) = self.handles.remove(&completion.id) {
            if let Err(e) = handle.state.transition(TaskState::Finished) {
                tracing::error!(task = completion.id, error = %e, "bad task state on finish");
            }
        }
        completion
    }

    /// Tasks submitted but not yet finished
    pub fn pending(&self) -> usize {
        self.handles.len()
    }

    pub fn handle(&self, id: TaskId) -> Option<&TaskHandle> {
        self.handles.get(&id)
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        match self.handles.get(&id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for handle in self.handles.values() {
            handle.cancel();
        }
    }

    /// Cancel outstanding work and join the workers
    pub fn shutdown(&mut self) {
        self.cancel_all();
        self.jobs = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("task worker panicked during shutdown");
            }
        }
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(jobs: Receiver<Job>, done: Sender<Completion>) {
    while let Ok(job) = jobs.recv() {
        let completion = execute(job);
        if done.send(completion).is_err() {
            break;
        }
    }
}

fn execute(mut job: Job) -> Completion {
    let start = Instant::now();
    let id = job.ctx.id;
    let kind = job.task.kind();
    let description = job.task.describe();
    let span = tracing::info_span!("task", id, kind = %kind);
    let _enter = span.enter();

    let result = if job.ctx.is_canceled() {
        tracing::debug!("canceled while queued");
        TaskResult::Canceled
    } else {
        run_task(&mut job)
    };

    if let Err(e) = job.state.transition(result.state()) {
        tracing::error!(error = %e, "bad task state after run");
    }

    // finalize is unconditional
    if catch_unwind(AssertUnwindSafe(|| job.task.finalize())).is_err() {
        tracing::error!("task finalize panicked");
    }

    match &result {
        TaskResult::Succeeded(_) => tracing::debug!(elapsed = ?start.elapsed(), "task succeeded"),
        TaskResult::Failed(e) => tracing::warn!(error = %e, "task failed"),
        TaskResult::Canceled => tracing::info!("task canceled"),
    }

    Completion {
        id,
        kind,
        description,
        result,
        elapsed: start.elapsed(),
    }
}

fn run_task(job: &mut Job) -> TaskResult {
    if let Err(e) = job.state.transition(TaskState::Running) {
        return TaskResult::Failed(e);
    }
    let ctx = job.ctx.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| job.task.run(&ctx)));
    match outcome {
        Ok(Ok(output)) => {
            ctx.set_progress(100);
            TaskResult::Succeeded(output)
        }
        Ok(Err(FilterError::Canceled)) => TaskResult::Canceled,
        Ok(Err(_)) if ctx.is_canceled() => TaskResult::Canceled,
        Ok(Err(e)) => TaskResult::Failed(e),
        Err(_) => TaskResult::Failed(FilterError::Other(format!(
            "{} task panicked",
            job.task.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::TaskOutput;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Sleepy {
        finalized: Arc<AtomicUsize>,
        ran: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Task for Sleepy {
        fn kind(&self) -> TaskKind {
            TaskKind::PopulateList
        }

        fn describe(&self) -> String {
            "sleepy".to_string()
        }

        fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            for _ in 0..200 {
                ctx.check_canceled()?;
                thread::sleep(Duration::from_millis(5));
            }
            if self.fail {
                return Err(FilterError::Other("boom".to_string()));
            }
            Ok(TaskOutput::Values(Vec::new()))
        }

        fn finalize(&mut self) {
            self.finalized.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Quick;

    impl Task for Quick {
        fn kind(&self) -> TaskKind {
            TaskKind::PopulateList
        }

        fn describe(&self) -> String {
            "quick".to_string()
        }

        fn run(&mut self, _ctx: &TaskContext) -> Result<TaskOutput> {
            Ok(TaskOutput::Values(Vec::new()))
        }
    }

    fn sleepy(fail: bool) -> (Box<Sleepy>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let finalized = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let task = Box::new(Sleepy {
            finalized: finalized.clone(),
            ran: ran.clone(),
            fail,
        });
        (task, finalized, ran)
    }

    #[test]
    fn test_success_reaches_finished() {
        let mut engine = TaskEngine::new(2).unwrap();
        let handle = engine.submit(Box::new(Quick)).unwrap();
        let completion = engine.next_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(completion.id, handle.id);
        assert!(matches!(completion.result, TaskResult::Succeeded(_)));
        assert_eq!(handle.state(), TaskState::Finished);
        assert_eq!(handle.progress(), 100);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_cancel_while_running() {
        let mut engine = TaskEngine::new(1).unwrap();
        let (task, finalized, ran) = sleepy(false);
        let handle = engine.submit(task).unwrap();
        while ran.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(engine.cancel(handle.id));
        let completion = engine.next_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(completion.result, TaskResult::Canceled));
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_canceled_while_queued_never_runs_but_finalizes() {
        let mut engine = TaskEngine::new(1).unwrap();
        let (blocker, _, blocker_ran) = sleepy(false);
        let blocker = engine.submit(blocker).unwrap();
        while blocker_ran.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let (queued, finalized, ran) = sleepy(false);
        let queued = engine.submit(queued).unwrap();
        queued.cancel();
        blocker.cancel();

        let mut results = Vec::new();
        while let Some(c) = engine.next_timeout(Duration::from_secs(5)) {
            results.push(c);
            if results.len() == 2 {
                break;
            }
        }
        let done = results.iter().find(|c| c.id == queued.id).unwrap();
        assert!(matches!(done.result, TaskResult::Canceled));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_is_reported_not_retried() {
        let mut engine = TaskEngine::new(1).unwrap();
        let (mut task, finalized, ran) = sleepy(true);
        task.fail = true;
        engine.submit(task).unwrap();
        let completion = engine.next_timeout(Duration::from_secs(10)).unwrap();
        match completion.result {
            TaskResult::Failed(e) => assert_eq!(e.to_string(), "boom"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_next_when_idle() {
        let mut engine = TaskEngine::new(1).unwrap();
        assert!(engine.try_next().is_none());
    }
}
