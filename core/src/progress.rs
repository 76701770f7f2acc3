//! Index build status: progress lines written by the indexer, a blocking
//! hand-off queue, and the board a status endpoint reads.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;

pub const PROGRESS_PREFIX: &str = "visearch";

pub const STAGE_INGEST: &str = "ingest";
pub const STAGE_INVERT: &str = "invert";
pub const STAGE_WEIGHTS: &str = "weights";

/// Stages of an indexer run, in order, with human readable descriptions.
pub const INDEX_STAGES: [(&str, &str); 3] = [
    (STAGE_INGEST, "Reading assignments"),
    (STAGE_INVERT, "Building inverted index"),
    (STAGE_WEIGHTS, "Computing weights"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageState {
    NotStarted,
    Started,
    Progress { steps_done: u64, steps_count: u64 },
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub stage: String,
    pub state: StageState,
}

impl StatusUpdate {
    pub fn new(stage: impl Into<String>, state: StageState) -> Self { Self { stage: stage.into(), state } }
}

/// `visearch,<stage>,<timestamp>,<done>,<count>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    pub stage: String,
    pub timestamp: String,
    pub done: u64,
    pub count: u64,
}

impl ProgressLine {
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim().split(',');
        if fields.next()? != PROGRESS_PREFIX { return None; }
        let stage = fields.next()?.to_string();
        let timestamp = fields.next()?.to_string();
        let done = fields.next()?.parse().ok()?;
        let count = fields.next()?.parse().ok()?;
        if fields.next().is_some() { return None; }
        Some(Self { stage, timestamp, done, count })
    }

    pub fn format(stage: &str, timestamp: &str, done: u64, count: u64) -> String {
        format!("{PROGRESS_PREFIX},{stage},{timestamp},{done},{count}")
    }

    pub fn into_update(self) -> StatusUpdate {
        StatusUpdate::new(self.stage, StageState::Progress { steps_done: self.done, steps_count: self.count })
    }
}

/// What the status consumer receives. `Reset` opens a new run, so updates
/// queued before it still land on the previous run's board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Reset,
    Update(StatusUpdate),
}

impl From<StatusUpdate> for StatusEvent {
    fn from(update: StatusUpdate) -> Self { StatusEvent::Update(update) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub name: String,
    pub description: String,
    #[serde(flatten)]
    pub state: StageState,
}

#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    stages: Vec<StageStatus>,
    started: bool,
}

impl StatusBoard {
    pub fn new(stages: &[(&str, &str)]) -> Self {
        let stages = stages
            .iter()
            .map(|(name, description)| StageStatus { name: name.to_string(), description: description.to_string(), state: StageState::NotStarted })
            .collect();
        Self { stages, started: false }
    }

    /// Mark every stage not started and the board as active.
    pub fn reset(&mut self) {
        for s in &mut self.stages { s.state = StageState::NotStarted; }
        self.started = true;
    }

    pub fn is_started(&self) -> bool { self.started }

    /// Returns false for stages the board does not know.
    pub fn apply(&mut self, update: StatusUpdate) -> bool {
        match self.stages.iter_mut().find(|s| s.name == update.stage) {
            Some(s) => {
                s.state = update.state;
                self.started = true;
                true
            }
            None => false,
        }
    }

    /// Returns false for updates to stages the board does not know.
    pub fn handle(&mut self, event: StatusEvent) -> bool {
        match event {
            StatusEvent::Reset => {
                self.reset();
                true
            }
            StatusEvent::Update(update) => self.apply(update),
        }
    }

    pub fn stages(&self) -> &[StageStatus] { &self.stages }
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded FIFO between producers and a consumer that blocks on `pop`.
pub struct StatusQueue<T> {
    inner: Mutex<QueueInner<T>>,
    ready: Condvar,
}

impl<T> Default for StatusQueue<T> {
    fn default() -> Self { Self::new() }
}

impl<T> StatusQueue<T> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(QueueInner { items: VecDeque::new(), closed: false }), ready: Condvar::new() }
    }

    pub fn push(&self, item: T) {
        self.inner.lock().items.push_back(item);
        self.ready.notify_one();
    }

    /// Blocks until an item arrives. `None` once closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            self.ready.wait(&mut inner);
        }
    }

    pub fn try_pop(&self) -> Option<T> { self.inner.lock().items.pop_front() }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize { self.inner.lock().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
