//! Process-wide initialization progress.
//!
//! Every mutation builds a fresh [`ProgressSnapshot`] and publishes it with a single
//! pointer swap, so pollers always see a whole snapshot and never wait on pipeline I/O.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::layout::write_json_atomic;

const MESSAGES_MAX: usize = 200;

static GLOBAL: Lazy<Arc<ProgressTracker>> = Lazy::new(|| Arc::new(ProgressTracker::new()));
static RUN_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    NotStarted,
    Fetching,
    Cleaning,
    Loading,
    Normalizing,
    Done,
    Failed,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::NotStarted => "not started",
            Stage::Fetching => "fetching",
            Stage::Cleaning => "cleaning",
            Stage::Loading => "loading",
            Stage::Normalizing => "normalizing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// The stage a run must enter after this one.
    pub fn successor(self) -> Option<Stage> {
        match self {
            Stage::NotStarted => Some(Stage::Fetching),
            Stage::Fetching => Some(Stage::Cleaning),
            Stage::Cleaning => Some(Stage::Loading),
            Stage::Loading => Some(Stage::Normalizing),
            Stage::Normalizing => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub stage: Stage,
    pub cause: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: u64,
    pub stage: Stage,
    pub percent: Option<f32>,
    pub message: String,
    pub sub_stage: Option<String>,
    pub terminal: bool,
    pub success: bool,
    pub failure: Option<Failure>,
    pub stages: Vec<Stage>,
    pub messages: VecDeque<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProgressSnapshot {
    fn initial(run_id: u64) -> Self {
        Self {
            run_id,
            stage: Stage::NotStarted,
            percent: None,
            message: "initialization pending".to_string(),
            sub_stage: None,
            terminal: false,
            success: false,
            failure: None,
            stages: vec![Stage::NotStarted],
            messages: VecDeque::new(),
            started_at: None,
            updated_at: Utc::now(),
            finished_at: None,
        }
    }

    fn push_message(&mut self, message: String) {
        if self.messages.len() >= MESSAGES_MAX {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn whole_percent(&self) -> Option<u8> {
        self.percent.map(|value| value.floor() as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Publish {
    Quiet,
    Mirror,
}

pub struct ProgressTracker {
    current: RwLock<Arc<ProgressSnapshot>>,
    writer: Mutex<()>,
    mirror: Mutex<Option<Utf8PathBuf>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(ProgressSnapshot::initial(next_run_id()))),
            writer: Mutex::new(()),
            mirror: Mutex::new(None),
        }
    }

    pub fn global() -> Arc<ProgressTracker> {
        Arc::clone(&GLOBAL)
    }

    /// Also persist snapshots as JSON at `path` so another process can poll them.
    pub fn set_mirror(&self, path: Option<Utf8PathBuf>) {
        if let Ok(mut mirror) = self.mirror.lock() {
            *mirror = path;
        }
    }

    pub fn snapshot(&self) -> Arc<ProgressSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn restart(&self) -> u64 {
        let run_id = next_run_id();
        self.update(|snapshot| {
            let mut fresh = ProgressSnapshot::initial(run_id);
            fresh.started_at = Some(Utc::now());
            *snapshot = fresh;
            Some(Publish::Mirror)
        });
        run_id
    }

    pub fn enter(&self, stage: Stage, message: impl Into<String>) -> bool {
        let message = message.into();
        self.update(|snapshot| {
            let skips = snapshot.stage.successor() != Some(stage);
            if snapshot.terminal || stage.is_terminal() || skips {
                warn!(from = %snapshot.stage, to = %stage, "ignored progress transition");
                return None;
            }
            snapshot.stage = stage;
            snapshot.stages.push(stage);
            snapshot.percent = Some(0.0);
            snapshot.sub_stage = None;
            snapshot.push_message(format!("[STEP] {message}"));
            snapshot.message = message;
            Some(Publish::Mirror)
        })
    }

    /// Enters every stage up to and including `stage`, for work that starts from an
    /// already initialized store.
    pub fn advance_to(&self, stage: Stage, message: impl Into<String>) -> bool {
        let message = message.into();
        if stage.is_terminal() || self.snapshot().stage >= stage {
            return false;
        }
        while let Some(next) = self.snapshot().stage.successor() {
            if next == stage {
                return self.enter(next, message);
            }
            if !self.enter(next, format!("{next} already done")) {
                return false;
            }
        }
        false
    }

    /// `percent = None` marks indeterminate progress.
    pub fn report(&self, stage: Stage, percent: Option<f32>, message: impl Into<String>) -> bool {
        let message = message.into();
        self.update(|snapshot| {
            if snapshot.terminal || snapshot.stage != stage {
                debug!(current = %snapshot.stage, reported = %stage, "stale progress report");
                return None;
            }
            let before = snapshot.whole_percent();
            snapshot.percent = match (percent, snapshot.percent) {
                (Some(next), Some(previous)) => Some(next.clamp(0.0, 100.0).max(previous)),
                (Some(next), None) => Some(next.clamp(0.0, 100.0)),
                (None, _) => None,
            };
            snapshot.message = message;
            if snapshot.whole_percent() != before {
                Some(Publish::Mirror)
            } else {
                Some(Publish::Quiet)
            }
        })
    }

    pub fn sub_stage(&self, stage: Stage, name: impl Into<String>) -> bool {
        let name = name.into();
        self.update(|snapshot| {
            if snapshot.terminal || snapshot.stage != stage {
                return None;
            }
            snapshot.push_message(format!("[STEP] {stage}: {name}"));
            snapshot.sub_stage = Some(name);
            Some(Publish::Mirror)
        })
    }

    pub fn log(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.update(|snapshot| {
            if snapshot.terminal {
                return None;
            }
            snapshot.push_message(message);
            Some(Publish::Quiet)
        })
    }

    pub fn complete(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.update(|snapshot| {
            if snapshot.terminal || snapshot.stage != Stage::Normalizing {
                warn!(from = %snapshot.stage, "ignored completion outside normalizing stage");
                return None;
            }
            let now = Utc::now();
            snapshot.stage = Stage::Done;
            snapshot.stages.push(Stage::Done);
            snapshot.percent = Some(100.0);
            snapshot.sub_stage = None;
            snapshot.terminal = true;
            snapshot.success = true;
            snapshot.push_message(format!("[OK] {message}"));
            snapshot.message = message;
            snapshot.finished_at = Some(now);
            Some(Publish::Mirror)
        })
    }

    pub fn fail(&self, stage: Stage, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        self.update(|snapshot| {
            if snapshot.terminal {
                return None;
            }
            snapshot.stage = Stage::Failed;
            snapshot.stages.push(Stage::Failed);
            snapshot.terminal = true;
            snapshot.success = false;
            snapshot.push_message(format!("[ERROR] {stage}: {cause}"));
            snapshot.message = format!("{stage} failed: {cause}");
            snapshot.failure = Some(Failure { stage, cause });
            snapshot.finished_at = Some(Utc::now());
            Some(Publish::Mirror)
        })
    }

    // Writers are serialized by `writer`; the read lock is only ever held for an Arc clone.
    fn update<F>(&self, mutate: F) -> bool
    where
        F: FnOnce(&mut ProgressSnapshot) -> Option<Publish>,
    {
        let publish = {
            let _writer = match self.writer.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut next = ProgressSnapshot::clone(&self.snapshot());
            let Some(publish) = mutate(&mut next) else {
                return false;
            };
            next.updated_at = Utc::now();
            match self.current.write() {
                Ok(mut guard) => *guard = Arc::new(next),
                Err(poisoned) => *poisoned.into_inner() = Arc::new(next),
            }
            publish
        };
        if publish == Publish::Mirror {
            self.write_mirror();
        }
        true
    }

    // Runs outside `writer`. The latest snapshot is written under the mirror lock, so
    // concurrent mirror writes land in publication order.
    fn write_mirror(&self) {
        let mirror = match self.mirror.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(path) = mirror.as_ref() {
            if let Err(err) = write_json_atomic(path, &*self.snapshot()) {
                warn!(path = %path, error = %err, "failed to mirror progress snapshot");
            }
        }
    }
}

fn next_run_id() -> u64 {
    RUN_IDS.fetch_add(1, Ordering::Relaxed)
}
