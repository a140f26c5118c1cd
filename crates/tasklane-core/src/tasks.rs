use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tasklane_shared::{TaskCreate, TaskDto, TaskPatch};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::ApiClient;
use crate::error::ApiError;

pub const TITLE_MAX_CHARS: usize = 200;
pub const DESCRIPTION_MAX_CHARS: usize = 500;
pub const LOAD_FAILED_MESSAGE: &str = "Failed to load tasks. Please try again later.";

/// Field-level messages shown next to the task form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFormErrors {
    pub title: Option<String>,
    pub description: Option<String>,
}

impl TaskFormErrors {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none()
    }
}

impl fmt::Display for TaskFormErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = [self.title.as_deref(), self.description.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        f.write_str(&messages.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(TaskFormErrors),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("task {0} is not in the list")]
    NotFound(Uuid),
}

/// Raw form input; trimmed and checked by `validate`.
#[derive(Debug, Clone, Default)]
pub struct TaskInput {
    pub title: String,
    pub description: String,
}

impl TaskInput {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn validate(&self) -> Result<TaskCreate, TaskFormErrors> {
        let title = self.title.trim();
        let description = self.description.trim();
        let errors = TaskFormErrors {
            title: title_error(title),
            description: description_error(description),
        };
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(TaskCreate {
            title: title.to_string(),
            description: description.to_string(),
        })
    }
}

/// Requested edits; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct TaskEdit {
    pub title: Option<String>,
    pub description: Option<String>,
}

fn title_error(title: &str) -> Option<String> {
    if title.is_empty() {
        Some("Title is required".to_string())
    } else if title.chars().count() > TITLE_MAX_CHARS {
        Some(format!("Title must be {TITLE_MAX_CHARS} characters or less"))
    } else {
        None
    }
}

fn description_error(description: &str) -> Option<String> {
    (description.chars().count() > DESCRIPTION_MAX_CHARS)
        .then(|| format!("Description must be {DESCRIPTION_MAX_CHARS} characters or less"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskListSnapshot {
    pub tasks: Vec<TaskDto>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub form_errors: TaskFormErrors,
}

/// Optimistic edits still waiting on the server for one task, layered
/// over the newest copy the server has confirmed.
#[derive(Debug)]
struct PendingEdits {
    confirmed: TaskDto,
    confirmed_version: u64,
    next_version: u64,
    patches: BTreeMap<u64, TaskPatch>,
}

impl PendingEdits {
    fn new(confirmed: TaskDto) -> Self {
        Self {
            confirmed,
            confirmed_version: 0,
            next_version: 0,
            patches: BTreeMap::new(),
        }
    }

    /// Confirmed copy plus every edit newer than it.
    fn shown(&self) -> TaskDto {
        let mut task = self.confirmed.clone();
        for patch in self.patches.range(self.confirmed_version + 1..).map(|(_, patch)| patch) {
            patch.apply_to(&mut task);
        }
        task
    }
}

#[derive(Debug, Default)]
struct TaskListState {
    view: TaskListSnapshot,
    pending: HashMap<Uuid, PendingEdits>,
    closed: bool,
}

impl TaskListState {
    fn position(&self, task_id: Uuid) -> Option<usize> {
        self.view.tasks.iter().position(|task| task.task_id == task_id)
    }
}

enum Delivery {
    Put,
    Patch,
}

/// Cached task list for one user plus the mutations on it. Clones share
/// state; the lock is never held across a request.
#[derive(Debug, Clone)]
pub struct TaskListModel {
    api: ApiClient,
    user_id: Uuid,
    cancel: CancellationToken,
    state: Arc<Mutex<TaskListState>>,
}

impl TaskListModel {
    pub fn new(api: &ApiClient, user_id: Uuid) -> Self {
        let cancel = CancellationToken::new();
        Self {
            api: api.scoped(cancel.clone()),
            user_id,
            cancel,
            state: Arc::new(Mutex::new(TaskListState::default())),
        }
    }

    pub fn snapshot(&self) -> TaskListSnapshot {
        self.state.lock().view.clone()
    }

    pub fn task(&self, task_id: Uuid) -> Option<TaskDto> {
        let state = self.state.lock();
        state.position(task_id).map(|idx| state.view.tasks[idx].clone())
    }

    pub async fn fetch_all(&self) {
        self.fetch_matching(None).await;
    }

    /// Replaces the cache with the server's list. Failures land in the
    /// snapshot's `error`.
    #[tracing::instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn fetch_matching(&self, completed: Option<bool>) {
        {
            let mut state = self.state.lock();
            state.view.is_loading = true;
            state.view.error = None;
        }

        let outcome = self.api.list_tasks(self.user_id, completed).await;

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.view.is_loading = false;
        match outcome {
            Ok(tasks) => {
                debug!(count = tasks.len(), "task list loaded");
                state.view.tasks = tasks;
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                warn!(error = %err, "failed to load tasks");
                state.view.error = Some(LOAD_FAILED_MESSAGE.to_string());
            }
        }
    }

    #[tracing::instrument(skip(self, input), fields(user_id = %self.user_id))]
    pub async fn create(&self, input: &TaskInput) -> Result<TaskDto, TaskError> {
        let payload = match input.validate() {
            Ok(payload) => payload,
            Err(errors) => {
                self.state.lock().view.form_errors = errors.clone();
                return Err(TaskError::Validation(errors));
            }
        };
        self.state.lock().view.form_errors = TaskFormErrors::default();

        let outcome = self.api.create_task(self.user_id, &payload).await;

        let mut state = self.state.lock();
        match outcome {
            Ok(task) => {
                info!(task_id = %task.task_id, "task created");
                if !state.closed {
                    state.view.tasks.insert(0, task.clone());
                }
                Ok(task)
            }
            Err(err) => {
                if !state.closed && !err.is_cancelled() {
                    state.view.form_errors.title = Some(err.message());
                }
                Err(err.into())
            }
        }
    }

    /// Sends only the fields that differ from the cached task. An edit
    /// that changes nothing returns the cached task without a request.
    #[tracing::instrument(skip(self, edit), fields(user_id = %self.user_id))]
    pub async fn update(&self, task_id: Uuid, edit: &TaskEdit) -> Result<TaskDto, TaskError> {
        let current = self.task(task_id).ok_or(TaskError::NotFound(task_id))?;

        let mut patch = TaskPatch::default();
        let mut errors = TaskFormErrors::default();
        if let Some(title) = edit.title.as_deref().map(str::trim) {
            if title != current.title {
                errors.title = title_error(title);
                patch.title = Some(title.to_string());
            }
        }
        if let Some(description) = edit.description.as_deref().map(str::trim) {
            if description != current.description {
                errors.description = description_error(description);
                patch.description = Some(description.to_string());
            }
        }

        if !errors.is_empty() {
            self.state.lock().view.form_errors = errors.clone();
            return Err(TaskError::Validation(errors));
        }
        if patch.is_empty() {
            debug!(%task_id, "edit changes nothing");
            return Ok(current);
        }

        self.mutate(task_id, patch, Delivery::Put).await
    }

    pub async fn set_completed(&self, task_id: Uuid, done: bool) -> Result<TaskDto, TaskError> {
        let current = self.task(task_id).ok_or(TaskError::NotFound(task_id))?;
        if current.is_completed == done {
            return Ok(current);
        }
        let patch = TaskPatch {
            is_completed: Some(done),
            ..TaskPatch::default()
        };
        self.mutate(task_id, patch, Delivery::Patch).await
    }

    pub async fn toggle_completed(&self, task_id: Uuid) -> Result<TaskDto, TaskError> {
        let current = self.task(task_id).ok_or(TaskError::NotFound(task_id))?;
        self.set_completed(task_id, !current.is_completed).await
    }

    /// Removes the task once the server confirms the delete.
    #[tracing::instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn delete(&self, task_id: Uuid) -> Result<(), TaskError> {
        if self.task(task_id).is_none() {
            return Err(TaskError::NotFound(task_id));
        }

        let outcome = self.api.delete_task(self.user_id, task_id).await;

        let mut state = self.state.lock();
        match outcome {
            Ok(()) => {
                if !state.closed {
                    state.view.tasks.retain(|task| task.task_id != task_id);
                    state.pending.remove(&task_id);
                }
                info!(%task_id, "task deleted");
                Ok(())
            }
            Err(err) => {
                if !state.closed && !err.is_cancelled() {
                    state.view.error = Some(format!("Failed to delete task: {}", err.message()));
                }
                Err(err.into())
            }
        }
    }

    /// Cancels in-flight requests. Anything that completes afterwards
    /// leaves the state as it was.
    pub fn teardown(&self) {
        self.state.lock().closed = true;
        self.cancel.cancel();
    }

    /// Applies `patch` to the cache at once, then reconciles with the
    /// server. Every reply, stale or not, rebuilds the cached task from the
    /// newest confirmed copy plus the edits still in flight, so a rejected
    /// edit never lingers behind a later one.
    async fn mutate(
        &self,
        task_id: Uuid,
        patch: TaskPatch,
        delivery: Delivery,
    ) -> Result<TaskDto, TaskError> {
        let version = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let idx = state.position(task_id).ok_or(TaskError::NotFound(task_id))?;
            let task = &mut state.view.tasks[idx];
            let pending = state
                .pending
                .entry(task_id)
                .or_insert_with(|| PendingEdits::new(task.clone()));
            pending.next_version += 1;
            pending.patches.insert(pending.next_version, patch.clone());
            patch.apply_to(task);
            state.view.error = None;
            state.view.form_errors = TaskFormErrors::default();
            pending.next_version
        };
        debug!(%task_id, version, "optimistic update applied");

        let outcome = match delivery {
            Delivery::Put => self.api.update_task(self.user_id, task_id, &patch).await,
            Delivery::Patch => self.api.patch_task(self.user_id, task_id, &patch).await,
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return outcome.map_err(TaskError::from);
        }

        let shown = match state.pending.get_mut(&task_id) {
            Some(pending) => {
                pending.patches.remove(&version);
                if pending.patches.keys().any(|newer| *newer > version) {
                    debug!(%task_id, version, "response superseded by a newer edit");
                }
                if let Ok(task) = &outcome
                    && version > pending.confirmed_version
                {
                    pending.confirmed = task.clone();
                    pending.confirmed_version = version;
                }
                let shown = pending.shown();
                if pending.patches.is_empty() {
                    state.pending.remove(&task_id);
                }
                Some(shown)
            }
            None => None,
        };
        if let Some(shown) = shown
            && let Some(idx) = state.position(task_id)
        {
            state.view.tasks[idx] = shown;
        }

        match outcome {
            Ok(task) => Ok(task),
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(%task_id, version, error = %err, "update failed; rolled back");
                    state.view.error = Some(format!("Failed to update task: {}", err.message()));
                }
                Err(err.into())
            }
        }
    }
}
