use anyhow::anyhow;
use tasklane_shared::TaskDto;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::AppContext;
use crate::cli::TaskCommand;
use crate::tasks::{TaskEdit, TaskError, TaskInput, TaskListModel};

#[instrument(skip(ctx, action))]
pub(super) async fn run(ctx: &AppContext, user_id: Uuid, action: TaskCommand) -> anyhow::Result<()> {
    let model = TaskListModel::new(ctx.session.api(), user_id);
    let outcome = execute(ctx, &model, action).await;
    model.teardown();
    outcome
}

async fn execute(ctx: &AppContext, model: &TaskListModel, action: TaskCommand) -> anyhow::Result<()> {
    match action {
        TaskCommand::List { completed, pending } => {
            let filter = if completed {
                Some(true)
            } else if pending {
                Some(false)
            } else {
                None
            };
            load(model, filter).await?;
            ctx.renderer.print_task_table(&model.snapshot().tasks)
        }
        TaskCommand::Add { title, description } => {
            let input = TaskInput::new(title.join(" "), description);
            let task = model.create(&input).await.map_err(|err| form_error(model, err))?;
            ctx.renderer.print_task("Created", &task)
        }
        TaskCommand::Edit {
            id,
            title,
            description,
        } => {
            let task_id = cached_task_id(model, &id).await?;
            let edit = TaskEdit { title, description };
            let task = model
                .update(task_id, &edit)
                .await
                .map_err(|err| form_error(model, err))?;
            ctx.renderer.print_task("Updated", &task)
        }
        TaskCommand::Done { id } => {
            let task_id = cached_task_id(model, &id).await?;
            let task = model.set_completed(task_id, true).await?;
            ctx.renderer.print_task("Completed", &task)
        }
        TaskCommand::Undo { id } => {
            let task_id = cached_task_id(model, &id).await?;
            let task = model.set_completed(task_id, false).await?;
            ctx.renderer.print_task("Reopened", &task)
        }
        TaskCommand::Delete { id } => {
            let task_id = cached_task_id(model, &id).await?;
            let title = model.task(task_id).map(|task| task.title).unwrap_or_default();
            model.delete(task_id).await?;
            println!("Deleted {title}");
            Ok(())
        }
    }
}

async fn load(model: &TaskListModel, filter: Option<bool>) -> anyhow::Result<()> {
    model.fetch_matching(filter).await;
    match model.snapshot().error {
        Some(message) => Err(anyhow!(message)),
        None => Ok(()),
    }
}

async fn cached_task_id(model: &TaskListModel, raw: &str) -> anyhow::Result<Uuid> {
    load(model, None).await?;
    resolve_task_id(&model.snapshot().tasks, raw)
}

/// Prefers the form's field message, which is what the user would see.
fn form_error(model: &TaskListModel, err: TaskError) -> anyhow::Error {
    match err {
        TaskError::Validation(errors) => anyhow!(errors.to_string()),
        other => match model.snapshot().form_errors.title {
            Some(message) => anyhow!(message),
            None => other.into(),
        },
    }
}

/// Accepts a full task id or a unique, case-insensitive prefix of one.
pub(crate) fn resolve_task_id(tasks: &[TaskDto], raw: &str) -> anyhow::Result<Uuid> {
    let needle = raw.trim().to_ascii_lowercase();
    if needle.is_empty() {
        return Err(anyhow!("task id cannot be empty"));
    }
    if let Ok(id) = Uuid::parse_str(&needle) {
        return Ok(id);
    }

    let mut matches = tasks
        .iter()
        .map(|task| task.task_id)
        .filter(|id| id.to_string().starts_with(&needle));
    let first = matches
        .next()
        .ok_or_else(|| anyhow!("no task id starts with {raw}"))?;
    if matches.next().is_some() {
        return Err(anyhow!("task id prefix {raw} is ambiguous; give more characters"));
    }
    debug!(prefix = %raw, task_id = %first, "resolved task id prefix");
    Ok(first)
}
