use anyhow::anyhow;
use tracing::instrument;
use uuid::Uuid;

use super::AppContext;
use crate::chat::ChatModel;
use crate::cli::ChatCommand;

#[instrument(skip(ctx, action))]
pub(super) async fn run(ctx: &AppContext, user_id: Uuid, action: ChatCommand) -> anyhow::Result<()> {
    let model = ChatModel::new(ctx.session.api(), user_id);
    let outcome = execute(ctx, &model, action).await;
    model.teardown();
    outcome
}

async fn execute(ctx: &AppContext, model: &ChatModel, action: ChatCommand) -> anyhow::Result<()> {
    match action {
        ChatCommand::List => {
            model.restore_selection();
            model.load_conversations().await;
            let snapshot = model.snapshot();
            if let Some(message) = snapshot.error {
                return Err(anyhow!(message));
            }
            ctx.renderer
                .print_conversations(&snapshot.conversations, snapshot.selected)
        }
        ChatCommand::Show { id } => {
            match id {
                Some(conversation_id) => model.select(conversation_id).await,
                None => model.mount().await,
            }
            let snapshot = model.snapshot();
            if let Some(message) = snapshot.error {
                return Err(anyhow!(message));
            }
            if snapshot.selected.is_none() {
                println!("No conversation selected. Start one with `tasklane chat send <MESSAGE>`.");
                return Ok(());
            }
            ctx.renderer.print_transcript(&snapshot.transcript)
        }
        ChatCommand::Send { message } => {
            model.restore_selection();
            let before = model.snapshot().transcript.len();
            let sent = model.send(&message.join(" ")).await;

            let snapshot = model.snapshot();
            let fresh = snapshot.transcript.get(before..).unwrap_or_default();
            ctx.renderer.print_transcript(fresh)?;
            sent?;
            Ok(())
        }
        ChatCommand::New => {
            model.new_conversation();
            println!("Started a new conversation.");
            Ok(())
        }
    }
}
