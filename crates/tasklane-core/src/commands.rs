mod account;
mod chat_ops;
mod task_ops;

use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::cli::Command;
use crate::guard::{self, GuardDecision, LOGIN_PATH};
use crate::render::Renderer;
use crate::session::{SessionSnapshot, SessionStore};

/// Everything a command needs, built once per run.
#[derive(Debug)]
pub struct AppContext {
    pub session: SessionStore,
    pub renderer: Renderer,
    pub refresh_interval: Duration,
}

/// Resolves the session, checks the command's route and runs it. The
/// background refresh is stopped before returning.
#[instrument(skip(ctx, command))]
pub async fn dispatch(ctx: &AppContext, command: Command) -> anyhow::Result<()> {
    let route = command.route();
    let snapshot = ctx.session.start(ctx.refresh_interval).await;
    debug!(route, status = ?snapshot.status, "session resolved");

    let outcome = match guard::evaluate_route(&snapshot, route) {
        GuardDecision::Render => run(ctx, &snapshot, command).await,
        GuardDecision::Redirect(target) => refuse(route, &target, &snapshot),
        GuardDecision::Loading => Err(anyhow!("session is still loading; try again")),
    };

    ctx.session.teardown().await;
    outcome
}

async fn run(ctx: &AppContext, snapshot: &SessionSnapshot, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Login { email, password } => account::login(ctx, &email, &password).await,
        Command::Register {
            email,
            password,
            name,
        } => account::register(ctx, &email, &password, name.as_deref()).await,
        Command::Logout => account::logout(ctx).await,
        Command::Whoami { verify } => account::whoami(ctx, snapshot, verify).await,
        Command::Profile { email, username } => account::profile(ctx, email, username).await,
        Command::Tasks { action } => task_ops::run(ctx, signed_in(snapshot)?, action).await,
        Command::Chat { action } => chat_ops::run(ctx, signed_in(snapshot)?, action).await,
    }
}

fn refuse(route: &str, target: &str, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
    if target.starts_with(LOGIN_PATH) {
        info!(route, target, "guard redirected to login");
        return Err(anyhow!(
            "{route} needs a signed-in user; run `tasklane login --email <EMAIL> --password <PASSWORD>` first"
        ));
    }

    let who = snapshot
        .user
        .as_ref()
        .map(|user| user.email.as_str())
        .unwrap_or("another user");
    println!("Already signed in as {who}. Run `tasklane logout` to switch accounts.");
    Ok(())
}

fn signed_in(snapshot: &SessionSnapshot) -> anyhow::Result<Uuid> {
    snapshot
        .user_id()
        .ok_or_else(|| anyhow!("not signed in"))
}
