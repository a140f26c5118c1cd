use anyhow::anyhow;
use tasklane_shared::ProfileUpdate;
use tracing::{info, instrument};

use super::AppContext;
use crate::session::SessionSnapshot;

#[instrument(skip(ctx, password))]
pub(super) async fn login(ctx: &AppContext, email: &str, password: &str) -> anyhow::Result<()> {
    let user = ctx.session.login(email, password).await?;
    println!("Signed in as {} <{}>", user.username, user.email);
    Ok(())
}

#[instrument(skip(ctx, password))]
pub(super) async fn register(
    ctx: &AppContext,
    email: &str,
    password: &str,
    name: Option<&str>,
) -> anyhow::Result<()> {
    let user = ctx.session.register(email, password, name).await?;
    println!("Registered and signed in as {} <{}>", user.username, user.email);
    Ok(())
}

pub(super) async fn logout(ctx: &AppContext) -> anyhow::Result<()> {
    ctx.session.logout().await;
    println!("Signed out.");
    Ok(())
}

pub(super) async fn whoami(
    ctx: &AppContext,
    snapshot: &SessionSnapshot,
    verify: bool,
) -> anyhow::Result<()> {
    match &snapshot.user {
        Some(user) if snapshot.is_authenticated() => ctx.renderer.print_user(user)?,
        _ => println!("Not signed in."),
    }

    if verify {
        let valid = ctx.session.verify().await?;
        println!("token     {}", if valid { "valid" } else { "not valid" });
    }
    Ok(())
}

#[instrument(skip(ctx))]
pub(super) async fn profile(
    ctx: &AppContext,
    email: Option<String>,
    username: Option<String>,
) -> anyhow::Result<()> {
    let update = ProfileUpdate {
        email: email.map(|value| value.trim().to_string()),
        username: username.map(|value| value.trim().to_string()),
    };
    if update.email.is_none() && update.username.is_none() {
        return Err(anyhow!("nothing to change; pass --email and/or --username"));
    }

    let user = ctx.session.update_profile(&update).await?;
    info!(user_id = %user.user_id, "profile updated");
    ctx.renderer.print_user(&user)
}
