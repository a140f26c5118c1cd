pub mod api;
pub mod chat;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod guard;
pub mod render;
pub mod session;
pub mod storage;
pub mod tasks;

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info
};

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    route = cli.command.route(),
    "starting tasklane CLI"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.tasklanerc.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let storage = Arc::new(
    storage::FileStorage::open(
      &data_dir
    )
    .with_context(|| {
      format!(
        "failed to open client state \
         in {}",
        data_dir.display()
      )
    })?
  );

  let base_url = cfg.api_base_url()?;
  let api = api::ApiClient::with_reqwest(
    base_url.clone(),
    cfg.request_timeout()?,
    storage
  )?;
  info!(base_url = %base_url, "api client ready");

  let ctx = commands::AppContext {
    session:          session::SessionStore::new(
      api
    ),
    renderer:         render::Renderer::new(
      &cfg
    ),
    refresh_interval: cfg
      .refresh_interval()?
  };

  let runtime =
    tokio::runtime::Builder::new_multi_thread()
      .enable_all()
      .build()
      .context(
        "failed to start async runtime"
      )?;
  runtime.block_on(commands::dispatch(
    &ctx,
    cli.command
  ))?;

  info!("done");
  Ok(())
}
