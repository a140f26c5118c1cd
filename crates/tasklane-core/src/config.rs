use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::time::Duration;

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

pub const DEFAULT_API_URL: &str =
  "http://localhost:7860";
pub const API_URL_ENV: &str =
  "TASKLANE_API_URL";
pub const RC_ENV: &str = "TASKLANERC";

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Config {
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let rc = resolve_rc_path(
      rc_override
    )?;
    let api_url =
      std::env::var(API_URL_ENV)
        .ok()
        .filter(|url| {
          !url.trim().is_empty()
        });
    Self::load_from(rc, api_url)
  }

  fn load_from(
    rc: Option<PathBuf>,
    api_url: Option<String>
  ) -> anyhow::Result<Self> {
    let mut cfg = Self::defaults();

    if let Some(url) = api_url {
      debug!(url = %url, "api url from environment");
      cfg
        .map
        .insert("api.url".to_string(), url);
    }

    if let Some(path) = rc {
      info!(rc = %path.display(), "loading tasklanerc");
      cfg.load_file(&path)?;
    } else {
      debug!(
        "no tasklanerc found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  pub fn defaults() -> Self {
    let map = [
      ("api.url", DEFAULT_API_URL),
      ("api.timeout", "30"),
      (
        "session.refresh_interval",
        "300"
      ),
      ("data.location", "~/.tasklane"),
      ("color", "on")
    ]
    .into_iter()
    .map(|(k, v)| {
      (k.to_string(), v.to_string())
    })
    .collect();

    Config {
      map,
      loaded_files: vec![]
    }
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> Option<bool> {
    self
      .map
      .get(key)
      .map(|v| parse_bool(v))
  }

  /// Base URL of the task API, without
  /// a trailing slash.
  pub fn api_base_url(
    &self
  ) -> anyhow::Result<String> {
    let raw = self
      .get("api.url")
      .unwrap_or_default();
    let url = raw
      .trim()
      .trim_end_matches('/')
      .to_string();
    if url.is_empty() {
      return Err(anyhow!(
        "api.url must not be empty"
      ));
    }
    if !url.starts_with("http://")
      && !url.starts_with("https://")
    {
      return Err(anyhow!(
        "api.url must start with \
         http:// or https://, got: \
         {url}"
      ));
    }
    Ok(url)
  }

  pub fn request_timeout(
    &self
  ) -> anyhow::Result<Duration> {
    self.get_seconds("api.timeout")
  }

  pub fn refresh_interval(
    &self
  ) -> anyhow::Result<Duration> {
    self.get_seconds(
      "session.refresh_interval"
    )
  }

  pub fn color_enabled(&self) -> bool {
    self
      .get_bool("color")
      .unwrap_or(true)
  }

  fn get_seconds(
    &self,
    key: &str
  ) -> anyhow::Result<Duration> {
    let raw =
      self.get(key).ok_or_else(|| {
        anyhow!("{key} is not set")
      })?;
    let secs: u64 =
      raw.trim().parse().with_context(
        || {
          format!(
            "{key} must be a whole \
             number of seconds, got: \
             {raw}"
          )
        }
      )?;
    if secs == 0 {
      return Err(anyhow!(
        "{key} must be greater than \
         zero"
      ));
    }
    Ok(Duration::from_secs(secs))
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let line = match raw_line
        .split_once('#')
      {
        | Some((before, _)) => before,
        | None => raw_line
      }
      .trim();

      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

/// Data directory for client state,
/// created when missing.
#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) = cfg
    .get("data.location")
    .filter(|v| !v.trim().is_empty())
  {
    expand_tilde(Path::new(
      cfg_value.trim()
    ))
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var(RC_ENV)
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      rc_env
    )));
  }

  let Some(home) = dirs::home_dir()
  else {
    warn!(
      "cannot determine home \
       directory; skipping \
       ~/.tasklanerc"
    );
    return Ok(None);
  };
  let candidate =
    home.join(".tasklanerc");
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".tasklane"))
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn parse_bool(s: &str) -> bool {
  matches!(
    s.trim()
      .to_ascii_lowercase()
      .as_str(),
    "1" | "y" | "yes" | "on" | "true"
  )
}
