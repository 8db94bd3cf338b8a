//! Renderer configuration.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Environment variable naming the renderer binary.
pub const RENDERER_PATH_ENV: &str = "FOLIO_RENDERER_PATH";

/// Renderer binary looked up when nothing else is configured.
pub const DEFAULT_RENDERER: &str = "folio-worker";

/// Interval between keepalive probes.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline applied to jobs that do not set their own.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for a [`Renderer`](crate::Renderer).
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Renderer binary.
    pub program: PathBuf,
    /// Arguments passed to the renderer, typically a script path.
    pub args: Vec<OsString>,
    /// Interval between keepalive probes on the renderer's stdin.
    pub keepalive_interval: Duration,
    /// Deadline for jobs that do not set one. `None` waits forever.
    pub job_timeout: Option<Duration>,
    /// Terminate renderer processes orphaned by a previous host before the
    /// first spawn.
    pub reap_orphans: bool,
    /// Consecutive protocol violations that force a renderer restart.
    /// Zero never forces one.
    pub max_protocol_violations: u32,
    /// Options merged under every job's own options.
    pub default_options: Map<String, Value>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_RENDERER),
            args: Vec::new(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            job_timeout: Some(DEFAULT_JOB_TIMEOUT),
            reap_orphans: true,
            max_protocol_violations: 2,
            default_options: Map::new(),
        }
    }
}

impl RendererConfig {
    /// Configuration for the given renderer binary with default settings.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Configuration for the renderer found by [`resolve_program`](Self::resolve_program).
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(Self::resolve_program(None)?))
    }

    /// Find the renderer binary.
    ///
    /// Looks in the following order:
    /// 1. `explicit`, if given (a bare name is searched on `PATH`)
    /// 2. `FOLIO_RENDERER_PATH` environment variable
    /// 3. Same directory as the current executable
    /// 4. System PATH
    pub fn resolve_program(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.components().count() > 1 || path.is_absolute() {
                if path.exists() {
                    return Ok(path.to_path_buf());
                }
                return Err(Error::RendererNotFound(format!(
                    "'{}' does not exist",
                    path.display()
                )));
            }
            return which::which(path).map_err(|e| {
                Error::RendererNotFound(format!("'{}' is not on PATH: {}", path.display(), e))
            });
        }

        if let Ok(path) = std::env::var(RENDERER_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
            tracing::warn!(
                "{} points at missing file {}",
                RENDERER_PATH_ENV,
                path.display()
            );
        }

        let binary_name = if cfg!(windows) {
            format!("{DEFAULT_RENDERER}.exe")
        } else {
            DEFAULT_RENDERER.to_string()
        };

        if let Some(path) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&binary_name)))
            .filter(|path| path.exists())
        {
            return Ok(path);
        }

        if let Ok(path) = which::which(&binary_name) {
            return Ok(path);
        }

        Err(Error::RendererNotFound(format!(
            "could not find {DEFAULT_RENDERER}. Set {RENDERER_PATH_ENV} or ensure it's in PATH."
        )))
    }

    /// Append one renderer argument.
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append renderer arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_reap_orphans(mut self, reap: bool) -> Self {
        self.reap_orphans = reap;
        self
    }

    pub fn with_max_protocol_violations(mut self, max: u32) -> Self {
        self.max_protocol_violations = max;
        self
    }

    /// Set an option sent with every job unless the job overrides it.
    pub fn with_default_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_options.insert(key.into(), value.into());
        self
    }
}
