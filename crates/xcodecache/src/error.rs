//! Stage-level errors with rich diagnostics.

use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Anything that aborts a stage. Per-target problems are logged and skipped
/// instead; only configuration and filesystem failures surface here.
#[derive(Error, Diagnostic, Debug)]
pub enum StageError {
    #[error("missing -configuration argument")]
    #[diagnostic(
        code(xcodecache::config::missing_configuration),
        help("pass `-configuration <name>` (or `--configuration <name>`) with the build arguments")
    )]
    MissingConfiguration,

    #[error("required environment variable {0} is not set")]
    #[diagnostic(
        code(xcodecache::config::missing_env),
        help("this stage must be invoked by the build tool, which exports the build settings")
    )]
    MissingEnv(&'static str),

    #[error("root pods project not found at {0}")]
    #[diagnostic(
        code(xcodecache::workspace::no_pods_project),
        help("run from the workspace directory that contains the Pods/ checkout")
    )]
    NoPodsProject(PathBuf),

    #[error("filesystem failure at {path}: {source}")]
    #[diagnostic(code(xcodecache::io))]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(xcodecache::config))]
    Config(#[from] xcodecache_types::ConfigError),

    #[error(transparent)]
    #[diagnostic(code(xcodecache::context))]
    Context(#[from] xcodecache_types::ContextError),

    #[error(transparent)]
    #[diagnostic(code(xcodecache::project))]
    Project(#[from] xcodecache_pbx::ProjectError),

    #[error(transparent)]
    #[diagnostic(code(xcodecache::fingerprint))]
    Fingerprint(#[from] xcodecache_fingerprint::FingerprintError),

    #[error(transparent)]
    #[diagnostic(code(xcodecache::store))]
    Store(#[from] xcodecache_store::StoreError),
}

impl StageError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Install the miette hook for terminal-friendly error rendering.
pub fn setup() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(false)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();
}
