//! Session state for one optimizer invocation.
//!
//! A [`Session`] bundles what every pass needs to see:
//!
//! - the [`UserConfig`] parsed from kernel attributes, which passes read
//!   and the GPU mapping pass writes back,
//! - the [`TileLogger`] collecting per-stage decisions for `tiling.log`,
//! - the [`TargetInfo`] describing the machine.
//!
//! Passes run one after another on a single thread; the locks only make the
//! session shareable through [`SessionRef`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod logger;

pub use config::{ConvAttrs, DumpLevel, MappingCfg, UserConfig};
pub use logger::{LogStage, TileLogger};

use camino::Utf8PathBuf;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use tpo_target::{TargetError, TargetInfo};

/// Errors raised by configuration and logging.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A configuration value could not be parsed or is out of range.
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue {
        /// Attribute key.
        key: String,
        /// Offending value.
        value: String,
    },

    /// Reading target information failed.
    #[error(transparent)]
    Target(#[from] TargetError),

    /// Writing the log failed.
    #[error("cannot write {path}")]
    Io {
        /// File or directory being written.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An unrecoverable condition recorded in the stage log.
    #[error("[{stage}] {message}")]
    Fatal {
        /// Stage header.
        stage: &'static str,
        /// Diagnostic.
        message: String,
    },
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// State shared by every pass of one invocation.
#[derive(Debug)]
pub struct Session {
    config: RwLock<UserConfig>,
    logger: Mutex<TileLogger>,
    target: TargetInfo,
}

impl Session {
    /// Creates a session. The logger level follows `config.dump_level`.
    #[must_use]
    pub fn new(config: UserConfig, target: TargetInfo) -> Self {
        let logger = TileLogger::new(config.dump_level);
        Self {
            config: RwLock::new(config),
            logger: Mutex::new(logger),
            target,
        }
    }

    /// Creates a session with default configuration and target.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(UserConfig::default(), TargetInfo::default())
    }

    /// Read access to the configuration.
    pub fn config(&self) -> RwLockReadGuard<'_, UserConfig> {
        self.config.read()
    }

    /// Write access to the configuration.
    pub fn config_mut(&self) -> RwLockWriteGuard<'_, UserConfig> {
        self.config.write()
    }

    /// Replaces the configuration, keeping the logger level in step.
    pub fn replace_config(&self, config: UserConfig) {
        self.logger.lock().set_level(config.dump_level);
        *self.config.write() = config;
    }

    /// The target description.
    #[must_use]
    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    /// Exclusive access to the stage logger.
    pub fn logger(&self) -> MutexGuard<'_, TileLogger> {
        self.logger.lock()
    }

    /// Records one line in the stage logger.
    pub fn log(&self, stage: LogStage, level: DumpLevel, line: impl Into<String>) {
        self.logger.lock().append(stage, level, line);
    }

    /// Flushes the stage logger into the configured dump directory.
    ///
    /// Returns `None` when no dump directory is configured.
    ///
    /// # Errors
    ///
    /// Fails if the log file cannot be written.
    pub fn flush_log(&self) -> SessionResult<Option<Utf8PathBuf>> {
        let dir = self.config.read().dump_dir.clone();
        match dir {
            Some(dir) => self.logger.lock().flush(&dir).map(Some),
            None => Ok(None),
        }
    }
}

/// A shared reference to a session.
pub type SessionRef = Arc<Session>;

/// Creates a shared session.
#[must_use]
pub fn create_session(config: UserConfig, target: TargetInfo) -> SessionRef {
    Arc::new(Session::new(config, target))
}
