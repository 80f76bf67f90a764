//! Per-invocation stage logger.
//!
//! Tiling and mapping decisions are recorded line by line under the stage
//! that produced them and written to `tiling.log` once the invocation ends.
//! Each line carries a [`DumpLevel`]; lines above the configured level are
//! dropped at the call site.

use crate::{DumpLevel, SessionError, SessionResult};
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt::Write as _;
use tracing::debug;

/// File name written by [`TileLogger::flush`].
pub const LOG_FILE: &str = "tiling.log";

/// The pipeline stage a log line belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogStage {
    /// Schedule-tree analysis.
    ScheduleTreeAnalysis,
    /// Buffer live-extent analysis.
    BufferLiveExtent,
    /// Tiling-space construction.
    TilingSpace,
    /// Candidate search.
    DoTiling,
    /// Tuning.
    DoTuning,
    /// Retry after an allocation failure.
    MicroTuning,
    /// GPU block and thread mapping.
    GpuMapping,
}

impl LogStage {
    /// Every stage in log order.
    pub const ALL: [Self; 7] = [
        Self::ScheduleTreeAnalysis,
        Self::BufferLiveExtent,
        Self::TilingSpace,
        Self::DoTiling,
        Self::DoTuning,
        Self::MicroTuning,
        Self::GpuMapping,
    ];

    /// Header written before the stage's lines.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ScheduleTreeAnalysis => "ANA_SCHETREE",
            Self::BufferLiveExtent => "ANA_BUF_LIVE_EXTENT",
            Self::TilingSpace => "ANA_TILING_SPACE",
            Self::DoTiling => "DO_TILING",
            Self::DoTuning => "DO_TUNING",
            Self::MicroTuning => "MICRO_TUNING",
            Self::GpuMapping => "GPU_MAPPING",
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

/// Buffered log lines, grouped by stage.
#[derive(Clone, Debug, Default)]
pub struct TileLogger {
    level: DumpLevel,
    stages: [Vec<String>; 7],
}

impl TileLogger {
    /// Creates an empty logger recording up to `level`.
    #[must_use]
    pub fn new(level: DumpLevel) -> Self {
        Self {
            level,
            stages: Default::default(),
        }
    }

    /// The configured level.
    #[must_use]
    pub fn level(&self) -> DumpLevel {
        self.level
    }

    /// Changes the configured level. Recorded lines are kept.
    pub fn set_level(&mut self, level: DumpLevel) {
        self.level = level;
    }

    /// Returns true if a line at `level` would be recorded.
    #[must_use]
    pub fn enabled(&self, level: DumpLevel) -> bool {
        level != DumpLevel::Off && self.level >= level
    }

    /// Records `line` under `stage` if `level` is enabled.
    pub fn append(&mut self, stage: LogStage, level: DumpLevel, line: impl Into<String>) {
        if self.enabled(level) {
            self.stages[stage.slot()].push(line.into());
        }
    }

    /// Records several lines under `stage`.
    pub fn append_all<I, S>(&mut self, stage: LogStage, level: DumpLevel, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.enabled(level) {
            self.stages[stage.slot()].extend(lines.into_iter().map(Into::into));
        }
    }

    /// Lines recorded for `stage`.
    #[must_use]
    pub fn lines(&self, stage: LogStage) -> &[String] {
        &self.stages[stage.slot()]
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(Vec::is_empty)
    }

    /// Drops every recorded line.
    pub fn clear(&mut self) {
        for lines in &mut self.stages {
            lines.clear();
        }
    }

    /// Renders the buffer: one `[STAGE]` header per non-empty stage.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for stage in LogStage::ALL {
            let lines = self.lines(stage);
            if lines.is_empty() {
                continue;
            }
            let _ = writeln!(out, "[{}]", stage.name());
            for line in lines {
                let _ = writeln!(out, "{line}");
            }
        }
        out
    }

    /// Writes the buffer to `dir/tiling.log` and clears it.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or the file written.
    pub fn flush(&mut self, dir: &Utf8Path) -> SessionResult<Utf8PathBuf> {
        std::fs::create_dir_all(dir).map_err(|source| SessionError::Io {
            path: dir.to_owned(),
            source,
        })?;
        let path = dir.join(LOG_FILE);
        std::fs::write(&path, self.render()).map_err(|source| SessionError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(%path, "flushed tiling log");
        self.clear();
        Ok(path)
    }

    /// Records `message`, saves the log when a directory is given, and
    /// returns the error to raise.
    pub fn fatal_and_save(
        &mut self,
        stage: LogStage,
        message: impl Into<String>,
        dir: Option<&Utf8Path>,
    ) -> SessionError {
        let message = message.into();
        self.stages[stage.slot()].push(message.clone());
        if let Some(dir) = dir {
            if let Err(err) = self.flush(dir) {
                return err;
            }
        }
        SessionError::Fatal {
            stage: stage.name(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_gating() {
        let mut log = TileLogger::new(DumpLevel::General);
        log.append(LogStage::DoTiling, DumpLevel::General, "kept");
        log.append(LogStage::DoTiling, DumpLevel::Candidate, "dropped");
        log.append(LogStage::DoTiling, DumpLevel::Off, "dropped");
        assert_eq!(log.lines(LogStage::DoTiling), &["kept".to_string()]);

        let mut off = TileLogger::new(DumpLevel::Off);
        off.append(LogStage::GpuMapping, DumpLevel::General, "x");
        assert!(off.is_empty());
    }

    #[test]
    fn test_render_orders_stages() {
        let mut log = TileLogger::new(DumpLevel::Tuning);
        log.append(LogStage::GpuMapping, DumpLevel::General, "g");
        log.append_all(LogStage::ScheduleTreeAnalysis, DumpLevel::Tuning, ["a", "b"]);
        assert_eq!(log.render(), "[ANA_SCHETREE]\na\nb\n[GPU_MAPPING]\ng\n");
    }

    #[test]
    fn test_flush_writes_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("dump");
        let mut log = TileLogger::new(DumpLevel::General);
        log.append(LogStage::TilingSpace, DumpLevel::General, "axis 0");
        let path = log.flush(&root).unwrap();
        assert_eq!(path.file_name(), Some(LOG_FILE));
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "[ANA_TILING_SPACE]\naxis 0\n");
        assert!(log.is_empty());
    }

    #[test]
    fn test_fatal_records_message() {
        let mut log = TileLogger::new(DumpLevel::Off);
        let err = log.fatal_and_save(LogStage::DoTiling, "no candidate", None);
        assert!(matches!(err, SessionError::Fatal { stage: "DO_TILING", .. }));
        assert_eq!(log.lines(LogStage::DoTiling), &["no candidate".to_string()]);
    }
}
