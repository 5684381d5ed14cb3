//! Crash report emission (mirrors `write_crash_report`/`die_nicely`): when a
//! fatal error aborts an import mid-stream, dump enough state — the recent
//! command window, the branch LRU, any tags created, and the mark table —
//! to diagnose the failure, then finish the open pack so work already done
//! isn't lost.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use git_utils::date::{DateFormat, GitDate};

use crate::engine::FastImportEngine;
use crate::marks::render_marks_file;

/// How many of the most recently dispatched command lines are kept for the
/// report, matching fast-import's own ring buffer.
pub const RECENT_COMMAND_LIMIT: usize = 10;

/// Ring buffer of recently seen command lines, fed by the stream driver
/// alongside `FastImportEngine::dispatch`.
#[derive(Debug, Default)]
pub struct CommandHistory {
    recent: VecDeque<String>,
}

impl CommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, line: impl Into<String>) {
        if self.recent.len() == RECENT_COMMAND_LIMIT {
            self.recent.pop_front();
        }
        self.recent.push_back(line.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }
}

/// Writes `fast_import_crash_<pid>` into `git_dir` and returns its path.
pub fn write_crash_report(
    engine: &FastImportEngine,
    history: &CommandHistory,
    export_marks_path: Option<&Path>,
    error: &str,
) -> std::io::Result<PathBuf> {
    let path = engine.git_dir().join(format!("fast_import_crash_{}", std::process::id()));
    let mut rpt = std::fs::File::create(&path)?;

    writeln!(rpt, "fast-import crash report:")?;
    writeln!(rpt, "    fast-import process: {}", std::process::id())?;
    writeln!(rpt, "    at {}", GitDate::now().format(DateFormat::Iso))?;
    writeln!(rpt)?;

    writeln!(rpt, "fatal: {error}")?;
    writeln!(rpt)?;

    writeln!(rpt, "Most Recent Commands Before Crash")?;
    writeln!(rpt, "---------------------------------")?;
    let mut lines: Vec<&str> = history.iter().collect();
    let last = lines.pop();
    for line in &lines {
        writeln!(rpt, "  {line}")?;
    }
    if let Some(line) = last {
        writeln!(rpt, "* {line}")?;
    }
    writeln!(rpt)?;

    writeln!(rpt, "Active Branch LRU")?;
    writeln!(rpt, "-----------------")?;
    let active: Vec<_> = engine.branches().filter(|b| b.is_active()).collect();
    writeln!(
        rpt,
        "    active_branches = {} cur, {} max",
        active.len(),
        engine.max_active_branches()
    )?;
    writeln!(rpt)?;
    writeln!(rpt, "  pos  clock name")?;
    writeln!(rpt, "  ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~")?;
    for (pos, branch) in active.iter().enumerate() {
        writeln!(rpt, "  {:2}) {:6} {}", pos + 1, branch.last_commit_clock, branch.name)?;
    }
    writeln!(rpt)?;

    writeln!(rpt, "Inactive Branches")?;
    writeln!(rpt, "-----------------")?;
    for branch in engine.branches().filter(|b| !b.is_active()) {
        writeln!(rpt, "  {}", branch.name)?;
        writeln!(
            rpt,
            "  tip         : {}",
            branch.tip.map(|id| id.to_hex()).unwrap_or_else(|| "<none>".into())
        )?;
        writeln!(rpt, "  commit clock: {}", branch.last_commit_clock)?;
        writeln!(rpt)?;
    }

    if !engine.tags().is_empty() {
        writeln!(rpt, "Annotated Tags")?;
        writeln!(rpt, "--------------")?;
        for (name, id) in engine.tags() {
            writeln!(rpt, "{} {}", id.to_hex(), name)?;
        }
        writeln!(rpt)?;
    }

    writeln!(rpt, "Marks")?;
    writeln!(rpt, "-----")?;
    match export_marks_path {
        Some(path) => writeln!(rpt, "  exported to {}", path.display())?,
        None => write!(rpt, "{}", render_marks_file(engine.marks()))?,
    }
    writeln!(rpt)?;

    writeln!(rpt, "-------------------")?;
    writeln!(rpt, "END OF CRASH REPORT")?;
    Ok(path)
}

/// Run on a fatal error before it propagates out of the stream driver:
/// finish whatever pack was open (refs are left untouched, same as upstream
/// `die_nicely`, which finalizes the pack but does not flush ref updates)
/// and write the crash report alongside it.
pub fn handle_fatal_error(
    engine: &mut FastImportEngine,
    history: &CommandHistory,
    export_marks_path: Option<&Path>,
    error: &str,
) -> std::io::Result<PathBuf> {
    let _ = engine.finish_current_pack();
    write_crash_report(engine, history, export_marks_path, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;

    #[test]
    fn history_keeps_only_the_most_recent_lines() {
        let mut history = CommandHistory::new();
        for i in 0..(RECENT_COMMAND_LIMIT + 3) {
            history.record(format!("commit {i}"));
        }
        let kept: Vec<&str> = history.iter().collect();
        assert_eq!(kept.len(), RECENT_COMMAND_LIMIT);
        assert_eq!(kept[0], "commit 3");
        assert_eq!(kept[RECENT_COMMAND_LIMIT - 1], format!("commit {}", RECENT_COMMAND_LIMIT + 2));
    }

    #[test]
    fn writes_a_report_with_expected_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FastImportEngine::new(EngineConfig::new(dir.path())).unwrap();
        let mut history = CommandHistory::new();
        history.record("blob");
        history.record("commit refs/heads/main");

        let report_path =
            handle_fatal_error(&mut engine, &history, None, "undefined mark :7").unwrap();
        let contents = std::fs::read_to_string(report_path).unwrap();
        assert!(contents.contains("fast-import crash report:"));
        assert!(contents.contains("fatal: undefined mark :7"));
        assert!(contents.contains("Most Recent Commands Before Crash"));
        assert!(contents.contains("* commit refs/heads/main"));
        assert!(contents.contains("Active Branch LRU"));
        assert!(contents.contains("Marks"));
        assert!(contents.contains("END OF CRASH REPORT"));
    }
}
