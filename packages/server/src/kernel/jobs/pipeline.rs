//! The two-stage external pipeline run for every job.
//!
//! 1. Collection: `<interpreter> -u MindSpider/main.py [options]`
//! 2. Report: `<interpreter> -u report_engine_only.py --query Q [flags]`
//!
//! Before the report stage each engine report directory is given a placeholder
//! markdown file if it has none. After it, the newest HTML and Markdown files
//! under the artifact directory are loaded as the job's result.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::error::{JobError, Result};
use super::job::{JobRequest, ReportArtifacts};
use super::process::{ProcessRunner, StageCommand, StageOutcome, DEFAULT_KILL_GRACE};

/// Engine name and report directory (relative to the toolchain root).
pub const ENGINE_REPORT_DIRS: [(&str, &str); 3] = [
    ("insight", "insight_engine_streamlit_reports"),
    ("media", "media_engine_streamlit_reports"),
    ("query", "query_engine_streamlit_reports"),
];

/// Where the stage executables live and how they are launched.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PipelineConfig {
    /// Vendored toolchain root: working directory and `PYTHONPATH` of both stages
    pub toolchain_root: PathBuf,

    #[builder(default = "python".to_string())]
    pub interpreter: String,

    /// Arguments placed before the entry script
    #[builder(default = vec!["-u".to_string()])]
    pub interpreter_args: Vec<String>,

    #[builder(default = "MindSpider/main.py".to_string())]
    pub collection_entry: String,

    #[builder(default = "report_engine_only.py".to_string())]
    pub report_entry: String,

    /// Artifact directory, `<toolchain_root>/final_reports` when unset
    #[builder(default, setter(strip_option))]
    pub report_dir: Option<PathBuf>,

    /// Time a cancelled stage gets between SIGTERM and SIGKILL
    #[builder(default = DEFAULT_KILL_GRACE)]
    pub kill_grace: Duration,
}

impl PipelineConfig {
    /// Directory scanned for the final report after the report stage.
    pub fn artifact_dir(&self) -> PathBuf {
        self.report_dir
            .clone()
            .unwrap_or_else(|| self.toolchain_root.join("final_reports"))
    }

    /// Engine report directories checked by the pre-step.
    pub fn engine_dirs(&self) -> Vec<(&'static str, PathBuf)> {
        ENGINE_REPORT_DIRS
            .iter()
            .map(|(name, dir)| (*name, self.toolchain_root.join(dir)))
            .collect()
    }
}

/// Builds and runs the stage commands for a job.
pub struct StagePipeline {
    config: PipelineConfig,
    runner: ProcessRunner,
}

impl StagePipeline {
    pub fn new(config: PipelineConfig, runner: ProcessRunner) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn base_command(&self, entry: &str) -> StageCommand {
        let root = self.config.toolchain_root.display().to_string();
        StageCommand::new(&self.config.interpreter)
            .args(self.config.interpreter_args.iter().cloned())
            .arg(entry)
            .current_dir(&self.config.toolchain_root)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONPATH", root)
    }

    /// Collection stage command; absent, empty or zero fields are omitted.
    pub fn collection_command(&self, request: &JobRequest) -> StageCommand {
        let mut cmd = self.base_command(&self.config.collection_entry);

        if let Some(date) = request.date.as_deref().filter(|d| !d.is_empty()) {
            cmd = cmd.arg("--date").arg(date);
        }
        if let Some(platforms) = request.platforms.as_ref().filter(|p| !p.is_empty()) {
            cmd = cmd.arg("--platforms").args(platforms.iter().cloned());
        }

        let counts = [
            ("--keywords-count", request.keywords_count),
            ("--max-keywords", request.max_keywords),
            ("--max-notes", request.max_notes),
        ];
        for (flag, value) in counts {
            if let Some(n) = value.filter(|n| *n > 0) {
                cmd = cmd.arg(flag).arg(n.to_string());
            }
        }

        if request.test_mode {
            cmd = cmd.arg("--test");
        }
        cmd
    }

    /// Report stage command.
    pub fn report_command(&self, request: &JobRequest) -> StageCommand {
        let mut cmd = self
            .base_command(&self.config.report_entry)
            .arg("--query")
            .arg(request.report_query());
        if request.skip_pdf {
            cmd = cmd.arg("--skip-pdf");
        }
        if request.skip_markdown {
            cmd = cmd.arg("--skip-markdown");
        }
        cmd
    }

    pub async fn run_collection(
        &self,
        job_id: Uuid,
        request: &JobRequest,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        let cmd = self.collection_command(request);
        self.runner.run(job_id, &cmd, token).await
    }

    /// Placeholder pre-step, then the report stage.
    pub async fn run_report(
        &self,
        job_id: Uuid,
        request: &JobRequest,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        let dirs = self.config.engine_dirs();
        let query = request.report_query().to_string();
        let created =
            blocking(move || ensure_engine_reports(&dirs, &query, Utc::now())).await??;
        for path in &created {
            info!(job_id = %job_id, path = %path.display(), "placeholder engine report created");
        }

        let cmd = self.report_command(request);
        self.runner.run(job_id, &cmd, token).await
    }

    /// Load the newest report artifacts. Unreadable files come back empty.
    pub async fn load_artifacts(&self) -> Result<ReportArtifacts> {
        let dir = self.config.artifact_dir();
        blocking(move || load_latest_report(&dir)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| JobError::Io(io::Error::other(e)))
}

// ============================================================================
// Engine report pre-step
// ============================================================================

/// Give every engine directory without a top-level `.md` file a placeholder.
///
/// Directories are created if missing. Returns the placeholder paths written.
pub fn ensure_engine_reports(
    dirs: &[(&str, PathBuf)],
    query: &str,
    now: DateTime<Utc>,
) -> io::Result<Vec<PathBuf>> {
    let stamp = now.format("%Y%m%d-%H%M%S");
    let mut created = Vec::new();

    for (name, dir) in dirs {
        fs::create_dir_all(dir)?;
        if has_markdown(dir)? {
            continue;
        }

        let path = dir.join(format!("{}_placeholder_{}.md", name, stamp));
        fs::write(&path, placeholder_report(name, query, now))?;
        created.push(path);
    }
    Ok(created)
}

fn has_markdown(dir: &Path) -> io::Result<bool> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_extension(&path, "md") {
            return Ok(true);
        }
    }
    Ok(false)
}

fn placeholder_report(engine: &str, query: &str, now: DateTime<Utc>) -> String {
    let mut title = engine.to_string();
    if let Some(first) = title.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    format!(
        "# {} Engine Report\n\n\
         - Query: {}\n\
         - Note: no engine report was available, placeholder content was used to build the combined report.\n\
         - Generated at: {}Z\n",
        title,
        query,
        now.format("%Y-%m-%dT%H:%M:%S%.6f"),
    )
}

// ============================================================================
// Artifact discovery
// ============================================================================

/// Newest `.html` and `.md` under `dir` (recursive), with their contents.
///
/// `path` is the HTML file when one exists, otherwise the Markdown file.
pub fn load_latest_report(dir: &Path) -> ReportArtifacts {
    let mut files = Vec::new();
    collect_files(dir, &mut files);

    let html = newest(&files, "html");
    let markdown = newest(&files, "md");

    ReportArtifacts {
        html: html.and_then(read_report),
        markdown: markdown.and_then(read_report),
        path: html.or(markdown).map(|p| p.display().to_string()),
    }
}

/// Newest file with the given extension. Equal mtimes fall back to path order.
fn newest<'a>(files: &'a [(SystemTime, PathBuf)], extension: &str) -> Option<&'a Path> {
    files
        .iter()
        .filter(|(_, path)| has_extension(path, extension))
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path.as_path())
}

fn collect_files(dir: &Path, out: &mut Vec<(SystemTime, PathBuf)>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "cannot scan report directory");
            }
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            collect_files(&path, out);
        } else if meta.is_file() {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((modified, path));
        }
    }
}

fn read_report(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "report unreadable");
            None
        }
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().is_some_and(|ext| ext == extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::cancellation::CancellationRegistry;
    use crate::kernel::jobs::store::MemoryJobStore;
    use std::fs::File;
    use std::sync::Arc;

    fn pipeline(root: &Path) -> StagePipeline {
        let config = PipelineConfig::builder().toolchain_root(root).build();
        let runner = ProcessRunner::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(CancellationRegistry::new()),
            config.kill_grace,
        );
        StagePipeline::new(config, runner)
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        let when = SystemTime::now() - Duration::from_secs(secs_ago);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[test]
    fn collection_command_carries_defaults() {
        let root = tempfile::tempdir().unwrap();
        let cmd = pipeline(root.path()).collection_command(&JobRequest::for_query("q"));

        assert_eq!(cmd.program, "python");
        assert_eq!(
            cmd.args,
            vec![
                "-u",
                "MindSpider/main.py",
                "--keywords-count",
                "100",
                "--max-keywords",
                "50",
                "--max-notes",
                "50",
            ]
        );
        assert_eq!(cmd.cwd.as_deref(), Some(root.path()));
        assert!(cmd
            .env
            .contains(&("PYTHONUNBUFFERED".to_string(), "1".to_string())));
        assert!(cmd.env.contains(&(
            "PYTHONPATH".to_string(),
            root.path().display().to_string()
        )));
    }

    #[test]
    fn collection_command_includes_every_set_field() {
        let root = tempfile::tempdir().unwrap();
        let request = JobRequest {
            date: Some("2024-05-01".into()),
            platforms: Some(vec!["wb".into(), "xhs".into()]),
            keywords_count: Some(10),
            max_keywords: None,
            max_notes: Some(0),
            test_mode: true,
            ..JobRequest::for_query("q")
        };

        let cmd = pipeline(root.path()).collection_command(&request);
        assert_eq!(
            cmd.args,
            vec![
                "-u",
                "MindSpider/main.py",
                "--date",
                "2024-05-01",
                "--platforms",
                "wb",
                "xhs",
                "--keywords-count",
                "10",
                "--test",
            ]
        );
    }

    #[test]
    fn empty_date_and_platforms_are_omitted() {
        let root = tempfile::tempdir().unwrap();
        let request = JobRequest {
            date: Some(String::new()),
            platforms: Some(Vec::new()),
            ..JobRequest::default()
        };

        let cmd = pipeline(root.path()).collection_command(&request);
        assert!(!cmd.args.iter().any(|a| a == "--date" || a == "--platforms"));
    }

    #[test]
    fn report_command_flags() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = pipeline(root.path());

        let cmd = pipeline.report_command(&JobRequest::for_query("topic"));
        assert_eq!(
            cmd.args,
            vec!["-u", "report_engine_only.py", "--query", "topic", "--skip-pdf"]
        );

        let request = JobRequest {
            skip_pdf: false,
            skip_markdown: true,
            ..JobRequest::default()
        };
        let cmd = pipeline.report_command(&request);
        assert_eq!(
            cmd.args,
            vec![
                "-u",
                "report_engine_only.py",
                "--query",
                crate::kernel::jobs::job::DEFAULT_REPORT_QUERY,
                "--skip-markdown",
            ]
        );
    }

    #[test]
    fn placeholders_are_created_once_per_empty_directory() {
        let root = tempfile::tempdir().unwrap();
        let config = PipelineConfig::builder().toolchain_root(root.path()).build();
        let dirs = config.engine_dirs();

        let created = ensure_engine_reports(&dirs, "topic", Utc::now()).unwrap();
        assert_eq!(created.len(), 3);
        for (name, dir) in &dirs {
            let files: Vec<_> = fs::read_dir(dir).unwrap().collect();
            assert_eq!(files.len(), 1, "{} should hold one placeholder", name);
        }

        let insight = &created[0];
        let content = fs::read_to_string(insight).unwrap();
        assert!(content.starts_with("# Insight Engine Report"));
        assert!(content.contains("- Query: topic"));
        assert!(insight
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("insight_placeholder_"));

        // Empty the media directory only: just that one is refilled.
        let media_dir = &dirs[1].1;
        for entry in fs::read_dir(media_dir).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }
        let created = ensure_engine_reports(&dirs, "topic", Utc::now()).unwrap();
        assert_eq!(created.len(), 1);
        assert!(created[0].starts_with(media_dir));
    }

    #[test]
    fn non_markdown_files_do_not_count_as_reports() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("engine");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("notes.txt"), "x").unwrap();
        fs::write(dir.join("nested").join("deep.md"), "x").unwrap();

        let created = ensure_engine_reports(&[("insight", dir)], "q", Utc::now()).unwrap();
        assert_eq!(created.len(), 1);
    }

    #[test]
    fn newest_html_wins() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("a.html");
        let newer = dir.path().join("b.html");
        fs::write(&older, "<p>a</p>").unwrap();
        fs::write(&newer, "<p>b</p>").unwrap();
        set_mtime(&older, 120);
        set_mtime(&newer, 10);

        let artifacts = load_latest_report(dir.path());
        assert_eq!(artifacts.html.as_deref(), Some("<p>b</p>"));
        assert_eq!(artifacts.markdown, None);
        assert_eq!(artifacts.path, Some(newer.display().to_string()));
    }

    #[test]
    fn discovery_is_recursive_and_prefers_html_path() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2024").join("05");
        fs::create_dir_all(&nested).unwrap();
        let md = dir.path().join("report.md");
        let html = nested.join("report.html");
        fs::write(&md, "# md").unwrap();
        fs::write(&html, "<h1>html</h1>").unwrap();
        set_mtime(&html, 300);

        let artifacts = load_latest_report(dir.path());
        assert_eq!(artifacts.html.as_deref(), Some("<h1>html</h1>"));
        assert_eq!(artifacts.markdown.as_deref(), Some("# md"));
        assert_eq!(artifacts.path, Some(html.display().to_string()));
    }

    #[test]
    fn unreadable_report_degrades_to_absent_content() {
        let dir = tempfile::tempdir().unwrap();
        let md = dir.path().join("broken.md");
        fs::write(&md, [0xff, 0xfe, 0x00]).unwrap();

        let artifacts = load_latest_report(dir.path());
        assert_eq!(artifacts.markdown, None);
        assert_eq!(artifacts.path, Some(md.display().to_string()));
    }

    #[test]
    fn missing_artifact_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = load_latest_report(&dir.path().join("final_reports"));
        assert!(artifacts.is_empty());
    }
}
