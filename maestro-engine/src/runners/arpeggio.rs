// Arpeggio Runner
// Data-driven batching: tabular rows mapped across repeated agent calls

use crate::agent::{AgentCall, AgentEventSender, AgentResponse, AgentStatus, CallOptions};
use crate::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::execution::rules::RuleEvaluator;
use crate::runners::DispatchOutcome;
use crate::score::{ArpeggioSpec, MergeStrategy, Movement};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Provider of the tabular rows an arpeggio movement maps over
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn rows(&self) -> EngineResult<Vec<Value>>;
}

/// Rows loaded from a JSON or YAML file holding an array of objects
pub struct FileRowSource {
    path: PathBuf,
}

impl FileRowSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RowSource for FileRowSource {
    async fn rows(&self) -> EngineResult<Vec<Value>> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::RowSource(format!("{}: {e}", self.path.display()))
        })?;

        let rows: Vec<Value> = if has_yaml_extension(&self.path) {
            serde_yaml::from_str(&text)
                .map_err(|e| EngineError::RowSource(format!("{}: {e}", self.path.display())))?
        } else {
            serde_json::from_str(&text)
                .map_err(|e| EngineError::RowSource(format!("{}: {e}", self.path.display())))?
        };
        Ok(rows)
    }
}

fn has_yaml_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Fixed in-memory rows, used by hosts that build rows programmatically
pub struct MemoryRowSource {
    rows: Vec<Value>,
}

impl MemoryRowSource {
    pub fn new(rows: Vec<Value>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    async fn rows(&self) -> EngineResult<Vec<Value>> {
        Ok(self.rows.clone())
    }
}

/// One settled batch, in batch order
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub index: usize,
    pub success: bool,
    pub content: String,
}

/// Host-injected merge over the ordered batch outcomes
pub type MergeFn = Arc<dyn Fn(&[BatchOutcome]) -> EngineResult<String> + Send + Sync>;

/// Maps rows across repeated agent calls: rows are grouped into batches,
/// each batch renders one prompt, batches run with bounded concurrency and
/// per-batch retry, and the merged output is the movement's content.
/// All-or-nothing: one exhausted batch discards every batch result.
pub struct ArpeggioRunner {
    agent: Arc<dyn AgentCall>,
    evaluator: Arc<RuleEvaluator>,
    custom_merge: Option<MergeFn>,
    agent_events: Option<AgentEventSender>,
    cwd: String,
}

impl ArpeggioRunner {
    pub fn new(agent: Arc<dyn AgentCall>, evaluator: Arc<RuleEvaluator>, cwd: String) -> Self {
        Self {
            agent,
            evaluator,
            custom_merge: None,
            agent_events: None,
            cwd,
        }
    }

    pub fn with_custom_merge(mut self, merge: Option<MergeFn>) -> Self {
        self.custom_merge = merge;
        self
    }

    pub fn with_agent_events(mut self, agent_events: Option<AgentEventSender>) -> Self {
        self.agent_events = agent_events;
        self
    }

    pub async fn run(
        &self,
        parent: &Movement,
        spec: &ArpeggioSpec,
        source: Arc<dyn RowSource>,
        cancel: &CancelToken,
    ) -> EngineResult<DispatchOutcome> {
        let rows = source.rows().await?;
        let batch_size = spec.batch_size.max(1);
        let batches: Vec<Vec<Value>> = rows.chunks(batch_size).map(<[Value]>::to_vec).collect();
        tracing::debug!(
            movement = %parent.name,
            rows = rows.len(),
            batches = batches.len(),
            "arpeggio fan-out"
        );

        let pool = Arc::new(Semaphore::new(spec.concurrency.max(1)));
        let mut handles = Vec::with_capacity(batches.len());

        for (index, batch) in batches.into_iter().enumerate() {
            let prompt = render_batch_prompt(&spec.prompt, &batch);
            let agent = Arc::clone(&self.agent);
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            let cwd = self.cwd.clone();
            let persona = parent.persona.clone();
            let allowed_tools = parent.allowed_tools.clone();
            let provider = parent.provider.clone();
            let model = parent.model.clone();
            let permission_mode = parent.permission_mode.clone();
            let max_turns = parent.max_turns;
            let timeout = parent.timeout_ms.map(Duration::from_millis);
            let max_retries = spec.max_retries;
            let retry_delay = Duration::from_millis(spec.retry_delay_ms);
            // Batches share the movement's streaming channel; chunks from
            // concurrent batches interleave
            let agent_events = self.agent_events.clone();

            let handle = tokio::spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::Internal(e.to_string()))?;

                let mut last_reason = String::new();
                for attempt in 0..=max_retries {
                    if let Some(reason) = cancel.reason() {
                        return Err(EngineError::BatchFailed {
                            index,
                            attempts: attempt,
                            reason: reason.as_str().to_string(),
                        });
                    }
                    if attempt > 0 {
                        tokio::time::sleep(retry_delay).await;
                    }

                    let response = agent
                        .call(
                            &persona,
                            &prompt,
                            CallOptions {
                                cwd: cwd.clone(),
                                cancel: Some(cancel.child_with_timeout(timeout)),
                                allowed_tools: allowed_tools.clone(),
                                provider: provider.clone(),
                                model: model.clone(),
                                permission_mode: permission_mode.clone(),
                                session_id: None,
                                max_turns,
                                progress: agent_events.clone(),
                            },
                        )
                        .await;

                    if response.status == AgentStatus::Done {
                        return Ok(BatchOutcome {
                            index,
                            success: true,
                            content: response.content,
                        });
                    }
                    last_reason = response.failure_reason();
                }

                Err(EngineError::BatchFailed {
                    index,
                    attempts: max_retries + 1,
                    reason: last_reason,
                })
            });
            handles.push(handle);
        }

        // Settle every batch in batch order; any exhausted batch fails the
        // whole movement and discards the rest.
        let mut outcomes = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert(EngineError::Internal(format!(
                        "batch task failed: {join_err}"
                    )));
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let merged = match spec.merge {
            MergeStrategy::Concat => outcomes
                .iter()
                .map(|o| o.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            MergeStrategy::Custom => {
                let merge = self.custom_merge.as_ref().ok_or_else(|| {
                    EngineError::Merge("custom merge configured but none injected".to_string())
                })?;
                merge(&outcomes)?
            }
        };

        if let Some(path) = &spec.output_path {
            tokio::fs::write(path, &merged).await?;
        }

        let matched = self
            .evaluator
            .evaluate(&merged, &parent.name, &parent.rules, &self.cwd)
            .await;

        let mut response = AgentResponse::done(&parent.name, &parent.persona, merged);
        if let Some(m) = matched {
            response.matched_rule = Some(m.index);
            response.match_method = Some(m.method);
        }

        Ok(DispatchOutcome::new(response))
    }
}

/// Render one batch prompt: `{{<i>.<column>}}` substitutes field `column`
/// of the batch's i-th row. String fields substitute as-is, everything
/// else as compact JSON. Unknown placeholders are left untouched.
pub fn render_batch_prompt(template: &str, batch: &[Value]) -> String {
    let mut out = template.to_string();
    for (i, row) in batch.iter().enumerate() {
        if let Value::Object(fields) = row {
            for (column, value) in fields {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out = out.replace(&format!("{{{{{i}.{column}}}}}"), &rendered);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::JudgeCall;
    use crate::score::Rule;

    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct NoJudge;

    #[async_trait]
    impl JudgeCall for NoJudge {
        async fn judge(
            &self,
            _content: &str,
            _conditions: &[(usize, String)],
            _cwd: &str,
        ) -> Option<usize> {
            None
        }
    }

    /// Echoes the prompt back; counts calls; optionally fails the first
    /// N attempts overall.
    struct EchoAgent {
        calls: AtomicU32,
        fail_first: u32,
        prompts: Mutex<Vec<String>>,
        saw_stream: Mutex<Vec<bool>>,
    }

    impl EchoAgent {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                prompts: Mutex::new(Vec::new()),
                saw_stream: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentCall for EchoAgent {
        async fn call(
            &self,
            _persona: &str,
            instruction: &str,
            options: CallOptions,
        ) -> AgentResponse {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(instruction.to_string());
            self.saw_stream
                .lock()
                .unwrap()
                .push(options.progress.is_some());
            if n < self.fail_first {
                AgentResponse::error("m", "p", "flaky")
            } else {
                AgentResponse::done("m", "p", format!("echo: {instruction}"))
            }
        }
    }

    fn parent() -> Movement {
        Movement {
            name: "map".to_string(),
            persona: "worker".to_string(),
            rules: vec![Rule::text("echo:", "COMPLETE")],
            instruction: String::new(),
            parallel: None,
            team_leader: None,
            arpeggio: None,
            allowed_tools: None,
            permission_mode: None,
            provider: None,
            model: None,
            max_turns: None,
            reports: Vec::new(),
            edit: false,
            fresh_session: false,
            timeout_ms: None,
        }
    }

    fn spec(batch_size: usize, concurrency: usize, max_retries: u32) -> ArpeggioSpec {
        ArpeggioSpec {
            source: None,
            prompt: "Process {{0.name}} and {{1.name}}".to_string(),
            batch_size,
            concurrency,
            max_retries,
            retry_delay_ms: 1,
            merge: MergeStrategy::Concat,
            output_path: None,
        }
    }

    fn four_rows() -> Arc<MemoryRowSource> {
        Arc::new(MemoryRowSource::new(vec![
            json!({"name": "one"}),
            json!({"name": "two"}),
            json!({"name": "three"}),
            json!({"name": "four"}),
        ]))
    }

    fn runner(agent: Arc<EchoAgent>) -> ArpeggioRunner {
        ArpeggioRunner::new(
            agent,
            Arc::new(RuleEvaluator::new(Arc::new(NoJudge))),
            "/work".to_string(),
        )
    }

    #[test]
    fn test_render_batch_prompt() {
        let batch = vec![json!({"name": "alpha", "count": 3}), json!({"name": "beta"})];
        let out = render_batch_prompt("{{0.name}} x{{0.count}}, then {{1.name}}", &batch);
        assert_eq!(out, "alpha x3, then beta");
    }

    #[tokio::test]
    async fn test_four_rows_batch_size_two_means_two_calls() {
        let agent = Arc::new(EchoAgent::new(0));
        let runner = runner(Arc::clone(&agent));
        let cancel = CancelToken::new();

        let outcome = runner
            .run(&parent(), &spec(2, 2, 0), four_rows(), &cancel)
            .await
            .unwrap();

        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
        // Concat merge joins batch outputs with a newline, batch order
        assert_eq!(
            outcome.response.content,
            "echo: Process one and two\necho: Process three and four"
        );
        assert_eq!(outcome.response.matched_rule, Some(0));
    }

    #[tokio::test]
    async fn test_flaky_batch_is_retried() {
        let agent = Arc::new(EchoAgent::new(1));
        let runner = runner(Arc::clone(&agent));
        let cancel = CancelToken::new();

        // concurrency 1 keeps the failing attempt first
        let outcome = runner
            .run(&parent(), &spec(2, 1, 1), four_rows(), &cancel)
            .await
            .unwrap();

        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
        assert!(outcome.response.content.contains("one and two"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_discard_everything() {
        let agent = Arc::new(EchoAgent::new(100));
        let runner = runner(Arc::clone(&agent));
        let cancel = CancelToken::new();

        let err = runner
            .run(&parent(), &spec(2, 1, 1), four_rows(), &cancel)
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("batch 0 failed after 2 attempts"), "{message}");
    }

    #[tokio::test]
    async fn test_batches_share_the_streaming_channel() {
        let agent = Arc::new(EchoAgent::new(0));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = runner(Arc::clone(&agent)).with_agent_events(Some(tx));
        let cancel = CancelToken::new();

        runner
            .run(&parent(), &spec(2, 2, 0), four_rows(), &cancel)
            .await
            .unwrap();

        let saw = agent.saw_stream.lock().unwrap();
        assert_eq!(saw.len(), 2);
        assert!(saw.iter().all(|&streamed| streamed));
    }

    #[tokio::test]
    async fn test_custom_merge() {
        let agent = Arc::new(EchoAgent::new(0));
        let merge: MergeFn = Arc::new(|outcomes| {
            Ok(format!("{} batches merged", outcomes.len()))
        });
        let runner = runner(Arc::clone(&agent)).with_custom_merge(Some(merge));
        let cancel = CancelToken::new();

        let mut s = spec(2, 2, 0);
        s.merge = MergeStrategy::Custom;

        let outcome = runner
            .run(&parent(), &s, four_rows(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.response.content, "2 batches merged");
    }

    #[tokio::test]
    async fn test_output_path_side_effect() {
        let agent = Arc::new(EchoAgent::new(0));
        let runner = runner(agent);
        let cancel = CancelToken::new();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.txt");
        let mut s = spec(4, 2, 0);
        s.output_path = Some(path.to_string_lossy().into_owned());

        runner
            .run(&parent(), &s, four_rows(), &cancel)
            .await
            .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("echo: Process one and two"));
    }

    #[tokio::test]
    async fn test_file_row_source_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.json");
        std::fs::write(&path, r#"[{"name": "a"}, {"name": "b"}]"#).unwrap();

        let rows = FileRowSource::new(&path).rows().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "a");
    }

    #[tokio::test]
    async fn test_file_row_source_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.yaml");
        std::fs::write(&path, "- name: a\n- name: b\n").unwrap();

        let rows = FileRowSource::new(&path).rows().await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
