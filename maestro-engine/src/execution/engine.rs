// Engine
// Top-level state machine: iteration loop, dispatch, transition resolution

use crate::agent::{AgentCall, AgentEventSender, AgentStatus, JudgeCall};
use crate::cancel::{CancelReason, CancelToken};
use crate::error::{EngineError, EngineResult};
use crate::execution::detect::{CycleDetector, LoopDetector, LoopVerdict};
use crate::execution::events::{EventSender, PieceEvent, ProgressSender};
use crate::execution::movement::MovementExecutor;
use crate::execution::rules::RuleEvaluator;
use crate::execution::state::{PieceState, PieceStatus};
use crate::host::HostCallbacks;
use crate::runners::{
    ArpeggioRunner, DispatchOutcome, FileRowSource, MergeFn, ParallelRunner, RowSource,
    TeamLeaderRunner,
};
use crate::score::{render, validate, Movement, PieceConfig, ABORT, COMPLETE};
use crate::session::session_key;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Summary of one finished piece run
#[derive(Debug, Clone)]
pub struct PieceResult {
    pub status: PieceStatus,
    /// Abort reason, when the piece did not complete
    pub reason: Option<String>,
    pub iterations: u32,
    pub last_output: String,
    pub duration: Duration,
}

/// Handle for requesting an abort from outside the run loop.
///
/// The flag is observed at loop boundaries; an in-flight call is only
/// preempted through the cancellation signal it was derived from.
#[derive(Clone)]
pub struct AbortHandle {
    cancel: CancelToken,
}

impl AbortHandle {
    /// Idempotent: calling twice behaves identically to once
    pub fn abort(&self) {
        self.cancel.cancel(CancelReason::Aborted);
    }
}

enum Step {
    Continue,
    Finished,
}

/// Drives one piece from its initial movement to a terminal state.
///
/// All `PieceState` mutation happens on the single logical control flow
/// running the loop; fan-out results are merged back only after every
/// concurrent branch has settled.
pub struct Engine {
    config: PieceConfig,
    agent: Arc<dyn AgentCall>,
    host: Arc<dyn HostCallbacks>,
    evaluator: Arc<RuleEvaluator>,
    state: PieceState,
    loop_detector: Option<LoopDetector>,
    cycle_detector: CycleDetector,
    events: Option<ProgressSender>,
    agent_events: Option<AgentEventSender>,
    cancel: CancelToken,
    cwd: String,
    max_cap: u32,
    abort_reason: Option<String>,
    row_source: Option<Arc<dyn RowSource>>,
    custom_merge: Option<MergeFn>,
    started: Instant,
    finished: bool,
}

impl Engine {
    /// Validate the piece and build an engine ready to run it.
    /// Invalid rule or monitor targets fail here, before `run()` exists.
    pub fn new(
        config: PieceConfig,
        agent: Arc<dyn AgentCall>,
        judge: Arc<dyn JudgeCall>,
        host: Arc<dyn HostCallbacks>,
    ) -> EngineResult<Self> {
        validate(&config)?;

        let state = PieceState::new(config.initial.clone());
        let loop_detector = config.loop_detection.map(LoopDetector::new);
        let cycle_detector = CycleDetector::new(config.cycle_monitors.clone());
        let max_cap = config.max_movements;

        Ok(Self {
            config,
            agent,
            host,
            evaluator: Arc::new(RuleEvaluator::new(judge)),
            state,
            loop_detector,
            cycle_detector,
            events: None,
            agent_events: None,
            cancel: CancelToken::new(),
            cwd: ".".to_string(),
            max_cap,
            abort_reason: None,
            row_source: None,
            custom_merge: None,
            started: Instant::now(),
            finished: false,
        })
    }

    pub fn with_events(mut self, events: Option<ProgressSender>) -> Self {
        self.events = events;
        self
    }

    pub fn with_agent_events(mut self, agent_events: Option<AgentEventSender>) -> Self {
        self.agent_events = agent_events;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Inject the row source arpeggio movements read from, overriding any
    /// `source` path in the piece config
    pub fn with_row_source(mut self, source: Arc<dyn RowSource>) -> Self {
        self.row_source = Some(source);
        self
    }

    pub fn with_custom_merge(mut self, merge: MergeFn) -> Self {
        self.custom_merge = Some(merge);
        self
    }

    /// Handle for aborting the run from another task
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn state(&self) -> &PieceState {
        &self.state
    }

    /// Run the piece to a terminal state
    pub async fn run(&mut self) -> PieceResult {
        loop {
            match self.step().await {
                Step::Continue => {}
                Step::Finished => break,
            }
        }
        self.result()
    }

    /// One pass of the run loop, for host-driven stepping. Returns the
    /// piece status after the pass.
    pub async fn run_single_iteration(&mut self) -> PieceStatus {
        if self.state.status == PieceStatus::Running {
            self.step().await;
        }
        self.state.status
    }

    /// Summary of the run so far
    pub fn result(&self) -> PieceResult {
        PieceResult {
            status: self.state.status,
            reason: self.abort_reason.clone(),
            iterations: self.state.iteration,
            last_output: self.state.last_output.clone(),
            duration: self.started.elapsed(),
        }
    }

    async fn step(&mut self) -> Step {
        // Completed and aborted are terminal; a finished engine never
        // dispatches another movement
        if self.state.status != PieceStatus::Running {
            return Step::Finished;
        }

        // (1) abort flag, observed only at loop boundaries
        if self.cancel.is_cancelled() {
            let reason = self
                .cancel
                .reason()
                .map_or("aborted", CancelReason::as_str);
            self.finish_aborted(format!("abort requested ({reason})"));
            return Step::Finished;
        }

        // (2) iteration cap, negotiable with the host
        if self.state.iteration >= self.max_cap {
            self.events.send_event(PieceEvent::IterationLimit {
                used: self.state.iteration,
                cap: self.max_cap,
            });
            match self.host.grant_iterations(self.state.iteration, self.max_cap).await {
                Some(extra) if extra > 0 => {
                    tracing::debug!(extra, "host granted additional iteration budget");
                    self.max_cap += extra;
                }
                _ => {
                    self.finish_aborted(format!("iteration cap of {} reached", self.max_cap));
                    return Step::Finished;
                }
            }
        }

        // (3) resolve the current movement and check the streak
        let name = self.state.current.clone();
        let Some(movement) = self.config.movement(&name).cloned() else {
            // Unreachable after validation
            self.finish_aborted(format!("unknown movement: {name}"));
            return Step::Finished;
        };

        if let Some(detector) = &mut self.loop_detector {
            match detector.record(&name) {
                LoopVerdict::Abort(streak) => {
                    self.events.send_event(PieceEvent::MovementLoopDetected {
                        movement: name.clone(),
                        streak,
                        hard: true,
                    });
                    self.finish_aborted(format!(
                        "movement '{name}' ran {streak} times in a row"
                    ));
                    return Step::Finished;
                }
                LoopVerdict::Warn(streak) => {
                    tracing::warn!(movement = %name, streak, "same-movement streak");
                    self.events.send_event(PieceEvent::MovementLoopDetected {
                        movement: name.clone(),
                        streak,
                        hard: false,
                    });
                }
                LoopVerdict::Ok => {}
            }
        }

        // (4) count the pass, build the instruction, dispatch
        let iteration = self.state.count_iteration(&name);
        self.events
            .send_event(PieceEvent::movement_start(&name, &movement.persona, iteration));

        let instruction = self.build_instruction(&movement);
        let call_started = Instant::now();

        let outcome = match self.dispatch(&movement, &instruction).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.finish_aborted(err.to_string());
                return Step::Finished;
            }
        };
        self.apply_sessions(outcome.session_updates).await;
        let response = outcome.response;

        self.events.send_event(PieceEvent::movement_complete(
            &name,
            response.status,
            response.matched_rule,
            call_started.elapsed(),
        ));

        // (5) error aborts; blocked routes to the host
        match response.status {
            AgentStatus::Error | AgentStatus::Interrupted => {
                let reason = response.failure_reason();
                self.state.record_response(response);
                self.finish_aborted(reason);
                return Step::Finished;
            }
            AgentStatus::Blocked => {
                self.events.send_event(PieceEvent::MovementBlocked {
                    movement: name.clone(),
                    content: response.content.clone(),
                });
                let resolution = self.host.resolve_blocked(&name, &response.content).await;
                self.state.record_response(response);
                return match resolution {
                    Some(input) => {
                        self.accept_user_input(&name, input);
                        Step::Continue // same movement, input appended
                    }
                    None => {
                        self.finish_aborted(format!(
                            "movement '{name}' blocked and the host declined to continue"
                        ));
                        Step::Finished
                    }
                };
            }
            AgentStatus::Done => {}
        }

        // (6) next movement comes strictly from the matched rule
        let Some(index) = response.matched_rule else {
            self.state.record_response(response);
            self.finish_aborted(EngineError::NoRuleMatched { movement: name.clone() }.to_string());
            return Step::Finished;
        };
        let rule = movement.rules[index].clone();
        self.state.record_response(response);

        // (7) rules may demand user input before advancing
        if rule.requires_user_input {
            match self.host.user_input(&name, &rule.condition).await {
                Some(input) => {
                    self.accept_user_input(&name, input);
                    return Step::Continue; // re-run the same movement
                }
                None => {
                    self.finish_aborted(format!(
                        "movement '{name}' required user input and the host declined"
                    ));
                    return Step::Finished;
                }
            }
        }

        let mut next = rule.next.clone();

        // (8) a triggered cycle monitor overrides the resolved transition
        if let Some(monitor_idx) = self.cycle_detector.record(&name) {
            let monitor = self.cycle_detector.monitor(monitor_idx).clone();
            let repeats = self.cycle_detector.repeats(monitor_idx);
            self.events.send_event(PieceEvent::MovementCycleDetected {
                cycle: monitor.cycle.clone(),
                repeats,
            });

            let verdict = self.run_cycle_judge(&monitor, repeats).await;
            // Counter resets whatever the judge decided
            self.cycle_detector.reset(monitor_idx);

            match verdict {
                Ok(target) => next = target,
                Err(err) => {
                    self.finish_aborted(err.to_string());
                    return Step::Finished;
                }
            }
        }

        // (9) terminal markers end the piece
        match next.as_str() {
            COMPLETE => {
                self.finish_completed();
                Step::Finished
            }
            ABORT => {
                self.finish_aborted(format!("movement '{name}' routed to ABORT"));
                Step::Finished
            }
            _ => {
                self.state.current = next;
                Step::Continue
            }
        }
    }

    /// Run the synthetic judge movement through the ordinary three-phase
    /// protocol; its matched rule supplies the real next movement.
    async fn run_cycle_judge(
        &mut self,
        monitor: &crate::score::CycleMonitor,
        repeats: u32,
    ) -> EngineResult<String> {
        let judge = CycleDetector::judge_movement(monitor, repeats);
        let key = session_key(&self.config.name, &judge.name);
        self.events
            .send_event(PieceEvent::movement_start(&judge.name, &judge.persona, 0));

        let instruction = judge.instruction.clone();
        let outcome = self
            .movement_executor()
            .run(&judge, &instruction, &key, None, &self.cancel)
            .await?;
        self.apply_sessions(outcome.session_update.into_iter().collect())
            .await;
        let response = outcome.response;

        self.events.send_event(PieceEvent::movement_complete(
            &judge.name,
            response.status,
            response.matched_rule,
            Duration::ZERO,
        ));

        if response.status != AgentStatus::Done {
            let reason = response.failure_reason();
            self.state.record_response(response);
            return Err(EngineError::Internal(format!(
                "cycle judge failed: {reason}"
            )));
        }

        let matched = response.matched_rule;
        self.state.record_response(response);
        let index = matched.ok_or(EngineError::NoRuleMatched {
            movement: judge.name.clone(),
        })?;
        Ok(judge.rules[index].next.clone())
    }

    async fn dispatch(
        &self,
        movement: &Movement,
        instruction: &str,
    ) -> EngineResult<DispatchOutcome> {
        if let Some(spec) = &movement.parallel {
            let runner = ParallelRunner::new(
                self.movement_executor(),
                Arc::clone(&self.evaluator),
                self.config.name.clone(),
                self.cwd.clone(),
            );
            return runner
                .run(movement, spec, &self.state.sessions, &self.cancel)
                .await;
        }

        if let Some(spec) = &movement.team_leader {
            let key = session_key(&self.config.name, &movement.name);
            let prior = self.state.session_for(&key);
            let runner = TeamLeaderRunner::new(
                Arc::clone(&self.agent),
                Arc::clone(&self.evaluator),
                self.cwd.clone(),
            )
            .with_agent_events(self.agent_events.clone());
            return runner
                .run(movement, spec, instruction, &key, prior, &self.cancel)
                .await;
        }

        if let Some(spec) = &movement.arpeggio {
            let source: Arc<dyn RowSource> = match (&self.row_source, &spec.source) {
                (Some(source), _) => Arc::clone(source),
                (None, Some(path)) => Arc::new(FileRowSource::new(path.clone())),
                (None, None) => {
                    return Err(EngineError::RowSource(format!(
                        "movement '{}' has no row source",
                        movement.name
                    )))
                }
            };
            let runner = ArpeggioRunner::new(
                Arc::clone(&self.agent),
                Arc::clone(&self.evaluator),
                self.cwd.clone(),
            )
            .with_custom_merge(self.custom_merge.clone())
            .with_agent_events(self.agent_events.clone());
            return runner.run(movement, spec, source, &self.cancel).await;
        }

        let key = session_key(&self.config.name, &movement.name);
        let prior = self.state.session_for(&key);
        let outcome = self
            .movement_executor()
            .run(movement, instruction, &key, prior, &self.cancel)
            .await?;

        Ok(DispatchOutcome {
            response: outcome.response,
            session_updates: outcome.session_update.into_iter().collect(),
        })
    }

    fn movement_executor(&self) -> MovementExecutor {
        MovementExecutor::new(
            Arc::clone(&self.agent),
            Arc::clone(&self.evaluator),
            self.cwd.clone(),
        )
        .with_events(self.events.clone())
        .with_agent_events(self.agent_events.clone())
    }

    fn build_instruction(&self, movement: &Movement) -> String {
        let mut instruction = render(&movement.instruction, &self.config.variables);
        if !self.state.user_inputs.is_empty() {
            instruction.push_str("\n\n## User input\n");
            instruction.push_str(&self.state.user_inputs.join("\n"));
        }
        instruction
    }

    fn accept_user_input(&mut self, movement: &str, input: String) {
        self.events.send_event(PieceEvent::MovementUserInput {
            movement: movement.to_string(),
            input: input.clone(),
        });
        self.state.user_inputs.push(input);
    }

    async fn apply_sessions(&mut self, updates: Vec<(String, String)>) {
        for (key, id) in updates {
            self.host.persist_session(&key, &id).await;
            self.state.sessions.insert(key, id);
        }
    }

    fn finish_completed(&mut self) {
        self.state.status = PieceStatus::Completed;
        self.emit_final();
    }

    fn finish_aborted(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(piece = %self.config.name, %reason, "piece aborted");
        self.state.status = PieceStatus::Aborted;
        self.abort_reason = Some(reason);
        self.emit_final();
    }

    fn emit_final(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        match self.state.status {
            PieceStatus::Completed => self.events.send_event(PieceEvent::piece_complete(
                &self.config.name,
                self.state.iteration,
                self.started.elapsed(),
            )),
            PieceStatus::Aborted => self.events.send_event(PieceEvent::piece_abort(
                &self.config.name,
                self.abort_reason.clone().unwrap_or_default(),
                self.state.iteration,
            )),
            PieceStatus::Running => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentResponse, CallOptions};
    use crate::host::NullHost;
    use crate::score::{CycleMonitor, LoopThresholds, Rule};

    use async_trait::async_trait;
    use std::collections::HashMap;
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

    /// Replies per persona/instruction from a fixed script keyed by
    /// movement-tagged markers embedded in the instruction.
    struct TableAgent {
        by_instruction: Vec<(&'static str, AgentResponse)>,
        calls: Mutex<Vec<String>>,
    }

    impl TableAgent {
        fn new(by_instruction: Vec<(&'static str, AgentResponse)>) -> Self {
            Self {
                by_instruction,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentCall for TableAgent {
        async fn call(
            &self,
            _persona: &str,
            instruction: &str,
            _options: CallOptions,
        ) -> AgentResponse {
            self.calls.lock().unwrap().push(instruction.to_string());
            for (marker, response) in &self.by_instruction {
                if instruction.contains(marker) {
                    return response.clone();
                }
            }
            AgentResponse::error("?", "?", format!("unscripted instruction: {instruction}"))
        }
    }

    fn movement(name: &str, instruction: &str, rules: Vec<Rule>) -> Movement {
        Movement {
            name: name.to_string(),
            persona: "worker".to_string(),
            rules,
            instruction: instruction.to_string(),
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

    fn piece(movements: Vec<Movement>, initial: &str) -> PieceConfig {
        PieceConfig {
            name: "suite".to_string(),
            movements,
            initial: initial.to_string(),
            max_movements: 50,
            loop_detection: None,
            cycle_monitors: Vec::new(),
            variables: HashMap::new(),
        }
    }

    fn engine(config: PieceConfig, agent: Arc<dyn AgentCall>) -> Engine {
        Engine::new(config, agent, Arc::new(NoJudge), Arc::new(NullHost)).unwrap()
    }

    #[tokio::test]
    async fn test_two_movement_piece_completes() {
        let agent = Arc::new(TableAgent::new(vec![
            ("plan it", AgentResponse::done("plan", "p", "plan ready [plan:1]")),
            ("build it", AgentResponse::done("build", "p", "shipped [build:1]")),
        ]));
        let config = piece(
            vec![
                movement("plan", "plan it", vec![Rule::text("plan ready", "build")]),
                movement("build", "build it", vec![Rule::text("shipped", "COMPLETE")]),
            ],
            "plan",
        );

        let mut engine = engine(config, agent);
        let result = engine.run().await;

        assert_eq!(result.status, PieceStatus::Completed);
        assert_eq!(result.iterations, 2);
        assert!(result.last_output.contains("shipped"));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_run() {
        let config = piece(
            vec![movement(
                "plan",
                "plan it",
                vec![Rule::text("ok", "nowhere")],
            )],
            "plan",
        );
        let err = Engine::new(
            config,
            Arc::new(TableAgent::new(Vec::new())),
            Arc::new(NoJudge),
            Arc::new(NullHost),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("config error"));
    }

    #[tokio::test]
    async fn test_finished_engine_never_redispatches() {
        let agent = Arc::new(TableAgent::new(vec![(
            "plan it",
            AgentResponse::done("plan", "p", "shipped [plan:1]"),
        )]));
        let config = piece(
            vec![movement("plan", "plan it", vec![Rule::text("shipped", "COMPLETE")])],
            "plan",
        );

        let mut engine = engine(config, Arc::clone(&agent) as Arc<dyn AgentCall>);
        let first = engine.run().await;
        assert_eq!(first.status, PieceStatus::Completed);
        assert_eq!(agent.calls.lock().unwrap().len(), 1);

        // Completed is terminal: running again must not re-execute anything
        let second = engine.run().await;
        assert_eq!(second.status, PieceStatus::Completed);
        assert_eq!(agent.calls.lock().unwrap().len(), 1);
        assert_eq!(engine.run_single_iteration().await, PieceStatus::Completed);
        assert_eq!(agent.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_response_aborts_with_reason() {
        let agent = Arc::new(TableAgent::new(vec![(
            "plan it",
            AgentResponse::error("plan", "p", "provider exploded"),
        )]));
        let config = piece(
            vec![movement("plan", "plan it", vec![Rule::text("ok", "COMPLETE")])],
            "plan",
        );

        let mut engine = engine(config, agent);
        let result = engine.run().await;

        assert_eq!(result.status, PieceStatus::Aborted);
        assert!(result.reason.unwrap().contains("provider exploded"));
    }

    #[tokio::test]
    async fn test_abort_handle_is_idempotent_and_stops_next_boundary() {
        let agent = Arc::new(TableAgent::new(vec![(
            "plan it",
            AgentResponse::done("plan", "p", "looping [plan:1]"),
        )]));
        let config = piece(
            vec![movement("plan", "plan it", vec![Rule::text("looping", "plan")])],
            "plan",
        );

        let mut engine = engine(config, agent);
        let handle = engine.abort_handle();
        handle.abort();
        handle.abort();

        let status = engine.run_single_iteration().await;
        assert_eq!(status, PieceStatus::Aborted);
        assert_eq!(engine.state().iteration, 0, "no new movement may start");
    }

    #[tokio::test]
    async fn test_hard_loop_threshold_aborts() {
        let agent = Arc::new(TableAgent::new(vec![(
            "plan it",
            AgentResponse::done("plan", "p", "again [plan:1]"),
        )]));
        let mut config = piece(
            vec![movement("plan", "plan it", vec![Rule::text("again", "plan")])],
            "plan",
        );
        config.loop_detection = Some(LoopThresholds { warn: 2, abort: 3 });

        let mut engine = engine(config, agent);
        let result = engine.run().await;

        assert_eq!(result.status, PieceStatus::Aborted);
        assert!(result.reason.unwrap().contains("3 times in a row"));
        assert_eq!(result.iterations, 2, "the aborting pass never dispatches");
    }

    #[tokio::test]
    async fn test_iteration_cap_with_null_host_aborts() {
        let agent = Arc::new(TableAgent::new(vec![(
            "plan it",
            AgentResponse::done("plan", "p", "again [plan:1]"),
        )]));
        let mut config = piece(
            vec![movement("plan", "plan it", vec![Rule::text("again", "plan")])],
            "plan",
        );
        config.max_movements = 3;

        let mut engine = engine(config, agent);
        let result = engine.run().await;

        assert_eq!(result.status, PieceStatus::Aborted);
        assert!(result.reason.unwrap().contains("iteration cap of 3"));
        assert_eq!(result.iterations, 3);
    }

    /// Host that grants one batch of extra iterations, then refuses
    struct GrantOnceHost {
        granted: Mutex<bool>,
    }

    #[async_trait]
    impl HostCallbacks for GrantOnceHost {
        async fn grant_iterations(&self, _used: u32, _cap: u32) -> Option<u32> {
            let mut granted = self.granted.lock().unwrap();
            if *granted {
                None
            } else {
                *granted = true;
                Some(2)
            }
        }

        async fn user_input(&self, _movement: &str, _prompt: &str) -> Option<String> {
            None
        }

        async fn resolve_blocked(&self, _movement: &str, _content: &str) -> Option<String> {
            None
        }

        async fn persist_session(&self, _key: &str, _session_id: &str) {}
    }

    #[tokio::test]
    async fn test_granted_budget_raises_the_cap() {
        let agent = Arc::new(TableAgent::new(vec![(
            "plan it",
            AgentResponse::done("plan", "p", "again [plan:1]"),
        )]));
        let mut config = piece(
            vec![movement("plan", "plan it", vec![Rule::text("again", "plan")])],
            "plan",
        );
        config.max_movements = 2;

        let mut engine = Engine::new(
            config,
            agent,
            Arc::new(NoJudge),
            Arc::new(GrantOnceHost {
                granted: Mutex::new(false),
            }),
        )
        .unwrap();
        let result = engine.run().await;

        assert_eq!(result.status, PieceStatus::Aborted);
        assert_eq!(result.iterations, 4, "cap of 2 raised once by 2");
    }

    #[tokio::test]
    async fn test_cycle_monitor_hands_the_transition_to_the_judge() {
        // plan -> implement -> review -> plan ...; threshold 2 on the full
        // cycle; the judge (scripted via the built-in instruction) stops.
        let agent = Arc::new(TableAgent::new(vec![
            ("plan it", AgentResponse::done("plan", "p", "go [plan:1]")),
            ("build it", AgentResponse::done("implement", "p", "go [implement:1]")),
            ("check it", AgentResponse::done("review", "p", "go [review:1]")),
            (
                "back-to-back",
                AgentResponse::done("CYCLE_JUDGE", "judge", "[CYCLE_JUDGE:2]"),
            ),
        ]));
        let mut config = piece(
            vec![
                movement("plan", "plan it", vec![Rule::text("go", "implement")]),
                movement("implement", "build it", vec![Rule::text("go", "review")]),
                movement("review", "check it", vec![Rule::text("go", "plan")]),
            ],
            "plan",
        );
        config.cycle_monitors = vec![CycleMonitor {
            cycle: vec![
                "plan".to_string(),
                "implement".to_string(),
                "review".to_string(),
            ],
            threshold: 2,
            judge: None,
        }];

        let mut engine = engine(config, agent);
        let result = engine.run().await;

        // review's own rule says "plan", but the judge said stop
        assert_eq!(result.status, PieceStatus::Completed);
        assert_eq!(result.iterations, 6);
    }

    fn blocked(movement: &str, content: &str) -> AgentResponse {
        let mut response = AgentResponse::done(movement, "p", content);
        response.status = AgentStatus::Blocked;
        response
    }

    /// Host that unblocks once with continuation input, then declines
    struct UnblockOnceHost {
        supplied: Mutex<bool>,
    }

    #[async_trait]
    impl HostCallbacks for UnblockOnceHost {
        async fn grant_iterations(&self, _used: u32, _cap: u32) -> Option<u32> {
            None
        }

        async fn user_input(&self, _movement: &str, _prompt: &str) -> Option<String> {
            None
        }

        async fn resolve_blocked(&self, _movement: &str, _content: &str) -> Option<String> {
            let mut supplied = self.supplied.lock().unwrap();
            if *supplied {
                None
            } else {
                *supplied = true;
                Some("use the staging credentials".to_string())
            }
        }

        async fn persist_session(&self, _key: &str, _session_id: &str) {}
    }

    #[tokio::test]
    async fn test_blocked_movement_continues_with_host_input() {
        let agent = Arc::new(TableAgent::new(vec![
            (
                "staging credentials",
                AgentResponse::done("fix", "p", "done [fix:1]"),
            ),
            ("fix it", blocked("fix", "cannot reach the registry")),
        ]));
        let config = piece(
            vec![movement("fix", "fix it", vec![Rule::text("done", "COMPLETE")])],
            "fix",
        );

        let mut engine = Engine::new(
            config,
            Arc::clone(&agent) as Arc<dyn AgentCall>,
            Arc::new(NoJudge),
            Arc::new(UnblockOnceHost {
                supplied: Mutex::new(false),
            }),
        )
        .unwrap();
        let result = engine.run().await;

        assert_eq!(result.status, PieceStatus::Completed);
        let calls = agent.calls.lock().unwrap();
        assert_eq!(calls.len(), 2, "blocked pass plus the unblocked re-run");
        assert!(calls[1].contains("use the staging credentials"));
    }

    #[tokio::test]
    async fn test_blocked_movement_aborts_when_host_declines() {
        let agent = Arc::new(TableAgent::new(vec![(
            "fix it",
            blocked("fix", "cannot reach the registry"),
        )]));
        let config = piece(
            vec![movement("fix", "fix it", vec![Rule::text("done", "COMPLETE")])],
            "fix",
        );

        let mut engine = engine(config, agent);
        let result = engine.run().await;

        assert_eq!(result.status, PieceStatus::Aborted);
        assert!(result.reason.unwrap().contains("blocked"));
    }

    /// Host that supplies input once for a requires-user-input rule
    struct InputOnceHost {
        supplied: Mutex<bool>,
    }

    #[async_trait]
    impl HostCallbacks for InputOnceHost {
        async fn grant_iterations(&self, _used: u32, _cap: u32) -> Option<u32> {
            None
        }

        async fn user_input(&self, _movement: &str, _prompt: &str) -> Option<String> {
            let mut supplied = self.supplied.lock().unwrap();
            if *supplied {
                None
            } else {
                *supplied = true;
                Some("use the blue variant".to_string())
            }
        }

        async fn resolve_blocked(&self, _movement: &str, _content: &str) -> Option<String> {
            None
        }

        async fn persist_session(&self, _key: &str, _session_id: &str) {}
    }

    #[tokio::test]
    async fn test_user_input_rule_reruns_movement_with_input_appended() {
        let agent = Arc::new(TableAgent::new(vec![
            (
                "blue variant",
                AgentResponse::done("ask", "p", "done [ask:2]"),
            ),
            ("ask away", AgentResponse::done("ask", "p", "need a choice [ask:1]")),
        ]));
        let config = piece(
            vec![movement(
                "ask",
                "ask away",
                vec![
                    Rule {
                        condition: "need a choice".to_string(),
                        judge: false,
                        next: "ask".to_string(),
                        requires_user_input: true,
                    },
                    Rule::text("done", "COMPLETE"),
                ],
            )],
            "ask",
        );

        let mut engine = Engine::new(
            config,
            Arc::clone(&agent) as Arc<dyn AgentCall>,
            Arc::new(NoJudge),
            Arc::new(InputOnceHost {
                supplied: Mutex::new(false),
            }),
        )
        .unwrap();
        let result = engine.run().await;

        assert_eq!(result.status, PieceStatus::Completed);
        let calls = agent.calls.lock().unwrap();
        assert!(calls[1].contains("use the blue variant"));
    }

    #[tokio::test]
    async fn test_session_id_round_trips_between_passes() {
        let mut first = AgentResponse::done("plan", "p", "again [plan:1]");
        first.session_id = Some("sess-1".to_string());
        let agent = Arc::new(TableAgent::new(vec![("plan it", first)]));

        let mut config = piece(
            vec![movement("plan", "plan it", vec![Rule::text("again", "plan")])],
            "plan",
        );
        config.max_movements = 2;

        let mut engine = engine(config, agent);
        engine.run().await;

        assert_eq!(
            engine.state().session_for("suite/plan"),
            Some("sess-1".to_string())
        );
    }
}
