//! Session orchestrator: one conformance test case, start to finish.
//!
//! Drives the engine through its lifecycle in a fixed order:
//! 1. Registers the profile and device-discovery callbacks
//! 2. Provisions the port and selects it as the engine's device
//! 3. Verifies the dongle and reports its address on the output stream
//! 4. Applies test parameters, then initializes the engine and its stack
//! 5. Arms the completion gate, starts the test case, and waits for the verdict
//! 6. Finalizes the test case and tears everything down
//!
//! Any failure before the test case runs is fatal. Teardown of the steps
//! already done is skipped unless `teardown_on_failure` is set. Once the
//! test case has run, teardown always happens, whatever the verdict.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::codec::TextEncoding;
use crate::completion::{CompletionGate, GateError};
use crate::config::BridgeConfig;
use crate::engine::{Engine, EngineCallbacks, LogType};
use crate::events::{BdAddr, Emitter, Event};
use crate::paths;
use crate::prompt::{BridgeError, PromptBridge, PromptPolicy};

/// One `name type value` triple applied before engine initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestParameter {
    pub name: String,
    pub value_type: String,
    pub value: String,
}

impl TestParameter {
    pub fn new(name: &str, value_type: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value_type: value_type.to_string(),
            value: value.to_string(),
        }
    }
}

/// Which log record ends the test case.
#[derive(Debug, Clone)]
pub struct VerdictRule {
    logtype: i32,
    marker: String,
    outcome: Option<Regex>,
}

impl VerdictRule {
    pub fn new(logtype: i32, marker: &str) -> Self {
        let outcome = Regex::new(&format!(r"{}([A-Za-z_]+)", regex::escape(marker))).ok();
        Self {
            logtype,
            marker: marker.to_string(),
            outcome,
        }
    }

    pub fn is_terminal(&self, logtype: i32, message: &str) -> bool {
        logtype == self.logtype && message.contains(&self.marker)
    }

    /// Outcome word following the marker, e.g. `PASS` in `VERDICT/PASS`.
    pub fn verdict(&self, message: &str) -> Verdict {
        let word = self
            .outcome
            .as_ref()
            .and_then(|re| re.captures(message))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .unwrap_or_default();
        Verdict::from_word(word)
    }
}

impl Default for VerdictRule {
    fn default() -> Self {
        Self::new(LogType::FinalVerdict as i32, "VERDICT/")
    }
}

/// Outcome of the test case as reported by the engine.
///
/// Informational only: the exit status never depends on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
    Other(String),
}

impl Verdict {
    fn from_word(word: &str) -> Self {
        match word.to_ascii_uppercase().as_str() {
            "PASS" => Verdict::Pass,
            "FAIL" => Verdict::Fail,
            "INCONC" | "INCONCLUSIVE" => Verdict::Inconclusive,
            _ => Verdict::Other(word.to_string()),
        }
    }
}

/// Lifecycle position of a [`TestSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Provisioning,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{step} failed for profile {profile}")]
    Registration { step: &'static str, profile: String },
    #[error("failed to provision port {port}: {reason}")]
    Provisioning { port: String, reason: &'static str },
    #[error("dongle verification failed")]
    Credential,
    #[error("engine rejected parameter {name} {value_type} {value}")]
    Parameter {
        name: String,
        value_type: String,
        value: String,
    },
    #[error("engine initialization failed for profile {profile}")]
    EngineInit { profile: String },
    #[error("protocol stack initialization failed for profile {profile}")]
    StackInit { profile: String },
    #[error("protocol violation on the answer stream")]
    ProtocolViolation(#[source] BridgeError),
    #[error("engine refused to start test case {test_case}")]
    Start { test_case: String },
    #[error("teardown failed: {}", steps.join(", "))]
    Teardown { steps: Vec<&'static str> },
    #[error("failed to write to the output stream")]
    Output(#[source] std::io::Error),
    #[error("completion gate misuse")]
    Gate(#[from] GateError),
    #[error("session already started")]
    AlreadyStarted,
}

/// Called when an engine callback hits an unrecoverable error.
pub type FatalHook = Arc<dyn Fn(&SessionError) + Send + Sync>;

/// Default [`FatalHook`]: report on stderr and end the process.
///
/// Nothing the engine does after a broken answer stream can be trusted, and
/// the orchestrator thread is parked on the completion gate, so the process
/// exits from the callback thread.
pub fn exit_on_fatal() -> FatalHook {
    Arc::new(|err: &SessionError| {
        eprintln!("Error: {}", error_chain(err));
        std::process::exit(1);
    })
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

/// Everything needed to run one test case.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port: String,
    pub profile: String,
    pub test_case: String,
    pub parameters: Vec<TestParameter>,
    pub install_dir: PathBuf,
    pub workspace: String,
    pub implicit_send_library: PathBuf,
    pub verify_credential: bool,
    pub post_logging: bool,
    pub max_log: bool,
    pub teardown_on_failure: bool,
    pub encoding: TextEncoding,
    pub prompt: PromptPolicy,
    pub verdict: VerdictRule,
}

impl SessionConfig {
    pub fn new(
        port: &str,
        profile: &str,
        test_case: &str,
        parameters: Vec<TestParameter>,
        config: &BridgeConfig,
        install_dir: PathBuf,
    ) -> Self {
        let implicit_send_library =
            paths::implicit_send_library(&install_dir, &config.engine.implicit_send_library);
        Self {
            port: port.to_string(),
            profile: profile.to_string(),
            test_case: test_case.to_string(),
            parameters,
            install_dir,
            workspace: config.engine.workspace.clone(),
            implicit_send_library,
            verify_credential: config.engine.verify_credential,
            post_logging: config.engine.post_logging,
            max_log: config.engine.max_log,
            teardown_on_failure: config.session.teardown_on_failure,
            encoding: config.output.encoding,
            prompt: config.prompt.policy(),
            verdict: VerdictRule::new(config.verdict.logtype, &config.verdict.marker),
        }
    }
}

/// Callbacks registered with the engine for one session.
pub struct SessionCallbacks {
    emitter: Arc<Emitter>,
    gate: Arc<CompletionGate>,
    bridge: Arc<PromptBridge>,
    encoding: TextEncoding,
    verdict_rule: VerdictRule,
    verdict: Mutex<Option<Verdict>>,
    on_fatal: FatalHook,
}

impl SessionCallbacks {
    fn decode(&self, bytes: &[u8]) -> String {
        self.encoding.decode(bytes)
    }

    /// Verdict of the first terminal record seen, if any.
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_verdict(&self, message: &str) {
        let verdict = self.verdict_rule.verdict(message);
        info!(verdict = ?verdict, "final verdict received");
        self.verdict
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_or_insert(verdict);

        match self.gate.signal() {
            Ok(()) => {}
            Err(GateError::AlreadySignaled) => {
                debug!("ignoring additional final verdict");
            }
            Err(err) => warn!(error = %err, "final verdict arrived outside a running test case"),
        }
    }
}

impl EngineCallbacks for SessionCallbacks {
    fn on_device_found(&self, address: &[u8], name: &[u8], class_of_device: &[u8]) -> bool {
        debug!(
            address = %self.decode(address),
            name = %self.decode(name),
            class_of_device = %self.decode(class_of_device),
            "device found"
        );
        true
    }

    fn on_dongle_message(&self, message: &[u8]) -> bool {
        debug!(message = %self.decode(message), "dongle message");
        true
    }

    fn use_auto_implicit_send(&self) -> bool {
        true
    }

    fn on_implicit_send(&self, description: &[u8], style: u32) -> Vec<u8> {
        let description = self.decode(description);
        match self.bridge.handle_prompt(&description, style) {
            Ok(answer) => self.encoding.encode(&answer),
            Err(err) => {
                (self.on_fatal)(&SessionError::ProtocolViolation(err));
                Vec::new()
            }
        }
    }

    fn on_log(&self, time: &[u8], description: &[u8], message: &[u8], logtype: i32) -> bool {
        let message = self.decode(message);
        let event = Event::Log {
            time: self.decode(time),
            description: self.decode(description),
            message: message.clone(),
            logtype,
        };
        if let Err(err) = self.emitter.emit(&event) {
            (self.on_fatal)(&SessionError::Output(err));
            return false;
        }

        if self.verdict_rule.is_terminal(logtype, &message) {
            self.record_verdict(&message);
        } else if LogType::from_code(logtype) == Some(LogType::Error) {
            warn!(message = %message.trim(), "engine reported an error");
        }
        true
    }
}

/// Lifecycle steps that have a teardown counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ProfileRegistered,
    DiscoveryInitialized,
    StackInitialized,
    TestStarted,
}

/// What a finished session reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub dongle_address: BdAddr,
    pub verdict: Option<Verdict>,
}

/// A single test case run.
pub struct TestSession {
    config: SessionConfig,
    state: SessionState,
    emitter: Arc<Emitter>,
    gate: Arc<CompletionGate>,
    bridge: Arc<PromptBridge>,
    on_fatal: FatalHook,
    completed: Vec<Step>,
}

impl TestSession {
    /// `input` is the answer stream; `emitter` the protocol output.
    pub fn new(
        config: SessionConfig,
        emitter: Arc<Emitter>,
        input: impl BufRead + Send + 'static,
    ) -> Self {
        let bridge = PromptBridge::new(
            Arc::clone(&emitter),
            input,
            config.prompt.clone(),
            config.encoding,
        );
        Self {
            config,
            state: SessionState::Idle,
            emitter,
            gate: Arc::new(CompletionGate::new()),
            bridge: Arc::new(bridge),
            on_fatal: exit_on_fatal(),
            completed: Vec::new(),
        }
    }

    /// Replace the handler for unrecoverable callback errors.
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.on_fatal = hook;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the test case to completion.
    ///
    /// Blocks for the whole test case. Returns `Ok` only when a verdict was
    /// received and every teardown call succeeded.
    pub fn run(&mut self, engine: &dyn Engine) -> Result<SessionReport, SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyStarted);
        }

        let callbacks = Arc::new(SessionCallbacks {
            emitter: Arc::clone(&self.emitter),
            gate: Arc::clone(&self.gate),
            bridge: Arc::clone(&self.bridge),
            encoding: self.config.encoding,
            verdict_rule: self.config.verdict.clone(),
            verdict: Mutex::new(None),
            on_fatal: Arc::clone(&self.on_fatal),
        });
        let engine_callbacks: Arc<dyn EngineCallbacks> = callbacks.clone();

        let dongle_address = self.prepare(engine, &engine_callbacks)?;

        self.state = SessionState::Running;
        if let Err(err) = self.gate.arm() {
            return self.abort(engine, err.into());
        }

        let profile = self.config.profile.clone();
        let test_case = self.config.test_case.clone();
        info!(test_case = %test_case, profile = %profile, "starting test case");
        let started = engine.start_test_case(&test_case, &profile, self.config.max_log);
        if started {
            self.completed.push(Step::TestStarted);
            if let Err(err) = self.gate.await_completion() {
                error!(error = %err, "completion wait failed");
            }
            info!(test_case = %test_case, "test case finished");
        } else {
            error!(test_case = %test_case, "engine refused to start test case");
        }

        let failed = self.teardown(engine);
        let verdict = callbacks.verdict();

        if !started {
            self.state = SessionState::Failed;
            return Err(SessionError::Start { test_case });
        }
        if !failed.is_empty() {
            self.state = SessionState::Failed;
            return Err(SessionError::Teardown { steps: failed });
        }

        self.state = SessionState::Completed;
        Ok(SessionReport {
            dongle_address,
            verdict,
        })
    }

    /// Everything up to an initialized protocol stack.
    fn prepare(
        &mut self,
        engine: &dyn Engine,
        callbacks: &Arc<dyn EngineCallbacks>,
    ) -> Result<BdAddr, SessionError> {
        let config = self.config.clone();
        let profile = config.profile.as_str();
        let port = config.port.as_str();

        info!(profile, "registering profile callbacks");
        if !engine.register_profile(profile, Arc::clone(callbacks)) {
            return self.abort(
                engine,
                SessionError::Registration {
                    step: "profile registration",
                    profile: profile.to_string(),
                },
            );
        }
        self.completed.push(Step::ProfileRegistered);

        if !engine.init_device_discovery(&config.install_dir, Arc::clone(callbacks)) {
            return self.abort(
                engine,
                SessionError::Registration {
                    step: "device discovery initialization",
                    profile: profile.to_string(),
                },
            );
        }
        self.completed.push(Step::DiscoveryInitialized);

        self.state = SessionState::Provisioning;
        info!(port, "provisioning port");
        if !engine.provision_port(port) {
            return self.abort(
                engine,
                SessionError::Provisioning {
                    port: port.to_string(),
                    reason: "port registration failed",
                },
            );
        }
        let devices = engine.device_list();
        if !devices.contains(port) {
            debug!(devices = %devices, "engine device list");
            return self.abort(
                engine,
                SessionError::Provisioning {
                    port: port.to_string(),
                    reason: "device not found",
                },
            );
        }
        engine.select_device(port);

        if !engine.verify_dongle() {
            if config.verify_credential {
                return self.abort(engine, SessionError::Credential);
            }
            warn!("dongle verification failed; continuing because verify_credential is off");
        }

        let dongle_address = BdAddr::from_u64(engine.dongle_address());
        info!(address = %dongle_address, "dongle address");
        if let Err(err) = self.emitter.emit(&Event::Addr {
            value: dongle_address,
        }) {
            return self.abort(engine, SessionError::Output(err));
        }
        engine.query_dongle_information();

        for parameter in &config.parameters {
            debug!(
                name = %parameter.name,
                value_type = %parameter.value_type,
                value = %parameter.value,
                "setting parameter"
            );
            if !engine.set_parameter(
                &parameter.name,
                &parameter.value_type,
                &parameter.value,
                profile,
            ) {
                return self.abort(
                    engine,
                    SessionError::Parameter {
                        name: parameter.name.clone(),
                        value_type: parameter.value_type.clone(),
                        value: parameter.value.clone(),
                    },
                );
            }
        }

        info!(
            workspace = %config.workspace,
            implicit_send = %config.implicit_send_library.display(),
            "initializing engine"
        );
        if !engine.init_ets(
            profile,
            &config.workspace,
            &config.implicit_send_library,
            &dongle_address.to_string(),
        ) {
            return self.abort(
                engine,
                SessionError::EngineInit {
                    profile: profile.to_string(),
                },
            );
        }

        if !engine.init_stack(profile) {
            return self.abort(
                engine,
                SessionError::StackInit {
                    profile: profile.to_string(),
                },
            );
        }
        self.completed.push(Step::StackInitialized);

        engine.set_post_logging(config.post_logging, profile);
        Ok(dongle_address)
    }

    fn abort<T>(&mut self, engine: &dyn Engine, err: SessionError) -> Result<T, SessionError> {
        self.state = SessionState::Failed;
        error!(error = %err, "session step failed");
        if self.config.teardown_on_failure {
            let order: Vec<Step> = self.completed.iter().rev().copied().collect();
            let failed = self.undo(engine, &order);
            if !failed.is_empty() {
                warn!(steps = ?failed, "teardown after failure was incomplete");
            }
        } else if !self.completed.is_empty() {
            warn!(
                completed = ?self.completed,
                "skipping teardown after failure; engine resources stay allocated"
            );
        }
        Err(err)
    }

    /// Normal teardown, in the order the engine expects.
    fn teardown(&mut self, engine: &dyn Engine) -> Vec<&'static str> {
        self.undo(
            engine,
            &[
                Step::TestStarted,
                Step::StackInitialized,
                Step::ProfileRegistered,
                Step::DiscoveryInitialized,
            ],
        )
    }

    /// Undo the completed steps among `order`. Returns the calls that failed.
    fn undo(&mut self, engine: &dyn Engine, order: &[Step]) -> Vec<&'static str> {
        let profile = self.config.profile.as_str();
        let test_case = self.config.test_case.as_str();
        let mut failed = Vec::new();

        for step in order.iter().filter(|step| self.completed.contains(step)) {
            let (name, ok) = match step {
                Step::TestStarted => (
                    "test_case_finished",
                    engine.test_case_finished(test_case, profile),
                ),
                Step::StackInitialized => ("exit_stack", engine.exit_stack(profile)),
                Step::ProfileRegistered => {
                    ("unregister_profile", engine.unregister_profile(profile))
                }
                Step::DiscoveryInitialized => (
                    "unregister_device_discovery",
                    engine.unregister_device_discovery(),
                ),
            };
            debug!(step = name, ok, "teardown");
            if !ok {
                warn!(step = name, "teardown call failed");
                failed.push(name);
            }
        }

        self.completed.clear();
        failed
    }
}
