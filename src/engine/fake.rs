//! Scripted engine for tests.
//!
//! [`FakeEngine`] records every lifecycle call and, once the test case is
//! started, replays a script of callbacks from its own thread the way the
//! vendor engine does. Callbacks are recorded in the same call log before
//! they are delivered, so tests can assert on the interleaving of callbacks
//! and lifecycle calls.

use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use super::{Engine, EngineCallbacks};

/// In-memory writer that can be cloned and inspected while shared.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.inner.lock().unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One callback the fake delivers after the test case starts.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Log {
        time: Vec<u8>,
        description: Vec<u8>,
        message: Vec<u8>,
        logtype: i32,
    },
    Prompt {
        description: Vec<u8>,
        style: u32,
    },
    DongleMessage(Vec<u8>),
    DeviceFound {
        address: Vec<u8>,
        name: Vec<u8>,
    },
}

impl ScriptStep {
    pub fn log(message: &str, logtype: i32) -> Self {
        ScriptStep::Log {
            time: b"00:00:00.000".to_vec(),
            description: b"".to_vec(),
            message: message.as_bytes().to_vec(),
            logtype,
        }
    }

    pub fn prompt(description: &str, style: u32) -> Self {
        ScriptStep::Prompt {
            description: description.as_bytes().to_vec(),
            style,
        }
    }

    fn label(&self) -> String {
        match self {
            ScriptStep::Log {
                message, logtype, ..
            } => format!("callback:log {logtype} {}", String::from_utf8_lossy(message)),
            ScriptStep::Prompt { description, style } => format!(
                "callback:implicit_send {style:#x} {}",
                String::from_utf8_lossy(description)
            ),
            ScriptStep::DongleMessage(message) => {
                format!("callback:dongle {}", String::from_utf8_lossy(message))
            }
            ScriptStep::DeviceFound { address, .. } => {
                format!("callback:device {}", String::from_utf8_lossy(address))
            }
        }
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    answers: Vec<Vec<u8>>,
    device_replies: Vec<bool>,
    ports: Vec<String>,
    callbacks: Option<Arc<dyn EngineCallbacks>>,
    runner: Option<JoinHandle<()>>,
}

/// Engine double driven by a fixed script.
#[derive(Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
    script: Vec<ScriptStep>,
    fail_on: Option<&'static str>,
    hide_ports: bool,
    dongle_address: u64,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FakeEngine {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            script,
            fail_on: None,
            hide_ports: false,
            dongle_address: 0x0000_001B_DC06_A1F2,
        }
    }

    /// Make the named lifecycle call report failure.
    pub fn failing_on(mut self, call: &'static str) -> Self {
        self.fail_on = Some(call);
        self
    }

    /// Accept port provisioning but leave the port out of the device list.
    pub fn hiding_ports(mut self) -> Self {
        self.hide_ports = true;
        self
    }

    pub fn with_dongle_address(mut self, address: u64) -> Self {
        self.dongle_address = address;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Full call log, lifecycle calls and delivered callbacks in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// First word of every lifecycle call, callbacks excluded.
    pub fn lifecycle(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|call| !call.starts_with("callback:"))
            .filter_map(|call| call.split_whitespace().next().map(str::to_string))
            .collect()
    }

    /// Answers returned by the prompt callback, in order.
    pub fn answers(&self) -> Vec<String> {
        self.lock()
            .answers
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect()
    }

    /// Return values of the device-found callback, in order.
    pub fn device_replies(&self) -> Vec<bool> {
        self.lock().device_replies.clone()
    }

    fn record(&self, call: &'static str, detail: String) -> bool {
        let mut state = self.lock();
        if detail.is_empty() {
            state.calls.push(call.to_string());
        } else {
            state.calls.push(format!("{call} {detail}"));
        }
        self.fail_on != Some(call)
    }

    fn callbacks(&self) -> Option<Arc<dyn EngineCallbacks>> {
        self.lock().callbacks.clone()
    }
}

fn deliver(state: &Mutex<FakeState>, callbacks: &dyn EngineCallbacks, step: &ScriptStep) {
    state.lock().unwrap().calls.push(step.label());
    match step {
        ScriptStep::Log {
            time,
            description,
            message,
            logtype,
        } => {
            callbacks.on_log(time, description, message, *logtype);
        }
        ScriptStep::Prompt { description, style } => {
            if callbacks.use_auto_implicit_send() {
                let answer = callbacks.on_implicit_send(description, *style);
                state.lock().unwrap().answers.push(answer);
            }
        }
        ScriptStep::DongleMessage(message) => {
            callbacks.on_dongle_message(message);
        }
        ScriptStep::DeviceFound { address, name } => {
            let accepted = callbacks.on_device_found(address, name, b"0x000000");
            state.lock().unwrap().device_replies.push(accepted);
        }
    }
}

impl Engine for FakeEngine {
    fn register_profile(&self, profile: &str, callbacks: Arc<dyn EngineCallbacks>) -> bool {
        let ok = self.record("register_profile", profile.to_string());
        if ok {
            self.lock().callbacks = Some(callbacks);
        }
        ok
    }

    fn init_device_discovery(
        &self,
        install_dir: &Path,
        _callbacks: Arc<dyn EngineCallbacks>,
    ) -> bool {
        self.record("init_device_discovery", install_dir.display().to_string())
    }

    fn provision_port(&self, port: &str) -> bool {
        let ok = self.record("provision_port", port.to_string());
        if ok && !self.hide_ports {
            self.lock().ports.push(port.to_string());
        }
        ok
    }

    fn device_list(&self) -> String {
        self.record("device_list", String::new());
        self.lock().ports.join(";")
    }

    fn select_device(&self, port: &str) {
        self.record("select_device", port.to_string());
    }

    fn verify_dongle(&self) -> bool {
        self.record("verify_dongle", String::new())
    }

    fn dongle_address(&self) -> u64 {
        self.record("dongle_address", String::new());
        self.dongle_address
    }

    fn query_dongle_information(&self) {
        self.record("query_dongle_information", String::new());
        if let Some(callbacks) = self.callbacks() {
            deliver(
                &self.state,
                callbacks.as_ref(),
                &ScriptStep::DongleMessage(b"dongle ready".to_vec()),
            );
        }
    }

    fn set_parameter(&self, name: &str, value_type: &str, value: &str, profile: &str) -> bool {
        self.record(
            "set_parameter",
            format!("{name} {value_type} {value} {profile}"),
        )
    }

    fn init_ets(
        &self,
        profile: &str,
        workspace: &str,
        implicit_send_library: &Path,
        dongle_address: &str,
    ) -> bool {
        self.record(
            "init_ets",
            format!(
                "{profile} {workspace} {} {dongle_address}",
                implicit_send_library.display()
            ),
        )
    }

    fn init_stack(&self, profile: &str) -> bool {
        self.record("init_stack", profile.to_string())
    }

    fn set_post_logging(&self, enabled: bool, profile: &str) {
        self.record("set_post_logging", format!("{enabled} {profile}"));
    }

    fn start_test_case(&self, test_case: &str, profile: &str, max_log: bool) -> bool {
        if !self.record("start_test_case", format!("{test_case} {profile} {max_log}")) {
            return false;
        }
        let Some(callbacks) = self.callbacks() else {
            return false;
        };

        let state = Arc::clone(&self.state);
        let script = self.script.clone();
        let runner = thread::spawn(move || {
            for step in &script {
                deliver(&state, callbacks.as_ref(), step);
            }
        });
        self.lock().runner = Some(runner);
        true
    }

    fn test_case_finished(&self, test_case: &str, profile: &str) -> bool {
        let runner = self.lock().runner.take();
        if let Some(runner) = runner {
            let _ = runner.join();
        }
        self.record("test_case_finished", format!("{test_case} {profile}"))
    }

    fn exit_stack(&self, profile: &str) -> bool {
        self.record("exit_stack", profile.to_string())
    }

    fn unregister_profile(&self, profile: &str) -> bool {
        let ok = self.record("unregister_profile", profile.to_string());
        self.lock().callbacks = None;
        ok
    }

    fn unregister_device_discovery(&self) -> bool {
        self.record("unregister_device_discovery", String::new())
    }
}
