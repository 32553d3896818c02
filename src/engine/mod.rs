//! Test engine abstraction.
//!
//! The conformance engine is a closed vendor library. It exposes synchronous
//! lifecycle entry points and calls back into us from its own threads. This
//! module models both halves as traits so the session orchestrator never
//! touches the vendor ABI directly:
//!
//! - [`Engine`]: lifecycle calls we make, in the order the orchestrator
//!   drives them.
//! - [`EngineCallbacks`]: the five callbacks the engine makes. Strings arrive
//!   as raw bytes in the engine's code page.
//!
//! Tests drive the orchestrator through a scripted fake engine; on Windows
//! the `ets_manager` adapter binds the real library.

#[cfg(windows)]
pub mod ets_manager;
#[cfg(any(test, feature = "scenario-test"))]
pub mod fake;

use std::path::Path;
use std::sync::Arc;

/// Callbacks the engine invokes while a profile is registered.
///
/// Every method may be called from an engine-owned thread, concurrently with
/// the orchestrator's own lifecycle calls.
pub trait EngineCallbacks: Send + Sync {
    /// A device turned up during discovery. Returns whether to accept it.
    fn on_device_found(&self, address: &[u8], name: &[u8], class_of_device: &[u8]) -> bool;

    /// Free-form status text from the radio dongle.
    fn on_dongle_message(&self, message: &[u8]) -> bool;

    /// Whether the engine should route prompts to [`on_implicit_send`](Self::on_implicit_send).
    fn use_auto_implicit_send(&self) -> bool;

    /// An operator prompt. The engine blocks until this returns; the returned
    /// bytes become the engine's answer.
    fn on_implicit_send(&self, description: &[u8], style: u32) -> Vec<u8>;

    /// One log record of the running test case.
    fn on_log(&self, time: &[u8], description: &[u8], message: &[u8], logtype: i32) -> bool;
}

/// Lifecycle entry points of the engine.
///
/// Methods returning `bool` report the engine's own success flag.
pub trait Engine {
    fn register_profile(&self, profile: &str, callbacks: Arc<dyn EngineCallbacks>) -> bool;

    fn init_device_discovery(
        &self,
        install_dir: &Path,
        callbacks: Arc<dyn EngineCallbacks>,
    ) -> bool;

    /// Make `port` visible to the engine as a radio device.
    fn provision_port(&self, port: &str) -> bool;

    /// Device names known to the engine, in its own list format.
    fn device_list(&self) -> String;

    fn select_device(&self, port: &str);

    fn verify_dongle(&self) -> bool;

    /// Dongle hardware address; the low 48 bits are significant.
    fn dongle_address(&self) -> u64;

    fn query_dongle_information(&self);

    fn set_parameter(&self, name: &str, value_type: &str, value: &str, profile: &str) -> bool;

    fn init_ets(
        &self,
        profile: &str,
        workspace: &str,
        implicit_send_library: &Path,
        dongle_address: &str,
    ) -> bool;

    fn init_stack(&self, profile: &str) -> bool;

    fn set_post_logging(&self, enabled: bool, profile: &str);

    fn start_test_case(&self, test_case: &str, profile: &str, max_log: bool) -> bool;

    fn test_case_finished(&self, test_case: &str, profile: &str) -> bool;

    fn exit_stack(&self, profile: &str) -> bool;

    fn unregister_profile(&self, profile: &str) -> bool;

    fn unregister_device_discovery(&self) -> bool;
}

/// Severity codes of engine log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LogType {
    GeneralText = 0,
    StartTestCase = 1,
    TestCaseEnded = 2,
    StartDefault = 3,
    DefaultEnded = 4,
    FinalVerdict = 5,
    PreliminaryVerdict = 6,
    Timeout = 7,
    Assignment = 8,
    StartTimer = 9,
    StopTimer = 10,
    CancelTimer = 11,
    ReadTimer = 12,
    Attach = 13,
    ImplicitSend = 14,
    Goto = 15,
    TimedOutTimer = 16,
    Error = 17,
    Create = 18,
    Done = 19,
    Activate = 20,
    Message = 21,
    LineMatched = 22,
    LineNotMatched = 23,
    SendEvent = 24,
    ReceiveEvent = 25,
    OtherwiseEvent = 26,
    ReceivedOnPco = 27,
    MatchFailed = 28,
    CoordinationMessage = 29,
}

impl LogType {
    const ALL: [LogType; 30] = [
        LogType::GeneralText,
        LogType::StartTestCase,
        LogType::TestCaseEnded,
        LogType::StartDefault,
        LogType::DefaultEnded,
        LogType::FinalVerdict,
        LogType::PreliminaryVerdict,
        LogType::Timeout,
        LogType::Assignment,
        LogType::StartTimer,
        LogType::StopTimer,
        LogType::CancelTimer,
        LogType::ReadTimer,
        LogType::Attach,
        LogType::ImplicitSend,
        LogType::Goto,
        LogType::TimedOutTimer,
        LogType::Error,
        LogType::Create,
        LogType::Done,
        LogType::Activate,
        LogType::Message,
        LogType::LineMatched,
        LogType::LineNotMatched,
        LogType::SendEvent,
        LogType::ReceiveEvent,
        LogType::OtherwiseEvent,
        LogType::ReceivedOnPco,
        LogType::MatchFailed,
        LogType::CoordinationMessage,
    ];

    pub fn from_code(code: i32) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }
}
