//! Interactive prompt bridge.
//!
//! The engine asks the operator questions ("MMI" prompts) through its
//! implicit-send callback and blocks on the returned answer. Every prompt is
//! announced on the output stream as an `implicit_send` record; the answer is
//! the next line of the input stream. The `\n` or `\r\n` terminator is
//! stripped before the answer reaches the engine; it is not passed through.
//!
//! ## Fire-and-forget prompts
//!
//! One style must never block: the engine keeps running while it is shown,
//! so the bridge answers it at once with a fixed value. The orchestrator
//! still sees the record and may answer it anyway, which leaves a stale line
//! in the input stream. The bridge counts these prompts and, on the next
//! blocking prompt, reads and discards that many lines before taking the
//! real answer:
//!
//! ```text
//! prompt            input        returned
//! FF  "Turn on"     -            "OK"        skips = 1
//! FF  "Advertise"   -            "OK"        skips = 2
//! Ok  "Confirm?"    x, y, z      "z"         skips = 0
//! ```

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info};

use crate::codec::TextEncoding;
use crate::events::{Emitter, Event};

/// Prompt style codes the engine is known to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MmiStyle {
    OkCancel1 = 0x11041,
    OkCancel2 = 0x11141,
    Ok = 0x11040,
    YesNo1 = 0x11044,
    YesNoCancel1 = 0x11043,
    AbortRetry1 = 0x11042,
    Edit1 = 0x12040,
    Edit2 = 0x12140,
}

impl MmiStyle {
    pub fn from_code(code: u32) -> Option<Self> {
        [
            Self::OkCancel1,
            Self::OkCancel2,
            Self::Ok,
            Self::YesNo1,
            Self::YesNoCancel1,
            Self::AbortRetry1,
            Self::Edit1,
            Self::Edit2,
        ]
        .into_iter()
        .find(|style| *style as u32 == code)
    }
}

/// How the bridge treats each style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPolicy {
    /// Style code that must be answered without reading input.
    pub fire_and_forget_style: u32,
    /// Answer returned for that style.
    pub fire_and_forget_answer: String,
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self {
            fire_and_forget_style: MmiStyle::OkCancel2 as u32,
            fire_and_forget_answer: "OK".to_string(),
        }
    }
}

impl PromptPolicy {
    pub fn is_fire_and_forget(&self, style: u32) -> bool {
        style == self.fire_and_forget_style
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The input stream closed while answers were still owed.
    #[error("input closed after {read} of {expected} expected answer lines")]
    InputExhausted { read: usize, expected: usize },
    #[error("failed to read answer from input")]
    Input(#[source] io::Error),
    #[error("failed to write prompt record")]
    Output(#[source] io::Error),
}

pub struct PromptBridge {
    emitter: Arc<Emitter>,
    input: Mutex<Box<dyn BufRead + Send>>,
    pending_skips: AtomicUsize,
    policy: PromptPolicy,
    encoding: TextEncoding,
}

impl PromptBridge {
    pub fn new(
        emitter: Arc<Emitter>,
        input: impl BufRead + Send + 'static,
        policy: PromptPolicy,
        encoding: TextEncoding,
    ) -> Self {
        Self {
            emitter,
            input: Mutex::new(Box::new(input)),
            pending_skips: AtomicUsize::new(0),
            policy,
            encoding,
        }
    }

    /// Answer one engine prompt.
    ///
    /// Blocks until an answer line is available for blocking styles.
    pub fn handle_prompt(&self, description: &str, style: u32) -> Result<String, BridgeError> {
        self.emitter
            .emit(&Event::ImplicitSend {
                description: description.to_string(),
                style,
            })
            .map_err(BridgeError::Output)?;

        if self.policy.is_fire_and_forget(style) {
            let pending = self.pending_skips.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(style, pending, "fire-and-forget prompt answered without input");
            return Ok(self.policy.fire_and_forget_answer.clone());
        }

        // Holding the input lock across the whole read keeps concurrent
        // prompts FIFO; a fire-and-forget prompt racing with this one is
        // counted toward the next blocking prompt.
        let mut input = self
            .input
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skips = self.pending_skips.swap(0, Ordering::SeqCst);
        let expected = skips + 1;

        let mut answer = String::new();
        for read in 0..expected {
            let Some(line) = read_answer_line(&mut **input, self.encoding)? else {
                return Err(BridgeError::InputExhausted { read, expected });
            };
            if read < skips {
                debug!(line = %line, "discarding answer for fire-and-forget prompt");
            } else {
                answer = line;
            }
        }

        info!(
            style = %describe_style(style),
            skipped = skips,
            answer = %answer,
            "prompt answered"
        );
        Ok(answer)
    }

    /// Fire-and-forget prompts issued since the last blocking answer.
    pub fn pending_skips(&self) -> usize {
        self.pending_skips.load(Ordering::SeqCst)
    }
}

/// One line without its terminator, or `None` at end of input.
fn read_answer_line(
    input: &mut dyn BufRead,
    encoding: TextEncoding,
) -> Result<Option<String>, BridgeError> {
    let mut buf = Vec::new();
    let n = input.read_until(b'\n', &mut buf).map_err(BridgeError::Input)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(encoding.decode(&buf)))
}

fn describe_style(style: u32) -> String {
    match MmiStyle::from_code(style) {
        Some(known) => format!("{known:?}"),
        None => format!("{style:#x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::SharedBuffer;
    use proptest::prelude::*;
    use std::io::Cursor;

    const FF: u32 = MmiStyle::OkCancel2 as u32;
    const BLOCKING: u32 = MmiStyle::Ok as u32;

    fn bridge(input: &str) -> (PromptBridge, SharedBuffer) {
        let out = SharedBuffer::default();
        let bridge = PromptBridge::new(
            Arc::new(Emitter::new(out.clone())),
            Cursor::new(input.as_bytes().to_vec()),
            PromptPolicy::default(),
            TextEncoding::Utf8,
        );
        (bridge, out)
    }

    fn prompt_records(out: &SharedBuffer) -> Vec<(String, u64)> {
        out.lines()
            .iter()
            .map(|line| {
                let v: serde_json::Value = serde_json::from_str(line).unwrap();
                assert_eq!(v["type"], "implicit_send");
                (
                    v["description"].as_str().unwrap().to_string(),
                    v["style"].as_u64().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn blocking_prompt_returns_next_line() {
        let (bridge, out) = bridge("yes\nno\n");
        assert_eq!(bridge.handle_prompt("Q1", BLOCKING).unwrap(), "yes");
        assert_eq!(bridge.handle_prompt("Q2", BLOCKING).unwrap(), "no");
        assert_eq!(prompt_records(&out).len(), 2);
    }

    #[test]
    fn fire_and_forget_does_not_read_input() {
        let (bridge, _out) = bridge("");
        assert_eq!(bridge.handle_prompt("Turn on", FF).unwrap(), "OK");
        assert_eq!(bridge.pending_skips(), 1);
    }

    #[test]
    fn skips_answers_owed_to_fire_and_forget_prompts() {
        let (bridge, out) = bridge("x\ny\nz\n");

        assert_eq!(bridge.handle_prompt("first", FF).unwrap(), "OK");
        assert_eq!(bridge.handle_prompt("second", FF).unwrap(), "OK");
        assert_eq!(bridge.pending_skips(), 2);
        assert_eq!(bridge.handle_prompt("third", BLOCKING).unwrap(), "z");
        assert_eq!(bridge.pending_skips(), 0);

        assert_eq!(
            prompt_records(&out),
            vec![
                ("first".to_string(), u64::from(FF)),
                ("second".to_string(), u64::from(FF)),
                ("third".to_string(), u64::from(BLOCKING)),
            ]
        );
    }

    #[test]
    fn counter_drains_before_next_cycle() {
        let (bridge, _out) = bridge("stale\nanswer\nnext\n");
        bridge.handle_prompt("a", FF).unwrap();
        assert_eq!(bridge.handle_prompt("b", BLOCKING).unwrap(), "answer");
        assert_eq!(bridge.handle_prompt("c", BLOCKING).unwrap(), "next");
    }

    #[test]
    fn eof_on_blocking_prompt_is_protocol_violation() {
        let (bridge, _out) = bridge("");
        let err = bridge.handle_prompt("Q", BLOCKING).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InputExhausted {
                read: 0,
                expected: 1
            }
        ));
    }

    #[test]
    fn eof_while_skipping_reports_progress() {
        let (bridge, _out) = bridge("only-one\n");
        bridge.handle_prompt("a", FF).unwrap();
        bridge.handle_prompt("b", FF).unwrap();
        let err = bridge.handle_prompt("c", BLOCKING).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InputExhausted {
                read: 1,
                expected: 3
            }
        ));
    }

    #[test]
    fn strips_crlf_and_accepts_unterminated_last_line() {
        let (bridge, _out) = bridge("first\r\nlast");
        assert_eq!(bridge.handle_prompt("a", BLOCKING).unwrap(), "first");
        assert_eq!(bridge.handle_prompt("b", BLOCKING).unwrap(), "last");
    }

    #[test]
    fn empty_line_is_a_valid_answer() {
        let (bridge, _out) = bridge("\n");
        assert_eq!(bridge.handle_prompt("edit", MmiStyle::Edit1 as u32).unwrap(), "");
    }

    #[test]
    fn legacy_input_is_decoded() {
        let out = SharedBuffer::default();
        let bridge = PromptBridge::new(
            Arc::new(Emitter::new(out)),
            Cursor::new(b"caf\xe9\n".to_vec()),
            PromptPolicy::default(),
            TextEncoding::Windows1252,
        );
        assert_eq!(bridge.handle_prompt("name?", BLOCKING).unwrap(), "café");
    }

    #[test]
    fn custom_policy_changes_fire_and_forget_style() {
        let out = SharedBuffer::default();
        let bridge = PromptBridge::new(
            Arc::new(Emitter::new(out)),
            Cursor::new(b"stale\nreal\n".to_vec()),
            PromptPolicy {
                fire_and_forget_style: BLOCKING,
                fire_and_forget_answer: "ACK".to_string(),
            },
            TextEncoding::Utf8,
        );
        assert_eq!(bridge.handle_prompt("a", BLOCKING).unwrap(), "ACK");
        assert_eq!(bridge.handle_prompt("b", FF).unwrap(), "real");
    }

    #[test]
    fn mmi_style_lookup() {
        assert_eq!(MmiStyle::from_code(0x11141), Some(MmiStyle::OkCancel2));
        assert_eq!(MmiStyle::from_code(0x12040), Some(MmiStyle::Edit1));
        assert_eq!(MmiStyle::from_code(7), None);
        assert_eq!(describe_style(0x11040), "Ok");
        assert_eq!(describe_style(7), "0x7");
    }

    proptest! {
        #[test]
        fn blocking_prompt_reads_one_line_per_pending_skip(
            k in 0usize..32,
            words in proptest::collection::vec("[a-z0-9 ]{0,12}", 34),
        ) {
            let lines: Vec<String> = words
                .iter()
                .enumerate()
                .map(|(i, word)| format!("{i}:{word}"))
                .collect();
            let (bridge, out) = bridge(&format!("{}\n", lines.join("\n")));

            for i in 0..k {
                prop_assert_eq!(bridge.handle_prompt(&format!("ff-{i}"), FF).unwrap(), "OK");
            }
            prop_assert_eq!(bridge.pending_skips(), k);
            prop_assert_eq!(bridge.handle_prompt("blocking", BLOCKING).unwrap(), lines[k].clone());
            prop_assert_eq!(bridge.pending_skips(), 0);

            // Exactly k + 1 lines were consumed.
            prop_assert_eq!(bridge.handle_prompt("next", BLOCKING).unwrap(), lines[k + 1].clone());

            let mut expected: Vec<(String, u64)> =
                (0..k).map(|i| (format!("ff-{i}"), u64::from(FF))).collect();
            expected.push(("blocking".to_string(), u64::from(BLOCKING)));
            expected.push(("next".to_string(), u64::from(BLOCKING)));
            prop_assert_eq!(prompt_records(&out), expected);
        }
    }
}
