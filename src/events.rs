//! Protocol records written to the orchestrator stream.
//!
//! Every engine callback that the external orchestrator needs to see becomes
//! one JSON object on its own line. The emitter is shared between the
//! orchestrator thread and the engine's callback threads; a single lock is
//! held while a whole record is written so lines never interleave.

use std::fmt;
use std::io::{self, Write};
use std::sync::Mutex;

use serde::{Serialize, Serializer};
use tracing::trace;

/// 48-bit hardware address of the engine's radio dongle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    pub fn new(value: [u8; 6]) -> Self {
        Self(value)
    }

    /// Build from the engine's integer form. Bits above 48 are ignored.
    pub fn from_u64(raw: u64) -> Self {
        let bytes = raw.to_be_bytes();
        Self([bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

/// Twelve uppercase hex digits, no separators.
impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl Serialize for BdAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One record of the output protocol.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Dongle address, reported once before the test case starts.
    Addr { value: BdAddr },
    /// The engine asked the operator something.
    ImplicitSend { description: String, style: u32 },
    /// A log callback from the engine.
    Log {
        time: String,
        description: String,
        message: String,
        logtype: i32,
    },
}

/// Line-atomic JSON writer for [`Event`]s.
pub struct Emitter {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl Emitter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Serialize `event` and write it as one line.
    ///
    /// The record is rendered before the lock is taken and written with a
    /// single `write_all`, then flushed so the orchestrator sees it at once.
    pub fn emit(&self, event: &Event) -> io::Result<()> {
        let mut line = serde_json::to_vec(event).map_err(io::Error::other)?;
        line.push(b'\n');

        trace!(record = %String::from_utf8_lossy(&line[..line.len() - 1]), "emit");

        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writer.write_all(&line)?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::SharedBuffer;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn bd_addr_formats_as_twelve_uppercase_hex_digits() {
        let addr = BdAddr::from_u64(0x0000_001B_DC06_A1F2);
        assert_eq!(addr.to_string(), "001BDC06A1F2");
        assert_eq!(BdAddr::from_u64(0).to_string(), "000000000000");
    }

    #[test]
    fn bd_addr_ignores_upper_bits() {
        let addr = BdAddr::from_u64(0xFFFF_0102_0304_0506);
        assert_eq!(addr.octets(), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn addr_record_shape() {
        let json = serde_json::to_string(&Event::Addr {
            value: BdAddr::new([0x00, 0x1b, 0xdc, 0x06, 0xa1, 0xf2]),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"addr","value":"001BDC06A1F2"}"#);
    }

    #[test]
    fn implicit_send_record_shape() {
        let value = serde_json::to_value(Event::ImplicitSend {
            description: "Press OK".to_string(),
            style: 0x11141,
        })
        .unwrap();
        assert_eq!(value["type"], "implicit_send");
        assert_eq!(value["description"], "Press OK");
        assert_eq!(value["style"], 0x11141);
    }

    #[test]
    fn log_record_shape() {
        let value = serde_json::to_value(Event::Log {
            time: "12:00:01.123".to_string(),
            description: "Final Verdict".to_string(),
            message: "VERDICT/PASS".to_string(),
            logtype: 5,
        })
        .unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["time"], "12:00:01.123");
        assert_eq!(value["description"], "Final Verdict");
        assert_eq!(value["message"], "VERDICT/PASS");
        assert_eq!(value["logtype"], 5);
    }

    #[test]
    fn control_characters_are_escaped() {
        let json = serde_json::to_string(&Event::ImplicitSend {
            description: "a\"b\\c\nd\te\u{1}f".to_string(),
            style: 1,
        })
        .unwrap();
        assert!(json.contains(r#"a\"b\\c\nd\te\u0001f"#), "{json}");
        assert!(!json.contains('\n'));
    }

    #[test]
    fn emit_writes_one_line_per_record() {
        let buffer = SharedBuffer::default();
        let emitter = Emitter::new(buffer.clone());

        emitter
            .emit(&Event::Addr {
                value: BdAddr::from_u64(1),
            })
            .unwrap();
        emitter
            .emit(&Event::ImplicitSend {
                description: "multi\nline".to_string(),
                style: 2,
            })
            .unwrap();

        let lines = buffer.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"addr\""));
        assert!(lines[1].contains("multi\\nline"));
    }

    #[test]
    fn concurrent_emits_never_interleave() {
        let buffer = SharedBuffer::default();
        let emitter = Arc::new(Emitter::new(buffer.clone()));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let emitter = Arc::clone(&emitter);
                thread::spawn(move || {
                    let payload = format!("{worker}").repeat(512);
                    for i in 0..100 {
                        emitter
                            .emit(&Event::Log {
                                time: i.to_string(),
                                description: payload.clone(),
                                message: payload.clone(),
                                logtype: worker,
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let lines = buffer.lines();
        assert_eq!(lines.len(), 400);
        for line in &lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            let worker = value["logtype"].as_i64().unwrap().to_string();
            let expected = worker.repeat(512);
            assert_eq!(value["description"], expected.as_str());
            assert_eq!(value["message"], expected.as_str());
        }
    }

    proptest! {
        #[test]
        fn escaped_text_decodes_back(text in "[\\x00-\\x1f\"\\\\a-z\u{80}-\u{ff}]{0,40}") {
            let json = serde_json::to_string(&Event::ImplicitSend {
                description: text.clone(),
                style: 0,
            })
            .unwrap();
            prop_assert!(!json.bytes().any(|b| b < 0x20));
            let value: serde_json::Value = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(value["description"].as_str().unwrap(), text.as_str());
        }
    }
}
