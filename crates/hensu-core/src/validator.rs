//! Agent output validation: size and safety checks run on every agent
//! response before it enters history or rubric evaluation (§4.9).

use crate::{HensuError, Result};

/// 1 MiB, matching the payload ceiling named in the spec.
const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

const BIDI_CONTROL_CHARS: [char; 9] = [
    '\u{202A}', '\u{202B}', '\u{202C}', '\u{202D}', '\u{202E}', '\u{2066}', '\u{2067}', '\u{2068}',
    '\u{2069}',
];
const ZERO_WIDTH_JOINER: char = '\u{200D}';
const ZERO_WIDTH_SPACE: char = '\u{200B}';

/// Validates raw agent output before it is trusted by the pipeline.
/// Stateless; safe to share across executions.
pub struct AgentOutputValidator;

impl AgentOutputValidator {
    /// Reject oversized payloads, embedded control characters (other
    /// than common whitespace), and bidi/zero-width obfuscation
    /// sequences that could be used to smuggle hidden instructions.
    pub fn validate(&self, output: &str) -> Result<()> {
        if output.len() > MAX_PAYLOAD_BYTES {
            return Err(HensuError::UnsafeAgentOutput(format!(
                "output exceeds {MAX_PAYLOAD_BYTES} byte limit"
            )));
        }

        for ch in output.chars() {
            if ch.is_control() && !matches!(ch, '\n' | '\r' | '\t') {
                return Err(HensuError::UnsafeAgentOutput(format!(
                    "control character U+{:04X} not permitted in agent output",
                    ch as u32
                )));
            }
            if BIDI_CONTROL_CHARS.contains(&ch) {
                return Err(HensuError::UnsafeAgentOutput(
                    "bidirectional control character not permitted in agent output".into(),
                ));
            }
            if ch == ZERO_WIDTH_JOINER || ch == ZERO_WIDTH_SPACE {
                return Err(HensuError::UnsafeAgentOutput(
                    "zero-width character not permitted in agent output".into(),
                ));
            }
        }

        Ok(())
    }
}
