//! Outgoing command gate
//!
//! Structural and semantic checks on every non-realtime command before it
//! reaches the transport, plus an optional external fixer that may block,
//! rewrite or prefix a command.

use fluidcnc_core::ValidationError;
use std::fmt;
use std::sync::Arc;

/// Letters a G-code word may start with
const WORD_LETTERS: &str = "ABCDFGHIJKLMNPQRSTXYZ";

/// Verdict from a [`CommandFixer`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixerVerdict {
    /// Refuse the command
    pub blocked: bool,
    /// Why it was blocked or rewritten
    pub reason: Option<String>,
    /// Replacement command
    pub fixed_command: Option<String>,
    /// Trusted commands to send first, in order, without gating
    pub prefix_commands: Vec<String>,
}

impl FixerVerdict {
    /// Let the command through unchanged
    pub fn pass() -> Self {
        Self::default()
    }

    /// Refuse the command
    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Replace the command
    pub fn rewrite(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            fixed_command: Some(command.into()),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Send these commands before the original
    pub fn with_prefix(mut self, commands: Vec<String>) -> Self {
        self.prefix_commands = commands;
        self
    }
}

/// External collaborator consulted for every gated command
pub trait CommandFixer: Send + Sync {
    /// Inspect a command
    fn check(&self, command: &str) -> FixerVerdict;
}

/// A command cleared for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatedCommand {
    /// What to transmit
    pub command: String,
    /// Trusted commands to transmit first
    pub prefix: Vec<String>,
    /// Non-blocking findings
    pub warnings: Vec<String>,
    /// Original text when the fixer rewrote it
    pub rewritten_from: Option<String>,
}

/// One parsed word such as `X-1.5`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Word {
    /// Upper-case letter
    pub letter: char,
    /// Numeric value
    pub value: f64,
}

fn malformed(command: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::Malformed {
        command: command.to_string(),
        reason: reason.into(),
    }
}

fn blocked(command: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::Blocked {
        command: command.to_string(),
        reason: reason.into(),
    }
}

/// Remove `;` trailing comments and `( )` comments, which may nest.
/// Shared by the gate and the program normalizer.
pub fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Split a G-code line into words. A number is an optional sign, digits and
/// an optional fraction; exponents and repeated points are rejected.
pub fn parse_words(command: &str) -> Result<Vec<Word>, ValidationError> {
    let body = strip_comments(command);
    let chars: Vec<char> = body.chars().collect();
    let mut words = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            return Err(malformed(command, format!("unexpected '{}'", c)));
        }
        let letter = c.to_ascii_uppercase();
        if !WORD_LETTERS.contains(letter) {
            return Err(malformed(command, format!("unsupported word '{}'", letter)));
        }
        i += 1;
        while i < chars.len() && chars[i] == ' ' {
            i += 1;
        }

        let start = i;
        if i < chars.len() && (chars[i] == '-' || chars[i] == '+') {
            i += 1;
        }
        let mut digits = 0;
        let mut points = 0;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
            if chars[i] == '.' {
                points += 1;
            } else {
                digits += 1;
            }
            i += 1;
        }
        let text: String = chars[start..i].iter().collect();
        if digits == 0 || points > 1 {
            return Err(malformed(
                command,
                format!("bad number '{}' after {}", text, letter),
            ));
        }
        let value = text
            .parse::<f64>()
            .map_err(|_| malformed(command, format!("bad number '{}' after {}", text, letter)))?;
        words.push(Word { letter, value });
    }

    Ok(words)
}

fn has_word(words: &[Word], letter: char, value: f64) -> bool {
    words
        .iter()
        .any(|w| w.letter == letter && (w.value - value).abs() < 1e-9)
}

/// Spindle-on (`M3`/`M4`) present
pub fn is_spindle_on(words: &[Word]) -> bool {
    has_word(words, 'M', 3.0) || has_word(words, 'M', 4.0)
}

/// Whether a command is a motion command blocked by the e-stop lockout
pub fn is_locked_motion(command: &str) -> bool {
    let trimmed = command.trim().to_ascii_uppercase();
    if trimmed.starts_with("$J=") {
        return true;
    }
    parse_words(&trimmed).is_ok_and(|words| is_spindle_on(&words))
}

/// The command gate
#[derive(Clone, Default)]
pub struct SafetyGate {
    fixer: Option<Arc<dyn CommandFixer>>,
}

impl fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetyGate")
            .field("fixer", &self.fixer.is_some())
            .finish()
    }
}

impl SafetyGate {
    /// Gate without a fixer
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or remove the fixer
    pub fn set_fixer(&mut self, fixer: Option<Arc<dyn CommandFixer>>) {
        self.fixer = fixer;
    }

    /// Whether a fixer is installed
    pub fn has_fixer(&self) -> bool {
        self.fixer.is_some()
    }

    /// Structural check only
    pub fn check_structure(&self, command: &str) -> Result<(), ValidationError> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(malformed(command, "empty command"));
        }
        if trimmed.contains('\n') || trimmed.contains('\r') {
            return Err(malformed(command, "embedded line break"));
        }
        if let Some(system) = trimmed.strip_prefix('$') {
            if let Some(jog) = system.strip_prefix("J=").or_else(|| system.strip_prefix("j=")) {
                let words = parse_words(jog)?;
                if words.is_empty() {
                    return Err(malformed(command, "empty jog"));
                }
            } else if let Some((number, value)) = system.split_once('=') {
                if number.starts_with(|c: char| c.is_ascii_digit()) {
                    if number.trim().parse::<u16>().is_err() {
                        return Err(malformed(command, "bad setting number"));
                    }
                    if value.trim().is_empty() {
                        return Err(malformed(command, "setting without a value"));
                    }
                }
            }
            return Ok(());
        }
        parse_words(trimmed).map(|_| ())
    }

    /// Structural and semantic check. Returns warnings.
    pub fn validate(&self, command: &str) -> Result<Vec<String>, ValidationError> {
        self.check_structure(command)?;
        let trimmed = command.trim();
        let words = match trimmed.strip_prefix('$') {
            Some(system) => match system.strip_prefix("J=").or_else(|| system.strip_prefix("j=")) {
                Some(jog) => parse_words(jog)?,
                None => return Ok(Vec::new()),
            },
            None => parse_words(trimmed)?,
        };

        let mut warnings = Vec::new();
        for word in &words {
            match word.letter {
                'F' if word.value <= 0.0 => {
                    return Err(blocked(command, "feed rate must be positive"))
                }
                'S' if word.value < 0.0 => {
                    return Err(blocked(command, "spindle speed must not be negative"))
                }
                _ => {}
            }
        }
        if is_spindle_on(&words) && !words.iter().any(|w| w.letter == 'S') {
            warnings.push("spindle on without an S speed".to_string());
        }
        Ok(warnings)
    }

    /// Full gate: structure, fixer, semantics on the final command, lockout.
    pub fn check(
        &self,
        command: &str,
        motion_locked: bool,
    ) -> Result<GatedCommand, ValidationError> {
        let original = command.trim();
        self.check_structure(original)?;

        let mut gated = GatedCommand {
            command: original.to_string(),
            prefix: Vec::new(),
            warnings: Vec::new(),
            rewritten_from: None,
        };

        if let Some(fixer) = &self.fixer {
            let verdict = fixer.check(original);
            if verdict.blocked {
                return Err(blocked(
                    original,
                    verdict
                        .reason
                        .unwrap_or_else(|| "blocked by fixer".to_string()),
                ));
            }
            if let Some(fixed) = verdict.fixed_command {
                let fixed = fixed.trim().to_string();
                if fixed != original {
                    tracing::warn!(
                        "Rewrote '{}' as '{}'{}",
                        original,
                        fixed,
                        verdict
                            .reason
                            .as_deref()
                            .map(|r| format!(": {}", r))
                            .unwrap_or_default()
                    );
                    gated.rewritten_from = Some(original.to_string());
                    gated.command = fixed;
                }
            }
            gated.prefix = verdict.prefix_commands;
        }

        gated.warnings = self.validate(&gated.command)?;

        if motion_locked && is_locked_motion(&gated.command) {
            return Err(ValidationError::MotionLocked {
                command: gated.command,
            });
        }

        Ok(gated)
    }
}
