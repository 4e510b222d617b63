// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming state classifier: raw terminal bytes in, discrete agent state
//! transitions out.
//!
//! Pure in-memory; one opaque block per session. The supervisor feeds output
//! chunks and drives the idle timer, so this module never touches I/O or
//! spawns tasks of its own.

use std::collections::HashMap;

use regex::Regex;
use tokio::time::Instant;

use crate::store::AgentState;
use crate::utf8::Utf8Stream;

/// Rolling plain-text window size, in characters.
pub const WINDOW_CHARS: usize = 2048;

/// A session stuck in `working` with no output for this long falls to `idle`.
pub const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Accumulated time per state, milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateTotals {
    pub working_ms: u64,
    pub idle_ms: u64,
    pub permission_wait_ms: u64,
}

/// Snapshot returned by a metrics query.
#[derive(Debug, Clone, Copy)]
pub struct StateMetrics {
    pub state: AgentState,
    pub totals: StateTotals,
    /// Elapsed time in the current state.
    pub current_state_ms: u64,
}

/// Result of feeding one chunk through the classifier.
#[derive(Debug, Default)]
pub struct FeedOutcome {
    /// `(prev, new)` when the chunk caused a transition.
    pub transition: Option<(AgentState, AgentState)>,
    /// When the session is in `working` after this chunk, the timer
    /// generation to arm a 30 s single-shot for. Any later chunk bumps the
    /// generation, implicitly cancelling the pending timer.
    pub arm_idle: Option<u64>,
}

struct PatternGroup {
    state: AgentState,
    regexes: Vec<Regex>,
}

/// Compiled pattern groups, one per target state.
///
/// Each group is a disjunction; among matching groups the one with the
/// rightmost match end wins (latest-match-wins).
pub struct Patterns {
    groups: Vec<PatternGroup>,
}

impl Patterns {
    pub fn new() -> anyhow::Result<Self> {
        let group = |state: AgentState, exprs: &[&str]| -> anyhow::Result<PatternGroup> {
            let regexes = exprs
                .iter()
                .map(|e| Regex::new(&format!("(?i){e}")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PatternGroup { state, regexes })
        };

        Ok(Self {
            groups: vec![
                // Prompt glyph at the end of the window, whitespace allowed after.
                group(AgentState::Idle, &[r"\u{276F}\s*$"])?,
                group(
                    AgentState::Working,
                    &[
                        r"\u{273B}",
                        r"\b(thinking|working|channeling)(\.\.\.|\u{2026})",
                        r"\b(reading|writing|editing|running|searching)\s+\S+",
                    ],
                )?,
                group(
                    AgentState::Compacting,
                    &[r"compacting conversation", r"\u{00B7}\s*compacting"],
                )?,
                group(
                    AgentState::PermissionNeeded,
                    &[
                        r"do you want to proceed\?",
                        r"\u{23F5}\u{23F5}\s*accept",
                        r"allow (once|always)",
                        r"\(y\)es",
                        r"yes\s*/\s*no",
                        r"deny[^\n]*allow",
                        r"press enter to confirm",
                        r"trust this folder",
                        r"enter to confirm",
                        r"yes, i trust",
                        r"quick safety check",
                        r"bypass permissions mode",
                        r"yes, i accept",
                    ],
                )?,
                group(
                    AgentState::Error,
                    &[
                        // Line-anchored so code the agent merely displays
                        // (e.g. `console.log("Error: ...")`) does not match.
                        r"(?m)^error:",
                        r"\bAPIError\b",
                        r"overloaded",
                        r"rate limit",
                        r"\b(ENOENT|EACCES|EPERM|ECONNREFUSED)\b",
                        r"(spawn|exec)\s+\S+\s+ENOENT",
                        r"authentication failed",
                        r"invalid[^\n]*api[^\n]*key",
                    ],
                )?,
            ],
        })
    }

    /// Classify the window. Returns the winning group's state, or `None`
    /// when no group matches.
    pub fn classify(&self, window: &str) -> Option<AgentState> {
        let mut best: Option<(usize, AgentState)> = None;
        for group in &self.groups {
            let mut latest: Option<usize> = None;
            for re in &group.regexes {
                if let Some(m) = re.find_iter(window).last() {
                    latest = Some(latest.map_or(m.end(), |l: usize| l.max(m.end())));
                }
            }
            if let Some(end) = latest {
                // Strictly greater: earlier groups win ties.
                if best.map_or(true, |(b, _)| end > b) {
                    best = Some((end, group.state));
                }
            }
        }
        best.map(|(_, state)| state)
    }
}

struct SessionBlock {
    window: String,
    /// Chunk boundaries are arbitrary; this carries a glyph split across
    /// two reads so the window never sees replacement characters for it.
    utf8: Utf8Stream,
    state: AgentState,
    entered_at: Instant,
    idle_gen: u64,
    totals: StateTotals,
}

impl SessionBlock {
    fn new() -> Self {
        Self {
            window: String::new(),
            utf8: Utf8Stream::new(),
            state: AgentState::Starting,
            entered_at: Instant::now(),
            idle_gen: 0,
            totals: StateTotals::default(),
        }
    }

    /// Credit elapsed time in the current state to its counter, then restart
    /// the clock.
    fn accumulate(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.entered_at).as_millis() as u64;
        match self.state {
            AgentState::Working => self.totals.working_ms += elapsed,
            AgentState::Idle => self.totals.idle_ms += elapsed,
            AgentState::PermissionNeeded => self.totals.permission_wait_ms += elapsed,
            AgentState::Starting | AgentState::Compacting | AgentState::Error => {}
        }
        self.entered_at = now;
    }
}

/// Per-supervisor detector holding one block per session.
pub struct StateDetector {
    patterns: Patterns,
    sessions: HashMap<String, SessionBlock>,
}

impl StateDetector {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self { patterns: Patterns::new()?, sessions: HashMap::new() })
    }

    /// Register a session in `starting` state.
    pub fn add(&mut self, id: &str) {
        self.sessions.insert(id.to_string(), SessionBlock::new());
    }

    /// Drop a session's block. Any pending idle timer generation becomes
    /// stale and will be ignored when it fires.
    pub fn remove(&mut self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn state(&self, id: &str) -> Option<AgentState> {
        self.sessions.get(id).map(|b| b.state)
    }

    pub fn totals(&self, id: &str) -> Option<StateTotals> {
        self.sessions.get(id).map(|b| b.totals)
    }

    /// Accumulated totals plus elapsed time in the current state.
    pub fn metrics(&self, id: &str) -> Option<StateMetrics> {
        self.sessions.get(id).map(|b| StateMetrics {
            state: b.state,
            totals: b.totals,
            current_state_ms: Instant::now().duration_since(b.entered_at).as_millis() as u64,
        })
    }

    /// Feed one output chunk through a session's classifier.
    pub fn feed(&mut self, id: &str, data: &[u8]) -> FeedOutcome {
        let Some(block) = self.sessions.get_mut(id) else {
            return FeedOutcome::default();
        };

        let decoded = block.utf8.decode(data);
        let text = strip_controls(&decoded);
        block.window.push_str(&text);
        trim_window(&mut block.window, WINDOW_CHARS);

        // No match: a starting session stays starting, a running one falls
        // to working.
        let fallback = if block.state == AgentState::Starting {
            AgentState::Starting
        } else {
            AgentState::Working
        };
        let target = self.patterns.classify(&block.window).unwrap_or(fallback);

        // Every chunk invalidates any pending idle timer.
        block.idle_gen += 1;

        let transition = if target != block.state {
            let now = Instant::now();
            block.accumulate(now);
            let prev = block.state;
            block.state = target;
            Some((prev, target))
        } else {
            None
        };

        let arm_idle = (block.state == AgentState::Working).then_some(block.idle_gen);
        FeedOutcome { transition, arm_idle }
    }

    /// Idle timer fired for the given generation. Transitions `working → idle`
    /// when the timer is still current; stale generations are ignored.
    pub fn idle_timeout(&mut self, id: &str, gen: u64) -> Option<(AgentState, AgentState)> {
        let block = self.sessions.get_mut(id)?;
        if block.idle_gen != gen || block.state != AgentState::Working {
            return None;
        }
        block.accumulate(Instant::now());
        block.state = AgentState::Idle;
        Some((AgentState::Working, AgentState::Idle))
    }
}

/// Keep only the most recent `max` characters of the window.
fn trim_window(window: &mut String, max: usize) {
    let count = window.chars().count();
    if count <= max {
        return;
    }
    let excess = count - max;
    if let Some((byte_off, _)) = window.char_indices().nth(excess) {
        window.drain(..byte_off);
    }
}

/// Strip terminal control sequences, retaining plain text.
///
/// Handles CSI (`ESC [ … finalByte`, including private-mode parameters),
/// OSC (`ESC ] … BEL` or `ESC ] … ESC \`), two-byte charset designators
/// (`ESC ( X` / `ESC ) X`), and drops any other two-byte escape.
pub fn strip_controls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            if c != '\u{07}' {
                out.push(c);
            }
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // Parameter and intermediate bytes, then one final byte.
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{07}' {
                        break;
                    }
                    if c == '\u{1b}' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            Some('(') | Some(')') => {
                chars.next();
                chars.next();
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

#[cfg(test)]
#[path = "detector_tests.rs"]
mod tests;
