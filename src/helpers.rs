use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Default)]
pub(crate) enum TerminalQueryState {
    #[default]
    Idle,
    Esc,
    Csi,
    CsiQmark,
    Csi6,
    CsiQmark6,
}

#[derive(Debug, Default)]
pub(crate) struct TerminalQueryParser {
    pub(crate) state: TerminalQueryState,
}

impl TerminalQueryParser {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<&'static [u8]> {
        const ESC: u8 = 0x1b;
        const CSI: u8 = b'[';
        const QMARK: u8 = b'?';
        const SIX: u8 = b'6';
        const N: u8 = b'n';

        let mut out = Vec::new();
        for byte in chunk {
            self.state = match (self.state, *byte) {
                (_, ESC) => TerminalQueryState::Esc,
                (TerminalQueryState::Esc, CSI) => TerminalQueryState::Csi,
                (TerminalQueryState::Csi, QMARK) => TerminalQueryState::CsiQmark,
                (TerminalQueryState::Csi, SIX) => TerminalQueryState::Csi6,
                (TerminalQueryState::CsiQmark, SIX) => TerminalQueryState::CsiQmark6,
                (TerminalQueryState::Csi6, N) => {
                    out.push(b"\x1b[1;1R".as_slice());
                    TerminalQueryState::Idle
                }
                (TerminalQueryState::CsiQmark6, N) => {
                    out.push(b"\x1b[?1;1R".as_slice());
                    TerminalQueryState::Idle
                }
                _ => TerminalQueryState::Idle,
            };
        }
        out
    }
}

#[cfg(test)]
pub(crate) fn terminal_query_responses(chunk: &[u8]) -> Vec<&'static [u8]> {
    let mut parser = TerminalQueryParser::default();
    parser.feed(chunk)
}

pub(crate) fn format_injection(from: &str, event_id: &str, body: &str, target: &str) -> String {
    // If body is already formatted (from orchestrator), don't double-wrap
    if body.starts_with("Relay message from ") {
        return body.to_string();
    }
    if target.starts_with('#') {
        format!("Relay message from {} in {} [{}]: {}", from, target, event_id, body)
    } else {
        format!("Relay message from {} [{}]: {}", from, event_id, body)
    }
}

/// Find the nearest character boundary at or before the given byte index.
pub(crate) fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Strip ANSI escape sequences from text for robust pattern matching.
pub(crate) fn strip_ansi(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    while let Some(&nc) = chars.peek() {
                        chars.next();
                        if nc.is_ascii_alphabetic() || nc == '@' || nc == '`' {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(nc) = chars.next() {
                        if nc == '\x07' {
                            break;
                        }
                        if nc == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some('(' | ')' | '*' | '+') => {
                    chars.next();
                    chars.next();
                }
                Some(c) if *c >= '0' && *c <= '~' => {
                    chars.next();
                }
                _ => {}
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Detect Claude Code --dangerously-skip-permissions confirmation prompt.
/// Returns (has_bypass_ref, has_confirmation).
pub(crate) fn detect_bypass_permissions_prompt(clean_output: &str) -> (bool, bool) {
    let lower = clean_output.to_lowercase();
    let has_bypass_ref =
        (lower.contains("bypass") && lower.contains("permission")) || lower.contains("dangerously");
    let has_confirmation = lower.contains("(yes/no)")
        || lower.contains("(y/n)")
        || (lower.contains("proceed") && lower.contains("yes"))
        || (lower.contains("accept") && lower.contains("risk"))
        || (lower.contains("accept") && lower.contains("no,") && lower.contains("exit"));
    (has_bypass_ref, has_confirmation)
}

/// Check if the bypass permissions prompt is in selection menu format.
pub(crate) fn is_bypass_selection_menu(clean_output: &str) -> bool {
    let lower = clean_output.to_lowercase();
    let has_accept = lower.contains("accept");
    let has_exit_option = lower.contains("exit");
    let has_enter_confirm = lower.contains("enter") && lower.contains("confirm");
    has_accept && has_exit_option && has_enter_confirm
}

/// Detect if the agent is in an editor mode (vim INSERT, nano, etc.).
/// When in editor mode, auto-Enter should be suppressed.
pub(crate) fn is_in_editor_mode(recent_output: &str) -> bool {
    let clean = strip_ansi(recent_output);
    let last_output = if clean.len() > 500 {
        let start = floor_char_boundary(&clean, clean.len() - 500);
        &clean[start..]
    } else {
        &clean
    };

    // Claude CLI status bar with mode indicator - NOT vim
    let claude_ui_chars = ['⏵', '⏴', '►', '▶'];
    let has_claude_ui = last_output.chars().any(|c| claude_ui_chars.contains(&c));
    if has_claude_ui
        && (last_output.contains("-- INSERT --")
            || last_output.contains("-- NORMAL --")
            || last_output.contains("-- VISUAL --"))
    {
        return false;
    }

    // Vim/Neovim mode indicators
    let vim_patterns = [
        "-- INSERT --",
        "-- REPLACE --",
        "-- VISUAL --",
        "-- VISUAL LINE --",
        "-- VISUAL BLOCK --",
        "-- SELECT --",
        "-- TERMINAL --",
    ];
    for pattern in vim_patterns {
        if let Some(pos) = last_output.rfind(pattern) {
            let after_pattern = &last_output[pos + pattern.len()..];
            let trimmed = after_pattern.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('\n') {
                return true;
            }
        }
    }

    // Nano / Emacs / pager indicators
    if last_output.contains("GNU nano") || last_output.contains("^G Get Help") {
        return true;
    }
    if last_output.contains("(END)") || last_output.contains("--More--") {
        return true;
    }

    false
}

/// Detect Codex model upgrade/selection prompt in output.
pub(crate) fn detect_codex_model_prompt(clean_output: &str) -> (bool, bool) {
    let lower = clean_output.to_lowercase();
    let has_upgrade_ref = (lower.contains("codex") && lower.contains("upgrade"))
        || (lower.contains("codex") && lower.contains("new") && lower.contains("model"))
        || (lower.contains("just") && lower.contains("got") && lower.contains("upgrade"));
    let has_model_options = lower.contains("try") && lower.contains("existing");
    (has_upgrade_ref, has_model_options)
}

/// Detect Gemini "Action Required" permission prompt in output.
pub(crate) fn detect_gemini_action_required(clean_output: &str) -> (bool, bool) {
    let has_header = clean_output.contains("Action Required");
    let has_allow_option =
        clean_output.contains("Allow once") || clean_output.contains("Allow for this session");
    (has_header, has_allow_option)
}

/// Detect Claude Code auto-suggestion ghost text.
pub(crate) fn is_auto_suggestion(output: &str) -> bool {
    let has_cursor_ghost = output.contains("\x1b[7m") && output.contains("\x1b[27m\x1b[2m");
    let has_send_hint = output.contains("↵ send");
    has_cursor_ghost || has_send_hint
}

/// Split a configured CLI command into its resolved binary and inline args,
/// e.g. `"claude --model sonnet"` -> `("claude", ["--model", "sonnet"])`.
pub(crate) fn parse_cli_command(cli: &str) -> Result<(String, Vec<String>)> {
    let trimmed = cli.trim();
    if trimmed.is_empty() {
        anyhow::bail!("empty CLI command");
    }
    let mut tokens = shlex::split(trimmed)
        .ok_or_else(|| anyhow::anyhow!("unable to tokenize CLI command '{trimmed}'"))?;
    if tokens.is_empty() {
        anyhow::bail!("empty CLI command");
    }
    let resolved = tokens.remove(0);
    Ok((resolved, tokens))
}

/// Reduce a resolved CLI path to the short name used for display and
/// per-CLI behavior lookups, e.g. `"/usr/local/bin/claude:sonnet"` -> `"claude"`.
pub(crate) fn normalize_cli_name(resolved_cli: &str) -> String {
    let basename = resolved_cli
        .rsplit(['/', '\\'])
        .next()
        .filter(|part| !part.is_empty())
        .unwrap_or(resolved_cli);
    basename.split(':').next().unwrap_or(basename).to_string()
}

const MIN_STARTUP_BYTES: usize = 1;
const READY_PROMPT_WINDOW_BYTES: usize = 800;

/// Generic CLI-readiness check used when a CLI has no special boot sequence
/// to wait for (contrast with the Codex relaycast-boot gate).
pub(crate) fn detect_cli_ready(cli: &str, startup_output: &str, startup_total_bytes: usize) -> bool {
    if startup_total_bytes < MIN_STARTUP_BYTES {
        return false;
    }
    let lower_cli = cli.to_ascii_lowercase();
    let clean = strip_ansi(startup_output);
    if clean.trim().is_empty() {
        return false;
    }
    let region = if clean.len() > READY_PROMPT_WINDOW_BYTES {
        let start = floor_char_boundary(&clean, clean.len() - READY_PROMPT_WINDOW_BYTES);
        &clean[start..]
    } else {
        clean.as_str()
    };

    let mut patterns = vec!["> ", "$ ", ">>> ", "›"];
    if lower_cli.contains("codex") {
        patterns.push("codex> ");
    }
    if patterns.iter().any(|pattern| region.contains(pattern)) {
        return true;
    }
    region.lines().rev().take(6).any(|line| {
        let trimmed = line.trim();
        matches!(trimmed, "›" | ">" | "$" | ">>>")
            || (lower_cli.contains("codex") && trimmed.eq_ignore_ascii_case("codex>"))
    })
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Check whether an injected message's text has echoed back through the
/// PTY, tolerating the ANSI reflow and line-wrapping terminals introduce.
pub(crate) fn check_echo_in_output(echo_buffer: &str, expected_echo: &str) -> bool {
    let normalized_expected = normalize_whitespace(&strip_ansi(expected_echo));
    if normalized_expected.is_empty() {
        return false;
    }
    let normalized_buffer = normalize_whitespace(&strip_ansi(echo_buffer));
    normalized_buffer.contains(&normalized_expected)
}

pub(crate) fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub(crate) fn delivery_queued_event_payload(
    delivery_id: &str,
    event_id: &str,
    worker_name: &str,
    ts_ms: u64,
) -> Value {
    json!({
        "delivery_id": delivery_id,
        "event_id": event_id,
        "agent": worker_name,
        "ts_ms": ts_ms,
    })
}

pub(crate) fn delivery_injected_event_payload(
    delivery_id: &str,
    event_id: &str,
    worker_name: &str,
    ts_ms: u64,
) -> Value {
    json!({
        "delivery_id": delivery_id,
        "event_id": event_id,
        "agent": worker_name,
        "ts_ms": ts_ms,
    })
}

/// Wrap a relay message for PTY injection, adding a one-line MCP reminder
/// when the worker hasn't used the relaycast tools recently.
pub(crate) fn format_injection_for_worker(
    from: &str,
    event_id: &str,
    body: &str,
    target: &str,
    include_mcp_reminder: bool,
    worker_pre_registered: bool,
    assigned_worker_name: Option<&str>,
) -> String {
    let mut injection = format_injection(from, event_id, body, target);
    if include_mcp_reminder {
        if worker_pre_registered {
            match assigned_worker_name {
                Some(name) => injection.push_str(&format!(
                    "\n\n(reminder: reply using the relaycast MCP tools as {name})"
                )),
                None => injection.push_str(
                    "\n\n(reminder: reply using the relaycast MCP tools)",
                ),
            }
        } else {
            injection.push_str(
                "\n\n(reminder: register with the relaycast MCP server, then reply using its tools)",
            );
        }
    }
    injection
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContinuityAction {
    Summary,
    Handoff,
}

impl ContinuityAction {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ContinuityAction::Summary => "summary",
            ContinuityAction::Handoff => "handoff",
        }
    }
}

/// Detect a `KIND: SUMMARY` / `KIND: HANDOFF` marker block the agent prints
/// to hand continuity context back to the broker, returning the action, the
/// block's content, and how many bytes of `buffer` it consumed.
pub(crate) fn parse_continuity_command(buffer: &str) -> Option<(ContinuityAction, String, usize)> {
    let marker_pos = buffer.find("KIND:")?;
    let after_marker = &buffer[marker_pos + "KIND:".len()..];
    let header_end = after_marker.find('\n')?;
    let action = match after_marker[..header_end].trim().to_ascii_uppercase().as_str() {
        "SUMMARY" => ContinuityAction::Summary,
        "HANDOFF" => ContinuityAction::Handoff,
        _ => return None,
    };

    let content_start = marker_pos + "KIND:".len() + header_end + 1;
    let rest = &buffer[content_start..];
    let (content, content_len) = match rest.find("\n\n") {
        Some(end) => (rest[..end].trim().to_string(), end + 2),
        None if rest.ends_with('\n') => (rest.trim().to_string(), rest.len()),
        None => return None, // still streaming; wait for more output
    };
    if content.is_empty() {
        return None;
    }
    Some((action, content, content_start + content_len))
}

/// How long a worker waits for PTY echo to confirm an injected delivery.
pub(crate) const VERIFICATION_WINDOW: Duration = Duration::from_secs(5);
/// Retry budget for echo verification in wrap mode (tracing-only, no broker ack).
pub(crate) const MAX_VERIFICATION_ATTEMPTS: u32 = 3;
/// How long after echo verification we keep watching output for activity patterns.
pub(crate) const ACTIVITY_WINDOW: Duration = Duration::from_secs(30);
pub(crate) const ACTIVITY_BUFFER_MAX_BYTES: usize = 8_000;
pub(crate) const ACTIVITY_BUFFER_KEEP_BYTES: usize = 4_000;

const DEFAULT_DELAY_MS: u64 = 50;
const MIN_DELAY_MS: u64 = 20;
const MAX_DELAY_MS: u64 = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    Success,
    Failed,
}

/// Simple inject-pacing state: speeds up after successful echo
/// verifications, backs off after failures.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThrottleState {
    delay_ms: u64,
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl ThrottleState {
    pub(crate) fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub(crate) fn record(&mut self, outcome: DeliveryOutcome) {
        self.delay_ms = match outcome {
            DeliveryOutcome::Success => (self.delay_ms * 85 / 100).max(MIN_DELAY_MS),
            DeliveryOutcome::Failed => (self.delay_ms * 13 / 10).min(MAX_DELAY_MS),
        };
    }
}

/// Pending echo verification for one PTY injection.
#[derive(Debug)]
pub(crate) struct PendingVerification {
    pub(crate) delivery_id: String,
    pub(crate) event_id: String,
    pub(crate) expected_echo: String,
    pub(crate) injected_at: Instant,
    pub(crate) attempts: u32,
    pub(crate) max_attempts: u32,
    pub(crate) request_id: Option<String>,
    pub(crate) from: String,
    pub(crate) body: String,
    pub(crate) target: String,
}

/// Per-CLI output patterns indicating the agent is actively working on a
/// delivery, used to emit `delivery_active` after echo verification.
#[derive(Debug, Clone)]
pub(crate) struct ActivityDetector {
    patterns: &'static [&'static str],
}

impl ActivityDetector {
    pub(crate) fn for_cli(cli: &str) -> Self {
        let lower = cli.to_ascii_lowercase();
        let patterns: &'static [&'static str] = if lower.contains("claude") {
            &["⏺", "Running…", "Tool use:"]
        } else if lower.contains("codex") {
            &["• Reading", "• Running", "thinking"]
        } else if lower.contains("gemini") {
            &["Action Required", "Running"]
        } else {
            &["Running", "Executing", "Thinking"]
        };
        Self { patterns }
    }

    pub(crate) fn detect_activity(&self, output_buffer: &str, expected_echo: &str) -> Option<String> {
        let clean = strip_ansi(output_buffer);
        let trimmed = clean.trim();
        if trimmed.is_empty() || trimmed == strip_ansi(expected_echo).trim() {
            return None;
        }
        self.patterns
            .iter()
            .find(|pattern| clean.contains(*pattern))
            .map(|pattern| pattern.to_string())
    }
}

/// Output accumulated after echo verification, watched for activity patterns.
#[derive(Debug)]
pub(crate) struct PendingActivity {
    pub(crate) delivery_id: String,
    pub(crate) event_id: String,
    pub(crate) expected_echo: String,
    pub(crate) verified_at: Instant,
    pub(crate) output_buffer: String,
    pub(crate) detector: ActivityDetector,
}
