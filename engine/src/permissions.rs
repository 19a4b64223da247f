//! Permission pipeline: decides allow / deny / ask for each approval request.
//!
//! The pipeline is a pure function of the request, the ambient
//! [`PermissionMode`], the oracle's rule set and the static
//! [`CapabilityTable`]. Persisting new rules is the oracle's concern.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use relay_types::{ApprovalRequest, PermissionDecision, PermissionMode, RuleScope};
use serde_json::Value;

use crate::util::lock_unpoisoned;

const DEFAULT_DENY_REASON: &str = "Permission denied";

/// Argument keys inspected, in order, when matching `Tool(prefix)` rules.
const PRIMARY_ARGUMENT_KEYS: &[&str] = &["command", "file_path", "path", "pattern", "url"];

/// Sequences that chain or substitute shell commands.
const SHELL_CONTROL: &[&str] = &["&&", "||", ";", "|", "`", "$(", "\n"];

// ============================================================================
// Capability table
// ============================================================================

/// What a tool does to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolAccess {
    /// No side effects. Safe to run concurrently with other reads.
    Read,
    /// Modifies files.
    Edit,
    /// Runs arbitrary commands.
    Execute,
}

impl ToolAccess {
    #[must_use]
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolCapability {
    pub access: ToolAccess,
    /// Force `Ask` even when the rule set allows the call.
    pub always_ask: bool,
}

impl ToolCapability {
    #[must_use]
    pub const fn new(access: ToolAccess) -> Self {
        Self {
            access,
            always_ask: false,
        }
    }

    #[must_use]
    pub const fn always_ask(mut self) -> Self {
        self.always_ask = true;
        self
    }
}

/// Static tool name -> policy override table, resolved at construction.
///
/// Unknown tools are treated as [`ToolAccess::Execute`] without the
/// always-ask override.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: HashMap<String, ToolCapability>,
}

impl CapabilityTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table for the agent's standard tool set.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with("Read", ToolCapability::new(ToolAccess::Read))
            .with("Glob", ToolCapability::new(ToolAccess::Read))
            .with("Grep", ToolCapability::new(ToolAccess::Read))
            .with("LS", ToolCapability::new(ToolAccess::Read))
            .with("WebFetch", ToolCapability::new(ToolAccess::Read))
            .with("Write", ToolCapability::new(ToolAccess::Edit))
            .with("Edit", ToolCapability::new(ToolAccess::Edit))
            .with("MultiEdit", ToolCapability::new(ToolAccess::Edit))
            .with("Bash", ToolCapability::new(ToolAccess::Execute))
            .with(
                "AskUserQuestion",
                ToolCapability::new(ToolAccess::Read).always_ask(),
            )
            .with(
                "EnterPlanMode",
                ToolCapability::new(ToolAccess::Read).always_ask(),
            )
            .with(
                "ExitPlanMode",
                ToolCapability::new(ToolAccess::Read).always_ask(),
            )
    }

    /// Every tool with an entry, in no particular order.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn with(mut self, tool: impl Into<String>, capability: ToolCapability) -> Self {
        self.entries.insert(tool.into(), capability);
        self
    }

    /// Mark a tool as always-ask, keeping its access class if already known.
    pub fn mark_always_ask(&mut self, tool: &str) {
        self.entries
            .entry(tool.to_string())
            .and_modify(|cap| cap.always_ask = true)
            .or_insert(ToolCapability::new(ToolAccess::Execute).always_ask());
    }

    /// Mark a tool as read-only, keeping its always-ask flag if already known.
    pub fn mark_read_only(&mut self, tool: &str) {
        self.entries
            .entry(tool.to_string())
            .and_modify(|cap| cap.access = ToolAccess::Read)
            .or_insert(ToolCapability::new(ToolAccess::Read));
    }

    #[must_use]
    pub fn get(&self, tool: &str) -> ToolCapability {
        self.entries
            .get(tool)
            .copied()
            .unwrap_or(ToolCapability::new(ToolAccess::Execute))
    }

    #[must_use]
    pub fn access(&self, tool: &str) -> ToolAccess {
        self.get(tool).access
    }

    #[must_use]
    pub fn is_always_ask(&self, tool: &str) -> bool {
        self.get(tool).always_ask
    }
}

// ============================================================================
// Rules
// ============================================================================

/// A persisted permission rule: `Tool` or `Tool(prefix)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionRule {
    pub tool: String,
    /// Matches when the call's primary argument starts with this text.
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid permission rule '{rule}': {reason}")]
pub struct RuleParseError {
    pub rule: String,
    pub reason: &'static str,
}

impl PermissionRule {
    pub fn tool(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            prefix: None,
        }
    }

    pub fn with_prefix(tool: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            prefix: Some(prefix.into()),
        }
    }

    /// Parse `Tool`, `Tool(prefix)` or `Tool(prefix:*)`.
    pub fn parse(raw: &str) -> Result<Self, RuleParseError> {
        let err = |reason| RuleParseError {
            rule: raw.to_string(),
            reason,
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(err("empty rule"));
        }

        let Some(open) = trimmed.find('(') else {
            if trimmed.contains(')') {
                return Err(err("unbalanced parenthesis"));
            }
            return Ok(Self::tool(trimmed));
        };

        let Some(inner) = trimmed[open + 1..].strip_suffix(')') else {
            return Err(err("missing closing parenthesis"));
        };
        let tool = trimmed[..open].trim();
        if tool.is_empty() {
            return Err(err("missing tool name"));
        }
        let inner = inner.trim();
        let inner = inner
            .strip_suffix(":*")
            .or_else(|| inner.strip_suffix('*'))
            .unwrap_or(inner)
            .trim_end();
        if inner.is_empty() {
            return Ok(Self::tool(tool));
        }
        Ok(Self::with_prefix(tool, inner))
    }

    /// Rule saved by "approve always" for a request.
    ///
    /// Command tools are scoped to the first word of the command; every other
    /// tool is allowed outright.
    #[must_use]
    pub fn for_request(request: &ApprovalRequest, access: ToolAccess) -> Self {
        if access == ToolAccess::Execute
            && let Some(arg) = primary_argument(&request.parsed_args())
            && let Some(head) = arg.split_whitespace().next()
        {
            return Self::with_prefix(request.tool_name.clone(), head);
        }
        Self::tool(request.tool_name.clone())
    }

    /// Whether this rule allows the call.
    ///
    /// Command prefixes match whole words only, and a command that chains or
    /// substitutes other commands never matches.
    #[must_use]
    pub fn matches(&self, tool: &str, args: &Value) -> bool {
        if self.tool != tool {
            return false;
        }
        let Some(prefix) = &self.prefix else {
            return true;
        };
        match command_argument(args) {
            Some(command) => {
                !has_shell_control(command) && starts_with_word(command.trim_start(), prefix)
            }
            None => primary_argument(args).is_some_and(|arg| arg.starts_with(prefix.as_str())),
        }
    }

    /// Whether this rule denies the call. Every segment of a chained command
    /// is checked.
    #[must_use]
    pub fn blocks(&self, tool: &str, args: &Value) -> bool {
        if self.tool != tool {
            return false;
        }
        let Some(prefix) = &self.prefix else {
            return true;
        };
        match command_argument(args) {
            Some(command) => command
                .split(['&', '|', ';', '\n', '`', '('])
                .any(|segment| starts_with_word(segment.trim_start(), prefix)),
            None => primary_argument(args).is_some_and(|arg| arg.starts_with(prefix.as_str())),
        }
    }
}

fn command_argument(args: &Value) -> Option<&str> {
    args.get("command").and_then(Value::as_str)
}

fn has_shell_control(command: &str) -> bool {
    SHELL_CONTROL.iter().any(|op| command.contains(op))
}

fn starts_with_word(command: &str, prefix: &str) -> bool {
    command
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}

impl fmt::Display for PermissionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}({prefix}:*)", self.tool),
            None => f.write_str(&self.tool),
        }
    }
}

fn primary_argument(args: &Value) -> Option<&str> {
    let object = args.as_object()?;
    PRIMARY_ARGUMENT_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDecision {
    Allow,
    Deny,
}

// ============================================================================
// Oracle
// ============================================================================

/// Result of consulting the rule store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleVerdict {
    pub decision: PermissionDecision,
    pub matched_rule: Option<String>,
    pub reason: Option<String>,
}

impl OracleVerdict {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            decision: PermissionDecision::Allow,
            matched_rule: None,
            reason: None,
        }
    }

    #[must_use]
    pub fn ask() -> Self {
        Self {
            decision: PermissionDecision::Ask,
            matched_rule: None,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            decision: PermissionDecision::deny(reason.clone()),
            matched_rule: None,
            reason: Some(reason),
        }
    }

    #[must_use]
    pub fn matched(mut self, rule: &PermissionRule) -> Self {
        self.matched_rule = Some(rule.to_string());
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to save permission rule {rule}: {message}")]
pub struct SaveRuleError {
    pub rule: String,
    pub message: String,
}

/// External rule store.
pub trait PermissionOracle: Send + Sync {
    fn check_permission(&self, tool: &str, args: &Value, mode: PermissionMode) -> OracleVerdict;

    fn save_rule(
        &self,
        rule: PermissionRule,
        decision: RuleDecision,
        scope: RuleScope,
    ) -> Result<(), SaveRuleError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScopedRule {
    rule: PermissionRule,
    scope: RuleScope,
}

/// In-memory rule store implementing the permission modes.
///
/// Precedence: deny rules, bypass mode, plan mode, allow rules, read-only
/// tools, accept-edits mode, then ask.
#[derive(Debug, Default)]
pub struct RuleSetOracle {
    capabilities: CapabilityTable,
    allow: Mutex<Vec<ScopedRule>>,
    deny: Mutex<Vec<ScopedRule>>,
}

impl RuleSetOracle {
    #[must_use]
    pub fn new(capabilities: CapabilityTable) -> Self {
        Self {
            capabilities,
            allow: Mutex::new(Vec::new()),
            deny: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_allow(self, rule: PermissionRule, scope: RuleScope) -> Self {
        lock_unpoisoned(&self.allow).push(ScopedRule { rule, scope });
        self
    }

    #[must_use]
    pub fn with_deny(self, rule: PermissionRule, scope: RuleScope) -> Self {
        lock_unpoisoned(&self.deny).push(ScopedRule { rule, scope });
        self
    }

    /// Allow rules currently held, with their scope.
    #[must_use]
    pub fn allow_rules(&self) -> Vec<(PermissionRule, RuleScope)> {
        lock_unpoisoned(&self.allow)
            .iter()
            .map(|r| (r.rule.clone(), r.scope))
            .collect()
    }

    fn first_match(
        rules: &Mutex<Vec<ScopedRule>>,
        covers: impl Fn(&PermissionRule) -> bool,
    ) -> Option<PermissionRule> {
        lock_unpoisoned(rules)
            .iter()
            .find(|r| covers(&r.rule))
            .map(|r| r.rule.clone())
    }
}

impl PermissionOracle for RuleSetOracle {
    fn check_permission(&self, tool: &str, args: &Value, mode: PermissionMode) -> OracleVerdict {
        if let Some(rule) = Self::first_match(&self.deny, |rule| rule.blocks(tool, args)) {
            return OracleVerdict::deny(format!("Denied by rule {rule}")).matched(&rule);
        }

        let access = self.capabilities.access(tool);
        match mode {
            PermissionMode::BypassPermissions => return OracleVerdict::allow(),
            PermissionMode::Plan if access.is_write() => {
                return OracleVerdict::deny(format!(
                    "{tool} is not available in plan mode; exit plan mode first"
                ));
            }
            _ => {}
        }

        if let Some(rule) = Self::first_match(&self.allow, |rule| rule.matches(tool, args)) {
            return OracleVerdict::allow().matched(&rule);
        }

        match (access, mode) {
            (ToolAccess::Read, _) | (ToolAccess::Edit, PermissionMode::AcceptEdits) => {
                OracleVerdict::allow()
            }
            _ => OracleVerdict::ask(),
        }
    }

    fn save_rule(
        &self,
        rule: PermissionRule,
        decision: RuleDecision,
        scope: RuleScope,
    ) -> Result<(), SaveRuleError> {
        tracing::info!(rule = %rule, scope = scope.as_str(), ?decision, "Saving permission rule");
        let target = match decision {
            RuleDecision::Allow => &self.allow,
            RuleDecision::Deny => &self.deny,
        };
        let mut rules = lock_unpoisoned(target);
        if !rules.iter().any(|r| r.rule == rule) {
            rules.push(ScopedRule { rule, scope });
        }
        Ok(())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct PermissionPipeline {
    oracle: Arc<dyn PermissionOracle>,
    capabilities: Arc<CapabilityTable>,
    mode: Mutex<PermissionMode>,
}

impl fmt::Debug for PermissionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionPipeline")
            .field("capabilities", &self.capabilities)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl PermissionPipeline {
    pub fn new(
        oracle: Arc<dyn PermissionOracle>,
        capabilities: Arc<CapabilityTable>,
        mode: PermissionMode,
    ) -> Self {
        Self {
            oracle,
            capabilities,
            mode: Mutex::new(mode),
        }
    }

    #[must_use]
    pub fn mode(&self) -> PermissionMode {
        *lock_unpoisoned(&self.mode)
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        *lock_unpoisoned(&self.mode) = mode;
    }

    #[must_use]
    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    #[must_use]
    pub fn classify(&self, request: &ApprovalRequest) -> PermissionDecision {
        let args = request.parsed_args();
        let verdict = self
            .oracle
            .check_permission(&request.tool_name, &args, self.mode());

        let decision = match verdict.decision {
            PermissionDecision::Allow if self.capabilities.is_always_ask(&request.tool_name) => {
                PermissionDecision::Ask
            }
            PermissionDecision::Deny { reason } if reason.trim().is_empty() => {
                let reason = verdict
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .or_else(|| verdict.matched_rule.map(|rule| format!("Denied by rule {rule}")))
                    .unwrap_or_else(|| DEFAULT_DENY_REASON.to_string());
                PermissionDecision::Deny { reason }
            }
            other => other,
        };

        tracing::debug!(
            tool = %request.tool_name,
            tool_call_id = %request.tool_call_id,
            decision = decision.label(),
            "Classified approval request"
        );
        decision
    }

    /// Classify a whole batch, keeping batch order.
    #[must_use]
    pub fn classify_batch(
        &self,
        requests: Vec<ApprovalRequest>,
    ) -> Vec<(ApprovalRequest, PermissionDecision)> {
        requests
            .into_iter()
            .map(|request| {
                let decision = self.classify(&request);
                (request, decision)
            })
            .collect()
    }

    /// Persist an allow rule for `request` (approve always).
    pub fn approve_always(
        &self,
        request: &ApprovalRequest,
        scope: RuleScope,
    ) -> Result<PermissionRule, SaveRuleError> {
        let rule =
            PermissionRule::for_request(request, self.capabilities.access(&request.tool_name));
        self.oracle
            .save_rule(rule.clone(), RuleDecision::Allow, scope)?;
        Ok(rule)
    }
}
