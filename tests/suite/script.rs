//! Replay scripts and config files driving a full session.

use std::io::Write;
use std::sync::Arc;

use relay_engine::scripted::Script;
use relay_engine::{Collaborators, Orchestrator, RelayConfig, TurnInput, TurnOutcome};
use tempfile::NamedTempFile;

const SCRIPT: &str = r#"
messages = ["list the repo", "thanks"]

[[responses]]
kind = "stream"
events = [
    { type = "run_started", run_id = "run-1" },
    { type = "text", text = "Looking..." },
    { type = "approval", tool_call_id = "call-1", tool_name = "Bash", args = { command = "ls" } },
    { type = "approval", tool_call_id = "call-2", tool_name = "Read", args = { file_path = "Cargo.toml" } },
    { type = "stop", reason = "requires_approval" },
]

[[responses]]
kind = "stream"
events = [{ type = "text", text = "Done." }, { type = "stop", reason = "end_turn" }]

[[responses]]
kind = "stream"
events = [{ type = "stop", reason = "end_turn" }]

[tools.Bash]
output = "Cargo.toml\nsrc"
"#;

const CONFIG: &str = r#"
[session]
conversation_id = "replay"

[permissions]
allow = ["Bash(ls)"]
"#;

fn temp_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn script_and_config_replay_without_review() {
    let script_file = temp_file(SCRIPT);
    let config_file = temp_file(CONFIG);

    let script = Script::load(script_file.path()).unwrap();
    let config = RelayConfig::load_from(config_file.path()).unwrap();
    let (messages, backend, tools) = script.into_parts();
    let backend = Arc::new(backend);
    let tools = Arc::new(tools);

    let capabilities = config.capability_table();
    let oracle = config.rule_set_oracle(capabilities.clone()).unwrap();
    let (orchestrator, _events) = Orchestrator::new(
        Collaborators {
            backend: backend.clone(),
            tools: tools.clone(),
            oracle: Arc::new(oracle),
            capabilities,
        },
        config.settings().unwrap(),
    );

    for message in messages {
        assert_eq!(orchestrator.submit(message).await, TurnOutcome::Completed);
    }

    let sent = backend.sent();
    assert_eq!(sent.len(), 3);
    let ids: Vec<&str> = sent[1]
        .iter()
        .filter_map(TurnInput::approval)
        .map(|result| result.tool_call_id())
        .collect();
    assert_eq!(ids, vec!["call-1", "call-2"]);
    assert_eq!(tools.calls().len(), 2);
    assert_eq!(backend.remaining_responses(), 0);
}
