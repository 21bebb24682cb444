//! End-to-end smoke test of the `hensu start` flow against a small
//! workflow definition written to a temp file.

use std::io::Write;
use std::process::Command;

#[test]
fn start_runs_two_node_workflow_to_completion() {
    let workflow_json = serde_json::json!({
        "id": "smoke",
        "version": "1.0.0",
        "start_node_id": "step1",
        "agents": {
            "writer": {
                "model": "stub",
                "role": "writer",
                "temperature": 0.0,
                "max_tokens": 64,
                "tool_ids": [],
                "instructions": null,
                "provider_hint": null
            }
        },
        "rubrics": {},
        "nodes": {
            "step1": {
                "id": "step1",
                "type": "standard",
                "agent_id": "writer",
                "prompt": "do the thing",
                "output_params": null,
                "plan_failure_target": null,
                "planning_mode": "disabled",
                "max_plan_steps": null,
                "max_plan_replans": null,
                "transition_rules": [{ "kind": "success", "target": "end" }],
                "rubric_id": null,
                "review": { "mode": "optional", "review_plan": false, "allow_backtrack": true, "allow_edit_prompt": true, "reviewer_id": null }
            },
            "end": {
                "id": "end",
                "type": "end",
                "exit_status": "success",
                "transition_rules": [],
                "rubric_id": null,
                "review": { "mode": "optional", "review_plan": false, "allow_backtrack": true, "allow_edit_prompt": true, "reviewer_id": null }
            }
        },
        "metadata": { "name": null, "description": null, "author": null, "tags": [] },
        "config": { "default_timeout_seconds": 120, "default_max_retries": 0 }
    });

    let tmp = tempfile::tempdir().unwrap();
    let workflow_path = tmp.path().join("workflow.json");
    let mut f = std::fs::File::create(&workflow_path).unwrap();
    write!(f, "{}", workflow_json).unwrap();

    let state_dir = tmp.path().join("state");

    let output = Command::new(env!("CARGO_BIN_EXE_hensu"))
        .arg("start")
        .arg(&workflow_path)
        .arg("--state-dir")
        .arg(&state_dir)
        .output()
        .expect("failed to run hensu binary");

    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("completed:"), "unexpected output: {stdout}");
}
