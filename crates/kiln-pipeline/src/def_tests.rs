// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn deserializes_minimal_step() {
    let json = serde_json::json!({
        "id": "build",
        "image": "alpine:3.20",
        "cmd": ["sh", "-c", "echo hi"],
    });
    let step: StepDef = serde_json::from_value(json).unwrap();
    assert_eq!(step.id, "build");
    assert_eq!(step.image.as_deref(), Some("alpine:3.20"));
    assert_eq!(step.cmd, Some(vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()]));
    assert!(step.uses.is_none());
}

#[test]
fn deserializes_kit_use_with_params() {
    let json = serde_json::json!({
        "id": "build",
        "uses": { "uses": "shell", "with": { "script": "build.sh" } },
    });
    let step: StepDef = serde_json::from_value(json).unwrap();
    let kit = step.uses.unwrap();
    assert_eq!(kit.uses, "shell");
    assert_eq!(kit.with.get("script").unwrap(), "build.sh");
}

#[test]
fn pipeline_def_defaults_id_to_none() {
    let json = serde_json::json!({
        "displayName": "My Pipeline",
        "steps": [],
    });
    let def: PipelineDef = serde_json::from_value(json).unwrap();
    assert!(def.id.is_none());
    assert_eq!(def.display_name.as_deref(), Some("My Pipeline"));
}
