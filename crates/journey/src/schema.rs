//! Per-step-type config schemas and journey definition validation.
//!
//! Validation never stops at the first problem: every function here returns
//! the full list of issues so the caller can report them together.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::ValidationIssue;
use crate::graph::StepGraph;
use crate::types::{JourneyStep, NewStep, StepConfig, StepType, MAX_WAIT_SECS};

pub const MESSAGE_CHANNELS: [&str; 5] = ["email", "sms", "push", "in_app", "whatsapp"];
pub const WEBHOOK_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];
const MAX_TAG_LEN: usize = 64;

/// Entry of the step-type catalogue exposed to clients.
#[derive(Debug, Clone, Serialize)]
pub struct StepTypeInfo {
    pub step_type: StepType,
    pub description: &'static str,
    pub has_side_effect: bool,
}

pub fn step_types() -> Vec<StepTypeInfo> {
    StepType::ALL
        .iter()
        .map(|t| StepTypeInfo {
            step_type: *t,
            description: describe(*t),
            has_side_effect: matches!(
                t,
                StepType::SendMessage
                    | StepType::UpdateField
                    | StepType::AddTag
                    | StepType::RemoveTag
                    | StepType::WebhookCall
            ),
        })
        .collect()
}

fn describe(step_type: StepType) -> &'static str {
    match step_type {
        StepType::SendMessage => "Send a rendered message to the contact",
        StepType::Wait => "Pause for a fixed delay or until a timestamp",
        StepType::Condition => "Branch on the contact's attributes, tags, or events",
        StepType::UpdateField => "Set a field on the contact record",
        StepType::AddTag => "Add a tag to the contact",
        StepType::RemoveTag => "Remove a tag from the contact",
        StepType::WebhookCall => "Call an external HTTP endpoint",
        StepType::End => "Finish the journey",
    }
}

/// JSON-schema description of a step type's `config` object, used by clients
/// to generate forms.
pub fn config_schema(step_type: StepType) -> serde_json::Value {
    match step_type {
        StepType::SendMessage => json!({
            "type": "object",
            "required": ["body"],
            "additionalProperties": false,
            "properties": {
                "channel": { "type": "string", "enum": MESSAGE_CHANNELS, "default": "email" },
                "subject": { "type": "string" },
                "body": { "type": "string", "minLength": 1, "description": "Supports {{attribute}} placeholders" }
            }
        }),
        StepType::Wait => json!({
            "type": "object",
            "additionalProperties": false,
            "oneOf": [
                { "required": ["delay_secs"] },
                { "required": ["until"] }
            ],
            "properties": {
                "delay_secs": { "type": "integer", "minimum": 1, "maximum": MAX_WAIT_SECS },
                "until": { "type": "string", "format": "date-time" }
            }
        }),
        StepType::Condition => json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {},
            "description": "Branch expression goes in the step's `conditions`; targets in `on_true`/`on_false`"
        }),
        StepType::UpdateField => json!({
            "type": "object",
            "required": ["field", "value"],
            "additionalProperties": false,
            "properties": {
                "field": { "type": "string", "minLength": 1 },
                "value": {}
            }
        }),
        StepType::AddTag | StepType::RemoveTag => json!({
            "type": "object",
            "required": ["tag"],
            "additionalProperties": false,
            "properties": {
                "tag": { "type": "string", "minLength": 1, "maxLength": MAX_TAG_LEN }
            }
        }),
        StepType::WebhookCall => json!({
            "type": "object",
            "required": ["url"],
            "additionalProperties": false,
            "properties": {
                "url": { "type": "string", "format": "uri" },
                "method": { "type": "string", "enum": WEBHOOK_METHODS, "default": "POST" },
                "payload": {},
                "headers": { "type": "object", "additionalProperties": { "type": "string" } }
            }
        }),
        StepType::End => json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "reason": { "type": "string" }
            }
        }),
    }
}

/// Semantic checks of a parsed config.
pub fn validate_config(step_id: Uuid, order_no: u32, config: &StepConfig) -> Vec<ValidationIssue> {
    let issue = |field: &str, message: String| {
        ValidationIssue::step(step_id, order_no, message).with_field(field)
    };
    let mut issues = Vec::new();

    match config {
        StepConfig::SendMessage(c) => {
            if c.body.trim().is_empty() {
                issues.push(issue("config.body", "message body must not be empty".into()));
            }
            if !MESSAGE_CHANNELS.contains(&c.channel.as_str()) {
                issues.push(issue(
                    "config.channel",
                    format!("unsupported channel '{}'", c.channel),
                ));
            }
        }
        StepConfig::Wait(c) => match (c.delay_secs, c.until) {
            (Some(_), Some(_)) => issues.push(issue(
                "config",
                "wait takes either delay_secs or until, not both".into(),
            )),
            (None, None) => issues.push(issue(
                "config",
                "wait requires delay_secs or until".into(),
            )),
            (Some(0), None) => issues.push(issue(
                "config.delay_secs",
                "delay_secs must be positive".into(),
            )),
            (Some(secs), None) if secs > MAX_WAIT_SECS => issues.push(issue(
                "config.delay_secs",
                format!("delay_secs must not exceed {MAX_WAIT_SECS}"),
            )),
            _ => {}
        },
        StepConfig::Condition | StepConfig::End(_) => {}
        StepConfig::UpdateField(c) => {
            if c.field.trim().is_empty() || c.field.trim() != c.field {
                issues.push(issue(
                    "config.field",
                    "field must be a non-empty name without surrounding whitespace".into(),
                ));
            }
        }
        StepConfig::AddTag(c) | StepConfig::RemoveTag(c) => {
            if c.tag.trim().is_empty() {
                issues.push(issue("config.tag", "tag must not be empty".into()));
            } else if c.tag.chars().count() > MAX_TAG_LEN {
                issues.push(issue(
                    "config.tag",
                    format!("tag must be at most {MAX_TAG_LEN} characters"),
                ));
            }
        }
        StepConfig::WebhookCall(c) => {
            if !(c.url.starts_with("https://") || c.url.starts_with("http://"))
                || c.url.contains(char::is_whitespace)
            {
                issues.push(issue(
                    "config.url",
                    format!("'{}' is not an http(s) URL", c.url),
                ));
            }
            if !WEBHOOK_METHODS.contains(&c.method.to_ascii_uppercase().as_str()) {
                issues.push(issue(
                    "config.method",
                    format!("unsupported method '{}'", c.method),
                ));
            }
        }
    }

    issues
}

/// Checks that branch fields and conditions sit on the step types that use them.
pub fn validate_step_shape(step: &JourneyStep) -> Vec<ValidationIssue> {
    let issue = |field: &str, message: &str| {
        ValidationIssue::step(step.id, step.order_no, message).with_field(field)
    };
    let mut issues = Vec::new();

    match step.step_type() {
        StepType::Condition => {
            match &step.conditions {
                None => issues.push(issue("conditions", "condition step requires conditions")),
                Some(group) => {
                    if group.iter_conditions().next().is_none() {
                        issues.push(issue("conditions", "condition group is empty"));
                    }
                    for condition in group.iter_conditions() {
                        if condition.path.trim().is_empty() {
                            issues.push(issue("conditions", "condition path must not be empty"));
                        }
                        if condition.comparator.takes_value() && condition.value.is_null() {
                            issues.push(issue(
                                "conditions",
                                &format!("condition on '{}' requires a value", condition.path),
                            ));
                        }
                    }
                }
            }
            if step.on_true.is_none() && step.on_false.is_none() {
                issues.push(issue(
                    "on_true",
                    "condition step needs at least one branch target",
                ));
            }
            if step.next_step.is_some() {
                issues.push(issue(
                    "next_step",
                    "condition steps branch through on_true/on_false",
                ));
            }
        }
        other => {
            if step.conditions.is_some() {
                issues.push(issue("conditions", "only condition steps take conditions"));
            }
            if step.on_true.is_some() || step.on_false.is_some() {
                issues.push(issue("on_true", "only condition steps take branch targets"));
            }
            if other == StepType::End && step.next_step.is_some() {
                issues.push(issue("next_step", "end steps have no successor"));
            }
        }
    }

    issues
}

/// Turns submitted steps into typed steps, collecting every decode and
/// config problem. Returns the steps sorted by `order_no`.
pub fn build_steps(
    journey_id: Uuid,
    submitted: Vec<NewStep>,
) -> Result<Vec<JourneyStep>, Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    let mut steps = Vec::with_capacity(submitted.len());

    for new in submitted {
        let id = new.id.unwrap_or_else(Uuid::new_v4);
        match StepConfig::parse(new.step_type, &new.config) {
            Ok(config) => {
                issues.extend(validate_config(id, new.order_no, &config));
                let step = JourneyStep {
                    id,
                    journey_id,
                    order_no: new.order_no,
                    config,
                    conditions: new.conditions,
                    on_true: new.on_true,
                    on_false: new.on_false,
                    next_step: new.next_step,
                };
                issues.extend(validate_step_shape(&step));
                steps.push(step);
            }
            Err(reason) => issues.push(
                ValidationIssue::step(
                    id,
                    new.order_no,
                    format!("invalid {} config: {reason}", new.step_type),
                )
                .with_field("config"),
            ),
        }
    }

    issues.extend(validate_ordering(&steps));

    if issues.is_empty() {
        steps.sort_by_key(|s| s.order_no);
        Ok(steps)
    } else {
        Err(issues)
    }
}

/// `order_no` must be dense from zero with no duplicates, and step ids unique.
pub fn validate_ordering(steps: &[JourneyStep]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let mut ids = HashSet::new();
    for step in steps {
        if !ids.insert(step.id) {
            issues.push(ValidationIssue::step(step.id, step.order_no, "duplicate step id"));
        }
    }

    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.order_no) {
            issues.push(
                ValidationIssue::step(step.id, step.order_no, "duplicate order_no")
                    .with_field("order_no"),
            );
        }
    }
    for expected in 0..steps.len() as u32 {
        if !seen.contains(&expected) {
            issues.push(
                ValidationIssue::journey(format!("order_no {expected} is missing"))
                    .with_field("order_no"),
            );
        }
    }

    issues
}

/// Full check run before a journey is published.
pub fn validate_for_publish(steps: &[JourneyStep]) -> Vec<ValidationIssue> {
    if steps.is_empty() {
        return vec![ValidationIssue::journey("journey has no steps")];
    }

    let mut issues = Vec::new();
    for step in steps {
        issues.extend(validate_config(step.id, step.order_no, &step.config));
        issues.extend(validate_step_shape(step));
    }
    issues.extend(validate_ordering(steps));

    let mut sorted = steps.to_vec();
    sorted.sort_by_key(|s| s.order_no);
    let graph = StepGraph::new(&sorted);

    for step in &sorted {
        let targets = [
            ("on_true", step.on_true),
            ("on_false", step.on_false),
            ("next_step", step.next_step),
        ];
        for (field, target) in targets {
            if let Some(target) = target {
                if !graph.contains(target) {
                    issues.push(
                        ValidationIssue::step(
                            step.id,
                            step.order_no,
                            format!("{field} references unknown step {target}"),
                        )
                        .with_field(field),
                    );
                }
            }
        }
    }

    let reachable = graph.reachable();
    for step in &sorted {
        if !reachable.contains(&step.id) {
            issues.push(ValidationIssue::step(
                step.id,
                step.order_no,
                "step is unreachable from the first step",
            ));
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{Comparator, Condition, ConditionGroup};

    fn new_step(order_no: u32, step_type: StepType, config: serde_json::Value) -> NewStep {
        NewStep {
            id: Some(Uuid::new_v4()),
            order_no,
            step_type,
            config,
            conditions: None,
            on_true: None,
            on_false: None,
            next_step: None,
        }
    }

    #[test]
    fn test_build_steps_collects_all_issues() {
        let journey_id = Uuid::new_v4();
        let err = build_steps(
            journey_id,
            vec![
                new_step(0, StepType::SendMessage, json!({"body": "  "})),
                new_step(1, StepType::Wait, json!({})),
                new_step(1, StepType::AddTag, json!({"tag": "ok"})),
                new_step(3, StepType::WebhookCall, json!({"url": "ftp://x"})),
                new_step(4, StepType::UpdateField, json!({"field": "x", "valu": 1})),
            ],
        )
        .unwrap_err();

        let messages: Vec<&str> = err.iter().map(|i| i.message.as_str()).collect();
        assert!(messages.contains(&"message body must not be empty"));
        assert!(messages.contains(&"wait requires delay_secs or until"));
        assert!(messages.contains(&"duplicate order_no"));
        assert!(messages.contains(&"order_no 2 is missing"));
        assert!(messages.iter().any(|m| m.contains("not an http(s) URL")));
        assert!(messages.iter().any(|m| m.starts_with("invalid update_field config")));
    }

    #[test]
    fn test_build_steps_sorts_by_order() {
        let steps = build_steps(
            Uuid::new_v4(),
            vec![
                new_step(1, StepType::End, json!({})),
                new_step(0, StepType::AddTag, json!({"tag": "lead"})),
            ],
        )
        .unwrap();
        assert_eq!(steps[0].step_type(), StepType::AddTag);
        assert_eq!(steps[1].step_type(), StepType::End);
    }

    #[test]
    fn test_publish_detects_dangling_and_unreachable() {
        let journey_id = Uuid::new_v4();
        let mut submitted = vec![
            new_step(0, StepType::Condition, json!({})),
            new_step(1, StepType::End, json!({})),
            new_step(2, StepType::AddTag, json!({"tag": "stray"})),
        ];
        submitted[0].conditions = Some(ConditionGroup::all(vec![Condition::new(
            "tags",
            Comparator::Contains,
            json!("vip"),
        )]));
        submitted[0].on_true = submitted[1].id;
        submitted[0].on_false = Some(Uuid::new_v4());
        let steps = build_steps(journey_id, submitted).unwrap();

        let issues = validate_for_publish(&steps);
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|i| i.field.as_deref() == Some("on_false")));
        assert!(issues
            .iter()
            .any(|i| i.message == "step is unreachable from the first step"
                && i.step_id == Some(steps[2].id)));
    }

    #[test]
    fn test_branch_fields_only_on_condition_steps() {
        let mut submitted = vec![
            new_step(0, StepType::AddTag, json!({"tag": "a"})),
            new_step(1, StepType::Condition, json!({})),
        ];
        submitted[0].on_true = submitted[1].id;
        let issues = build_steps(Uuid::new_v4(), submitted).unwrap_err();
        let messages: Vec<&str> = issues.iter().map(|i| i.message.as_str()).collect();
        assert!(messages.contains(&"only condition steps take branch targets"));
        assert!(messages.contains(&"condition step requires conditions"));
        assert!(messages.contains(&"condition step needs at least one branch target"));
    }

    #[test]
    fn test_empty_journey_cannot_publish() {
        let issues = validate_for_publish(&[]);
        assert_eq!(issues, vec![ValidationIssue::journey("journey has no steps")]);
    }

    #[test]
    fn test_every_step_type_has_a_schema() {
        for info in step_types() {
            let schema = config_schema(info.step_type);
            assert_eq!(schema["type"], "object");
        }
        assert_eq!(step_types().len(), StepType::ALL.len());
    }
}
