//! YAML authoring format for process definitions.
//!
//! ```yaml
//! id: order
//! start: received
//! listeners:
//!   - event: start
//!     job_type: audit
//! elements:
//!   - id: received
//!     type: start_event
//!     outgoing: [charge]
//!   - id: charge
//!     type: service_task
//!     job_type: "=paymentWorker"
//!     listeners:
//!       - event: end
//!         job_type: notify
//!     multi_instance:
//!       mode: parallel
//!       input_collection: items
//!     outgoing: [done]
//!   - id: done
//!     type: end_event
//! ```
//!
//! Job types starting with `=` are expressions; anything else is a literal.

use crate::definition::{JobTypeSpec, ListenerEventType};
use crate::types::MultiInstanceMode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ── DTOs ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDto {
    pub id: String,
    pub start: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ListenerDto>,
    pub elements: Vec<ElementDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDto {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ElementKindDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<JobTypeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ListenerDto>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outgoing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstanceDto>,
    /// Start element of a sub-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKindDto {
    StartEvent,
    EndEvent,
    ServiceTask,
    ManualTask,
    SubProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerDto {
    pub event: ListenerEventType,
    pub job_type: JobTypeSpec,
    /// Defaults to the listener's position among listeners of the same event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiInstanceDto {
    pub mode: MultiInstanceMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_collection: Option<String>,
}

/// Parse a YAML string into a ProcessDto.
///
/// Validation is NOT performed here. `ProcessDefinition::from_dto` validates
/// before building the runtime table.
pub fn parse_process_yaml(yaml_str: &str) -> Result<ProcessDto, serde_yaml::Error> {
    serde_yaml::from_str(yaml_str)
}

// ── Validation ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn violation(errors: &mut Vec<ValidationError>, rule: &str, message: String) {
    errors.push(ValidationError {
        rule: rule.to_string(),
        message,
    });
}

/// Validate a ProcessDto before building the runtime table. Returns all
/// errors found.
pub fn validate_dto(dto: &ProcessDto) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut ids: HashMap<&str, &ElementDto> = HashMap::new();

    // V1: Element ids are unique and distinct from the process id
    for element in &dto.elements {
        if element.id == dto.id {
            violation(
                &mut errors,
                "V1",
                format!("Element id collides with process id: {}", element.id),
            );
        }
        if ids.insert(element.id.as_str(), element).is_some() {
            violation(&mut errors, "V1", format!("Duplicate element id: {}", element.id));
        }
    }

    // V2: Process start element exists
    if !ids.contains_key(dto.start.as_str()) {
        violation(
            &mut errors,
            "V2",
            format!("Start element not found: {}", dto.start),
        );
    }

    // V3: Outgoing flows reference existing elements
    for element in &dto.elements {
        for target in &element.outgoing {
            if !ids.contains_key(target.as_str()) {
                violation(
                    &mut errors,
                    "V3",
                    format!("{}: outgoing flow to unknown element {}", element.id, target),
                );
            }
        }
    }

    // V4: Service tasks carry a non-empty job type; other kinds carry none
    for element in &dto.elements {
        match (element.kind, &element.job_type) {
            (ElementKindDto::ServiceTask, None) => violation(
                &mut errors,
                "V4",
                format!("{}: service task without job_type", element.id),
            ),
            (ElementKindDto::ServiceTask, Some(spec)) if spec.is_blank() => violation(
                &mut errors,
                "V4",
                format!("{}: empty job_type", element.id),
            ),
            (ElementKindDto::ServiceTask, Some(_)) | (_, None) => {}
            (kind, Some(_)) => violation(
                &mut errors,
                "V4",
                format!("{}: {:?} cannot have a job_type", element.id, kind),
            ),
        }
    }

    // V5: Listener job types are non-empty and explicit ordinals unique per event
    validate_listeners(&dto.id, &dto.listeners, &mut errors);
    for element in &dto.elements {
        validate_listeners(&element.id, &element.listeners, &mut errors);
    }

    // V6: Multi-instance needs exactly one of cardinality > 0 / input_collection
    for element in &dto.elements {
        if let Some(mi) = &element.multi_instance {
            match (mi.cardinality, &mi.input_collection) {
                (Some(0), None) => violation(
                    &mut errors,
                    "V6",
                    format!("{}: multi-instance cardinality must be positive", element.id),
                ),
                (Some(_), None) | (None, Some(_)) => {}
                (None, None) => violation(
                    &mut errors,
                    "V6",
                    format!(
                        "{}: multi-instance needs cardinality or input_collection",
                        element.id
                    ),
                ),
                (Some(_), Some(_)) => violation(
                    &mut errors,
                    "V6",
                    format!(
                        "{}: multi-instance cannot have both cardinality and input_collection",
                        element.id
                    ),
                ),
            }
            if matches!(
                element.kind,
                ElementKindDto::StartEvent | ElementKindDto::EndEvent
            ) {
                violation(
                    &mut errors,
                    "V6",
                    format!("{}: events cannot be multi-instance", element.id),
                );
            }
        }
    }

    // V7: Sub-processes name an existing start element; nothing else does
    for element in &dto.elements {
        match (element.kind, &element.start) {
            (ElementKindDto::SubProcess, None) => violation(
                &mut errors,
                "V7",
                format!("{}: sub-process without start", element.id),
            ),
            (ElementKindDto::SubProcess, Some(start)) if !ids.contains_key(start.as_str()) => {
                violation(
                    &mut errors,
                    "V7",
                    format!("{}: sub-process start not found: {}", element.id, start),
                )
            }
            (ElementKindDto::SubProcess, Some(_)) | (_, None) => {}
            (_, Some(_)) => violation(
                &mut errors,
                "V7",
                format!("{}: only sub-processes have a start", element.id),
            ),
        }
    }

    errors
}

fn validate_listeners(owner: &str, listeners: &[ListenerDto], errors: &mut Vec<ValidationError>) {
    let mut seen: HashSet<(ListenerEventType, u32)> = HashSet::new();
    for listener in listeners {
        if listener.job_type.is_blank() {
            violation(
                errors,
                "V5",
                format!("{owner}: {:?} listener with empty job_type", listener.event),
            );
        }
        if let Some(ordinal) = listener.ordinal {
            if !seen.insert((listener.event, ordinal)) {
                violation(
                    errors,
                    "V5",
                    format!(
                        "{owner}: duplicate {:?} listener ordinal {ordinal}",
                        listener.event
                    ),
                );
            }
        }
    }
    // An implicit ordinal is the listener's position, which may collide
    // with an explicit one; each event uses one style or the other.
    for event in [ListenerEventType::Start, ListenerEventType::End] {
        let mut styles = listeners
            .iter()
            .filter(|l| l.event == event)
            .map(|l| l.ordinal.is_some());
        if let Some(first) = styles.next() {
            if styles.any(|explicit| explicit != first) {
                violation(
                    errors,
                    "V5",
                    format!("{owner}: {event:?} listeners mix explicit and implicit ordinals"),
                );
            }
        }
    }
}
