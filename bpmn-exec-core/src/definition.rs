//! Runtime process definitions.
//!
//! Built once from validated DTOs and shared read-only between every
//! instance: `DefinitionTable` is a cheap `Arc` clone and is never mutated.

use crate::authoring::{
    parse_process_yaml, validate_dto, ElementDto, ElementKindDto, ListenerDto, ProcessDto,
};
use crate::error::EngineError;
use crate::types::{ElementType, MultiInstanceMode, Phase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// ─── Job type specs ───────────────────────────────────────────

/// Job type as written in the definition: a literal, or an expression
/// evaluated against the element's scope (written `=expr`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobTypeSpec {
    Literal(String),
    Expression(String),
}

impl JobTypeSpec {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('=') {
            Some(expr) => JobTypeSpec::Expression(expr.trim().to_string()),
            None => JobTypeSpec::Literal(raw.to_string()),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            JobTypeSpec::Literal(s) | JobTypeSpec::Expression(s) => s.trim().is_empty(),
        }
    }
}

impl From<String> for JobTypeSpec {
    fn from(raw: String) -> Self {
        JobTypeSpec::parse(&raw)
    }
}

impl From<JobTypeSpec> for String {
    fn from(spec: JobTypeSpec) -> Self {
        match spec {
            JobTypeSpec::Literal(s) => s,
            JobTypeSpec::Expression(e) => format!("={e}"),
        }
    }
}

// ─── Listeners ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerEventType {
    Start,
    End,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerSpec {
    pub event_type: ListenerEventType,
    pub ordinal: u32,
    pub job_type: JobTypeSpec,
    pub retries: u32,
}

// ─── Elements ─────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cardinality {
    Fixed(u32),
    /// Name of a variable holding a JSON array.
    InputCollection(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultiInstanceSpec {
    pub mode: MultiInstanceMode,
    pub cardinality: Cardinality,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub id: String,
    pub element_type: ElementType,
    pub job_type: Option<JobTypeSpec>,
    pub retries: u32,
    /// Sorted by ordinal.
    pub start_listeners: Vec<ListenerSpec>,
    /// Sorted by ordinal.
    pub end_listeners: Vec<ListenerSpec>,
    pub outgoing: Vec<String>,
    pub multi_instance: Option<MultiInstanceSpec>,
    /// First element of a scope (process or sub-process).
    pub start: Option<String>,
}

impl Element {
    pub fn listeners(&self, phase: Phase) -> &[ListenerSpec] {
        match phase {
            Phase::StartListeners => &self.start_listeners,
            Phase::EndListeners => &self.end_listeners,
            Phase::MainWork => &[],
        }
    }
}

// ─── Process definition ───────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessDefinition {
    pub process_id: String,
    /// Keyed by element id; includes the process element itself.
    elements: BTreeMap<String, Element>,
}

impl ProcessDefinition {
    pub fn from_yaml(yaml: &str, default_retries: u32) -> Result<Self, EngineError> {
        let dto = parse_process_yaml(yaml)?;
        Self::from_dto(&dto, default_retries)
    }

    pub fn from_dto(dto: &ProcessDto, default_retries: u32) -> Result<Self, EngineError> {
        let errors = validate_dto(dto);
        if !errors.is_empty() {
            return Err(EngineError::InvalidDefinition(errors));
        }

        let mut elements = BTreeMap::new();
        let (start_listeners, end_listeners) = build_listeners(&dto.listeners, default_retries);
        elements.insert(
            dto.id.clone(),
            Element {
                id: dto.id.clone(),
                element_type: ElementType::Process,
                job_type: None,
                retries: default_retries,
                start_listeners,
                end_listeners,
                outgoing: Vec::new(),
                multi_instance: None,
                start: Some(dto.start.clone()),
            },
        );
        for element in &dto.elements {
            elements.insert(element.id.clone(), build_element(element, default_retries));
        }

        Ok(Self {
            process_id: dto.id.clone(),
            elements,
        })
    }

    pub fn root(&self) -> Result<&Element, EngineError> {
        self.element(&self.process_id)
    }

    pub fn element(&self, element_id: &str) -> Result<&Element, EngineError> {
        self.elements
            .get(element_id)
            .ok_or_else(|| EngineError::UnknownElement {
                process_id: self.process_id.clone(),
                element_id: element_id.to_string(),
            })
    }
}

fn build_element(dto: &ElementDto, default_retries: u32) -> Element {
    let element_type = match dto.kind {
        ElementKindDto::StartEvent => ElementType::StartEvent,
        ElementKindDto::EndEvent => ElementType::EndEvent,
        ElementKindDto::ServiceTask => ElementType::ServiceTask,
        ElementKindDto::ManualTask => ElementType::ManualTask,
        ElementKindDto::SubProcess => ElementType::SubProcess,
    };
    let (start_listeners, end_listeners) = build_listeners(&dto.listeners, default_retries);
    let multi_instance = dto.multi_instance.as_ref().map(|mi| MultiInstanceSpec {
        mode: mi.mode,
        cardinality: match (&mi.input_collection, mi.cardinality) {
            (Some(collection), _) => Cardinality::InputCollection(collection.clone()),
            (None, n) => Cardinality::Fixed(n.unwrap_or(1)),
        },
    });

    Element {
        id: dto.id.clone(),
        element_type,
        job_type: dto.job_type.clone(),
        retries: dto.retries.unwrap_or(default_retries),
        start_listeners,
        end_listeners,
        outgoing: dto.outgoing.clone(),
        multi_instance,
        start: dto.start.clone(),
    }
}

/// Split listeners by event and order them by `(ordinal, position)`.
/// Listeners without an explicit ordinal take their position. Validation
/// keeps the two styles apart per event, so ordinals only tie when the
/// source repeats one, and declaration order breaks such ties.
fn build_listeners(
    dtos: &[ListenerDto],
    default_retries: u32,
) -> (Vec<ListenerSpec>, Vec<ListenerSpec>) {
    let mut start = Vec::new();
    let mut end = Vec::new();
    for dto in dtos {
        let bucket = match dto.event {
            ListenerEventType::Start => &mut start,
            ListenerEventType::End => &mut end,
        };
        let position = bucket.len();
        bucket.push((
            ListenerSpec {
                event_type: dto.event,
                ordinal: dto.ordinal.unwrap_or(position as u32),
                job_type: dto.job_type.clone(),
                retries: dto.retries.unwrap_or(default_retries),
            },
            position,
        ));
    }
    let finish = |mut specs: Vec<(ListenerSpec, usize)>| -> Vec<ListenerSpec> {
        specs.sort_by_key(|(spec, position)| (spec.ordinal, *position));
        specs.into_iter().map(|(spec, _)| spec).collect()
    };
    (finish(start), finish(end))
}

// ─── Definition table ─────────────────────────────────────────

/// Immutable, shared lookup of deployed processes by process id.
#[derive(Clone, Debug, Default)]
pub struct DefinitionTable {
    processes: Arc<BTreeMap<String, Arc<ProcessDefinition>>>,
}

impl DefinitionTable {
    pub fn new(definitions: impl IntoIterator<Item = ProcessDefinition>) -> Self {
        let processes = definitions
            .into_iter()
            .map(|d| (d.process_id.clone(), Arc::new(d)))
            .collect();
        Self {
            processes: Arc::new(processes),
        }
    }

    pub fn process(&self, process_id: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.processes
            .get(process_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProcess(process_id.to_string()))
    }

    pub fn contains(&self, process_id: &str) -> bool {
        self.processes.contains_key(process_id)
    }

    pub fn process_ids(&self) -> impl Iterator<Item = &str> {
        self.processes.keys().map(String::as_str)
    }
}
