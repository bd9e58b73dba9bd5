// Resolved Model Contracts
// Property-resolved views of job, partition, and split-flow definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Key/value parameters and resolved properties, as passed on submission
/// and carried on execution records.
pub type Properties = HashMap<String, String>;

/// Submission-parameter key under which the correlation id is carried.
///
/// The value is read once at dispatch and propagated unchanged through every
/// event published for the work unit's lifetime. The runtime never interprets
/// it.
pub const CORRELATION_ID_PARAM: &str = "correlationId";

/// A single resolved property from a job, partition, or flow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A property-resolved view of an executable definition body.
///
/// Produced by a [`ModelResolver`] from definition text plus runtime
/// parameters; consumed by the dispatch helper when assembling a work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedModel {
    /// Resolved job name (the id attribute of the definition root).
    pub job_name: String,

    /// The definition text this model was resolved from.
    pub definition_text: String,

    /// Properties declared on the definition, post-substitution.
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl ResolvedModel {
    /// Flatten the declared property list into a map.
    ///
    /// A definition with no properties yields an empty map, never an absent
    /// one. Later declarations of the same name win.
    pub fn property_map(&self) -> Properties {
        self.properties
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }
}

/// Errors from model resolution.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to parse job definition: {0}")]
    Parse(String),

    #[error("unresolved property reference '{0}' in definition")]
    UnresolvedProperty(String),
}

/// Resolution of definition text into a navigable, property-substituted model.
///
/// Implemented by the parsing/substitution layer outside this crate; the
/// runtime consumes it when dispatching work units. Partition resolution
/// additionally understands partition-scoped property overrides, which take
/// precedence over the submission parameters.
pub trait ModelResolver: Send + Sync {
    /// Resolve a top-level job definition against submission parameters.
    fn resolve_job(
        &self,
        definition: &str,
        parameters: &Properties,
    ) -> Result<ResolvedModel, ModelError>;

    /// Resolve one partition replica's view of a step definition.
    fn resolve_partition(
        &self,
        definition: &str,
        parameters: &Properties,
        partition_properties: &Properties,
    ) -> Result<ResolvedModel, ModelError>;

    /// Resolve one flow of a split.
    fn resolve_split_flow(
        &self,
        definition: &str,
        parameters: &Properties,
        split_name: &str,
        flow_name: &str,
    ) -> Result<ResolvedModel, ModelError>;
}
