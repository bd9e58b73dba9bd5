// YAML Model Resolver
// A minimal ModelResolver over YAML definitions, for tests and examples

use serde::Deserialize;

use crate::model::{ModelError, ModelResolver, Properties, Property, ResolvedModel};

#[derive(Debug, Deserialize)]
struct JobDefinition {
    job: String,
    #[serde(default)]
    properties: Vec<PropertyDefinition>,
}

#[derive(Debug, Deserialize)]
struct PropertyDefinition {
    name: String,
    value: String,
}

/// Resolves definitions of the form:
///
/// ```yaml
/// job: payroll
/// properties:
///   - name: region
///     value: "${region}"
/// ```
///
/// `${name}` references are substituted from the given parameter scopes;
/// for partitions, partition-scoped properties are consulted before the
/// submission parameters.
#[derive(Debug, Default)]
pub struct YamlModelResolver;

impl YamlModelResolver {
    pub fn new() -> Self {
        Self
    }

    fn resolve(&self, definition: &str, scopes: &[&Properties]) -> Result<ResolvedModel, ModelError> {
        let parsed: JobDefinition =
            serde_yaml::from_str(definition).map_err(|e| ModelError::Parse(e.to_string()))?;

        let properties = parsed
            .properties
            .into_iter()
            .map(|p| {
                let value = substitute(&p.value, scopes)?;
                Ok(Property::new(p.name, value))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;

        Ok(ResolvedModel {
            job_name: parsed.job,
            definition_text: definition.to_string(),
            properties,
        })
    }
}

impl ModelResolver for YamlModelResolver {
    fn resolve_job(
        &self,
        definition: &str,
        parameters: &Properties,
    ) -> Result<ResolvedModel, ModelError> {
        self.resolve(definition, &[parameters])
    }

    fn resolve_partition(
        &self,
        definition: &str,
        parameters: &Properties,
        partition_properties: &Properties,
    ) -> Result<ResolvedModel, ModelError> {
        // partition-scoped overrides win over submission parameters
        self.resolve(definition, &[partition_properties, parameters])
    }

    fn resolve_split_flow(
        &self,
        definition: &str,
        parameters: &Properties,
        _split_name: &str,
        _flow_name: &str,
    ) -> Result<ResolvedModel, ModelError> {
        self.resolve(definition, &[parameters])
    }
}

/// Replace every `${name}` with the first value found across the scopes.
fn substitute(raw: &str, scopes: &[&Properties]) -> Result<String, ModelError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ModelError::Parse(format!("unterminated property reference in '{raw}'")))?;
        let name = &after[..end];
        let value = scopes
            .iter()
            .find_map(|scope| scope.get(name))
            .ok_or_else(|| ModelError::UnresolvedProperty(name.to_string()))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
