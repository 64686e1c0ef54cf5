//! Versioned event schema contracts
//!
//! Every event type is a contract `{type, schema_version, field set}`. Within a
//! version, and from one version to the next, fields may only be added: a
//! revision that removes or retypes an existing field is rejected with
//! [`SchemaError::Incompatible`].

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::events::{saga_types, Event, Payload};

/// Type of a payload field
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
}

/// Declaration of one field of a schema
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Schema of one (event type, version) pair
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSchema {
    pub event_type: String,
    pub version: u32,
    pub fields: BTreeMap<String, FieldSpec>,
}

impl EventSchema {
    pub fn new(event_type: &str, version: u32) -> Self {
        Self {
            event_type: event_type.to_string(),
            version,
            fields: BTreeMap::new(),
        }
    }

    /// Add a required field
    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.insert(name.to_string(), FieldSpec { kind, required: true });
        self
    }

    /// Add an optional field
    pub fn optional(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.insert(name.to_string(), FieldSpec { kind, required: false });
        self
    }

    /// Check that `newer` only adds fields to `self`
    pub fn check_additive(&self, newer: &EventSchema) -> Result<(), SchemaError> {
        for (name, spec) in &self.fields {
            match newer.fields.get(name) {
                None => {
                    return Err(SchemaError::Incompatible {
                        event_type: newer.event_type.clone(),
                        version: newer.version,
                        reason: format!("field `{name}` removed"),
                    })
                }
                Some(next) if next.kind != spec.kind => {
                    return Err(SchemaError::Incompatible {
                        event_type: newer.event_type.clone(),
                        version: newer.version,
                        reason: format!(
                            "field `{name}` retyped from {:?} to {:?}",
                            spec.kind, next.kind
                        ),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Validate a payload against this schema.
    ///
    /// Fields unknown to the schema are accepted (additive producers).
    pub fn validate(&self, payload: &Payload) -> Result<(), SchemaError> {
        for (name, spec) in &self.fields {
            match payload.get(name).and_then(|v| v.kind().map(|k| (k, v))) {
                None if spec.required => {
                    return Err(SchemaError::MissingField {
                        event_type: self.event_type.clone(),
                        field: name.clone(),
                    })
                }
                None => {}
                Some((kind, _)) if kind != spec.kind => {
                    return Err(SchemaError::InvalidField {
                        event_type: self.event_type.clone(),
                        field: name.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// A consumer's declared interest in an event type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInterest {
    pub event_type: String,
    pub min_version: u32,
    pub max_version: u32,
}

impl SchemaInterest {
    pub fn new(event_type: &str, min_version: u32, max_version: u32) -> Self {
        Self {
            event_type: event_type.to_string(),
            min_version,
            max_version,
        }
    }

    /// Interest in version 1 only
    pub fn v1(event_type: &str) -> Self {
        Self::new(event_type, 1, 1)
    }

    pub fn accepts(&self, event: &Event) -> Result<(), SchemaError> {
        if (self.min_version..=self.max_version).contains(&event.schema_version) {
            Ok(())
        } else {
            Err(SchemaError::Incompatible {
                event_type: event.event_type.clone(),
                version: event.schema_version,
                reason: format!(
                    "consumer handles versions {}..={}",
                    self.min_version, self.max_version
                ),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("schema incompatible for {event_type} v{version}: {reason}")]
    Incompatible {
        event_type: String,
        version: u32,
        reason: String,
    },
    #[error("no schema registered for {event_type} v{version}")]
    UnknownSchema { event_type: String, version: u32 },
    #[error("{event_type}: missing field `{field}`")]
    MissingField { event_type: String, field: String },
    #[error("{event_type}: field `{field}` has the wrong type")]
    InvalidField { event_type: String, field: String },
}

/// Registry of event schemas keyed by (type, version)
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, BTreeMap<u32, EventSchema>>>,
    strict: bool,
}

impl SchemaRegistry {
    /// Registry that rejects events whose schema is unknown
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            strict: true,
        }
    }

    /// Registry that lets events with no registered schema through unchecked
    pub fn permissive() -> Self {
        Self {
            strict: false,
            ..Self::new()
        }
    }

    /// Register a schema, or a revision of an already registered version.
    ///
    /// A revision must be additive relative to the current definition of the
    /// same version and to the closest lower version.
    pub fn register(&self, schema: EventSchema) -> Result<(), SchemaError> {
        let mut schemas = self.schemas.write().map_err(|_| SchemaError::Incompatible {
            event_type: schema.event_type.clone(),
            version: schema.version,
            reason: "registry lock poisoned".to_string(),
        })?;
        let versions = schemas.entry(schema.event_type.clone()).or_default();

        if let Some(existing) = versions.get(&schema.version) {
            existing.check_additive(&schema)?;
        }
        if let Some((_, previous)) = versions.range(..schema.version).next_back() {
            previous.check_additive(&schema)?;
        }
        if let Some((_, following)) = versions.range(schema.version + 1..).next() {
            schema.check_additive(following)?;
        }

        tracing::debug!(
            event_type = %schema.event_type,
            version = schema.version,
            "Schema registered"
        );
        versions.insert(schema.version, schema);
        Ok(())
    }

    pub fn get(&self, event_type: &str, version: u32) -> Option<EventSchema> {
        let schemas = self.schemas.read().ok()?;
        schemas.get(event_type)?.get(&version).cloned()
    }

    pub fn latest_version(&self, event_type: &str) -> Option<u32> {
        let schemas = self.schemas.read().ok()?;
        schemas.get(event_type)?.keys().next_back().copied()
    }

    /// Validate an event's payload against its declared schema version
    pub fn validate(&self, event: &Event) -> Result<(), SchemaError> {
        match self.get(&event.event_type, event.schema_version) {
            Some(schema) => schema.validate(&event.payload),
            None if self.strict => Err(SchemaError::UnknownSchema {
                event_type: event.event_type.clone(),
                version: event.schema_version,
            }),
            None => Ok(()),
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register version 1 of every saga protocol message
pub fn register_protocol_schemas(registry: &SchemaRegistry) -> Result<(), SchemaError> {
    for event_type in saga_types::ALL {
        let mut schema = EventSchema::new(event_type, 1)
            .field("saga_id", FieldKind::Text)
            .field("saga_type", FieldKind::Text)
            .field("step", FieldKind::Text)
            .field("step_index", FieldKind::Int);
        if matches!(
            event_type,
            saga_types::STEP_FAILED | saga_types::COMPENSATION_FAILED | saga_types::SAGA_FAILED
        ) {
            schema = schema.field("reason", FieldKind::Text);
        }
        registry.register(schema)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient_created_v1() -> EventSchema {
        EventSchema::new("patient.created", 1)
            .field("patient_id", FieldKind::Text)
            .field("name", FieldKind::Text)
    }

    #[test]
    fn additive_revision_is_accepted() {
        let registry = SchemaRegistry::new();
        registry.register(patient_created_v1()).unwrap();
        registry
            .register(patient_created_v1().optional("email", FieldKind::Text))
            .unwrap();
        registry
            .register(
                EventSchema::new("patient.created", 2)
                    .field("patient_id", FieldKind::Text)
                    .field("name", FieldKind::Text)
                    .optional("email", FieldKind::Text)
                    .field("birth_year", FieldKind::Int),
            )
            .unwrap();

        assert_eq!(registry.latest_version("patient.created"), Some(2));
        assert!(registry.get("patient.created", 1).unwrap().fields.contains_key("email"));
    }

    #[test]
    fn removing_or_retyping_a_field_is_incompatible() {
        let registry = SchemaRegistry::new();
        registry.register(patient_created_v1()).unwrap();

        let removed = EventSchema::new("patient.created", 1).field("patient_id", FieldKind::Text);
        assert!(matches!(registry.register(removed), Err(SchemaError::Incompatible { .. })));

        let retyped = EventSchema::new("patient.created", 2)
            .field("patient_id", FieldKind::Int)
            .field("name", FieldKind::Text);
        assert!(matches!(registry.register(retyped), Err(SchemaError::Incompatible { .. })));
    }

    #[test]
    fn payload_validation() {
        let registry = SchemaRegistry::new();
        registry.register(patient_created_v1()).unwrap();

        let ok = Event::builder("patient.created", "p-1")
            .field("patient_id", "p-1")
            .field("name", "Ada")
            .field("extra", 3i64)
            .build();
        assert!(registry.validate(&ok).is_ok());

        let missing = Event::builder("patient.created", "p-1").field("patient_id", "p-1").build();
        assert!(matches!(registry.validate(&missing), Err(SchemaError::MissingField { .. })));

        let wrong = Event::builder("patient.created", "p-1")
            .field("patient_id", 1i64)
            .field("name", "Ada")
            .build();
        assert!(matches!(registry.validate(&wrong), Err(SchemaError::InvalidField { .. })));

        let unknown = Event::builder("patient.created", "p-1").schema_version(9).build();
        assert!(matches!(registry.validate(&unknown), Err(SchemaError::UnknownSchema { .. })));
        assert!(SchemaRegistry::permissive().validate(&unknown).is_ok());
    }

    #[test]
    fn interest_version_range() {
        let interest = SchemaInterest::new("patient.created", 1, 2);
        let v2 = Event::builder("patient.created", "p-1").schema_version(2).build();
        let v3 = Event::builder("patient.created", "p-1").schema_version(3).build();

        assert!(interest.accepts(&v2).is_ok());
        assert!(matches!(interest.accepts(&v3), Err(SchemaError::Incompatible { .. })));
    }
}
