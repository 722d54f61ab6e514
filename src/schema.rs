//! Schema metadata: which entity types carry encrypted fields

use crate::error::Result;
use crate::SchemaRegistry;

/// Storage type name declared for fields whose values are encrypted at rest.
pub const ENCRYPTED_TEXT_TYPE: &str = "encrypted_text";

/// A field declaration within an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMetadata {
    /// Field name
    pub name: String,

    /// Declared storage type, e.g. `text` or `encrypted_text`
    pub storage_type: String,
}

impl FieldMetadata {
    /// Creates field metadata.
    pub fn new(name: impl Into<String>, storage_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage_type: storage_type.into(),
        }
    }

    /// True when values of this field are encrypted at rest.
    pub fn is_encrypted(&self) -> bool {
        self.storage_type == ENCRYPTED_TEXT_TYPE
    }
}

/// Metadata for one entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    /// Entity type name
    pub entity_type: String,

    /// Abstract base types cannot be instantiated and own no records
    pub is_abstract: bool,

    /// Declared fields, in declaration order
    pub fields: Vec<FieldMetadata>,
}

impl EntityMetadata {
    /// Creates metadata for a concrete entity type with no fields.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            is_abstract: false,
            fields: Vec::new(),
        }
    }

    /// Marks the entity type as an abstract base type.
    pub fn abstract_base(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Adds a field declaration.
    pub fn with_field(mut self, name: impl Into<String>, storage_type: impl Into<String>) -> Self {
        self.fields.push(FieldMetadata::new(name, storage_type));
        self
    }
}

/// An in-memory implementation of the `SchemaRegistry` trait.
#[derive(Debug, Default)]
pub struct InMemorySchemaRegistry {
    entities: Vec<EntityMetadata>,
}

impl InMemorySchemaRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity type declaration.
    pub fn with_entity(mut self, entity: EntityMetadata) -> Self {
        self.entities.push(entity);
        self
    }
}

impl SchemaRegistry for InMemorySchemaRegistry {
    fn all_metadata(&self) -> Result<Vec<EntityMetadata>> {
        Ok(self.entities.clone())
    }
}

/// An entity type with at least one encryption-eligible field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibleEntity {
    /// Entity type name
    pub entity_type: String,

    /// Names of the fields declared [`ENCRYPTED_TEXT_TYPE`], in declaration
    /// order
    pub fields: Vec<String>,
}

/// Discovers every entity type carrying encryption-eligible fields.
///
/// Abstract base types are skipped and entity types without a single eligible
/// field are dropped, so an empty result means there is nothing to migrate.
pub fn eligible_entities(registry: &dyn SchemaRegistry) -> Result<Vec<EligibleEntity>> {
    let mut eligible = Vec::new();

    for entity in registry.all_metadata()? {
        if entity.is_abstract {
            continue;
        }

        let fields: Vec<String> = entity
            .fields
            .iter()
            .filter(|field| field.is_encrypted())
            .map(|field| field.name.clone())
            .collect();

        if fields.is_empty() {
            continue;
        }

        eligible.push(EligibleEntity {
            entity_type: entity.entity_type,
            fields,
        });
    }

    Ok(eligible)
}
