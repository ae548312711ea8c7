//! # Schema Collaborator
//!
//! The slice of a directory schema the storage engine actually consumes:
//! resolving attribute ids (names or OIDs, any case) to canonical OIDs,
//! and normalizing attribute values with the attribute's equality
//! matching rule. The engine never interprets object classes beyond the
//! `alias` marker; everything else schema-related belongs to the caller.
//!
//! [`SchemaRegistry::core`] ships the attribute types the test corpus and
//! a minimal partition need. Callers register additional types before
//! handing the registry to the store.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;

use crate::error::StoreError;

/// Equality matching rules the engine normalizes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    /// Case-insensitive, leading/trailing space trimmed, runs of inner
    /// whitespace collapsed (caseIgnoreMatch).
    CaseIgnore,
    /// Identity (octet/exact match).
    Exact,
}

impl Normalizer {
    pub fn normalize(&self, value: &str) -> String {
        match self {
            Normalizer::Exact => value.to_string(),
            Normalizer::CaseIgnore => {
                let mut out = String::with_capacity(value.len());
                for (i, word) in value.split_whitespace().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.extend(word.chars().flat_map(char::to_lowercase));
                }
                out
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttributeType {
    oid: String,
    names: Vec<String>,
    equality: Normalizer,
}

impl AttributeType {
    pub fn new(oid: &str, names: &[&str], equality: Normalizer) -> Self {
        Self {
            oid: oid.to_string(),
            names: names.iter().map(|n| n.to_string()).collect(),
            equality,
        }
    }

    pub fn oid(&self) -> &str {
        &self.oid
    }

    /// First registered name, falling back to the OID.
    pub fn primary_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.oid)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn equality(&self) -> Normalizer {
        self.equality
    }
}

/// Attribute-type registry: id resolution plus normalizer lookup.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    by_oid: HashMap<String, AttributeType>,
    name_to_oid: HashMap<String, String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the core directory attribute types.
    pub fn core() -> Arc<Self> {
        let mut registry = Self::new();
        for at in [
            AttributeType::new("2.5.4.0", &["objectClass"], Normalizer::CaseIgnore),
            AttributeType::new("2.5.4.1", &["aliasedObjectName"], Normalizer::CaseIgnore),
            AttributeType::new("2.5.4.3", &["cn", "commonName"], Normalizer::CaseIgnore),
            AttributeType::new("2.5.4.4", &["sn", "surname"], Normalizer::CaseIgnore),
            AttributeType::new("2.5.4.10", &["o", "organizationName"], Normalizer::CaseIgnore),
            AttributeType::new("2.5.4.11", &["ou", "organizationalUnitName"], Normalizer::CaseIgnore),
            AttributeType::new("2.5.4.13", &["description"], Normalizer::CaseIgnore),
            AttributeType::new("2.5.4.31", &["member"], Normalizer::CaseIgnore),
            AttributeType::new("2.5.4.35", &["userPassword"], Normalizer::Exact),
            AttributeType::new(
                "0.9.2342.19200300.100.1.1",
                &["uid", "userid"],
                Normalizer::CaseIgnore,
            ),
            AttributeType::new("0.9.2342.19200300.100.1.3", &["mail"], Normalizer::CaseIgnore),
            AttributeType::new(
                "0.9.2342.19200300.100.1.25",
                &["dc", "domainComponent"],
                Normalizer::CaseIgnore,
            ),
        ] {
            registry.register(at);
        }
        Arc::new(registry)
    }

    pub fn register(&mut self, attribute_type: AttributeType) {
        for name in attribute_type.names() {
            self.name_to_oid
                .insert(name.to_ascii_lowercase(), attribute_type.oid().to_string());
        }
        self.by_oid
            .insert(attribute_type.oid().to_string(), attribute_type);
    }

    /// Resolves an attribute id (name or OID, any case) to its OID.
    pub fn resolve_oid(&self, id: &str) -> Result<&str> {
        let trimmed = id.trim();
        if let Some(at) = self.by_oid.get(trimmed) {
            return Ok(at.oid());
        }
        if let Some(oid) = self.name_to_oid.get(&trimmed.to_ascii_lowercase()) {
            return Ok(oid);
        }
        Err(StoreError::SchemaViolation {
            detail: format!("attribute id '{id}' cannot be resolved to an OID"),
        }
        .into())
    }

    pub fn attribute_type(&self, id: &str) -> Result<&AttributeType> {
        let oid = self.resolve_oid(id)?.to_string();
        Ok(&self.by_oid[&oid])
    }

    pub fn has(&self, id: &str) -> bool {
        self.resolve_oid(id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_names_and_aliases_case_insensitively() {
        let registry = SchemaRegistry::core();
        assert_eq!(registry.resolve_oid("cn").unwrap(), "2.5.4.3");
        assert_eq!(registry.resolve_oid("CommonName").unwrap(), "2.5.4.3");
        assert_eq!(registry.resolve_oid("OBJECTCLASS").unwrap(), "2.5.4.0");
        assert_eq!(registry.resolve_oid("2.5.4.3").unwrap(), "2.5.4.3");
    }

    #[test]
    fn unknown_attribute_is_a_schema_violation() {
        let registry = SchemaRegistry::core();
        let err = registry.resolve_oid("noSuchAttr").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn case_ignore_normalization_trims_and_collapses() {
        let n = Normalizer::CaseIgnore;
        assert_eq!(n.normalize("  Alice   B.  Smith "), "alice b. smith");
        assert_eq!(n.normalize("ALICE"), "alice");
    }

    #[test]
    fn exact_normalization_is_identity() {
        assert_eq!(Normalizer::Exact.normalize("  MiXeD "), "  MiXeD ");
    }

    #[test]
    fn custom_registration_round_trips() {
        let mut registry = SchemaRegistry::new();
        registry.register(AttributeType::new(
            "1.2.3.4",
            &["color"],
            Normalizer::CaseIgnore,
        ));
        assert_eq!(registry.resolve_oid("Color").unwrap(), "1.2.3.4");
        assert_eq!(
            registry.attribute_type("color").unwrap().primary_name(),
            "color"
        );
    }
}
