use std::collections::{HashMap, HashSet};

use crate::crs::crs_utils::Crs;

/// Value of a single attribute. Null values are not stored, the attribute is simply absent.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Integer(i64),
    Real(f64),
    String(String),
}

impl AttributeValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            AttributeValue::Integer(_) => FieldType::Integer,
            AttributeValue::Real(_) => FieldType::Real,
            AttributeValue::String(_) => FieldType::String,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Real,
    String,
}

impl FieldType {
    /// The narrowest type able to hold values of both `self` and `other`.
    pub fn widen(self, other: FieldType) -> FieldType {
        use FieldType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Real) | (Real, Integer) => Real,
            _ => String,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDefinition {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
        }
    }
}

pub type FeatureMap = HashMap<String, AttributeValue>;

#[derive(Debug, Clone)]
pub struct Feature {
    pub geometry: geo::Geometry,
    pub attributes: Option<FeatureMap>,
}

impl Feature {
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .as_ref()
            .and_then(|attributes| attributes.get(name))
    }
}

impl From<geo::Geometry> for Feature {
    fn from(value: geo::Geometry) -> Self {
        Self {
            geometry: value,
            attributes: None,
        }
    }
}

/// An ordered table of features sharing a schema and a CRS.
#[derive(Debug, Clone)]
pub struct FeatureCollection {
    pub schema: Vec<FieldDefinition>,
    pub features: Vec<Feature>,
    pub crs: Crs,
}

impl FeatureCollection {
    pub fn new(schema: Vec<FieldDefinition>, features: Vec<Feature>, crs: Crs) -> Self {
        Self {
            schema,
            features,
            crs,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Keep only the first `max_features` features.
    pub fn truncate(&mut self, max_features: usize) {
        self.features.truncate(max_features);
    }

    /// Concatenate collections in order into a single collection tagged with `crs`.
    ///
    /// The resulting schema is the union of all input schemas in first-seen order, with field
    /// types widened where inputs disagree. Features keep exactly the attributes they had, so rows
    /// coming from an input without a given column have no value for it.
    pub fn concat(collections: Vec<FeatureCollection>, crs: Crs) -> FeatureCollection {
        let schema = merge_schemas(collections.iter().map(|collection| &collection.schema));
        let total: usize = collections.iter().map(FeatureCollection::len).sum();
        let mut features = Vec::with_capacity(total);
        for collection in collections {
            features.extend(collection.features);
        }
        FeatureCollection {
            schema,
            features,
            crs,
        }
    }
}

fn merge_schemas<'a>(
    schemas: impl Iterator<Item = &'a Vec<FieldDefinition>>,
) -> Vec<FieldDefinition> {
    let mut merged: Vec<FieldDefinition> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for schema in schemas {
        for field in schema {
            if seen.insert(field.name.clone()) {
                merged.push(field.clone());
            } else if let Some(existing) = merged.iter_mut().find(|f| f.name == field.name) {
                existing.field_type = existing.field_type.widen(field.field_type);
            }
        }
    }
    merged
}
