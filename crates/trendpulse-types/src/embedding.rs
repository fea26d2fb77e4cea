use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// What an embedding row points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    SourceItem,
    TopicSummary,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::SourceItem => "source_item",
            ObjectType::TopicSummary => "topic_summary",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "source_item" => Ok(ObjectType::SourceItem),
            "topic_summary" => Ok(ObjectType::TopicSummary),
            other => Err(Error::Parse(format!("unknown object type '{}'", other))),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative embedding row. The vector index is a derived copy and is
/// reconstructable from these rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub object_type: ObjectType,
    pub object_id: i64,
    pub provider: String,
    pub model: String,
    pub vector: Vec<f32>,
}

/// Key for an entry in the vector index, e.g. `source_item_42`.
pub fn vector_key(object_type: ObjectType, object_id: i64) -> String {
    format!("{}_{}", object_type.as_str(), object_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_round_trip() {
        assert_eq!(
            ObjectType::parse("source_item").unwrap(),
            ObjectType::SourceItem
        );
        assert_eq!(
            ObjectType::parse("topic_summary").unwrap(),
            ObjectType::TopicSummary
        );
        assert!(ObjectType::parse("topic_node").is_err());
    }

    #[test]
    fn test_vector_key_format() {
        assert_eq!(vector_key(ObjectType::SourceItem, 42), "source_item_42");
        assert_eq!(vector_key(ObjectType::TopicSummary, 7), "topic_summary_7");
    }
}
