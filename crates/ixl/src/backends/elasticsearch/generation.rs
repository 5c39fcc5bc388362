//! 🧬 REST generations: the parts of the API that changed between cluster majors.
//!
//! Elasticsearch 6 still speaks in mapping types: documents live at `/{index}/{type}/{id}`,
//! bulk action lines carry `_type`, and mappings are wrapped in the type name. From 7 on,
//! everything is typeless and `_doc` is just a path word.
//!
//! Every generation is a small marker type with static dispatch, the same trick the
//! format transforms use: the compiler monomorphizes `ElasticsearchBackend<G>` per
//! generation and nobody pays for a vtable. 🦆

use std::fmt::Debug;

use serde_json::{Map, Value};

/// 🧬 What differs between REST generations. Everything else is shared plumbing.
pub trait ApiGeneration: Debug + Clone + Send + Sync + 'static {
    /// 🏷️ for logs
    fn name(&self) -> &'static str;
    /// 📐 path segments of a single document
    fn document_path<'a>(&'a self, index: &'a str, id: &'a str) -> Vec<&'a str>;
    /// 📎 metadata object inside a bulk action line
    fn action_metadata(&self, index: &str, id: &str) -> Map<String, Value>;
    /// 🗺️ the `mappings` section of a create-index body
    fn mappings_body(&self, mappings: &Value) -> Value;
}

/// 🆕 Elasticsearch 7 and 8: typeless.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypelessApi;

impl ApiGeneration for TypelessApi {
    fn name(&self) -> &'static str {
        "typeless (7.x/8.x)"
    }

    fn document_path<'a>(&'a self, index: &'a str, id: &'a str) -> Vec<&'a str> {
        vec![index, "_doc", id]
    }

    fn action_metadata(&self, index: &str, id: &str) -> Map<String, Value> {
        let mut the_metadata = Map::new();
        the_metadata.insert("_index".to_string(), Value::String(index.to_string()));
        the_metadata.insert("_id".to_string(), Value::String(id.to_string()));
        the_metadata
    }

    fn mappings_body(&self, mappings: &Value) -> Value {
        mappings.clone()
    }
}

/// 👴 Elasticsearch 6: one mapping type per index, named in config.
#[derive(Debug, Clone)]
pub struct TypedApi {
    mapping_type: String,
}

impl TypedApi {
    pub fn new(mapping_type: impl Into<String>) -> Self {
        Self {
            mapping_type: mapping_type.into(),
        }
    }

    pub fn mapping_type(&self) -> &str {
        &self.mapping_type
    }
}

impl ApiGeneration for TypedApi {
    fn name(&self) -> &'static str {
        "typed (6.x)"
    }

    fn document_path<'a>(&'a self, index: &'a str, id: &'a str) -> Vec<&'a str> {
        vec![index, self.mapping_type.as_str(), id]
    }

    fn action_metadata(&self, index: &str, id: &str) -> Map<String, Value> {
        let mut the_metadata = Map::new();
        the_metadata.insert("_index".to_string(), Value::String(index.to_string()));
        the_metadata.insert("_type".to_string(), Value::String(self.mapping_type.clone()));
        the_metadata.insert("_id".to_string(), Value::String(id.to_string()));
        the_metadata
    }

    fn mappings_body(&self, mappings: &Value) -> Value {
        // -- 🎁 already wrapped in the type name, or nothing to wrap: leave it be
        let already_typed = mappings.get(&self.mapping_type).is_some();
        let is_empty = mappings.as_object().is_none_or(|m| m.is_empty());
        if already_typed || is_empty {
            return mappings.clone();
        }
        let mut the_wrapper = Map::new();
        the_wrapper.insert(self.mapping_type.clone(), mappings.clone());
        Value::Object(the_wrapper)
    }
}
