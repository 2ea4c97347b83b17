use crate::PATCH_MARKER;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Global lookup function the rewritten call sites go through.
pub const MAP_FUNCTION: &str = "globalThis.__cliMap";

/// Source id -> target id pairs, always iterated in key order so the
/// generated header is byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    entries: BTreeMap<String, String>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later pairs override earlier ones; pairs with an empty side are dropped.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut table = Self::new();
        for (source, target) in pairs {
            table.insert(source, target);
        }
        table
    }

    pub fn insert(&mut self, source: impl Into<String>, target: impl Into<String>) -> Option<String> {
        let source = source.into();
        let target = target.into();
        if source.trim().is_empty() || target.trim().is_empty() {
            return None;
        }
        self.entries.insert(source, target)
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.entries.get(source).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `"a":"x","b":"y"`, the body of a JS object literal.
    pub fn to_js_object_body(&self) -> String {
        self.iter()
            .map(|(source, target)| format!("{}:{}", js_string(source), js_string(target)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Marker, table and accessor on one line, ready to splice before the
    /// bundle's first import.
    pub fn header_snippet(&self) -> String {
        format!(
            "{PATCH_MARKER}globalThis.__cliModelMap={{{}}};{MAP_FUNCTION}=function(m){{return(globalThis.__cliModelMap[m]||m)}};",
            self.to_js_object_body()
        )
    }
}

fn js_string(raw: &str) -> String {
    JsonValue::String(raw.to_string()).to_string()
}
