//! Remembered permission choices.
//!
//! Two tiers: a tool-only "always" entry, and an entry scoped to the tool
//! plus a hash of its inputs. The tool-only tier is consulted first. Entries
//! never expire; they are cleared only on request.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Default)]
pub struct PermissionMemory {
    inner: RwLock<MemoryTables>,
}

#[derive(Debug, Default)]
struct MemoryTables {
    always: HashMap<String, bool>,
    scoped: HashMap<(String, String), bool>,
}

impl PermissionMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember_always(&self, tool: &str, allow: bool) {
        tracing::debug!(target = "session_bridge::memory", tool = %tool, allow, "remembering tool choice");
        self.inner.write().always.insert(tool.to_string(), allow);
    }

    pub fn remember(&self, tool: &str, input_hash: &str, allow: bool) {
        tracing::debug!(target = "session_bridge::memory", tool = %tool, hash = %input_hash, allow, "remembering scoped choice");
        self.inner
            .write()
            .scoped
            .insert((tool.to_string(), input_hash.to_string()), allow);
    }

    /// Convenience for [`remember`](Self::remember) that hashes `inputs`.
    pub fn remember_inputs(&self, tool: &str, inputs: &Value, allow: bool) {
        self.remember(tool, &input_hash(inputs), allow);
    }

    pub fn lookup(&self, tool: &str, inputs: &Value) -> Option<bool> {
        let tables = self.inner.read();
        if let Some(allow) = tables.always.get(tool) {
            return Some(*allow);
        }
        if tables.scoped.is_empty() {
            return None;
        }
        tables
            .scoped
            .get(&(tool.to_string(), input_hash(inputs)))
            .copied()
    }

    pub fn clear_all(&self) {
        let mut tables = self.inner.write();
        tables.always.clear();
        tables.scoped.clear();
    }

    pub fn clear_for_tool(&self, tool: &str) {
        let mut tables = self.inner.write();
        tables.always.remove(tool);
        tables.scoped.retain(|(name, _), _| name != tool);
    }

    pub fn len(&self) -> usize {
        let tables = self.inner.read();
        tables.always.len() + tables.scoped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stable hash of a tool's inputs. Object keys are sorted before hashing so
/// that equal key/value content always yields the same digest.
pub fn input_hash(inputs: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(inputs, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
