//! Multi-tenant routing of decision requests.
//!
//! Each open host window registers a consumer under its project root. A
//! request is routed to the registration whose root is the longest
//! segment-aligned prefix of the resource path found in the request inputs.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;

use crate::broker::{DecisionShower, RequestKind};

/// Input fields checked for a resource path, in priority order.
const PATH_FIELDS: &[&str] = &["file_path", "path", "notebook_path"];
const COMMAND_FIELD: &str = "command";

static PATH_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|=)((?:/|~[/\\]|[A-Za-z]:[/\\])[^'";|&<>]*)"#).expect("valid regex")
});

pub struct ConsumerRegistration {
    tenant_root: String,
    shower: Arc<dyn DecisionShower>,
}

impl ConsumerRegistration {
    pub fn tenant_root(&self) -> &str {
        &self.tenant_root
    }

    pub fn shower(&self) -> Arc<dyn DecisionShower> {
        Arc::clone(&self.shower)
    }
}

impl std::fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("tenant_root", &self.tenant_root)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct TenantRouter {
    registrations: RwLock<Vec<Arc<ConsumerRegistration>>>,
}

impl TenantRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer for `tenant_root`, replacing any previous
    /// registration for the same root.
    pub fn register(&self, tenant_root: &str, shower: Arc<dyn DecisionShower>) {
        let root = normalize_path(tenant_root);
        let mut registrations = self.registrations.write();
        registrations.retain(|existing| existing.tenant_root != root);
        tracing::debug!(target = "session_bridge::routing", root = %root, "consumer registered");
        registrations.push(Arc::new(ConsumerRegistration {
            tenant_root: root,
            shower,
        }));
    }

    pub fn unregister(&self, tenant_root: &str) -> bool {
        let root = normalize_path(tenant_root);
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|existing| existing.tenant_root != root);
        let removed = registrations.len() != before;
        if removed {
            tracing::debug!(target = "session_bridge::routing", root = %root, "consumer unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }

    /// Pick the consumer for a request.
    ///
    /// Only registrations able to show `kind` are candidates. With one
    /// candidate it is returned directly; with several, the resource path
    /// from `inputs` (or `cwd` when the inputs carry none) selects the
    /// longest matching root, falling back to the first candidate.
    pub fn select(
        &self,
        kind: RequestKind,
        inputs: &Value,
        cwd: Option<&str>,
    ) -> Option<Arc<ConsumerRegistration>> {
        let registrations = self.registrations.read();
        let candidates: Vec<&Arc<ConsumerRegistration>> = registrations
            .iter()
            .filter(|registration| registration.shower.supports(kind))
            .collect();

        match candidates.len() {
            0 => return None,
            1 => return Some(Arc::clone(candidates[0])),
            _ => {}
        }

        let path = extract_resource_path(inputs)
            .map(|raw| absolutize(&raw, cwd))
            .or_else(|| cwd.map(normalize_path));

        if let Some(path) = path.as_deref() {
            if let Some(best) = longest_prefix_match(&candidates, path) {
                tracing::debug!(
                    target = "session_bridge::routing",
                    path = %path,
                    root = %best.tenant_root,
                    "routed by resource path"
                );
                return Some(Arc::clone(best));
            }
        }

        tracing::debug!(
            target = "session_bridge::routing",
            path = ?path,
            candidates = candidates.len(),
            "no tenant root matched, using first registration"
        );
        Some(Arc::clone(candidates[0]))
    }
}

fn longest_prefix_match<'a>(
    candidates: &[&'a Arc<ConsumerRegistration>],
    path: &str,
) -> Option<&'a Arc<ConsumerRegistration>> {
    candidates
        .iter()
        .filter(|registration| root_contains(&registration.tenant_root, path))
        .max_by_key(|registration| registration.tenant_root.len())
        .copied()
}

/// Pull the first resource path out of a tool's inputs.
pub fn extract_resource_path(inputs: &Value) -> Option<String> {
    let object = inputs.as_object()?;
    for field in PATH_FIELDS {
        if let Some(path) = object.get(*field).and_then(Value::as_str) {
            if !path.trim().is_empty() {
                return Some(path.trim().to_string());
            }
        }
    }
    object
        .get(COMMAND_FIELD)
        .and_then(Value::as_str)
        .and_then(path_from_command)
}

fn path_from_command(command: &str) -> Option<String> {
    let tokens = shlex::split(command)
        .unwrap_or_else(|| command.split_whitespace().map(ToOwned::to_owned).collect());
    tokens.iter().find_map(|token| {
        PATH_TOKEN
            .captures(token)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Use forward slashes and drop trailing separators (except a bare root).
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn absolutize(raw: &str, cwd: Option<&str>) -> String {
    let normalized = normalize_path(raw);
    let is_absolute = normalized.starts_with('/')
        || normalized.starts_with('~')
        || Path::new(raw).is_absolute()
        || normalized.as_bytes().get(1) == Some(&b':');
    match cwd {
        Some(cwd) if !is_absolute => normalize_path(&format!("{cwd}/{normalized}")),
        _ => normalized,
    }
}

/// True when `path` is `root` itself or lies below it. Matching happens only
/// at whole segment boundaries.
pub fn root_contains(root: &str, path: &str) -> bool {
    let root = normalize_path(root);
    let path = normalize_path(path);
    if root.is_empty() {
        return false;
    }
    if root == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(root.as_str()) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}
