//! Catalog registry
//!
//! The authoritative view of everything the gateway aggregates: tools,
//! prompts, resources, and resource templates, keyed by namespaced
//! identifier, plus a per-backend index so removing a backend is one
//! operation. Mutation happens under a single writer lock; readers always
//! observe a complete pre- or post-sync state, never a partial insertion.

mod sync;

pub use sync::{SyncLists, sync_backend, sync_category};

use std::collections::{BTreeSet, HashMap};

use tokio::sync::broadcast;
use tracing::debug;

use crate::naming;
use crate::protocol::{Prompt, Resource, ResourceTemplate, ServerCapabilities, Tool};

/// Catalog category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Tool catalog
    Tools,
    /// Prompt catalog
    Prompts,
    /// Resource catalog
    Resources,
    /// Resource template catalog
    ResourceTemplates,
}

/// Emitted when a catalog mutates
#[derive(Debug, Clone, Copy)]
pub struct ChangeEvent {
    /// Which catalog changed
    pub category: Category,
}

/// A tool known to the gateway
#[derive(Debug, Clone)]
pub struct ToolEntry {
    /// Gateway-issued unique id
    pub namespaced_id: String,
    /// Owning backend name (the gateway's own name for local tools)
    pub backend: String,
    /// Original definition; `tool.name` is the un-namespaced name
    pub tool: Tool,
    /// Whether this is a meta-tool executed in-process
    pub is_local: bool,
}

/// A prompt known to the gateway
#[derive(Debug, Clone)]
pub struct PromptEntry {
    /// Gateway-issued unique id
    pub namespaced_id: String,
    /// Owning backend name
    pub backend: String,
    /// Original definition; `prompt.name` is the un-namespaced name
    pub prompt: Prompt,
}

/// A resource known to the gateway
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    /// Gateway-issued unique URI
    pub namespaced_uri: String,
    /// Owning backend name
    pub backend: String,
    /// Original definition; `resource.uri` is the opaque original URI
    pub resource: Resource,
}

/// A resource template known to the gateway
#[derive(Debug, Clone)]
pub struct TemplateEntry {
    /// Storage key (`backend_uriTemplate`)
    pub key: String,
    /// Owning backend name
    pub backend: String,
    /// Original definition with the original uriTemplate
    pub template: ResourceTemplate,
}

/// Resolution of a resource URI to its owning backend
#[derive(Debug, Clone)]
pub struct ResourceResolution {
    /// Owning backend name
    pub backend: String,
    /// The URI to present to the backend
    pub original_uri: String,
    /// The namespaced URI clients use
    pub namespaced_uri: String,
}

#[derive(Default)]
struct BackendIndex {
    tool_ids: BTreeSet<String>,
    prompt_ids: BTreeSet<String>,
    resource_uris: BTreeSet<String>,
    template_keys: BTreeSet<String>,
    capabilities: ServerCapabilities,
}

#[derive(Default)]
struct Catalogs {
    tools: HashMap<String, ToolEntry>,
    prompts: HashMap<String, PromptEntry>,
    resources: HashMap<String, ResourceEntry>,
    templates: HashMap<String, TemplateEntry>,
    backends: HashMap<String, BackendIndex>,
    // Derived flat lists, rebuilt on mutation, sorted by namespaced id so
    // repeated listings are byte-identical.
    flat_tools: Vec<(String, Tool)>,
    flat_prompts: Vec<(String, Prompt)>,
    flat_resources: Vec<(String, Resource)>,
    flat_templates: Vec<(String, ResourceTemplate)>,
}

impl Catalogs {
    fn rebuild_flat(&mut self, category: Category) {
        match category {
            Category::Tools => {
                let mut flat: Vec<(String, Tool)> = self
                    .tools
                    .values()
                    .map(|e| {
                        let mut tool = e.tool.clone();
                        tool.name = e.namespaced_id.clone();
                        (e.backend.clone(), tool)
                    })
                    .collect();
                flat.sort_by(|a, b| a.1.name.cmp(&b.1.name));
                self.flat_tools = flat;
            }
            Category::Prompts => {
                let mut flat: Vec<(String, Prompt)> = self
                    .prompts
                    .values()
                    .map(|e| {
                        let mut prompt = e.prompt.clone();
                        prompt.name = e.namespaced_id.clone();
                        (e.backend.clone(), prompt)
                    })
                    .collect();
                flat.sort_by(|a, b| a.1.name.cmp(&b.1.name));
                self.flat_prompts = flat;
            }
            Category::Resources => {
                let mut flat: Vec<(String, Resource)> = self
                    .resources
                    .values()
                    .map(|e| {
                        let mut resource = e.resource.clone();
                        resource.uri = e.namespaced_uri.clone();
                        (e.backend.clone(), resource)
                    })
                    .collect();
                flat.sort_by(|a, b| a.1.uri.cmp(&b.1.uri));
                self.flat_resources = flat;
            }
            Category::ResourceTemplates => {
                let mut flat: Vec<(String, ResourceTemplate)> = self
                    .templates
                    .values()
                    .map(|e| (e.backend.clone(), e.template.clone()))
                    .collect();
                // uri_template alone can collide across backends; the owner
                // breaks the tie so listings stay deterministic.
                flat.sort_by(|a, b| {
                    a.1.uri_template
                        .cmp(&b.1.uri_template)
                        .then_with(|| a.0.cmp(&b.0))
                });
                self.flat_templates = flat;
            }
        }
    }
}

/// The registry proper
pub struct Registry {
    /// Name under which the gateway registers its own meta-tools
    local_name: String,
    inner: parking_lot::RwLock<Catalogs>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(local_name: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            local_name: local_name.to_string(),
            inner: parking_lot::RwLock::new(Catalogs::default()),
            events,
        }
    }

    /// Name under which meta-tools are registered.
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Subscribe to catalog change events.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, category: Category) {
        let _ = self.events.send(ChangeEvent { category });

        let (tools, prompts, resources, templates) = self.counts();
        let (label, count) = match category {
            Category::Tools => ("tools", tools),
            Category::Prompts => ("prompts", prompts),
            Category::Resources => ("resources", resources),
            Category::ResourceTemplates => ("resource_templates", templates),
        };
        telemetry_metrics::gauge!("goblin_catalog_entries", "category" => label)
            .set(count as f64);
    }

    /// Register the gateway's own in-process tools.
    ///
    /// Local tools keep their plain names; they are resolved before any
    /// backend lookup and never engage a transport.
    pub fn register_local_tools(&self, tools: Vec<Tool>) {
        {
            let mut inner = self.inner.write();
            for tool in tools {
                let entry = ToolEntry {
                    namespaced_id: tool.name.clone(),
                    backend: self.local_name.clone(),
                    tool,
                    is_local: true,
                };
                inner.tools.insert(entry.namespaced_id.clone(), entry);
            }
            inner.rebuild_flat(Category::Tools);
        }
        self.emit(Category::Tools);
    }

    /// Record the capabilities a backend declared at connect time.
    pub fn set_backend_capabilities(&self, backend: &str, capabilities: ServerCapabilities) {
        let mut inner = self.inner.write();
        inner
            .backends
            .entry(backend.to_string())
            .or_default()
            .capabilities = capabilities;
    }

    /// Capabilities snapshot for a backend.
    #[must_use]
    pub fn backend_capabilities(&self, backend: &str) -> Option<ServerCapabilities> {
        self.inner
            .read()
            .backends
            .get(backend)
            .map(|b| b.capabilities.clone())
    }

    /// Replace one backend's entries in one category.
    ///
    /// Computes the set difference against the previous per-backend index:
    /// vanished entries are removed, new ones inserted, survivors
    /// overwritten. Returns whether anything changed.
    pub fn apply_tools(&self, backend: &str, tools: Vec<Tool>) -> bool {
        let changed = {
            let mut inner = self.inner.write();
            let fresh: BTreeSet<String> = tools
                .iter()
                .map(|t| naming::namespaced_id(backend, &t.name))
                .collect();
            let previous = std::mem::take(
                &mut inner.backends.entry(backend.to_string()).or_default().tool_ids,
            );
            let mut changed = previous != fresh;

            for stale in previous.difference(&fresh) {
                inner.tools.remove(stale);
            }
            for tool in tools {
                let id = naming::namespaced_id(backend, &tool.name);
                let new_def = serde_json::to_value(&tool).unwrap_or_default();
                let old = inner.tools.insert(
                    id.clone(),
                    ToolEntry {
                        namespaced_id: id,
                        backend: backend.to_string(),
                        tool,
                        is_local: false,
                    },
                );
                // A re-appearing entry with a new definition also counts.
                if !changed
                    && old.map(|e| serde_json::to_value(&e.tool).unwrap_or_default())
                        != Some(new_def)
                {
                    changed = true;
                }
            }

            inner
                .backends
                .get_mut(backend)
                .expect("index entry created above")
                .tool_ids = fresh;
            if changed {
                inner.rebuild_flat(Category::Tools);
            }
            changed
        };
        if changed {
            debug!(backend = %backend, "Tool catalog updated");
            self.emit(Category::Tools);
        }
        changed
    }

    /// Replace one backend's prompts. See [`Registry::apply_tools`].
    pub fn apply_prompts(&self, backend: &str, prompts: Vec<Prompt>) -> bool {
        let changed = {
            let mut inner = self.inner.write();
            let fresh: BTreeSet<String> = prompts
                .iter()
                .map(|p| naming::namespaced_id(backend, &p.name))
                .collect();
            let previous = std::mem::take(
                &mut inner
                    .backends
                    .entry(backend.to_string())
                    .or_default()
                    .prompt_ids,
            );
            let mut changed = previous != fresh;

            for stale in previous.difference(&fresh) {
                inner.prompts.remove(stale);
            }
            for prompt in prompts {
                let id = naming::namespaced_id(backend, &prompt.name);
                let new_def = serde_json::to_value(&prompt).unwrap_or_default();
                let old = inner.prompts.insert(
                    id.clone(),
                    PromptEntry {
                        namespaced_id: id,
                        backend: backend.to_string(),
                        prompt,
                    },
                );
                if !changed
                    && old.map(|e| serde_json::to_value(&e.prompt).unwrap_or_default())
                        != Some(new_def)
                {
                    changed = true;
                }
            }

            inner
                .backends
                .get_mut(backend)
                .expect("index entry created above")
                .prompt_ids = fresh;
            if changed {
                inner.rebuild_flat(Category::Prompts);
            }
            changed
        };
        if changed {
            debug!(backend = %backend, "Prompt catalog updated");
            self.emit(Category::Prompts);
        }
        changed
    }

    /// Replace one backend's resources. See [`Registry::apply_tools`].
    pub fn apply_resources(&self, backend: &str, resources: Vec<Resource>) -> bool {
        let changed = {
            let mut inner = self.inner.write();
            let fresh: BTreeSet<String> = resources
                .iter()
                .map(|r| naming::namespaced_uri(backend, &r.uri))
                .collect();
            let previous = std::mem::take(
                &mut inner
                    .backends
                    .entry(backend.to_string())
                    .or_default()
                    .resource_uris,
            );
            let mut changed = previous != fresh;

            for stale in previous.difference(&fresh) {
                inner.resources.remove(stale);
            }
            for resource in resources {
                let uri = naming::namespaced_uri(backend, &resource.uri);
                let new_def = serde_json::to_value(&resource).unwrap_or_default();
                let old = inner.resources.insert(
                    uri.clone(),
                    ResourceEntry {
                        namespaced_uri: uri,
                        backend: backend.to_string(),
                        resource,
                    },
                );
                if !changed
                    && old.map(|e| serde_json::to_value(&e.resource).unwrap_or_default())
                        != Some(new_def)
                {
                    changed = true;
                }
            }

            inner
                .backends
                .get_mut(backend)
                .expect("index entry created above")
                .resource_uris = fresh;
            if changed {
                inner.rebuild_flat(Category::Resources);
            }
            changed
        };
        if changed {
            debug!(backend = %backend, "Resource catalog updated");
            self.emit(Category::Resources);
        }
        changed
    }

    /// Replace one backend's resource templates. See [`Registry::apply_tools`].
    pub fn apply_templates(&self, backend: &str, templates: Vec<ResourceTemplate>) -> bool {
        let changed = {
            let mut inner = self.inner.write();
            let fresh: BTreeSet<String> = templates
                .iter()
                .map(|t| naming::template_key(backend, &t.uri_template))
                .collect();
            let previous = std::mem::take(
                &mut inner
                    .backends
                    .entry(backend.to_string())
                    .or_default()
                    .template_keys,
            );
            let mut changed = previous != fresh;

            for stale in previous.difference(&fresh) {
                inner.templates.remove(stale);
            }
            for template in templates {
                let key = naming::template_key(backend, &template.uri_template);
                let new_def = serde_json::to_value(&template).unwrap_or_default();
                let old = inner.templates.insert(
                    key.clone(),
                    TemplateEntry {
                        key,
                        backend: backend.to_string(),
                        template,
                    },
                );
                if !changed
                    && old.map(|e| serde_json::to_value(&e.template).unwrap_or_default())
                        != Some(new_def)
                {
                    changed = true;
                }
            }

            inner
                .backends
                .get_mut(backend)
                .expect("index entry created above")
                .template_keys = fresh;
            if changed {
                inner.rebuild_flat(Category::ResourceTemplates);
            }
            changed
        };
        if changed {
            debug!(backend = %backend, "Resource template catalog updated");
            self.emit(Category::ResourceTemplates);
        }
        changed
    }

    /// Remove every entry belonging to a backend, atomically.
    pub fn remove_backend(&self, backend: &str) {
        let changed: Vec<Category> = {
            let mut inner = self.inner.write();
            let Some(index) = inner.backends.remove(backend) else {
                return;
            };
            let mut changed = Vec::new();
            if !index.tool_ids.is_empty() {
                for id in &index.tool_ids {
                    inner.tools.remove(id);
                }
                inner.rebuild_flat(Category::Tools);
                changed.push(Category::Tools);
            }
            if !index.prompt_ids.is_empty() {
                for id in &index.prompt_ids {
                    inner.prompts.remove(id);
                }
                inner.rebuild_flat(Category::Prompts);
                changed.push(Category::Prompts);
            }
            if !index.resource_uris.is_empty() {
                for uri in &index.resource_uris {
                    inner.resources.remove(uri);
                }
                inner.rebuild_flat(Category::Resources);
                changed.push(Category::Resources);
            }
            if !index.template_keys.is_empty() {
                for key in &index.template_keys {
                    inner.templates.remove(key);
                }
                inner.rebuild_flat(Category::ResourceTemplates);
                changed.push(Category::ResourceTemplates);
            }
            changed
        };
        for category in changed {
            self.emit(category);
        }
    }

    // ── lookups ───────────────────────────────────────────────────────

    /// Find a tool by namespaced id.
    #[must_use]
    pub fn find_tool(&self, namespaced_id: &str) -> Option<ToolEntry> {
        self.inner.read().tools.get(namespaced_id).cloned()
    }

    /// Find a prompt by namespaced id.
    #[must_use]
    pub fn find_prompt(&self, namespaced_id: &str) -> Option<PromptEntry> {
        self.inner.read().prompts.get(namespaced_id).cloned()
    }

    /// Resolve a namespaced resource URI to its owning backend.
    ///
    /// Exact catalog entries resolve to their stored original URI. A miss
    /// falls back to template matching: when the URI (with the backend's
    /// namespace prefix stripped) starts with a template's literal prefix up
    /// to its first `{`, the template's backend owns it and the de-prefixed
    /// remainder is forwarded.
    #[must_use]
    pub fn resolve_resource(&self, namespaced_uri: &str) -> Option<ResourceResolution> {
        let inner = self.inner.read();
        if let Some(entry) = inner.resources.get(namespaced_uri) {
            return Some(ResourceResolution {
                backend: entry.backend.clone(),
                original_uri: entry.resource.uri.clone(),
                namespaced_uri: entry.namespaced_uri.clone(),
            });
        }

        for entry in inner.templates.values() {
            let prefix = format!("{}_", entry.backend);
            let Some(remainder) = namespaced_uri.strip_prefix(&prefix) else {
                continue;
            };
            let literal = entry
                .template
                .uri_template
                .split('{')
                .next()
                .unwrap_or_default();
            // The remainder may be raw or sanitized; accept either spelling
            // of the template's literal prefix.
            if remainder.starts_with(literal)
                || remainder.starts_with(&naming::sanitize_uri(literal))
            {
                return Some(ResourceResolution {
                    backend: entry.backend.clone(),
                    original_uri: remainder.to_string(),
                    namespaced_uri: namespaced_uri.to_string(),
                });
            }
        }
        None
    }

    /// Map a backend's original resource URI to the namespaced URI clients
    /// know, if the resource is cataloged.
    #[must_use]
    pub fn namespaced_uri_for(&self, backend: &str, original_uri: &str) -> Option<String> {
        let candidate = naming::namespaced_uri(backend, original_uri);
        let inner = self.inner.read();
        inner.resources.contains_key(&candidate).then_some(candidate)
    }

    // ── listings ──────────────────────────────────────────────────────

    /// Flat tool listing with namespaced names.
    #[must_use]
    pub fn list_tools(&self, exclude_backends: &[String]) -> Vec<Tool> {
        self.inner
            .read()
            .flat_tools
            .iter()
            .filter(|(backend, _)| !exclude_backends.contains(backend))
            .map(|(_, tool)| tool.clone())
            .collect()
    }

    /// Flat prompt listing with namespaced names.
    #[must_use]
    pub fn list_prompts(&self, exclude_backends: &[String]) -> Vec<Prompt> {
        self.inner
            .read()
            .flat_prompts
            .iter()
            .filter(|(backend, _)| !exclude_backends.contains(backend))
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }

    /// Flat resource listing with namespaced URIs.
    #[must_use]
    pub fn list_resources(&self, exclude_backends: &[String]) -> Vec<Resource> {
        self.inner
            .read()
            .flat_resources
            .iter()
            .filter(|(backend, _)| !exclude_backends.contains(backend))
            .map(|(_, resource)| resource.clone())
            .collect()
    }

    /// Flat resource template listing (original templates, owner implied by
    /// the storage key).
    #[must_use]
    pub fn list_templates(&self, exclude_backends: &[String]) -> Vec<ResourceTemplate> {
        self.inner
            .read()
            .flat_templates
            .iter()
            .filter(|(backend, _)| !exclude_backends.contains(backend))
            .map(|(_, template)| template.clone())
            .collect()
    }

    /// All tool entries (for meta-tools and suggestion ranking).
    #[must_use]
    pub fn tool_entries(&self) -> Vec<ToolEntry> {
        let mut entries: Vec<ToolEntry> = self.inner.read().tools.values().cloned().collect();
        entries.sort_by(|a, b| a.namespaced_id.cmp(&b.namespaced_id));
        entries
    }

    /// All prompt entries.
    #[must_use]
    pub fn prompt_entries(&self) -> Vec<PromptEntry> {
        let mut entries: Vec<PromptEntry> = self.inner.read().prompts.values().cloned().collect();
        entries.sort_by(|a, b| a.namespaced_id.cmp(&b.namespaced_id));
        entries
    }

    /// All resource entries.
    #[must_use]
    pub fn resource_entries(&self) -> Vec<ResourceEntry> {
        let mut entries: Vec<ResourceEntry> =
            self.inner.read().resources.values().cloned().collect();
        entries.sort_by(|a, b| a.namespaced_uri.cmp(&b.namespaced_uri));
        entries
    }

    /// All template entries.
    #[must_use]
    pub fn template_entries(&self) -> Vec<TemplateEntry> {
        let mut entries: Vec<TemplateEntry> =
            self.inner.read().templates.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Names of every backend with at least one catalog entry or recorded
    /// capabilities.
    #[must_use]
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Namespaced tools owned by one backend.
    #[must_use]
    pub fn tools_for_server(&self, backend: &str) -> Vec<Tool> {
        self.inner
            .read()
            .flat_tools
            .iter()
            .filter(|(owner, _)| owner == backend)
            .map(|(_, tool)| tool.clone())
            .collect()
    }

    /// Entry counts per category: (tools, prompts, resources, templates).
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let inner = self.inner.read();
        (
            inner.tools.len(),
            inner.prompts.len(),
            inner.resources.len(),
            inner.templates.len(),
        )
    }
}
