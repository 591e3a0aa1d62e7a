//! Built-in meta-tools
//!
//! Tools implemented inside the gateway itself: catalog discovery, search,
//! and health. They are registered in the registry as local entries, resolved
//! by the router before any backend lookup, and never touch a transport.

mod schema;

pub use schema::validate_arguments;

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};

use crate::config::BackendConfig;
use crate::naming;
use crate::pool::TransportPool;
use crate::protocol::Tool;
use crate::registry::Registry;
use crate::{Error, Result};

/// The in-process tool set
pub struct MetaTools {
    registry: Arc<Registry>,
    pool: Arc<TransportPool>,
    servers: Vec<BackendConfig>,
    started_at: Instant,
}

impl MetaTools {
    /// Create the meta-tool set and register its definitions as local tools.
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<TransportPool>,
        servers: Vec<BackendConfig>,
    ) -> Arc<Self> {
        registry.register_local_tools(Self::definitions());
        Arc::new(Self {
            registry,
            pool,
            servers,
            started_at: Instant::now(),
        })
    }

    /// Definitions of every meta-tool, schemas included.
    #[must_use]
    pub fn definitions() -> Vec<Tool> {
        fn tool(name: &str, description: &str, schema: Value) -> Tool {
            Tool {
                name: name.to_string(),
                title: None,
                description: Some(description.to_string()),
                input_schema: schema,
                output_schema: None,
            }
        }

        let empty = || {
            json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": false
            })
        };

        vec![
            tool(
                "health",
                "Per-backend connection and circuit status, uptime, and catalog counts",
                empty(),
            ),
            tool(
                "catalog_list",
                "Compact list of every available tool across all backends",
                empty(),
            ),
            tool(
                "catalog_search",
                "Search tools across all backends by keyword",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Search keywords"},
                        "limit": {"type": "integer", "description": "Maximum results (default 10)"}
                    },
                    "required": ["query"],
                    "additionalProperties": false
                }),
            ),
            tool(
                "describe_tool",
                "Full input schema and description for one tool",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Namespaced tool name"}
                    },
                    "required": ["name"],
                    "additionalProperties": false
                }),
            ),
            tool(
                "catalog_prompts",
                "Compact list of every available prompt",
                json!({
                    "type": "object",
                    "properties": {
                        "serverId": {"type": "string", "description": "Restrict to one backend"}
                    },
                    "required": [],
                    "additionalProperties": false
                }),
            ),
            tool(
                "describe_prompt",
                "Argument descriptors and description for one prompt",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Namespaced prompt name"}
                    },
                    "required": ["name"],
                    "additionalProperties": false
                }),
            ),
            tool(
                "catalog_resources",
                "Compact list of available resources",
                json!({
                    "type": "object",
                    "properties": {
                        "serverId": {"type": "string", "description": "Restrict to one backend"},
                        "mimeType": {"type": "string", "description": "Restrict to one MIME type"}
                    },
                    "required": [],
                    "additionalProperties": false
                }),
            ),
            tool(
                "describe_resource",
                "Full details for one resource",
                json!({
                    "type": "object",
                    "properties": {
                        "uri": {"type": "string", "description": "Namespaced resource URI"}
                    },
                    "required": ["uri"],
                    "additionalProperties": false
                }),
            ),
            tool(
                "search_resources",
                "Search resources by keyword",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Search keywords"},
                        "mimeType": {"type": "string", "description": "Restrict to one MIME type"}
                    },
                    "required": ["query"],
                    "additionalProperties": false
                }),
            ),
            tool(
                "catalog_resource_templates",
                "List resource templates",
                json!({
                    "type": "object",
                    "properties": {
                        "serverId": {"type": "string", "description": "Restrict to one backend"}
                    },
                    "required": [],
                    "additionalProperties": false
                }),
            ),
        ]
    }

    /// Execute a meta-tool.
    ///
    /// Arguments are validated against the registered schema before the
    /// handler runs.
    pub async fn call(&self, name: &str, arguments: &Value) -> Result<Value> {
        let definition = Self::definitions()
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::ToolNotFound {
                name: name.to_string(),
                suggestions: vec![],
            })?;
        validate_arguments(&definition.input_schema, arguments)?;

        match name {
            "health" => Ok(self.health()),
            "catalog_list" => Ok(self.catalog_list()),
            "catalog_search" => Ok(self.catalog_search(arguments)),
            "describe_tool" => self.describe_tool(arguments),
            "catalog_prompts" => Ok(self.catalog_prompts(arguments)),
            "describe_prompt" => self.describe_prompt(arguments),
            "catalog_resources" => Ok(self.catalog_resources(arguments)),
            "describe_resource" => self.describe_resource(arguments),
            "search_resources" => Ok(self.search_resources(arguments)),
            "catalog_resource_templates" => Ok(self.catalog_resource_templates(arguments)),
            _ => Err(Error::Internal(format!("meta-tool '{name}' has no handler"))),
        }
    }

    fn health(&self) -> Value {
        let servers: Vec<Value> = self
            .servers
            .iter()
            .map(|server| {
                let status = self.pool.status(&server.name);
                json!({
                    "name": server.name,
                    "enabled": server.enabled,
                    "transport": server.transport.as_str(),
                    "connected": status.connected,
                    "circuitState": status.circuit.state.as_str(),
                    "lastError": status.last_error,
                })
            })
            .collect();

        let (tools, prompts, resources, templates) = self.registry.counts();

        json!({
            "status": "ok",
            "uptimeSeconds": self.started_at.elapsed().as_secs(),
            "servers": servers,
            "counts": {
                "tools": tools,
                "prompts": prompts,
                "resources": resources,
                "resourceTemplates": templates,
            }
        })
    }

    fn catalog_list(&self) -> Value {
        let tools: Vec<Value> = self
            .registry
            .tool_entries()
            .into_iter()
            .map(|entry| {
                json!({
                    "name": entry.namespaced_id,
                    "server": entry.backend,
                    "description": short_description(entry.tool.description.as_deref()),
                })
            })
            .collect();
        json!({ "tools": tools, "total": tools.len() })
    }

    fn catalog_search(&self, arguments: &Value) -> Value {
        let query = arguments.get("query").and_then(Value::as_str).unwrap_or("");
        let limit = arguments
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(10) as usize;

        let query_tokens = naming::tokenize(query);
        let mut scored: Vec<(usize, Value)> = self
            .registry
            .tool_entries()
            .into_iter()
            .filter_map(|entry| {
                let score = score_tokens(
                    &query_tokens,
                    &entry.namespaced_id,
                    entry.tool.description.as_deref(),
                );
                (score > 0).then(|| {
                    (
                        score,
                        json!({
                            "name": entry.namespaced_id,
                            "server": entry.backend,
                            "description": short_description(entry.tool.description.as_deref()),
                            "score": score,
                        }),
                    )
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1["name"].as_str().cmp(&b.1["name"].as_str()))
        });
        scored.truncate(limit);

        let matches: Vec<Value> = scored.into_iter().map(|(_, card)| card).collect();
        json!({ "query": query, "matches": matches, "total": matches.len() })
    }

    fn describe_tool(&self, arguments: &Value) -> Result<Value> {
        let name = arguments.get("name").and_then(Value::as_str).unwrap_or("");
        let entry = self.registry.find_tool(name).ok_or_else(|| {
            let catalog: Vec<String> = self
                .registry
                .tool_entries()
                .into_iter()
                .map(|e| e.namespaced_id)
                .collect();
            Error::ToolNotFound {
                name: name.to_string(),
                suggestions: naming::suggestions(
                    name,
                    catalog.iter().map(String::as_str),
                    3,
                ),
            }
        })?;

        Ok(json!({
            "name": entry.namespaced_id,
            "server": entry.backend,
            "description": entry.tool.description,
            "inputSchema": entry.tool.input_schema,
            "local": entry.is_local,
        }))
    }

    fn catalog_prompts(&self, arguments: &Value) -> Value {
        let server = arguments.get("serverId").and_then(Value::as_str);
        let prompts: Vec<Value> = self
            .registry
            .prompt_entries()
            .into_iter()
            .filter(|entry| server.is_none_or(|s| entry.backend == s))
            .map(|entry| {
                json!({
                    "name": entry.namespaced_id,
                    "server": entry.backend,
                    "description": short_description(entry.prompt.description.as_deref()),
                })
            })
            .collect();
        json!({ "prompts": prompts, "total": prompts.len() })
    }

    fn describe_prompt(&self, arguments: &Value) -> Result<Value> {
        let name = arguments.get("name").and_then(Value::as_str).unwrap_or("");
        let entry = self.registry.find_prompt(name).ok_or_else(|| {
            let catalog: Vec<String> = self
                .registry
                .prompt_entries()
                .into_iter()
                .map(|e| e.namespaced_id)
                .collect();
            Error::PromptNotFound {
                name: name.to_string(),
                suggestions: naming::suggestions(
                    name,
                    catalog.iter().map(String::as_str),
                    3,
                ),
            }
        })?;

        Ok(json!({
            "name": entry.namespaced_id,
            "server": entry.backend,
            "description": entry.prompt.description,
            "arguments": entry.prompt.arguments,
        }))
    }

    fn catalog_resources(&self, arguments: &Value) -> Value {
        let server = arguments.get("serverId").and_then(Value::as_str);
        let mime = arguments.get("mimeType").and_then(Value::as_str);

        let resources: Vec<Value> = self
            .registry
            .resource_entries()
            .into_iter()
            .filter(|entry| server.is_none_or(|s| entry.backend == s))
            .filter(|entry| mime.is_none_or(|m| entry.resource.mime_type.as_deref() == Some(m)))
            .map(|entry| {
                json!({
                    "uri": entry.namespaced_uri,
                    "server": entry.backend,
                    "name": entry.resource.name,
                    "mimeType": entry.resource.mime_type,
                })
            })
            .collect();
        json!({ "resources": resources, "total": resources.len() })
    }

    fn describe_resource(&self, arguments: &Value) -> Result<Value> {
        let uri = arguments.get("uri").and_then(Value::as_str).unwrap_or("");
        let entry = self
            .registry
            .resource_entries()
            .into_iter()
            .find(|e| e.namespaced_uri == uri)
            .ok_or_else(|| {
                let catalog: Vec<String> = self
                    .registry
                    .resource_entries()
                    .into_iter()
                    .map(|e| e.namespaced_uri)
                    .collect();
                Error::ResourceNotFound {
                    uri: uri.to_string(),
                    suggestions: naming::suggestions(
                        uri,
                        catalog.iter().map(String::as_str),
                        3,
                    ),
                }
            })?;

        Ok(json!({
            "uri": entry.namespaced_uri,
            "server": entry.backend,
            "name": entry.resource.name,
            "description": entry.resource.description,
            "mimeType": entry.resource.mime_type,
            "size": entry.resource.size,
        }))
    }

    fn search_resources(&self, arguments: &Value) -> Value {
        let query = arguments.get("query").and_then(Value::as_str).unwrap_or("");
        let mime = arguments.get("mimeType").and_then(Value::as_str);
        let query_tokens = naming::tokenize(query);

        let mut scored: Vec<(usize, Value)> = self
            .registry
            .resource_entries()
            .into_iter()
            .filter(|entry| mime.is_none_or(|m| entry.resource.mime_type.as_deref() == Some(m)))
            .filter_map(|entry| {
                let haystack = format!("{} {}", entry.namespaced_uri, entry.resource.name);
                let score =
                    score_tokens(&query_tokens, &haystack, entry.resource.description.as_deref());
                (score > 0).then(|| {
                    (
                        score,
                        json!({
                            "uri": entry.namespaced_uri,
                            "server": entry.backend,
                            "name": entry.resource.name,
                            "mimeType": entry.resource.mime_type,
                            "score": score,
                        }),
                    )
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1["uri"].as_str().cmp(&b.1["uri"].as_str()))
        });

        let matches: Vec<Value> = scored.into_iter().map(|(_, card)| card).collect();
        json!({ "query": query, "matches": matches, "total": matches.len() })
    }

    fn catalog_resource_templates(&self, arguments: &Value) -> Value {
        let server = arguments.get("serverId").and_then(Value::as_str);
        let templates: Vec<Value> = self
            .registry
            .template_entries()
            .into_iter()
            .filter(|entry| server.is_none_or(|s| entry.backend == s))
            .map(|entry| {
                json!({
                    "uriTemplate": entry.template.uri_template,
                    "server": entry.backend,
                    "name": entry.template.name,
                    "description": short_description(entry.template.description.as_deref()),
                })
            })
            .collect();
        json!({ "resourceTemplates": templates, "total": templates.len() })
    }
}

/// Case-insensitive token scoring over a name and description.
///
/// Name token hits count double; a token hitting neither contributes
/// nothing. No document-frequency weighting; catalogs are small.
fn score_tokens(query_tokens: &[String], name: &str, description: Option<&str>) -> usize {
    if query_tokens.is_empty() {
        return 0;
    }
    let name_tokens = naming::tokenize(name);
    let desc_tokens = description.map(naming::tokenize).unwrap_or_default();

    query_tokens
        .iter()
        .map(|token| {
            let name_hits = name_tokens.iter().filter(|t| *t == token).count() * 2;
            let desc_hits = desc_tokens.iter().filter(|t| *t == token).count();
            name_hits + desc_hits
        })
        .sum()
}

fn short_description(description: Option<&str>) -> String {
    description.unwrap_or("").chars().take(200).collect()
}
