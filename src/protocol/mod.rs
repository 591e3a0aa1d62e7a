//! MCP protocol types (version 2024-11-05)

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// MCP protocol version spoken on both sides of the gateway
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Method name constants shared by the frontend server and backend sync.
pub mod methods {
    /// Initialize handshake
    pub const INITIALIZE: &str = "initialize";
    /// Liveness probe
    pub const PING: &str = "ping";
    /// Tool listing
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation
    pub const TOOLS_CALL: &str = "tools/call";
    /// Prompt listing
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Prompt retrieval
    pub const PROMPTS_GET: &str = "prompts/get";
    /// Resource listing
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Resource read
    pub const RESOURCES_READ: &str = "resources/read";
    /// Resource template listing
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    /// Resource update subscription
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    /// Resource update unsubscription
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    /// Logging level adjustment
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    /// Client finished initialization
    pub const NOTIF_INITIALIZED: &str = "notifications/initialized";
    /// Request cancellation
    pub const NOTIF_CANCELLED: &str = "notifications/cancelled";
    /// Tool catalog changed
    pub const NOTIF_TOOLS_CHANGED: &str = "notifications/tools/list_changed";
    /// Prompt catalog changed
    pub const NOTIF_PROMPTS_CHANGED: &str = "notifications/prompts/list_changed";
    /// Resource catalog changed
    pub const NOTIF_RESOURCES_CHANGED: &str = "notifications/resources/list_changed";
    /// A subscribed resource changed
    pub const NOTIF_RESOURCE_UPDATED: &str = "notifications/resources/updated";
}
