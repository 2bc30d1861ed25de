//! Built-in capabilities for Loopwire.
//!
//! Integrators normally register their own tools; these two exist so the
//! gateway and CLI are useful out of the box.

pub mod fetch_page;
pub mod web_search;

use loopwire_core::tool::ToolRegistry;

pub use fetch_page::FetchPageTool;
pub use web_search::WebSearchTool;

/// Create a registry holding every built-in tool.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(web_search::WebSearchTool));
    registry.register(Box::new(fetch_page::FetchPageTool::new()));
    registry
}
