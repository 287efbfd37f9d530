pub mod vericorp;
mod registry;

pub use registry::{json_schema_object, json_schema_string, Tool, ToolRegistry};
pub use vericorp::{
    CompanyLookupTool, SupportedCountriesTool, UpstreamError, ValidateVatTool, VeriCorpClient,
};

use std::sync::Arc;

/// Build the registry with the fixed VeriCorp tool catalog. `tools/list`
/// reports the tools in exactly this order.
pub fn vericorp_registry(client: Arc<VeriCorpClient>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CompanyLookupTool::new(client.clone())));
    registry.register(Arc::new(ValidateVatTool::new(client.clone())));
    registry.register(Arc::new(SupportedCountriesTool::new(client)));
    registry
}
