use super::ai53::Ai53Adaptor;
use super::ai53_workflow::Ai53WorkflowAdaptor;
use super::coze::CozeAdaptor;
use super::error::RelayError;
use super::openai::OpenAiAdaptor;
use super::tencent::TencentAdaptor;
use super::{Adaptor, AdaptorContext};
use crate::store::VendorType;
use std::collections::HashMap;

/// Builds a fresh adaptor for one call
pub type AdaptorFactory = fn(&AdaptorContext) -> Box<dyn Adaptor>;

/// Registry of adaptor factories keyed by vendor type
pub struct AdaptorRegistry {
    factories: HashMap<VendorType, AdaptorFactory>,
}

impl AdaptorRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in chat vendor
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(VendorType::OpenAi, |ctx| Box::new(OpenAiAdaptor::new(ctx.clone())));
        registry.register(VendorType::Ai53Bot, |ctx| Box::new(Ai53Adaptor::new(ctx.clone())));
        registry.register(VendorType::Ai53Workflow, |ctx| {
            Box::new(Ai53WorkflowAdaptor::new(ctx.clone()))
        });
        registry.register(VendorType::Tencent, |ctx| Box::new(TencentAdaptor::new(ctx.clone())));
        registry.register(VendorType::Coze, |ctx| Box::new(CozeAdaptor::new(ctx.clone())));
        registry
    }

    /// Register or replace the factory for a vendor
    pub fn register(&mut self, vendor: VendorType, factory: AdaptorFactory) {
        self.factories.insert(vendor, factory);
    }

    /// Instantiate the adaptor for a vendor
    pub fn build(&self, vendor: VendorType, ctx: &AdaptorContext) -> Result<Box<dyn Adaptor>, RelayError> {
        let factory = self
            .factories
            .get(&vendor)
            .ok_or_else(|| RelayError::Config(format!("no chat adaptor registered for vendor '{}'", vendor)))?;
        Ok(factory(ctx))
    }

    /// Vendors with a registered factory
    pub fn vendors(&self) -> Vec<VendorType> {
        let mut vendors: Vec<VendorType> = self.factories.keys().copied().collect();
        vendors.sort_by_key(|v| v.as_str());
        vendors
    }
}

impl Default for AdaptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
