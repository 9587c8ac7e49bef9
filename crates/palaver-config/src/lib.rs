pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AppConfig, CancellationPolicy, EndpointConfig, GenerationConfig, ModelConfig, ProviderKind,
};
