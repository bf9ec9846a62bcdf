pub mod collector;
pub mod config;
pub mod container;
pub mod providers;
pub mod registry;
pub mod rest;
pub mod upstream;

pub use collector::{Collector, CollectorError, CollectorSettings, CollectorStatus, Phase};
pub use config::{Bootstrap, Settings};
pub use container::{Container, ContainerError};
pub use providers::{DynamicType, Provider, ProviderRegistry, RegistryError};
pub use registry::{KindModel, ModelRegistry, ProviderModel, Role};
pub use upstream::{Upstream, UpstreamError, UpstreamFactory};
