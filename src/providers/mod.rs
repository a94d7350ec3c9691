pub mod http_provider;
pub mod registry;

pub use http_provider::HttpRateProvider;
pub use registry::build_providers;
