pub mod adapt;
pub mod router;
pub mod sse;
pub mod upstream;

pub use router::{Provider, ProviderRouter, Resolution};
pub use upstream::UpstreamClient;
