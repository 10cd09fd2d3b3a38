mod elastic;
mod query;

pub use elastic::{update_body, ElasticConfig, ElasticSource};
pub use query::build_query;
