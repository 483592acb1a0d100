pub mod backend;
pub mod health;
pub mod policy;
pub mod pool;

pub use backend::Backend;
pub use health::ProberSet;
pub use policy::Policy;
pub use pool::ServerPool;

use std::net::IpAddr;

/// Per-request state threaded through selection and forwarding. Carried
/// explicitly rather than in task-local storage.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_ip: IpAddr,
    /// Key the hashing policies use: the first X-Forwarded-For value when
    /// proxy headers are trusted, otherwise the socket address
    key: String,
    pub retries: u32,
}

impl RequestContext {
    pub fn new(client_ip: IpAddr, trusted_forwarded_for: Option<String>) -> Self {
        let key = trusted_forwarded_for.unwrap_or_else(|| client_ip.to_string());
        Self {
            client_ip,
            key,
            retries: 0,
        }
    }

    pub fn hash_key(&self) -> &str {
        &self.key
    }
}
