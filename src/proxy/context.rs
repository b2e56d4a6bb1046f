use std::net::SocketAddr;

pub struct RequestContext {
    pub client_address: SocketAddr,
}

impl RequestContext {
    pub fn new(client_address: SocketAddr) -> Self {
        Self { client_address }
    }

    /// Sessions are keyed by the client endpoint.
    pub fn session_id(&self) -> String {
        self.client_address.to_string()
    }
}
