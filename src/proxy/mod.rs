use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error};

use crate::{config::Settings, proxy::context::RequestContext, state::State};

mod context;
mod relay;
mod socks5;

use socks5::serve_socks5;

/// Accepts SOCKS5 clients forever, one task per connection.
pub async fn start(
    settings: Arc<Settings>,
    state: Arc<State>,
    listener: TcpListener,
) -> anyhow::Result<()> {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("Failed to accept a connection: {err}");
                continue;
            }
        };

        if let Err(err) = socket.set_nodelay(settings.tcp_nodelay) {
            debug!("Could not set TCP_NODELAY for {addr}: {err}");
        }

        let settings = settings.clone();
        let state = state.clone();
        let ctx = RequestContext::new(addr);

        tokio::spawn(async move {
            if let Err(err) = serve_socks5(settings, state, ctx, socket).await {
                error!("Proxy error from {addr}: {err}");
            }
        });
    }
}
