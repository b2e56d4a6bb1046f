use std::{io, sync::Arc};

use fast_socks5::{ReplyError, SocksError, server::Socks5ServerProtocol, util::target_addr::TargetAddr};
use tokio::{io::{AsyncRead, AsyncWrite}, net::TcpStream};
use tracing::{debug, info};

use crate::{acl::ConnectionRequest, config::Settings, proxy::{context::RequestContext, relay::relay}, state::State, stats::SessionStats};

/// Keeps the open-session count balanced on every exit path.
struct ActiveSession<'a> {
    stats: &'a SessionStats,
}

impl<'a> ActiveSession<'a> {
    fn start(stats: &'a SessionStats) -> Self {
        stats.on_session_started();
        Self { stats }
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.stats.on_session_finished();
    }
}

pub async fn serve_socks5<S: AsyncRead + AsyncWrite + Unpin>(
    settings: Arc<Settings>,
    state: Arc<State>,
    ctx: RequestContext,
    socket: S,
) -> Result<(), SocksError> {
    let (proto, cmd, target_addr) = Socks5ServerProtocol::accept_no_auth(socket).await?.read_command().await?;
    let initial_target = target_addr.to_string();

    // Rules are expressed over addresses only, so names are resolved first.
    let target = match target_addr.resolve_dns().await {
        Ok(TargetAddr::Ip(addr)) => addr,
        Ok(TargetAddr::Domain(..)) => {
            debug!("Target {initial_target} did not resolve to an address");
            proto.reply_error(&ReplyError::HostUnreachable).await?;
            return Ok(());
        }
        Err(err) => {
            debug!("Failed to resolve {initial_target}: {err}");
            proto.reply_error(&ReplyError::HostUnreachable).await?;
            return Err(err.into());
        }
    };

    let request = ConnectionRequest {
        command: cmd.into(),
        source: ctx.client_address.ip().to_canonical(),
        destination: target.ip().to_canonical(),
        port: target.port(),
    };

    if !state.authorize(&request) {
        info!(
            "Request from {} to {initial_target} ({:?} {target}) is blocked",
            ctx.client_address, request.command
        );
        state.stats.on_session_blocked();
        proto.reply_error(&ReplyError::ConnectionNotAllowed).await?;
        return Ok(());
    }

    let _session = ActiveSession::start(&state.stats);

    let outbound = match tokio::time::timeout(settings.request_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!("Connection to {target} failed: {err}");
            proto.reply_error(&ReplyError::ConnectionRefused).await?;
            return Err(err.into());
        }
        Err(_) => {
            debug!("Connection to {target} timed out");
            proto.reply_error(&ReplyError::HostUnreachable).await?;
            return Err(io::Error::new(io::ErrorKind::TimedOut, format!("connecting to {target} timed out")).into());
        }
    };
    outbound.set_nodelay(settings.tcp_nodelay)?;

    let inbound = proto.reply_success(outbound.local_addr()?).await?;
    debug!("Relaying {} <-> {target}", ctx.client_address);

    let (uploaded, downloaded) = relay(inbound, outbound, &state.stats, &ctx.session_id()).await?;
    debug!(
        "Session {} to {target} closed ({uploaded} bytes up, {downloaded} bytes down)",
        ctx.client_address
    );

    Ok(())
}
