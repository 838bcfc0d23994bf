//! Server side: dispatcher, user panel, upstream forwarding and admin API

mod admin;
mod dispatcher;
mod panel;
mod upstream;

pub use admin::serve_admin;
pub use panel::{ActiveUser, LocalUserManager, Panel, UserInfo, UserManager, UserStatus};
pub use upstream::serve_session;

use crate::config::{ProxyEntry, ServerConfig};
use crate::protocol::{TouchStone, Uid, UsedRandoms, WorldState, TIMESTAMP_WINDOW};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Reasons a user is refused
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("User not found")]
    UserNotFound,

    #[error("No credit left")]
    NoCredit,

    #[error("User expired")]
    Expired,

    #[error("Sessions cap reached")]
    SessionsCapReached,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Shared server state
pub struct Server {
    touchstone: TouchStone,
    redir_addr: String,
    proxy_book: HashMap<String, ProxyEntry>,
    admin_uid: Option<Uid>,
    panel: Arc<Panel>,
    stream_timeout: Duration,
    allow_plain: bool,
    world: WorldState,
}

impl Server {
    pub fn from_config(config: &ServerConfig) -> Result<Arc<Self>, crate::Error> {
        Self::with_world(config, WorldState::real())
    }

    /// Build against an explicit clock, backed by the config's user list
    pub fn with_world(config: &ServerConfig, world: WorldState) -> Result<Arc<Self>, crate::Error> {
        let users = config
            .users
            .iter()
            .map(UserInfo::from_entry)
            .collect::<Result<Vec<_>, _>>()?;
        let manager = Arc::new(LocalUserManager::new(users, world.clone()));
        Self::with_manager(config, manager, world)
    }

    /// Build with a custom user manager
    pub fn with_manager(
        config: &ServerConfig,
        manager: Arc<dyn UserManager>,
        world: WorldState,
    ) -> Result<Arc<Self>, crate::Error> {
        config.validate()?;
        let used_randoms = Arc::new(UsedRandoms::new(config.max_used_randoms));
        Ok(Arc::new(Self {
            touchstone: TouchStone::new(config.private_key()?, used_randoms, world.clone()),
            redir_addr: config.redir_addr.clone(),
            proxy_book: config.proxy_book.clone(),
            admin_uid: config.admin_uid()?,
            panel: Panel::new(manager, config.bypass_uids()?),
            stream_timeout: config.stream_timeout(),
            allow_plain: config.allow_plain,
            world,
        }))
    }

    pub fn panel(&self) -> &Arc<Panel> {
        &self.panel
    }

    pub fn used_randoms(&self) -> &Arc<UsedRandoms> {
        self.touchstone.used_randoms()
    }

    /// Accept connections on `listener` until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        let local = listener.local_addr().ok();
        info!(listen = ?local, "server listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        debug!(%peer, "new connection");
                        tokio::spawn(dispatcher::dispatch(self.clone(), conn, peer));
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        info!(listen = ?local, "server stopped");
    }

    /// Periodically evict used randoms older than the timestamp window
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIMESTAMP_WINDOW);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = server.used_randoms().sweep(server.world.unix_now());
                        debug!(evicted, remaining = server.used_randoms().len(), "used randoms swept");
                    }
                }
            }
        })
    }
}
