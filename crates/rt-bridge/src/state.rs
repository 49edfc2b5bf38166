//! Bridge state shared by the dispatcher and the session tasks

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rt_core::config::BridgeConfig;
use rt_core::{DeviceIdentity, SessionError};
use rt_protocol::{ConnectionId, TerminalSize};

use crate::auth::AuthGate;
use crate::pty::{find_multiplexer, resolve_shell, PtySession, SpawnOptions};
use crate::session::{Session, SessionTable};

/// Global state for the bridge daemon
pub struct BridgeState {
    /// Effective configuration
    pub config: BridgeConfig,
    /// Identity advertised on every registration
    pub identity: DeviceIdentity,
    /// Whitelist check for connect requests
    pub auth: AuthGate,
    /// Live sessions
    sessions: SessionTable<Arc<Session>>,
    /// tmux binary, if installed
    multiplexer: Option<PathBuf>,
    /// Validated shell for non-multiplexed sessions
    shell: String,
    /// Parent of every session's cancellation token
    shutdown: CancellationToken,
    /// Background session closes still in progress
    closing: TaskTracker,
}

impl BridgeState {
    /// Create bridge state, probing for tmux and validating the shell
    pub fn new(config: BridgeConfig, shutdown: CancellationToken) -> Result<Self, SessionError> {
        let multiplexer = find_multiplexer();
        match &multiplexer {
            Some(path) => tracing::info!("Persistent sessions via {}", path.display()),
            None if config.session_persistent => {
                tracing::warn!("tmux not found, sessions will not persist across disconnects")
            }
            None => {}
        }

        Self::with_multiplexer(config, multiplexer, shutdown)
    }

    /// Create bridge state with an explicit multiplexer choice
    pub fn with_multiplexer(
        config: BridgeConfig,
        multiplexer: Option<PathBuf>,
        shutdown: CancellationToken,
    ) -> Result<Self, SessionError> {
        let shell = resolve_shell(config.shell.as_deref())?;
        let identity = config.identity(multiplexer.is_some());
        let auth = AuthGate::new(config.whitelist());

        Ok(Self {
            config,
            identity,
            auth,
            sessions: SessionTable::new(),
            multiplexer,
            shell,
            shutdown,
            closing: TaskTracker::new(),
        })
    }

    /// Live sessions
    pub fn sessions(&self) -> &SessionTable<Arc<Session>> {
        &self.sessions
    }

    /// Whether persistent sessions go through tmux
    pub fn has_multiplexer(&self) -> bool {
        self.multiplexer.is_some()
    }

    /// Launch parameters for a session owned by `user`
    pub fn spawn_options(&self, user: &str) -> SpawnOptions {
        SpawnOptions {
            shell: self.shell.clone(),
            work_dir: self.config.work_dir(),
            env: self
                .config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            persistent: self.config.session_persistent,
            user_key: user.to_string(),
            multiplexer: self.multiplexer.clone(),
            size: TerminalSize::default(),
        }
    }

    /// Open a terminal and register it under `id`
    pub fn open_session(&self, id: &ConnectionId, user: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(max) = self.config.max_sessions {
            if self.sessions.len() >= max as usize {
                return Err(SessionError::LimitExceeded(max));
            }
        }

        let options = self.spawn_options(user);
        self.sessions.create(id.clone(), || {
            let pty = PtySession::open(&options, self.config.io_timeout)?;
            Ok(Arc::new(Session::new(
                id.clone(),
                user,
                options.uses_multiplexer(),
                pty,
                self.shutdown.child_token(),
                self.config.close_grace,
            )))
        })
    }

    /// Remove the session registered under `id` and close it in the background
    ///
    /// Returns `false` if there was none. The close (and its grace period)
    /// does not hold up the caller; [`close_all`](Self::close_all) waits
    /// for it.
    pub fn teardown(&self, id: &ConnectionId) -> bool {
        match self.sessions.remove(id) {
            Some(session) => {
                self.closing.spawn(async move {
                    session.close().await;
                });
                true
            }
            None => false,
        }
    }

    /// Close `session`, unregistering it if it is still the one under its ID
    ///
    /// A connection ID can be reused after a disconnect; this never removes
    /// a newer session that took over the ID.
    pub async fn release(&self, session: &Arc<Session>) {
        self.sessions
            .remove_if(session.connection_id(), |current| Arc::ptr_eq(current, session));
        session.close().await;
    }

    /// Like [`release`](Self::release), but closes in the background
    pub fn retire(&self, session: Arc<Session>) {
        self.sessions
            .remove_if(session.connection_id(), |current| Arc::ptr_eq(current, &session));
        self.closing.spawn(async move {
            session.close().await;
        });
    }

    /// Close every session and wait for background closes to finish
    pub async fn close_all(&self) {
        let sessions = self.sessions.list_all();
        if !sessions.is_empty() {
            tracing::info!("Closing {} session(s)", sessions.len());
        }

        let closes = sessions.into_iter().map(|(id, session)| async move {
            self.sessions
                .remove_if(&id, |current| Arc::ptr_eq(current, &session));
            session.close().await;
        });
        futures::future::join_all(closes).await;

        self.closing.close();
        self.closing.wait().await;
    }
}
