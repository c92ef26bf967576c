use crate::api::ApiClient;
use crate::error::ApiResult;
use crate::events::{EventBus, EventKind, Subscription};
use crate::monitor::{SessionMonitor, SessionState};
use crate::protocol::UserInfo;
use crate::storage::{ACCESS_TOKEN_KEY, StorageAdapter};
use crate::token::Credential;
use std::sync::{Arc, Weak};

/// Owns the login state of one user.
///
/// Built by the application from explicitly constructed parts. On an
/// `unauthorized` or `expired` event it stops the monitor and forgets the
/// stored credential.
pub struct AuthSession {
    storage: Arc<StorageAdapter>,
    bus: Arc<EventBus>,
    monitor: Arc<SessionMonitor>,
    api: Arc<ApiClient>,
    subscriptions: Vec<Subscription>,
}

impl AuthSession {
    pub fn new(
        storage: Arc<StorageAdapter>,
        bus: Arc<EventBus>,
        monitor: Arc<SessionMonitor>,
        api: Arc<ApiClient>,
    ) -> Self {
        let subscriptions = [EventKind::UNAUTHORIZED, EventKind::EXPIRED]
            .into_iter()
            .map(|kind| {
                let storage = Arc::clone(&storage);
                let monitor: Weak<SessionMonitor> = Arc::downgrade(&monitor);
                let reason = kind.clone();
                bus.subscribe(kind, move || {
                    tracing::info!(reason = %reason, "clearing session");
                    storage.remove(ACCESS_TOKEN_KEY);
                    if let Some(monitor) = monitor.upgrade() {
                        monitor.stop();
                    }
                })
            })
            .collect();

        Self {
            storage,
            bus,
            monitor,
            api,
            subscriptions,
        }
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn monitor(&self) -> &Arc<SessionMonitor> {
        &self.monitor
    }

    pub fn storage(&self) -> &Arc<StorageAdapter> {
        &self.storage
    }

    pub async fn register(&self, email: &str, password: &str) -> ApiResult<UserInfo> {
        let user = self.api.register(email, password).await?;
        tracing::info!(user_id = user.id, "account registered");
        Ok(user)
    }

    /// Log in, persist the credential and start monitoring it.
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<Credential> {
        let credential = self.api.login(email, password).await?;
        self.storage.set(ACCESS_TOKEN_KEY, credential.as_str());
        self.monitor.start(credential.clone());
        tracing::info!(
            expires_at = credential.expires_at().unwrap_or_default(),
            "logged in"
        );
        Ok(credential)
    }

    /// Resume a session persisted by an earlier run. Returns whether a live
    /// credential was found.
    pub fn restore(&self) -> bool {
        let Some(raw) = self.storage.get(ACCESS_TOKEN_KEY) else {
            return false;
        };
        let credential = Credential::new(raw);
        if SessionMonitor::is_expired(&credential) {
            tracing::info!("stored credential expired, discarding");
            self.storage.remove(ACCESS_TOKEN_KEY);
            return false;
        }
        self.monitor.start(credential);
        true
    }

    pub fn logout(&self) {
        self.monitor.stop();
        self.storage.remove(ACCESS_TOKEN_KEY);
        tracing::info!("logged out");
    }

    pub fn state(&self) -> SessionState {
        self.monitor.state()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.monitor.credential()
    }

    /// A credential is held and has not expired.
    pub fn is_authenticated(&self) -> bool {
        self.storage.get(ACCESS_TOKEN_KEY).is_some() && self.monitor.is_authenticated()
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        for sub in &self.subscriptions {
            sub.unsubscribe();
        }
    }
}
