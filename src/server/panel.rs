//! User registry: who may connect and how many sessions they hold

use super::AuthError;
use crate::config::{encode_uid, parse_uid, UserEntry};
use crate::protocol::{Uid, WorldState};
use crate::tunnel::{Session, SessionConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// A user as stored by a [`UserManager`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub uid: Uid,
    pub sessions_cap: usize,
    /// Unix seconds; 0 never expires
    pub expiry: u64,
    /// Remaining bytes; `None` is unlimited
    pub credit: Option<u64>,
}

impl UserInfo {
    pub fn from_entry(entry: &UserEntry) -> Result<Self, crate::Error> {
        Ok(Self {
            uid: parse_uid(&entry.uid)?,
            sessions_cap: entry.sessions_cap,
            expiry: entry.expiry,
            credit: entry.credit,
        })
    }
}

/// Snapshot of a user served by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    pub uid: String,
    pub sessions_cap: usize,
    pub expiry: u64,
    pub credit: Option<u64>,
    pub active_sessions: usize,
}

/// Source of truth for user admission
#[async_trait]
pub trait UserManager: Send + Sync {
    /// Whether `uid` may connect at all
    async fn authenticate_user(&self, uid: &Uid) -> Result<(), AuthError>;

    /// Whether `uid`, already holding `existing` sessions, may open one more
    async fn authorise_new_session(&self, uid: &Uid, existing: usize) -> Result<(), AuthError>;

    async fn list_users(&self) -> Vec<UserInfo>;

    async fn get_user(&self, uid: &Uid) -> Option<UserInfo>;
}

/// In-memory user database loaded from the config file
pub struct LocalUserManager {
    users: HashMap<Uid, UserInfo>,
    world: WorldState,
}

impl LocalUserManager {
    pub fn new(users: impl IntoIterator<Item = UserInfo>, world: WorldState) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.uid, u)).collect(),
            world,
        }
    }

    fn admissible(&self, uid: &Uid) -> Result<&UserInfo, AuthError> {
        let user = self.users.get(uid).ok_or(AuthError::UserNotFound)?;
        if user.credit == Some(0) {
            return Err(AuthError::NoCredit);
        }
        if user.expiry != 0 && user.expiry <= self.world.unix_now() {
            return Err(AuthError::Expired);
        }
        Ok(user)
    }
}

#[async_trait]
impl UserManager for LocalUserManager {
    async fn authenticate_user(&self, uid: &Uid) -> Result<(), AuthError> {
        self.admissible(uid).map(|_| ())
    }

    async fn authorise_new_session(&self, uid: &Uid, existing: usize) -> Result<(), AuthError> {
        let user = self.admissible(uid)?;
        if existing >= user.sessions_cap {
            return Err(AuthError::SessionsCapReached);
        }
        Ok(())
    }

    async fn list_users(&self) -> Vec<UserInfo> {
        let mut users: Vec<_> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.uid.cmp(&b.uid));
        users
    }

    async fn get_user(&self, uid: &Uid) -> Option<UserInfo> {
        self.users.get(uid).cloned()
    }
}

/// Registry of users with live sessions
pub struct Panel {
    manager: Arc<dyn UserManager>,
    bypass: HashSet<Uid>,
    active: Mutex<HashMap<Uid, Arc<ActiveUser>>>,
}

impl Panel {
    pub fn new(manager: Arc<dyn UserManager>, bypass: impl IntoIterator<Item = Uid>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            bypass: bypass.into_iter().collect(),
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn manager(&self) -> &Arc<dyn UserManager> {
        &self.manager
    }

    /// Look up or admit `uid`
    pub async fn get_user(self: &Arc<Self>, uid: &Uid) -> Result<Arc<ActiveUser>, AuthError> {
        if let Some(user) = self.active.lock().get(uid) {
            return Ok(user.clone());
        }

        let bypass = self.bypass.contains(uid);
        if !bypass {
            self.manager.authenticate_user(uid).await?;
        }

        let mut active = self.active.lock();
        let user = active.entry(*uid).or_insert_with(|| {
            debug!(uid = %encode_uid(uid), bypass, "user activated");
            Arc::new(ActiveUser {
                uid: *uid,
                bypass,
                panel: Arc::downgrade(self),
                sessions: Mutex::new(HashMap::new()),
                admission: tokio::sync::Mutex::new(()),
            })
        });
        Ok(user.clone())
    }

    pub fn active_user(&self, uid: &Uid) -> Option<Arc<ActiveUser>> {
        self.active.lock().get(uid).cloned()
    }

    pub fn active_user_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Users known to the manager with their live session counts
    pub async fn user_statuses(&self) -> Vec<UserStatus> {
        let users = self.manager.list_users().await;
        users.iter().map(|u| self.status_of(u)).collect()
    }

    pub async fn user_status(&self, uid: &Uid) -> Option<UserStatus> {
        let user = self.manager.get_user(uid).await?;
        Some(self.status_of(&user))
    }

    fn status_of(&self, user: &UserInfo) -> UserStatus {
        UserStatus {
            uid: encode_uid(&user.uid),
            sessions_cap: user.sessions_cap,
            expiry: user.expiry,
            credit: user.credit,
            active_sessions: self
                .active_user(&user.uid)
                .map(|u| u.session_count())
                .unwrap_or(0),
        }
    }

    fn deactivate_if_idle(&self, uid: &Uid) {
        let mut active = self.active.lock();
        if let Some(user) = active.get(uid) {
            if user.session_count() == 0 {
                active.remove(uid);
                debug!(uid = %encode_uid(uid), "user deactivated");
            }
        }
    }
}

/// A user with at least one live session
pub struct ActiveUser {
    uid: Uid,
    bypass: bool,
    panel: Weak<Panel>,
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
    /// Serialises session creation so concurrent connections with one id share a session
    admission: tokio::sync::Mutex<()>,
}

impl ActiveUser {
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn is_bypass(&self) -> bool {
        self.bypass
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Existing session `session_id`, or a new one built from `make`
    ///
    /// Returns the session and whether it was newly created.
    pub async fn get_session(
        self: &Arc<Self>,
        session_id: u32,
        make: impl FnOnce() -> Result<SessionConfig, crate::tunnel::TunnelError>,
    ) -> Result<(Arc<Session>, bool), AuthError> {
        let _admission = self.admission.lock().await;
        if let Some(session) = self.sessions.lock().get(&session_id) {
            if !session.is_closed() {
                return Ok((session.clone(), false));
            }
        }

        if !self.bypass {
            let panel = self.panel.upgrade().ok_or(AuthError::UserNotFound)?;
            let existing = self.session_count();
            panel
                .manager
                .authorise_new_session(&self.uid, existing)
                .await?;
        }

        let config = make().map_err(|e| AuthError::Internal(e.to_string()))?;
        let session = Session::new(session_id, config);
        self.sessions.lock().insert(session_id, session.clone());

        let user = Arc::downgrade(self);
        session.on_close(move |id| {
            if let Some(user) = user.upgrade() {
                user.remove_session(id);
            }
        });
        info!(uid = %encode_uid(&self.uid), session_id, "session created");
        Ok((session, true))
    }

    fn remove_session(&self, session_id: u32) {
        let now_empty = {
            let mut sessions = self.sessions.lock();
            if sessions
                .get(&session_id)
                .is_some_and(|s| s.is_closed())
            {
                sessions.remove(&session_id);
            }
            sessions.is_empty()
        };
        if now_empty {
            if let Some(panel) = self.panel.upgrade() {
                panel.deactivate_if_idle(&self.uid);
            }
        }
    }

    /// Close every session of this user
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{EncryptionMethod, Obfuscator, Role};

    fn user(uid: u8, cap: usize) -> UserInfo {
        UserInfo {
            uid: [uid; 16],
            sessions_cap: cap,
            expiry: 0,
            credit: None,
        }
    }

    fn session_config() -> Result<SessionConfig, crate::tunnel::TunnelError> {
        Ok(SessionConfig {
            obfuscator: Obfuscator::new(EncryptionMethod::Aes128Gcm, &[3u8; 32], Role::Server)?,
            unordered: false,
            singleplex: false,
            accept_streams: true,
        })
    }

    fn panel(users: Vec<UserInfo>, bypass: Vec<Uid>) -> Arc<Panel> {
        Panel::new(
            Arc::new(LocalUserManager::new(users, WorldState::real())),
            bypass,
        )
    }

    #[tokio::test]
    async fn test_local_manager_errors() {
        let now = WorldState::real().unix_now();
        let manager = LocalUserManager::new(
            vec![
                user(1, 1),
                UserInfo {
                    credit: Some(0),
                    ..user(2, 1)
                },
                UserInfo {
                    expiry: now - 10,
                    ..user(3, 1)
                },
            ],
            WorldState::real(),
        );

        assert!(manager.authenticate_user(&[1; 16]).await.is_ok());
        assert!(matches!(
            manager.authenticate_user(&[9; 16]).await,
            Err(AuthError::UserNotFound)
        ));
        assert!(matches!(
            manager.authenticate_user(&[2; 16]).await,
            Err(AuthError::NoCredit)
        ));
        assert!(matches!(
            manager.authenticate_user(&[3; 16]).await,
            Err(AuthError::Expired)
        ));
        assert!(manager.authorise_new_session(&[1; 16], 0).await.is_ok());
        assert!(matches!(
            manager.authorise_new_session(&[1; 16], 1).await,
            Err(AuthError::SessionsCapReached)
        ));
    }

    #[tokio::test]
    async fn test_sessions_shared_and_capped() {
        let panel = panel(vec![user(1, 2)], vec![]);
        let active = panel.get_user(&[1; 16]).await.unwrap();

        let (first, created) = active.get_session(10, session_config).await.unwrap();
        assert!(created);
        let (again, created) = active.get_session(10, session_config).await.unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &again));

        active.get_session(11, session_config).await.unwrap();
        assert!(matches!(
            active.get_session(12, session_config).await,
            Err(AuthError::SessionsCapReached)
        ));
        assert_eq!(active.session_count(), 2);
    }

    #[tokio::test]
    async fn test_user_removed_with_last_session() {
        let panel = panel(vec![user(1, 4)], vec![]);
        let active = panel.get_user(&[1; 16]).await.unwrap();
        let (a, _) = active.get_session(1, session_config).await.unwrap();
        let (b, _) = active.get_session(2, session_config).await.unwrap();
        assert_eq!(panel.active_user_count(), 1);

        a.close().await;
        assert_eq!(active.session_count(), 1);
        assert_eq!(panel.active_user_count(), 1);
        b.close().await;
        assert_eq!(active.session_count(), 0);
        assert_eq!(panel.active_user_count(), 0);
    }

    #[tokio::test]
    async fn test_bypass_skips_manager() {
        let panel = panel(vec![], vec![[5; 16]]);
        assert!(matches!(
            panel.get_user(&[6; 16]).await,
            Err(AuthError::UserNotFound)
        ));

        let active = panel.get_user(&[5; 16]).await.unwrap();
        assert!(active.is_bypass());
        for id in 0..32 {
            active.get_session(id, session_config).await.unwrap();
        }
        assert_eq!(active.session_count(), 32);
    }

    #[tokio::test]
    async fn test_statuses() {
        let panel = panel(vec![user(2, 3), user(1, 1)], vec![]);
        let active = panel.get_user(&[2; 16]).await.unwrap();
        active.get_session(1, session_config).await.unwrap();

        let statuses = panel.user_statuses().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].uid, encode_uid(&[1; 16]));
        assert_eq!(statuses[0].active_sessions, 0);
        assert_eq!(statuses[1].active_sessions, 1);
        assert!(panel.user_status(&[7; 16]).await.is_none());
    }
}
