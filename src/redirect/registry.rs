//! Session registry: at most one live session per (GUID, mode) key.
//!
//! A browser refresh within the reuse window rejoins the existing session
//! and keeps the authenticated device connection; anything older is
//! cancelled and replaced. The map lock is never held across network I/O —
//! connecting to the device happens outside the lock, with a re-check on
//! insert in case a concurrent attach won the race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::challenge::AuthChallenge;
use super::session::RedirectSession;
use super::transport::TransportFactory;
use super::SessionKey;
use crate::device::{Cryptor, Device};
use crate::error::RedirectError;

/// Outcome of [`SessionRegistry::acquire`].
#[derive(Debug)]
pub struct Acquired {
    pub session: Arc<RedirectSession>,
    /// True when a new session (and device connection) was created — the
    /// caller is responsible for starting the relay tasks exactly once.
    pub created: bool,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, Arc<RedirectSession>>>,
    /// Idle time beyond which an existing session is replaced instead of
    /// reused.
    reuse_window: Duration,
}

impl SessionRegistry {
    pub fn new(reuse_window: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            reuse_window,
        }
    }

    /// Get the live session for `key`, creating one if none exists or the
    /// existing one has been idle past the reuse window.
    pub async fn acquire(
        &self,
        key: &SessionKey,
        device: &Device,
        cryptor: &dyn Cryptor,
        factory: &dyn TransportFactory,
        parent: &CancellationToken,
    ) -> Result<Acquired, RedirectError> {
        // Fast path: fresh session under the shared lock.
        {
            let sessions = self.sessions.read().await;
            if let Some(existing) = sessions.get(key) {
                if existing.idle_for() <= self.reuse_window {
                    debug!(key = %key, "reusing session");
                    return Ok(Acquired {
                        session: existing.clone(),
                        created: false,
                    });
                }
            }
        }

        // Build the replacement outside the map lock: decryption and the
        // device connect must not stall other keys.
        let password = cryptor.decrypt(&device.password)?;
        let transport = factory.open(device).await?;
        let session = RedirectSession::new(
            key.clone(),
            Arc::from(transport),
            AuthChallenge::new(device.username.clone(), password),
            parent,
        );

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(key) {
            if existing.idle_for() <= self.reuse_window {
                // Lost the race to a concurrent attach; discard ours.
                session.transport().close().await;
                debug!(key = %key, "reusing session created by concurrent attach");
                return Ok(Acquired {
                    session: existing.clone(),
                    created: false,
                });
            }
            // Expired: cancel it and let its joiner finish the teardown.
            // Removing it here frees the slot immediately; the joiner's
            // release becomes a no-op because the instance id won't match.
            info!(key = %key, "replacing expired session");
            existing.cancel();
            sessions.remove(key);
        }

        sessions.insert(key.clone(), session.clone());
        info!(key = %key, "session created");
        Ok(Acquired {
            session,
            created: true,
        })
    }

    /// Remove `key` if the registry still holds the instance identified by
    /// `id`. Idempotent: second calls, and calls for an instance that has
    /// already been replaced, do nothing.
    pub async fn release(&self, key: &SessionKey, id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.get(key).is_some_and(|s| s.id == id) {
            sessions.remove(key);
            debug!(key = %key, "session released");
            true
        } else {
            false
        }
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Arc<RedirectSession>> {
        self.sessions.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Cancel every live session (process shutdown). Slots are freed by the
    /// sessions' joiners as usual.
    pub async fn drain(&self) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            session.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PassthroughCryptor;
    use crate::redirect::transport::testing::{fake_transport, FakeFactory};
    use crate::redirect::Mode;
    use std::sync::atomic::Ordering;

    fn device() -> Device {
        Device {
            guid: "guid-1".to_string(),
            username: "admin".to_string(),
            password: "pw".to_string(),
            address: "192.168.1.50".to_string(),
            tenant_id: String::new(),
            use_tls: true,
        }
    }

    fn key() -> SessionKey {
        SessionKey::new("guid-1", Mode::Kvm)
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses() {
        let t1 = fake_transport();
        let factory = FakeFactory::with_transports(vec![t1.transport.clone()]);
        let registry = SessionRegistry::new(Duration::from_secs(300));
        let parent = CancellationToken::new();

        let first = registry
            .acquire(&key(), &device(), &PassthroughCryptor, &factory, &parent)
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(registry.len().await, 1);

        let second = registry
            .acquire(&key(), &device(), &PassthroughCryptor, &factory, &parent)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(
            factory.opened.load(Ordering::Acquire),
            1,
            "reuse must not open a second device connection"
        );
    }

    #[tokio::test]
    async fn reuse_preserves_direct_state() {
        let t1 = fake_transport();
        let factory = FakeFactory::with_transports(vec![t1.transport.clone()]);
        let registry = SessionRegistry::new(Duration::from_secs(300));
        let parent = CancellationToken::new();

        let first = registry
            .acquire(&key(), &device(), &PassthroughCryptor, &factory, &parent)
            .await
            .unwrap();
        first.session.set_direct();

        let second = registry
            .acquire(&key(), &device(), &PassthroughCryptor, &factory, &parent)
            .await
            .unwrap();
        assert!(second.session.direct());
    }

    #[tokio::test]
    async fn expired_session_is_cancelled_and_replaced() {
        let t1 = fake_transport();
        let t2 = fake_transport();
        let factory =
            FakeFactory::with_transports(vec![t1.transport.clone(), t2.transport.clone()]);
        // zero window: everything is expired on the next acquire
        let registry = SessionRegistry::new(Duration::ZERO);
        let parent = CancellationToken::new();

        let first = registry
            .acquire(&key(), &device(), &PassthroughCryptor, &factory, &parent)
            .await
            .unwrap();

        // let the clock move so the zero window is definitely exceeded
        tokio::time::sleep(Duration::from_millis(2)).await;

        let second = registry
            .acquire(&key(), &device(), &PassthroughCryptor, &factory, &parent)
            .await
            .unwrap();
        assert!(second.created);
        assert_ne!(second.session.id, first.session.id);
        assert!(first.session.is_cancelled(), "old session must be cancelled");
        assert_eq!(factory.opened.load(Ordering::Acquire), 2);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_and_leaves_registry_empty() {
        let factory = FakeFactory::with_transports(vec![]);
        let registry = SessionRegistry::new(Duration::from_secs(300));
        let parent = CancellationToken::new();

        let err = registry
            .acquire(&key(), &device(), &PassthroughCryptor, &factory, &parent)
            .await
            .unwrap_err();
        assert!(matches!(err, RedirectError::Transport(_)));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_instance_checked() {
        let t1 = fake_transport();
        let factory = FakeFactory::with_transports(vec![t1.transport.clone()]);
        let registry = SessionRegistry::new(Duration::from_secs(300));
        let parent = CancellationToken::new();

        let acquired = registry
            .acquire(&key(), &device(), &PassthroughCryptor, &factory, &parent)
            .await
            .unwrap();

        // wrong instance: no-op
        assert!(!registry.release(&key(), Uuid::new_v4()).await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.release(&key(), acquired.session.id).await);
        assert_eq!(registry.len().await, 0);

        // second call is a no-op
        assert!(!registry.release(&key(), acquired.session.id).await);
    }

    #[tokio::test]
    async fn drain_cancels_every_session() {
        let t1 = fake_transport();
        let t2 = fake_transport();
        let factory =
            FakeFactory::with_transports(vec![t1.transport.clone(), t2.transport.clone()]);
        let registry = SessionRegistry::new(Duration::from_secs(300));
        let parent = CancellationToken::new();

        let a = registry
            .acquire(&key(), &device(), &PassthroughCryptor, &factory, &parent)
            .await
            .unwrap();
        let other_key = SessionKey::new("guid-2", Mode::Sol);
        let mut other = device();
        other.guid = "guid-2".to_string();
        let b = registry
            .acquire(&other_key, &other, &PassthroughCryptor, &factory, &parent)
            .await
            .unwrap();

        registry.drain().await;
        assert!(a.session.is_cancelled());
        assert!(b.session.is_cancelled());
    }
}
