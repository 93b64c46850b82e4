//! Per-(GUID, mode) redirection session state.
//!
//! A session outlives any single browser socket: the registry may hand the
//! same session to a reconnecting browser within the reuse window, swapping
//! only the sink. Each attachment gets a generation number so a loop still
//! holding a replaced socket cannot detach its successor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use futures::Sink;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::challenge::AuthChallenge;
use super::transport::DeviceTransport;
use super::{Mode, SessionKey};

/// Browser-side write half. Boxed behind the [`Sink`] trait so the relay is
/// not married to a concrete socket type.
pub type BrowserSink = Box<dyn Sink<Message, Error = axum::Error> + Send + Unpin>;

/// The current browser attachment, tagged with its generation.
pub struct BrowserHandle {
    pub generation: u64,
    pub sink: BrowserSink,
}

/// Activity timestamps. `last_activity` never trails `last_data_recv`.
struct Activity {
    last_activity: Instant,
    last_data_recv: Instant,
}

/// One live redirection session.
pub struct RedirectSession {
    pub key: SessionKey,
    /// Instance identity; release is a no-op unless the registry still
    /// holds this exact instance.
    pub id: Uuid,
    pub mode: Mode,

    transport: Arc<dyn DeviceTransport>,
    challenge: StdMutex<AuthChallenge>,
    /// False until the device reports authentication success. Flips at most
    /// once; only the device loop writes it.
    direct: AtomicBool,
    browser: Mutex<Option<BrowserHandle>>,
    browser_generation: AtomicU64,
    activity: StdRwLock<Activity>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RedirectSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectSession")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl RedirectSession {
    pub fn new(
        key: SessionKey,
        transport: Arc<dyn DeviceTransport>,
        challenge: AuthChallenge,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            mode: key.mode,
            key,
            id: Uuid::new_v4(),
            transport,
            challenge: StdMutex::new(challenge),
            direct: AtomicBool::new(false),
            browser: Mutex::new(None),
            browser_generation: AtomicU64::new(0),
            activity: StdRwLock::new(Activity {
                last_activity: now,
                last_data_recv: now,
            }),
            cancel: parent.child_token(),
        })
    }

    pub fn transport(&self) -> &dyn DeviceTransport {
        self.transport.as_ref()
    }

    /// Run `f` against the digest challenge under its lock.
    pub fn with_challenge<R>(&self, f: impl FnOnce(&mut AuthChallenge) -> R) -> R {
        let mut guard = self
            .challenge
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Zero the stored device secret. Called exactly once, at teardown.
    pub fn wipe_secret(&self) {
        self.with_challenge(AuthChallenge::wipe_secret);
    }

    pub fn direct(&self) -> bool {
        self.direct.load(Ordering::Acquire)
    }

    /// Enter direct-relay mode. Never reverts within a session.
    pub fn set_direct(&self) {
        self.direct.store(true, Ordering::Release);
    }

    /// Note loop progress in either direction.
    pub fn touch_activity(&self) {
        let mut act = self
            .activity
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        act.last_activity = Instant::now();
    }

    /// Note bytes received from the device. Also refreshes the activity
    /// floor so `last_activity >= last_data_recv` holds by construction.
    pub fn mark_data_recv(&self) {
        let now = Instant::now();
        let mut act = self
            .activity
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        act.last_data_recv = now;
        act.last_activity = now;
    }

    pub fn idle_for(&self) -> Duration {
        self.activity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_activity
            .elapsed()
    }

    /// Elapsed silence from the device; drives the inactivity shutdown.
    pub fn since_last_data(&self) -> Duration {
        self.activity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_data_recv
            .elapsed()
    }

    #[cfg(test)]
    pub(crate) fn activity_pair(&self) -> (Instant, Instant) {
        let act = self.activity.read().unwrap_or_else(PoisonError::into_inner);
        (act.last_activity, act.last_data_recv)
    }

    /// Install a browser sink, returning its generation and the handle it
    /// displaced (the caller owes the old socket a normal close frame).
    pub async fn attach_browser(&self, sink: BrowserSink) -> (u64, Option<BrowserHandle>) {
        let generation = self.browser_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut slot = self.browser.lock().await;
        let old = slot.replace(BrowserHandle { generation, sink });
        (generation, old)
    }

    /// Drop the browser attachment, but only if `generation` is still the
    /// current one — a loop whose socket was already replaced must not
    /// detach its successor.
    pub async fn detach_browser(&self, generation: u64) {
        let mut slot = self.browser.lock().await;
        if slot.as_ref().is_some_and(|h| h.generation == generation) {
            *slot = None;
        }
    }

    /// Take the current attachment for teardown.
    pub async fn take_browser(&self) -> Option<BrowserHandle> {
        self.browser.lock().await.take()
    }

    /// Lock the browser slot; the device loop writes through this.
    pub async fn browser(&self) -> tokio::sync::MutexGuard<'_, Option<BrowserHandle>> {
        self.browser.lock().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fire the session's cancellation. Idempotent; after this no task of
    /// the session writes another frame to either peer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redirect::transport::testing::fake_transport;
    use futures::SinkExt;

    fn sink() -> BrowserSink {
        Box::new(futures::sink::drain().sink_map_err(axum::Error::new))
    }

    fn session() -> Arc<RedirectSession> {
        let handle = fake_transport();
        RedirectSession::new(
            SessionKey::new("guid-1", Mode::Kvm),
            Arc::new(handle.transport.clone()),
            AuthChallenge::new("admin", "pw"),
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn activity_never_trails_data_recv() {
        let s = session();
        s.touch_activity();
        s.mark_data_recv();
        let (activity, data) = s.activity_pair();
        assert!(activity >= data);

        // a bare data mark still refreshes the activity floor
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.mark_data_recv();
        let (activity, data) = s.activity_pair();
        assert!(activity >= data);
    }

    #[tokio::test]
    async fn direct_flips_once_and_sticks() {
        let s = session();
        assert!(!s.direct());
        s.set_direct();
        assert!(s.direct());
        s.set_direct();
        assert!(s.direct());
    }

    #[tokio::test]
    async fn attach_replaces_and_returns_the_old_handle() {
        let s = session();
        let (gen1, old) = s.attach_browser(sink()).await;
        assert!(old.is_none());

        let (gen2, old) = s.attach_browser(sink()).await;
        assert!(gen2 > gen1);
        assert_eq!(old.expect("displaced handle").generation, gen1);
    }

    #[tokio::test]
    async fn stale_generation_cannot_detach_its_successor() {
        let s = session();
        let (gen1, _) = s.attach_browser(sink()).await;
        let (gen2, _) = s.attach_browser(sink()).await;

        s.detach_browser(gen1).await;
        assert!(s.browser().await.is_some(), "stale detach must be a no-op");

        s.detach_browser(gen2).await;
        assert!(s.browser().await.is_none());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_observable() {
        let s = session();
        assert!(!s.is_cancelled());
        s.cancel();
        s.cancel();
        assert!(s.is_cancelled());
        s.cancelled().await; // completes immediately
    }

    #[tokio::test]
    async fn parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let handle = fake_transport();
        let s = RedirectSession::new(
            SessionKey::new("guid-1", Mode::Ider),
            Arc::new(handle.transport.clone()),
            AuthChallenge::new("admin", "pw"),
            &parent,
        );
        parent.cancel();
        assert!(s.is_cancelled());
    }

    #[tokio::test]
    async fn wipe_secret_clears_the_challenge_password() {
        let s = session();
        s.wipe_secret();
        s.with_challenge(|ch| assert!(ch.secret().is_empty()));
    }
}
