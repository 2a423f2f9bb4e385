//! Flushing the cache when the signed-in identity goes away.
//!
//! Cached artwork isn't tied to a user, but signing out is a convenient point to hand the memory back, and it makes
//! sure nothing cached under one session is visible to the next.  Signing in never flushes.
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::*;

/// Authentication state transitions, as an auth provider reports them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

#[derive(Clone)]
pub struct InvalidationController {
    cache: ArtworkCache,
    /// The user seen by the last event.
    user: Arc<Mutex<Option<String>>>,
}

impl InvalidationController {
    pub fn new(cache: ArtworkCache) -> InvalidationController {
        InvalidationController {
            cache,
            user: Default::default(),
        }
    }

    pub fn current_user(&self) -> Option<String> {
        self.user.lock().clone()
    }

    /// Feed an auth event through.  Returns whether the cache was flushed.
    ///
    /// Only a sign-out of a user we had seen flushes.  The new user is recorded either way.
    pub async fn on_auth_state_change(&self, event: AuthEvent, user: Option<String>) -> bool {
        let previous = std::mem::replace(&mut *self.user.lock(), user);
        if event != AuthEvent::SignedOut || previous.is_none() {
            return false;
        }

        debug!("Signed out, flushing the artwork cache");
        self.cache.clear_all().await;
        true
    }

    /// Flush, then forget the user.
    pub async fn sign_out(&self) -> FlushReport {
        let report = self.cache.clear_all().await;
        *self.user.lock() = None;
        report
    }

    /// Flush on request, e.g. from a settings screen.
    pub async fn clear_cache(&self) -> FlushReport {
        self.cache.clear_all().await
    }

    /// Follow an auth-state channel carrying the current user, flushing whenever a user goes away.
    ///
    /// The task ends when the sending side is dropped.
    pub fn watch(&self, mut receiver: watch::Receiver<Option<String>>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let initial = receiver.borrow_and_update().clone();
            this.on_auth_state_change(AuthEvent::InitialSession, initial)
                .await;

            while receiver.changed().await.is_ok() {
                let user = receiver.borrow_and_update().clone();
                let event = match (&user, this.current_user()) {
                    (None, _) => AuthEvent::SignedOut,
                    (Some(_), None) => AuthEvent::SignedIn,
                    (Some(_), Some(_)) => AuthEvent::UserUpdated,
                };
                this.on_auth_state_change(event, user).await;
            }
        })
    }
}
