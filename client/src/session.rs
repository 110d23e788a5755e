//! Signed-in account context.
//!
//! The session decides which private channel live updates arrive on and which
//! auth token is attached to outgoing commands. Components hold a
//! [`SessionHandle`] and read the current value when they need it, so a
//! sign-in or token refresh is picked up without restarting anything.

use std::sync::Arc;
use tokio::sync::watch;

/// Channel name prefix for per-account encrypted push channels.
pub const PRIVATE_USER_CHANNEL_PREFIX: &str = "private-encrypted-user-accountID-";

/// Who is signed in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// Backend account identifier
    pub account_id: Option<u64>,
    /// Login email, for logging only
    pub email: Option<String>,
    /// Token attached to every command request
    pub auth_token: Option<String>,
}

impl SessionContext {
    /// Context for a signed-in account.
    pub fn signed_in(account_id: u64, auth_token: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id),
            email: None,
            auth_token: Some(auth_token.into()),
        }
    }

    /// Attach a login email.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// True if an account id is known.
    pub fn is_signed_in(&self) -> bool {
        self.account_id.is_some()
    }

    /// The account's private push channel, if signed in.
    pub fn private_user_channel(&self) -> Option<String> {
        self.account_id
            .map(|id| format!("{}{}", PRIVATE_USER_CHANNEL_PREFIX, id))
    }
}

/// Shared, observable session context.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: Arc<watch::Sender<SessionContext>>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new(SessionContext::default())
    }
}

impl SessionHandle {
    pub fn new(context: SessionContext) -> Self {
        let (tx, _rx) = watch::channel(context);
        Self { tx: Arc::new(tx) }
    }

    /// Copy of the current context.
    pub fn current(&self) -> SessionContext {
        self.tx.borrow().clone()
    }

    /// Modify the context in place and notify watchers.
    pub fn update(&self, f: impl FnOnce(&mut SessionContext)) {
        self.tx.send_modify(f);
    }

    /// Forget the signed-in account.
    pub fn sign_out(&self) {
        self.tx.send_replace(SessionContext::default());
        tracing::info!("session cleared");
    }

    /// Receiver that observes every change.
    pub fn watch(&self) -> watch::Receiver<SessionContext> {
        self.tx.subscribe()
    }
}
