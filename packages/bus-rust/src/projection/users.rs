//! User read model.
//!
//! Two event handlers keep [`UserRecord`] rows in step with the user
//! aggregate's events, and one command handler changes a user's email on the
//! write side and replies with the updated row. Every handler decodes its
//! own payload and writes only through the transaction it is given.

use async_trait::async_trait;
use conveyor_core::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{CommandBus, EventBus};
use crate::context::ExecutionContext;
use crate::error::{DispatchError, HandlerError};
use crate::handler::{Handler, Reply};
use crate::storage::{MemoryStore, MemoryTransaction};

pub const EMAIL_CHANGED: &str = "user.email_changed";
pub const CONNECTED_WITH_GOOGLE: &str = "user.connected_with_google";
pub const CHANGE_EMAIL_ADDRESS: &str = "user.change_email_address";

/// One row of the user table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: Option<String>,
    pub google_id: Option<String>,
}

impl UserRecord {
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            email: None,
            google_id: None,
        }
    }
}

pub type UserStore = MemoryStore<UserRecord>;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAddressWasChanged {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedWithGoogle {
    pub id: Uuid,
    pub google_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEmailAddressCommand {
    pub id: Uuid,
    pub email: String,
}

/// Loads the row of `id` inside `tx`, or a blank row if the projection has
/// not seen the user yet.
fn load(tx: &MemoryTransaction<UserRecord>, id: Uuid) -> UserRecord {
    tx.get(&id.to_string()).unwrap_or_else(|| UserRecord::new(id))
}

// ---------------------------------------------------------------------------
// Event handlers
// ---------------------------------------------------------------------------

/// Projects `user.email_changed` onto the user row.
pub struct WhenEmailAddressWasChanged {
    store: UserStore,
}

impl WhenEmailAddressWasChanged {
    #[must_use]
    pub fn new(store: UserStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for WhenEmailAddressWasChanged {
    type Store = UserStore;

    fn name(&self) -> &'static str {
        "when_email_address_was_changed"
    }

    fn store(&self) -> &UserStore {
        &self.store
    }

    async fn handle(
        &self,
        _ctx: &ExecutionContext,
        tx: &mut MemoryTransaction<UserRecord>,
        message: &Message,
    ) -> Result<Reply, HandlerError> {
        let event: EmailAddressWasChanged = message.decode_json()?;
        let mut row = load(tx, event.id);
        row.email = Some(event.email);
        tx.put(event.id.to_string(), row)?;
        Ok(Reply::empty())
    }
}

/// Projects `user.connected_with_google` onto the user row.
pub struct WhenConnectedWithGoogle {
    store: UserStore,
}

impl WhenConnectedWithGoogle {
    #[must_use]
    pub fn new(store: UserStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for WhenConnectedWithGoogle {
    type Store = UserStore;

    fn name(&self) -> &'static str {
        "when_connected_with_google"
    }

    fn store(&self) -> &UserStore {
        &self.store
    }

    async fn handle(
        &self,
        _ctx: &ExecutionContext,
        tx: &mut MemoryTransaction<UserRecord>,
        message: &Message,
    ) -> Result<Reply, HandlerError> {
        let event: ConnectedWithGoogle = message.decode_json()?;
        let mut row = load(tx, event.id);
        row.google_id = Some(event.google_id);
        tx.put(event.id.to_string(), row)?;
        Ok(Reply::empty())
    }
}

// ---------------------------------------------------------------------------
// Command handler
// ---------------------------------------------------------------------------

/// Changes a user's email address and replies with the updated row.
///
/// Refuses addresses without an `@` and users that do not exist.
pub struct ChangeEmailAddress {
    store: UserStore,
}

impl ChangeEmailAddress {
    #[must_use]
    pub fn new(store: UserStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler for ChangeEmailAddress {
    type Store = UserStore;

    fn name(&self) -> &'static str {
        "change_email_address"
    }

    fn store(&self) -> &UserStore {
        &self.store
    }

    async fn handle(
        &self,
        _ctx: &ExecutionContext,
        tx: &mut MemoryTransaction<UserRecord>,
        message: &Message,
    ) -> Result<Reply, HandlerError> {
        let cmd: ChangeEmailAddressCommand = message.decode_json()?;
        if !cmd.email.contains('@') {
            return Err(HandlerError::Rejected(format!(
                "invalid email address {:?}",
                cmd.email
            )));
        }
        let mut row = tx
            .get(&cmd.id.to_string())
            .ok_or_else(|| HandlerError::Rejected(format!("user {} not found", cmd.id)))?;
        row.email = Some(cmd.email);
        tx.put(cmd.id.to_string(), row.clone())?;
        Reply::json(&row)
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Subscribes the read-model handlers to `bus`, all writing to `store`.
pub fn subscribe_projection(bus: &mut EventBus, store: &UserStore) {
    bus.subscribe(EMAIL_CHANGED, WhenEmailAddressWasChanged::new(store.clone()));
    bus.subscribe(CONNECTED_WITH_GOOGLE, WhenConnectedWithGoogle::new(store.clone()));
}

/// Registers the user command handlers on `bus`.
///
/// # Errors
///
/// Returns [`DispatchError::Configuration`] if a user command kind already
/// has a handler.
pub fn subscribe_commands(bus: &mut CommandBus, store: &UserStore) -> Result<(), DispatchError> {
    bus.subscribe(CHANGE_EMAIL_ADDRESS, ChangeEmailAddress::new(store.clone()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
