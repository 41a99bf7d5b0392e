//! Domain handlers wired onto the buses.

pub mod users;

pub use users::{
    subscribe_commands, subscribe_projection, ChangeEmailAddress, UserRecord, UserStore,
    WhenConnectedWithGoogle, WhenEmailAddressWasChanged,
};
