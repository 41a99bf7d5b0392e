//! Demo wiring both buses with the user projection.
//!
//! Dispatches a `user.change_email_address` command, publishes the resulting
//! `user.email_changed` event to the read model, then shuts both buses down.
//! Ctrl-C stops it early.

use anyhow::Context as _;
use clap::Parser;
use conveyor_bus::config::DispatchArgs;
use conveyor_bus::projection::users::{
    self, ChangeEmailAddressCommand, EmailAddressWasChanged, UserRecord, UserStore,
};
use conveyor_bus::{logging, CommandBus, EventBus};
use conveyor_core::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = DispatchArgs::parse();
    if !logging::init(args.environment.log_format()) {
        tracing::debug!("global subscriber already installed, keeping it");
    }
    let config = args.dispatch_config();

    let write_model = UserStore::new();
    let read_model = UserStore::new();
    let id = Uuid::new_v4();
    write_model.insert(id.to_string(), UserRecord::new(id));

    let mut command_bus = CommandBus::new(config.command_bus);
    users::subscribe_commands(&mut command_bus, &write_model)
        .context("registering user command handlers")?;
    let mut event_bus = EventBus::new(config.event_bus);
    users::subscribe_projection(&mut event_bus, &read_model);

    let dispatcher = command_bus.dispatcher();
    let publisher = event_bus.publisher();
    let command_shutdown = command_bus.shutdown_handle();
    let event_shutdown = event_bus.shutdown_handle();

    let stop = CancellationToken::new();
    let command_task = tokio::spawn(command_bus.run(stop.clone()));
    let event_task = tokio::spawn(event_bus.run(stop.clone()));

    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received");
            signal_stop.cancel();
        }
    });

    let command = Message::json(
        users::CHANGE_EMAIL_ADDRESS,
        &ChangeEmailAddressCommand {
            id,
            email: "demo@conveyor.dev".to_string(),
        },
    )?;
    let correlation_id = command.correlation_id();
    let row: UserRecord = dispatcher
        .dispatch(command)
        .await?
        .decode_json()
        .context("decoding command reply")?;
    tracing::info!(%correlation_id, user = %row.id, email = ?row.email, "email changed");

    if let Some(email) = row.email {
        let event = Message::json(users::EMAIL_CHANGED, &EmailAddressWasChanged { id, email })?
            .with_correlation_id(correlation_id);
        publisher.publish(event).await?;
    }

    command_shutdown.shutdown();
    event_shutdown.shutdown();
    let command_report = command_task.await.context("command bus task")?;
    let event_report = event_task.await.context("event bus task")?;

    tracing::info!(
        projected = ?read_model.get(&id.to_string()),
        command_discarded = command_report.discarded,
        event_discarded = event_report.discarded,
        "demo finished"
    );
    Ok(())
}
