//! ==============================================================================
//! dispatcher.rs - per-connection command dispatcher
//! ==============================================================================
//!
//! purpose:
//!     one dispatcher per websocket connection. it handles that connection's
//!     messages strictly one at a time; different connections have their own
//!     dispatchers and run concurrently.
//!
//!     every failure is turned into a wire message here. nothing a client
//!     sends can close its own connection.
//!
//! per-client telemetry:
//!     `start_measuring` spawns a push loop owning a child of the process
//!     shutdown token. `stop_measuring`, a second `start_measuring`, and
//!     teardown all cancel it and wait for it to finish, so no frame from a
//!     stopped loop arrives after the stop response.
//!
//! ==============================================================================

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::AppState;
use crate::error::{CalibrationError, CommandError};
use crate::hub::ClientHandle;
use crate::protocol::{unix_timestamp, Command, CommandRequest, CommandResponse, Outbound, Status};
use crate::sensors::round_to;
use crate::telemetry::run_client_loop;
use serde_json::Value;

struct MeasuringTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CommandDispatcher {
    state: AppState,
    client: ClientHandle,
    measuring: Option<MeasuringTask>,
}

impl CommandDispatcher {
    pub fn new(state: AppState, client: ClientHandle) -> Self {
        Self { state, client, measuring: None }
    }

    /// Handle one inbound text frame and produce the reply for this client.
    pub async fn handle_text(&mut self, text: &str) -> Outbound {
        match self.try_handle(text).await {
            Ok(response) => response.into(),
            Err(e) => {
                tracing::warn!(client = %self.client.id(), kind = e.as_label(), error = %e, "command failed");
                Outbound::error(e.to_string())
            }
        }
    }

    async fn try_handle(&mut self, text: &str) -> Result<CommandResponse, CommandError> {
        let request = CommandRequest::parse(text)?;
        tracing::info!(client = %self.client.id(), command = %request.command, "received command");
        let command = Command::from_request(&request)?;
        self.dispatch(command).await
    }

    pub async fn dispatch(&mut self, command: Command) -> Result<CommandResponse, CommandError> {
        let name = command.name().to_string();

        match command {
            Command::StartMeasuring => {
                self.start_measuring().await;
                Ok(CommandResponse::success(name).with_message("Measurement started"))
            }

            Command::StopMeasuring => {
                let was_running = self.stop_measuring().await;
                tracing::debug!(client = %self.client.id(), was_running, "per-client telemetry stop");
                Ok(CommandResponse::success(name).with_message("Measurement stopped"))
            }

            Command::StartZeroMeasurement => Ok(match self.state.calibration.zero().await {
                Ok(zero) => CommandResponse::success(name)
                    .with_message("Zero value measured")
                    .with_field("zero_value", zero),
                Err(e) => CommandResponse::error(name, e.to_string()),
            }),

            Command::Init { known_weight } => Ok(match self.state.calibration.init(Some(known_weight)).await {
                Ok(reference_unit) => CommandResponse::success(name).with_field("reference_unit", reference_unit),
                Err(e) => {
                    if e.is_device_not_ready() {
                        tracing::warn!(error = %e, "HX711 never signalled ready; check wiring and power");
                    } else {
                        tracing::warn!(kind = e.as_label(), error = %e, "scale init failed");
                    }
                    CommandResponse::new(name, Status::Failed)
                        .with_message(e.to_string())
                        .with_field("reference_unit", Value::Null)
                }
            }),

            Command::TareScale => Ok(match self.state.calibration.init(None).await {
                Ok(_) => CommandResponse::success(name).with_message("Scale tared"),
                Err(e) => CommandResponse::error(name, e.to_string()),
            }),

            Command::CalibrateScale { known_weight } => match self.state.calibration.calibrate(known_weight).await {
                Ok(reference_unit) => Ok(CommandResponse::success(name)
                    .with_message("Calibration successful")
                    .with_field("reference_unit", round_to(reference_unit, 2))),
                Err(e @ CalibrationError::DegenerateReading { .. }) => {
                    tracing::warn!(error = %e, "calibration produced no usable reference unit");
                    Ok(CommandResponse::error(name, "Calibration failed"))
                }
                Err(e) => Err(e.into()),
            },

            Command::GetCurrentWeight => {
                let weight = self.state.gateway.sample_weight(self.state.feed.weight_samples).await;
                Ok(CommandResponse::success(name)
                    .with_field("waage2", weight)
                    .with_field("timestamp", unix_timestamp()))
            }

            Command::Unknown(command) => {
                Ok(CommandResponse::error(name, format!("Unknown command: {command}")))
            }
        }
    }

    /// (Re)start this connection's push loop.
    async fn start_measuring(&mut self) {
        self.stop_measuring().await;

        let token = self.state.shutdown.child_token();
        let gateway = self.state.gateway.clone();
        let client = self.client.clone();
        let settings = self.state.feed;
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let id = client.id();
            match run_client_loop(gateway, client, settings, loop_token).await {
                Ok(()) => tracing::debug!(client = %id, "per-client telemetry stopped"),
                Err(e) => tracing::warn!(client = %id, error = %e, "per-client telemetry ended"),
            }
        });

        tracing::info!(client = %self.client.id(), "per-client telemetry started");
        self.measuring = Some(MeasuringTask { token, handle });
    }

    /// Cancel the push loop and wait for it to wind down. Returns whether one was running.
    pub async fn stop_measuring(&mut self) -> bool {
        match self.measuring.take() {
            Some(task) => {
                task.token.cancel();
                let _ = task.handle.await;
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_measuring(&self) -> bool {
        self.measuring.as_ref().is_some_and(|task| !task.handle.is_finished())
    }

    /// Connection teardown.
    pub async fn shutdown(mut self) {
        self.stop_measuring().await;
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        if let Some(task) = self.measuring.take() {
            task.token.cancel();
        }
    }
}
