//! The per-server heartbeat task.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::{description::server::ServerDescription, topology::WeakTopology};
use crate::{
    cmap::{conn::Connection, establish::Handshaker},
    error::{Error, Result},
    event::{
        sdam::{
            ServerHeartbeatFailedEvent,
            ServerHeartbeatStartedEvent,
            ServerHeartbeatSucceededEvent,
        },
        SdamEventHandlerRef,
    },
    hello::{hello_command, HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress},
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// Checks closer together than this are coalesced, even when selection is starved and
/// requesting them.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The exponential moving average weight given to the newest round trip time sample.
const RTT_EWMA_WEIGHT: f64 = 0.2;

/// Periodically checks one server and pushes the resulting description into the topology.
///
/// The monitor keeps its own connection, separate from the server's pool, so that
/// heartbeats are never queued behind application operations. It holds only a weak
/// topology reference and exits when the topology is dropped, shut down, or no longer
/// contains its server.
pub(crate) struct Monitor {
    address: ServerAddress,
    topology: WeakTopology,
    handshaker: Handshaker,
    connection: Option<Connection>,
    /// Set once the server has advertised support for the `hello` command name.
    hello_ok: Option<bool>,
    average_round_trip_time: Option<Duration>,
    heartbeat_frequency: Duration,
    connect_timeout: Option<Duration>,
    event_handler: Option<SdamEventHandlerRef>,
    shutdown: watch::Receiver<bool>,
    check_requests: watch::Receiver<()>,
}

impl Monitor {
    /// Spawns the monitor task for one address.
    pub(crate) fn start(
        address: ServerAddress,
        topology: WeakTopology,
        options: &ClientOptions,
        shutdown: watch::Receiver<bool>,
        check_requests: watch::Receiver<()>,
    ) {
        // Monitoring connections are never authenticated and never compressed.
        let handshaker = Handshaker::new(options.app_name.clone(), Vec::new(), None);
        let mut monitor = Self {
            address,
            topology,
            handshaker,
            connection: None,
            hello_ok: None,
            average_round_trip_time: None,
            heartbeat_frequency: options.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
            connect_timeout: options.connect_timeout,
            event_handler: options.sdam_event_handler.clone(),
            shutdown,
            check_requests,
        };
        tokio::spawn(async move {
            monitor.execute().await;
        });
    }

    async fn execute(&mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let topology = match self.topology.upgrade() {
                Some(topology) => topology,
                None => break,
            };
            if !topology.is_monitoring(&self.address) {
                break;
            }

            let description = self.check_server().await;
            topology.update(description).await;

            // Drop the strong reference before sleeping so a dropped client can wind
            // down between checks.
            drop(topology);

            if !self.wait_for_next_check().await {
                break;
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }

    /// Sleeps until the next check is due. A check request shortens the wait to the
    /// minimum frequency. Returns false when shutdown was signalled.
    async fn wait_for_next_check(&mut self) -> bool {
        tokio::time::sleep(MIN_HEARTBEAT_FREQUENCY).await;
        if *self.shutdown.borrow() {
            return false;
        }

        let remaining = self
            .heartbeat_frequency
            .saturating_sub(MIN_HEARTBEAT_FREQUENCY);
        tokio::select! {
            _ = tokio::time::sleep(remaining) => true,
            changed = self.check_requests.changed() => changed.is_ok(),
            _ = self.shutdown.changed() => !*self.shutdown.borrow(),
        }
    }

    /// Runs one hello exchange and turns the outcome into a server description. A network
    /// failure tears down the monitoring connection and is retried exactly once on a
    /// fresh one before the server is declared unknown.
    async fn check_server(&mut self) -> ServerDescription {
        self.emit(|handler| {
            handler.handle_server_heartbeat_started_event(ServerHeartbeatStartedEvent {
                address: self.address.clone(),
            })
        });

        let start = Instant::now();
        let result = match self.perform_hello().await {
            Err(error) if error.is_network_error() => {
                self.connection = None;
                self.perform_hello().await
            }
            other => other,
        };

        match result {
            Ok(reply) => {
                self.hello_ok = Some(reply.command_response.hello_ok == Some(true));
                let average = self.update_average_round_trip_time(reply.round_trip_time);

                self.emit(|handler| {
                    handler.handle_server_heartbeat_succeeded_event(
                        ServerHeartbeatSucceededEvent {
                            address: self.address.clone(),
                            duration: reply.round_trip_time,
                        },
                    )
                });
                ServerDescription::new_from_hello_reply(self.address.clone(), &reply, average)
            }
            Err(error) => {
                self.connection = None;
                self.average_round_trip_time = None;
                self.hello_ok = None;

                self.emit(|handler| {
                    handler.handle_server_heartbeat_failed_event(ServerHeartbeatFailedEvent {
                        address: self.address.clone(),
                        duration: start.elapsed(),
                        failure: error.clone(),
                    })
                });
                ServerDescription::new_from_error(self.address.clone(), error)
            }
        }
    }

    /// Sends a hello on the monitoring connection, opening one (and handshaking) first
    /// when none is live. Any failure invalidates the connection.
    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let result = match self.connection {
            Some(ref connection) => {
                let command = hello_command(self.hello_ok);
                let start = Instant::now();
                let response = connection.send_command(command).await;
                let round_trip_time = start.elapsed();

                response.and_then(|response| {
                    response.command_error()?;
                    let command_response: HelloCommandResponse = response.body()?;
                    Ok(HelloReply {
                        server_address: self.address.clone(),
                        command_response,
                        round_trip_time,
                    })
                })
            }
            None => {
                let connection =
                    Connection::connect(self.address.clone(), 0, 0, self.connect_timeout, None)
                        .await?;
                let reply = self.handshaker.handshake(&connection).await;
                self.connection = Some(connection);
                reply
            }
        };

        if result.is_err() {
            if let Some(connection) = self.connection.take() {
                connection.close();
            }
        }
        result
    }

    fn update_average_round_trip_time(&mut self, sample: Duration) -> Duration {
        let average = match self.average_round_trip_time {
            Some(average) => {
                sample.mul_f64(RTT_EWMA_WEIGHT) + average.mul_f64(1.0 - RTT_EWMA_WEIGHT)
            }
            None => sample,
        };
        self.average_round_trip_time = Some(average);
        average
    }

    fn emit<F>(&self, emit: F)
    where
        F: FnOnce(&dyn crate::event::sdam::SdamEventHandler),
    {
        if let Some(handler) = &self.event_handler {
            emit(handler.0.as_ref());
        }
    }

    #[cfg(test)]
    fn stub(address: ServerAddress) -> Self {
        let (_, shutdown) = watch::channel(false);
        let (_, check_requests) = watch::channel(());
        Self {
            address,
            topology: WeakTopology::empty(),
            handshaker: Handshaker::new(None, Vec::new(), None),
            connection: None,
            hello_ok: None,
            average_round_trip_time: None,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            connect_timeout: None,
            event_handler: None,
            shutdown,
            check_requests,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn address() -> ServerAddress {
        ServerAddress::parse("localhost:27017").unwrap()
    }

    #[test]
    fn round_trip_time_is_exponentially_weighted() {
        let mut monitor = Monitor::stub(address());

        let first = monitor.update_average_round_trip_time(Duration::from_millis(100));
        assert_eq!(first, Duration::from_millis(100));

        // 0.2 * 200ms + 0.8 * 100ms
        let second = monitor.update_average_round_trip_time(Duration::from_millis(200));
        assert_eq!(second, Duration::from_millis(120));

        let third = monitor.update_average_round_trip_time(Duration::from_millis(120));
        assert_eq!(third, Duration::from_millis(120));
    }

    #[test]
    fn failed_check_forgets_the_averaged_round_trip_time() {
        let mut monitor = Monitor::stub(address());
        monitor.update_average_round_trip_time(Duration::from_millis(100));
        monitor.average_round_trip_time = None;
        assert_eq!(
            monitor.update_average_round_trip_time(Duration::from_millis(40)),
            Duration::from_millis(40),
        );
    }
}
