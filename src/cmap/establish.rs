//! The connection handshake: the first exchange on every new connection, which tells the
//! server who we are and tells us what the server supports.

use std::time::Instant;

use crate::{
    bson::{doc, Document},
    client::auth::{self, Credential},
    cmap::conn::{stream_description::StreamDescription, Connection},
    compression::Compressor,
    error::Result,
    hello::{hello_command, HelloCommandResponse, HelloReply},
};

/// Contents of the `client` metadata document sent in the handshake. Shows up in server
/// logs and in currentOp output.
#[derive(Clone, Debug)]
pub(crate) struct ClientMetadata {
    pub(crate) application_name: Option<String>,
}

impl ClientMetadata {
    fn into_document(self) -> Document {
        let mut metadata = doc! {
            "driver": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
            },
        };
        if let Some(name) = self.application_name {
            metadata.insert("application", doc! { "name": name });
        }
        metadata
    }
}

/// Performs the handshake and optional authentication on freshly-opened connections.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    client_metadata: Document,
    compressors: Vec<Compressor>,
    credential: Option<Credential>,
}

impl Handshaker {
    pub(crate) fn new(
        app_name: Option<String>,
        compressors: Vec<Compressor>,
        credential: Option<Credential>,
    ) -> Self {
        Self {
            client_metadata: ClientMetadata {
                application_name: app_name,
            }
            .into_document(),
            compressors,
            credential,
        }
    }

    /// Runs the handshake on the given connection, recording what was learned as the
    /// connection's stream description, then authenticates if a credential was configured.
    pub(crate) async fn handshake(&self, connection: &Connection) -> Result<HelloReply> {
        let mut command = hello_command(None);
        command.body.insert("client", self.client_metadata.clone());

        if !self.compressors.is_empty() {
            let names: Vec<&str> = self
                .compressors
                .iter()
                .map(|compressor| compressor.name())
                .collect();
            command.body.insert("compression", names);
        }

        if let Some(username) = self
            .credential
            .as_ref()
            .and_then(|credential| credential.username_for_handshake())
        {
            command.body.insert("saslSupportedMechs", username);
        }

        let start = Instant::now();
        let response = connection.send_command(command).await?;
        let round_trip_time = start.elapsed();
        response.command_error()?;

        let command_response: HelloCommandResponse = response.body()?;

        let compressor = command_response
            .compression
            .as_deref()
            .and_then(|advertised| Compressor::negotiate(&self.compressors, advertised));

        let reply = HelloReply {
            server_address: connection.address.clone(),
            command_response,
            round_trip_time,
        };

        connection.set_stream_description(StreamDescription::from_hello_reply(
            &reply, compressor,
        ))?;

        if let Some(credential) = &self.credential {
            let mechanisms = reply
                .command_response
                .sasl_supported_mechs
                .clone()
                .unwrap_or_default();
            auth::authenticate_connection(connection, credential, &mechanisms).await?;
        }

        Ok(reply)
    }
}
