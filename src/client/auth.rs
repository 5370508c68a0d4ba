//! Authentication types and the per-connection authentication step of connection
//! establishment.

use std::{fmt, str::FromStr};

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary},
    cmap::conn::{command::Command, Connection},
    error::{Error, Result},
};

/// The authentication mechanisms the driver knows how to negotiate.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// SCRAM-SHA-1, the default against servers that do not advertise SCRAM-SHA-256.
    ScramSha1,

    /// SCRAM-SHA-256.
    ScramSha256,

    /// Plain-text SASL, for use behind LDAP proxies. Only safe over TLS.
    Plain,
}

impl AuthMechanism {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => "SCRAM-SHA-1",
            AuthMechanism::ScramSha256 => "SCRAM-SHA-256",
            AuthMechanism::Plain => "PLAIN",
        }
    }

    /// Chooses a mechanism from the list the server advertised for the user during the
    /// handshake.
    pub(crate) fn from_supported(mechanisms: &[String]) -> AuthMechanism {
        if mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(string: &str) -> Result<Self> {
        match string {
            "SCRAM-SHA-1" => Ok(AuthMechanism::ScramSha1),
            "SCRAM-SHA-256" => Ok(AuthMechanism::ScramSha256),
            "PLAIN" => Ok(AuthMechanism::Plain),
            other => Err(Error::invalid_argument(format!(
                "invalid authentication mechanism: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// A user's authentication credential.
#[derive(Clone, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username.
    pub username: Option<String>,

    /// The database the credential is defined on. Defaults to "admin".
    pub source: Option<String>,

    /// The password.
    pub password: Option<String>,

    /// The mechanism to authenticate with. When unset, the driver picks one based on what
    /// the server advertises for the user.
    pub mechanism: Option<AuthMechanism>,
}

impl Credential {
    pub(crate) fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or("admin")
    }

    pub(crate) fn username_for_handshake(&self) -> Option<String> {
        self.username
            .as_ref()
            .map(|username| format!("{}.{}", self.resolved_source(), username))
    }
}

// Credential implements Debug manually so passwords never end up in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Credential")
            .field("username", &self.username)
            .field("source", &self.source)
            .field("password", &self.password.as_ref().map(|_| "REDACTED"))
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

impl<'de> Deserialize<'de> for AuthMechanism {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        AuthMechanism::from_str(&string).map_err(serde::de::Error::custom)
    }
}

/// Runs the authentication step of connection establishment.
pub(crate) async fn authenticate_connection(
    connection: &Connection,
    credential: &Credential,
    server_mechanisms: &[String],
) -> Result<()> {
    let mechanism = match &credential.mechanism {
        Some(mechanism) => mechanism.clone(),
        None => AuthMechanism::from_supported(server_mechanisms),
    };

    match mechanism {
        AuthMechanism::Plain => plain_authenticate(connection, credential).await,
        other => Err(Error::authentication(format!(
            "the {} mechanism is not supported",
            other
        ))),
    }
}

/// PLAIN SASL: a single saslStart carrying `\0username\0password`.
async fn plain_authenticate(connection: &Connection, credential: &Credential) -> Result<()> {
    let username = credential
        .username
        .as_deref()
        .ok_or_else(|| Error::authentication("PLAIN requires a username"))?;
    let password = credential
        .password
        .as_deref()
        .ok_or_else(|| Error::authentication("PLAIN requires a password"))?;

    let payload = format!("\u{0}{}\u{0}{}", username, password).into_bytes();
    let command = Command::new(
        "saslStart",
        credential.resolved_source(),
        doc! {
            "saslStart": 1,
            "mechanism": AuthMechanism::Plain.as_str(),
            "payload": Binary { subtype: BinarySubtype::Generic, bytes: payload },
            "autoAuthorize": 1,
        },
    );

    let response = connection.send_command(command).await?;
    response.command_error()?;

    let body: SaslResponse = response.body()?;
    if !body.done {
        return Err(Error::authentication(
            "the server did not complete PLAIN authentication in one round",
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SaslResponse {
    #[serde(default)]
    done: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mechanism_names_round_trip() {
        for mechanism in [
            AuthMechanism::ScramSha1,
            AuthMechanism::ScramSha256,
            AuthMechanism::Plain,
        ] {
            assert_eq!(mechanism.as_str().parse::<AuthMechanism>().unwrap(), mechanism);
        }
        assert!("GSSAPI".parse::<AuthMechanism>().is_err());
    }

    #[test]
    fn mechanism_selection_prefers_sha256() {
        let advertised = vec!["SCRAM-SHA-1".to_string(), "SCRAM-SHA-256".to_string()];
        assert_eq!(
            AuthMechanism::from_supported(&advertised),
            AuthMechanism::ScramSha256
        );
        assert_eq!(
            AuthMechanism::from_supported(&["SCRAM-SHA-1".to_string()]),
            AuthMechanism::ScramSha1
        );
    }

    #[test]
    fn debug_redacts_password() {
        let credential = Credential::builder()
            .username(Some("user".to_string()))
            .password(Some("hunter2".to_string()))
            .build();
        let output = format!("{:?}", credential);
        assert!(!output.contains("hunter2"));
        assert!(output.contains("REDACTED"));
    }
}
