//! The hello / isMaster handshake command and its response.

use std::time::Duration;

use serde::Deserialize;

use crate::{
    bson::{doc, oid::ObjectId},
    cmap::conn::command::Command,
    options::ServerAddress,
    sdam::ServerType,
    selection_criteria::TagSet,
};

/// The legacy name of the hello command. Used against servers that predate `hello` and for
/// the very first exchange on a connection, before the wire version is known.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";
pub(crate) const LEGACY_HELLO_COMMAND_NAME_LOWERCASE: &str = "ismaster";

/// Construct a hello command, taking into account whether the server is known to support
/// the modern name.
pub(crate) fn hello_command(hello_ok: Option<bool>) -> Command {
    let (name, body) = if hello_ok == Some(true) {
        ("hello", doc! { "hello": 1 })
    } else {
        (
            LEGACY_HELLO_COMMAND_NAME,
            doc! { LEGACY_HELLO_COMMAND_NAME: 1, "helloOk": true },
        )
    };

    Command::new(name, "admin", body)
}

/// The response to a hello command, paired with the address it came from.
#[derive(Clone, Debug)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) round_trip_time: Duration,
}

/// The body of the response to a hello command.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server understands the modern `hello` command name.
    #[serde(default)]
    pub(crate) hello_ok: Option<bool>,

    #[serde(rename = "ismaster", default)]
    pub(crate) is_master: Option<bool>,

    #[serde(default)]
    pub(crate) is_writable_primary: Option<bool>,

    /// "isdbgrid" when the server is a mongos.
    #[serde(default)]
    pub(crate) msg: Option<String>,

    /// Present and true only on a server started with --replSet that has not yet been
    /// initiated into a set.
    #[serde(rename = "isreplicaset", default)]
    pub(crate) is_replica_set: Option<bool>,

    #[serde(default)]
    pub(crate) set_name: Option<String>,

    #[serde(default)]
    pub(crate) set_version: Option<i32>,

    #[serde(default)]
    pub(crate) election_id: Option<ObjectId>,

    #[serde(default)]
    pub(crate) secondary: Option<bool>,

    #[serde(default)]
    pub(crate) arbiter_only: Option<bool>,

    #[serde(default)]
    pub(crate) hidden: Option<bool>,

    #[serde(default)]
    pub(crate) hosts: Option<Vec<String>>,

    #[serde(default)]
    pub(crate) passives: Option<Vec<String>>,

    #[serde(default)]
    pub(crate) arbiters: Option<Vec<String>>,

    /// The address the server believes it is known by, which may disagree with the address
    /// the client used to reach it.
    #[serde(default)]
    pub(crate) me: Option<String>,

    #[serde(default)]
    pub(crate) tags: Option<TagSet>,

    #[serde(default)]
    pub(crate) min_wire_version: Option<i32>,

    #[serde(default)]
    pub(crate) max_wire_version: Option<i32>,

    #[serde(default)]
    pub(crate) max_bson_object_size: Option<i64>,

    #[serde(default)]
    pub(crate) max_message_size_bytes: Option<i64>,

    #[serde(default)]
    pub(crate) max_write_batch_size: Option<i64>,

    #[serde(default)]
    pub(crate) logical_session_timeout_minutes: Option<i64>,

    /// The compressors, of those offered by the client, that the server also supports.
    #[serde(default)]
    pub(crate) compression: Option<Vec<String>>,

    #[serde(default)]
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,
}

impl HelloCommandResponse {
    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout_minutes
            .map(|minutes| Duration::from_secs(minutes.max(0) as u64 * 60))
    }

    fn is_primary(&self) -> bool {
        self.is_writable_primary.or(self.is_master).unwrap_or(false)
    }

    /// Derives the type of the server that sent this response.
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerType::Mongos;
        }

        if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_primary() {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }

    /// All addresses the response names as members of its set.
    pub(crate) fn known_hosts(&self) -> impl Iterator<Item = &String> {
        self.hosts
            .iter()
            .flatten()
            .chain(self.passives.iter().flatten())
            .chain(self.arbiters.iter().flatten())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::Document;

    fn response(doc: Document) -> HelloCommandResponse {
        crate::bson::from_document(doc).unwrap()
    }

    #[test]
    fn server_type_derivation() {
        assert_eq!(response(doc! { "ok": 1 }).server_type(), ServerType::Standalone);
        assert_eq!(
            response(doc! { "ok": 1, "msg": "isdbgrid" }).server_type(),
            ServerType::Mongos
        );
        assert_eq!(
            response(doc! { "ok": 1, "isreplicaset": true }).server_type(),
            ServerType::RsGhost
        );
        assert_eq!(
            response(doc! { "ok": 1, "setName": "rs", "isWritablePrimary": true }).server_type(),
            ServerType::RsPrimary
        );
        assert_eq!(
            response(doc! { "ok": 1, "setName": "rs", "ismaster": true }).server_type(),
            ServerType::RsPrimary
        );
        assert_eq!(
            response(doc! { "ok": 1, "setName": "rs", "secondary": true }).server_type(),
            ServerType::RsSecondary
        );
        assert_eq!(
            response(doc! { "ok": 1, "setName": "rs", "arbiterOnly": true }).server_type(),
            ServerType::RsArbiter
        );
        assert_eq!(
            response(doc! { "ok": 1, "setName": "rs", "hidden": true, "secondary": true })
                .server_type(),
            ServerType::RsOther
        );
        assert_eq!(
            response(doc! { "ok": 1, "setName": "rs" }).server_type(),
            ServerType::RsOther
        );
    }

    #[test]
    fn session_timeout_minutes() {
        let response = response(doc! { "ok": 1, "logicalSessionTimeoutMinutes": 30 });
        assert_eq!(
            response.logical_session_timeout(),
            Some(Duration::from_secs(30 * 60))
        );
    }

    #[test]
    fn hello_command_names() {
        let legacy = hello_command(None);
        assert_eq!(legacy.name, LEGACY_HELLO_COMMAND_NAME);
        assert!(legacy.body.contains_key("helloOk"));

        let modern = hello_command(Some(true));
        assert_eq!(modern.name, "hello");
    }
}
