//! Startup sequencing against the store: topology first, then the optional
//! command-table and version probes, then the schema marker and any
//! registered scripts. Expressed as a [`PhaseChain`] so each step runs only
//! after the previous one has fully settled.

use crate::baton::PhaseChain;
use crate::keys;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use resp::{Frame, Value};
use seriesid::Id;
use store_client::{StoreClient, StoreError};

/// The series schema generation this code writes.
pub const SERIES_VERSION: u32 = 2;

/// Oldest server major version with every command the schema needs.
pub const MIN_SERVER_VERSION: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unsupported server (got v{0}, need v{MIN_SERVER_VERSION} or later)")]
    ServerVersion(u32),
    #[error("unsupported series schema (got v{0}, expected v{SERIES_VERSION})")]
    SchemaMismatch(u32),
    #[error("script {handle} rejected: {message}")]
    Script { handle: String, message: String },
}

/// Which optional probes to run, on top of the always-on topology phase.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapFlags {
    /// Probe the command table for key positions (proxied traffic only).
    pub keymap: bool,
    /// Probe server and schema versions.
    pub version: bool,
    /// Load registered scripts.
    pub scripts: bool,
    /// Refuse to run against a mismatched schema instead of going
    /// read-only.
    pub strict: bool,
}

impl Default for BootstrapFlags {
    fn default() -> BootstrapFlags {
        BootstrapFlags {
            keymap: false,
            version: true,
            scripts: false,
            strict: false,
        }
    }
}

/// A server-side script and the content handle it loads under.
#[derive(Debug, Clone)]
pub struct Script {
    pub text: String,
    pub handle: Id,
}

impl Script {
    pub fn new(text: impl Into<String>) -> Script {
        let text = text.into();
        let handle = Id::of(&text);
        Script { text, handle }
    }
}

/// Scripts to install during bootstrap, registered up front and addressed
/// by content handle afterwards.
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    scripts: Vec<Script>,
}

impl ScriptRegistry {
    pub fn new() -> ScriptRegistry {
        ScriptRegistry::default()
    }

    pub fn register(&mut self, text: impl Into<String>) -> Id {
        let script = Script::new(text);
        let handle = script.handle;
        self.scripts.push(script);
        handle
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Script> {
        self.scripts.iter()
    }
}

/// What bootstrap learned about the deployment.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapOutcome {
    /// Server major version; 0 when the probe could not tell.
    pub server_version: u32,
    /// Effective schema version in the store.
    pub schema_version: u32,
    /// Set on schema mismatch in non-strict mode: keep serving reads, do
    /// not write.
    pub read_only: bool,
}

struct Sequence<'a> {
    client: &'a StoreClient,
    registry: &'a ScriptRegistry,
    flags: BootstrapFlags,
    server_version: u32,
    schema_version: u32,
    read_only: bool,
}

/// Run the bootstrap phases. On success the client is in the ready state
/// and the slot map reflects the current topology; re-run after the client
/// reports a disconnect.
pub async fn bootstrap(
    client: &StoreClient,
    registry: &ScriptRegistry,
    flags: BootstrapFlags,
) -> Result<BootstrapOutcome, BootstrapError> {
    let mut chain: PhaseChain<Sequence<'_>, BootstrapError> =
        PhaseChain::new("store bootstrap").phase("slots", slots_phase);
    if flags.keymap {
        chain = chain.phase("command keys", keymap_phase);
    }
    if flags.version {
        chain = chain
            .phase("server version", server_version_phase)
            .phase("schema version", schema_version_phase);
    }
    if flags.scripts && !registry.is_empty() {
        chain = chain.phase("scripts", scripts_phase);
    }

    let mut sequence = Sequence {
        client,
        registry,
        flags,
        server_version: 0,
        schema_version: 0,
        read_only: false,
    };
    chain.run(&mut sequence).await?;

    Ok(BootstrapOutcome {
        server_version: sequence.server_version,
        schema_version: sequence.schema_version,
        read_only: sequence.read_only,
    })
}

fn slots_phase<'c>(seq: &'c mut Sequence<'_>) -> LocalBoxFuture<'c, Result<(), BootstrapError>> {
    async move { Ok(seq.client.refresh_slots().await?) }.boxed_local()
}

fn keymap_phase<'c>(seq: &'c mut Sequence<'_>) -> LocalBoxFuture<'c, Result<(), BootstrapError>> {
    async move { Ok(seq.client.load_keymap().await?) }.boxed_local()
}

fn server_version_phase<'c>(
    seq: &'c mut Sequence<'_>,
) -> LocalBoxFuture<'c, Result<(), BootstrapError>> {
    async move {
        let version = seq.client.server_version().await?;
        // An unreadable probe reports 0 and the sequence continues on a
        // best-effort basis; a positively old server is refused.
        if version != 0 && version < MIN_SERVER_VERSION {
            return Err(BootstrapError::ServerVersion(version));
        }
        seq.server_version = version;
        Ok(())
    }
    .boxed_local()
}

fn schema_version_phase<'c>(
    seq: &'c mut Sequence<'_>,
) -> LocalBoxFuture<'c, Result<(), BootstrapError>> {
    async move {
        let frame = Frame::new("GET", 2).arg(keys::SCHEMA_VERSION);
        let reply = seq
            .client
            .request(Some(keys::SCHEMA_VERSION.as_bytes()), frame)
            .await?;

        let found = match &reply {
            Value::Nil => 0,
            Value::Bulk(_) => {
                let text = reply.as_str().map_err(StoreError::Protocol)?;
                match text.parse::<u32>() {
                    Ok(version) => version,
                    Err(_) => {
                        tracing::error!(text, "unparseable schema version, rewriting");
                        0
                    }
                }
            }
            Value::Error(message) => {
                tracing::warn!(message = %message, "schema version check failed");
                seq.schema_version = 0;
                return Ok(());
            }
            other => {
                tracing::error!(kind = other.kind(), "unexpected schema version reply");
                seq.schema_version = 0;
                return Ok(());
            }
        };

        match found {
            0 => {
                // First time through: install the version marker.
                let frame = Frame::new("SET", 3)
                    .arg(keys::SCHEMA_VERSION)
                    .arg(SERIES_VERSION.to_string());
                let reply = seq
                    .client
                    .request(Some(keys::SCHEMA_VERSION.as_bytes()), frame)
                    .await?;
                if !reply.is_ok_status() {
                    tracing::error!(kind = reply.kind(), "schema version setup failed");
                }
                seq.schema_version = SERIES_VERSION;
            }
            version if version == SERIES_VERSION => seq.schema_version = version,
            version => {
                tracing::error!(
                    got = version,
                    expected = SERIES_VERSION,
                    "schema version mismatch",
                );
                if seq.flags.strict {
                    return Err(BootstrapError::SchemaMismatch(version));
                }
                seq.schema_version = version;
                seq.read_only = true;
            }
        }
        Ok(())
    }
    .boxed_local()
}

fn scripts_phase<'c>(seq: &'c mut Sequence<'_>) -> LocalBoxFuture<'c, Result<(), BootstrapError>> {
    async move {
        for script in seq.registry.iter() {
            let frame = Frame::new("SCRIPT", 3).arg("LOAD").arg(&script.text);
            let reply = seq.client.request(None, frame).await?;
            match &reply {
                Value::Error(message) => {
                    return Err(BootstrapError::Script {
                        handle: script.handle.hex().as_str().to_owned(),
                        message: message.clone(),
                    });
                }
                other => {
                    let loaded = other.as_str().map_err(StoreError::Protocol)?;
                    if loaded != script.handle.hex().as_str() {
                        tracing::warn!(
                            handle = %script.handle,
                            loaded,
                            "script loaded under an unexpected handle",
                        );
                    }
                }
            }
        }
        Ok(())
    }
    .boxed_local()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_script_handles() {
        let mut registry = ScriptRegistry::new();
        assert!(registry.is_empty());

        let text = "return redis.call('GET', KEYS[1])";
        let handle = registry.register(text);
        assert_eq!(handle, Id::of(text));
        assert_eq!(registry.iter().count(), 1);
        // Registration is content-addressed: same text, same handle.
        assert_eq!(registry.register(text), handle);
    }
}
