//! Pluggable payload decoders
//!
//! Decoder ids:
//! - `raw`: hex dump of the decrypted payload, always available
//! - `builtin:<file>.js`: shipped, read-only decoder scripts
//! - `file:<file>.js`: deployment-uploaded scripts (can be disabled)
//!
//! A decoder is resolved to a [`Decoder`] once, before a batch starts, and
//! then invoked per payload through [`PayloadDecoder`].

pub mod sandbox;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::DecoderError;
use crate::udp::protocol::Rxpk;
use sandbox::Sandbox;

pub const RAW_DECODER_ID: &str = "raw";
const BUILTIN_PREFIX: &str = "builtin:";
const UPLOAD_PREFIX: &str = "file:";

#[async_trait]
pub trait PayloadDecoder: Send + Sync {
    /// Decode one decrypted payload into a JSON value
    async fn decode(
        &self,
        payload: &[u8],
        f_port: Option<u8>,
        dev_addr: &str,
        rxpk: &Rxpk,
    ) -> Result<Value, DecoderError>;
}

/// A decoder resolved at load time
pub enum Decoder {
    Raw,
    Script(ScriptDecoder),
}

pub struct ScriptDecoder {
    path: PathBuf,
    sandbox: Arc<dyn Sandbox>,
}

impl ScriptDecoder {
    pub fn new(path: PathBuf, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { path, sandbox }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PayloadDecoder for Decoder {
    async fn decode(
        &self,
        payload: &[u8],
        f_port: Option<u8>,
        dev_addr: &str,
        _rxpk: &Rxpk,
    ) -> Result<Value, DecoderError> {
        match self {
            Decoder::Raw => Ok(json!({
                "payload_hex": hex::encode_upper(payload),
                "fport": f_port,
            })),
            Decoder::Script(script) => {
                debug!("Running {:?} for {} on FPort {:?}", script.path, dev_addr, f_port);
                // Scripts see a missing FPort as port 0
                script
                    .sandbox
                    .run(&script.path, f_port.unwrap_or(0), payload)
                    .await
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderSource {
    Builtin,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecoderInfo {
    pub id: String,
    pub label: String,
    pub source: DecoderSource,
}

/// Locates decoder scripts and turns decoder ids into [`Decoder`]s
pub struct DecoderRegistry {
    builtin_dir: PathBuf,
    /// `None` disables uploaded decoders entirely
    upload_dir: Option<PathBuf>,
    sandbox: Arc<dyn Sandbox>,
}

impl DecoderRegistry {
    pub fn new(builtin_dir: PathBuf, upload_dir: Option<PathBuf>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            builtin_dir,
            upload_dir,
            sandbox,
        }
    }

    pub fn uploads_enabled(&self) -> bool {
        self.upload_dir.is_some()
    }

    /// `raw` first, then built-in scripts, then uploaded scripts, each sorted
    pub fn list(&self) -> Vec<DecoderInfo> {
        let mut decoders = vec![DecoderInfo {
            id: RAW_DECODER_ID.to_string(),
            label: "Raw payload (hex)".to_string(),
            source: DecoderSource::Builtin,
        }];

        for name in script_files(&self.builtin_dir) {
            decoders.push(DecoderInfo {
                id: format!("{}{}", BUILTIN_PREFIX, name),
                label: name,
                source: DecoderSource::Builtin,
            });
        }

        if let Some(dir) = &self.upload_dir {
            for name in script_files(dir) {
                decoders.push(DecoderInfo {
                    id: format!("{}{}", UPLOAD_PREFIX, name),
                    label: name,
                    source: DecoderSource::Upload,
                });
            }
        }

        decoders
    }

    /// Resolve a decoder id to the script it names
    pub fn resolve_path(&self, id: &str) -> Result<PathBuf, DecoderError> {
        if let Some(name) = id.strip_prefix(BUILTIN_PREFIX) {
            validate_file_name(name)?;
            return Ok(self.builtin_dir.join(name));
        }
        if let Some(name) = id.strip_prefix(UPLOAD_PREFIX) {
            validate_file_name(name)?;
            let dir = self.upload_dir.as_ref().ok_or(DecoderError::UploadsDisabled)?;
            return Ok(dir.join(name));
        }
        Err(DecoderError::InvalidSelection(format!(
            "unknown decoder '{}'",
            id
        )))
    }

    pub fn load(&self, id: &str) -> Result<Decoder, DecoderError> {
        if id == RAW_DECODER_ID {
            return Ok(Decoder::Raw);
        }

        let path = self.resolve_path(id)?;
        if !path.is_file() {
            return Err(DecoderError::NotFound(id.to_string()));
        }
        Ok(Decoder::Script(ScriptDecoder::new(path, self.sandbox.clone())))
    }
}

/// Reject anything that could escape the decoder directory
fn validate_file_name(name: &str) -> Result<(), DecoderError> {
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(DecoderError::InvalidSelection(format!(
            "'{}' is not a plain file name",
            name
        )));
    }
    Ok(())
}

/// Sorted `.js` file names in `dir`; a missing directory is simply empty
fn script_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.to_lowercase().ends_with(".js"))
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::sandbox::CommandSandbox;
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn registry(uploads: bool) -> (tempfile::TempDir, DecoderRegistry) {
        let root = tempfile::tempdir().unwrap();
        let builtin = root.path().join("builtin");
        let upload = root.path().join("upload");
        fs::create_dir_all(&builtin).unwrap();
        fs::create_dir_all(&upload).unwrap();
        fs::write(builtin.join("b.js"), "function decode(b){return {}}").unwrap();
        fs::write(builtin.join("a.js"), "function decode(b){return {}}").unwrap();
        fs::write(builtin.join("notes.txt"), "").unwrap();
        fs::write(upload.join("mine.JS"), "function decode(b){return {}}").unwrap();

        let sandbox = Arc::new(CommandSandbox::node("node", Duration::from_secs(1)));
        let registry = DecoderRegistry::new(builtin, uploads.then_some(upload), sandbox);
        (root, registry)
    }

    #[test]
    fn test_list_order() {
        let (_root, registry) = registry(true);
        let ids: Vec<String> = registry.list().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["raw", "builtin:a.js", "builtin:b.js", "file:mine.JS"]);
    }

    #[test]
    fn test_uploads_disabled() {
        let (_root, registry) = registry(false);
        assert!(!registry.uploads_enabled());
        assert_eq!(registry.list().len(), 3);
        assert!(matches!(
            registry.load("file:mine.JS"),
            Err(DecoderError::UploadsDisabled)
        ));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let (_root, registry) = registry(true);
        for id in [
            "builtin:../secret.js",
            "file:..",
            "builtin:sub/a.js",
            "file:..\\a.js",
            "builtin:",
        ] {
            assert!(
                matches!(registry.load(id), Err(DecoderError::InvalidSelection(_))),
                "{} should be rejected",
                id
            );
        }
        assert!(matches!(
            registry.load("python:x.py"),
            Err(DecoderError::InvalidSelection(_))
        ));
    }

    #[test]
    fn test_load_resolves_scripts() {
        let (_root, registry) = registry(true);
        assert!(matches!(registry.load("raw"), Ok(Decoder::Raw)));
        match registry.load("builtin:a.js").unwrap() {
            Decoder::Script(script) => assert!(script.path().ends_with("builtin/a.js")),
            Decoder::Raw => panic!("expected script decoder"),
        }
        assert!(matches!(
            registry.load("builtin:missing.js"),
            Err(DecoderError::NotFound(_))
        ));
    }

    #[test]
    fn test_raw_decoder_output() {
        let value = tokio_test::block_on(Decoder::Raw.decode(
            &[0x01, 0xAB],
            Some(2),
            "26011BDA",
            &Rxpk::default(),
        ))
        .unwrap();
        assert_eq!(value, json!({"payload_hex": "01AB", "fport": 2}));

        let value =
            tokio_test::block_on(Decoder::Raw.decode(&[], None, "26011BDA", &Rxpk::default()))
                .unwrap();
        assert_eq!(value["fport"], Value::Null);
    }
}
