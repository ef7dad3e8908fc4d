//! Isolated execution of script decoders
//!
//! A [`Sandbox`] takes a decoder script, an FPort and the decrypted bytes and
//! hands back the decoder's JSON result. [`CommandSandbox`] runs each call in
//! a fresh subprocess with a wall-clock limit; by default that subprocess is
//! Node.js evaluating the script inside a `vm` context.

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::DecoderError;

/// Default upper bound for a single decoder call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Node.js runner: argv = [script path, fport, base64 payload].
///
/// Recognises `Decoder(bytes, port)`, `decodeUplink({bytes, fPort})` and
/// `decode(bytes, port)`. Decoder console output goes to stderr so stdout
/// carries only the JSON result.
pub const NODE_RUNNER: &str = r#"
const fs = require("fs");
const vm = require("vm");

const path = process.argv[1];
const fport = parseInt(process.argv[2], 10) || 0;
const bytes = Array.from(Buffer.from(process.argv[3] || "", "base64").values());

const log = (...args) => process.stderr.write(args.join(" ") + "\n");
const sandbox = { console: { log: log, info: log, warn: log, error: log, debug: log } };
vm.createContext(sandbox);
vm.runInContext(fs.readFileSync(path, "utf8"), sandbox, { filename: path });

let result;
if (typeof sandbox.Decoder === "function") {
  result = { data: sandbox.Decoder(bytes, fport) };
} else if (typeof sandbox.decodeUplink === "function") {
  result = sandbox.decodeUplink({ bytes: bytes, fPort: fport });
} else if (typeof sandbox.decode === "function") {
  result = sandbox.decode(bytes, fport);
} else {
  throw new Error("Decoder file must define decodeUplink(), Decoder(), or decode().");
}

process.stdout.write(JSON.stringify(result === undefined ? null : result));
"#;

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, script: &Path, f_port: u8, payload: &[u8]) -> Result<Value, DecoderError>;
}

/// Runs `program [prelude...] <script> <fport> <base64 payload>` per call
#[derive(Debug, Clone)]
pub struct CommandSandbox {
    program: String,
    prelude: Vec<String>,
    timeout: Duration,
}

impl CommandSandbox {
    pub fn new(program: impl Into<String>, prelude: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            prelude,
            timeout,
        }
    }

    /// Node.js with the built-in runner script
    pub fn node(binary: impl Into<String>, timeout: Duration) -> Self {
        Self::new(
            binary,
            vec!["-e".to_string(), NODE_RUNNER.to_string()],
            timeout,
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Sandbox for CommandSandbox {
    async fn run(&self, script: &Path, f_port: u8, payload: &[u8]) -> Result<Value, DecoderError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);

        let child = Command::new(&self.program)
            .args(&self.prelude)
            .arg(script)
            .arg(f_port.to_string())
            .arg(&encoded)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the child on timeout kills it
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| DecoderError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            debug!("Decoder {:?} exited with {}", script, output.status);
            return Err(DecoderError::Failed(if message.is_empty() {
                format!("Unknown decoder error ({}).", output.status)
            } else {
                message.to_string()
            }));
        }

        parse_output(&output.stdout)
    }
}

/// Interpret decoder stdout: empty means `null`, anything else must be JSON
pub fn parse_output(stdout: &[u8]) -> Result<Value, DecoderError> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| {
        let preview: String = text.chars().take(80).collect();
        DecoderError::MalformedOutput(format!("{} ({})", e, preview))
    })
}
