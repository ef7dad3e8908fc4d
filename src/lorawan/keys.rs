//! LoRaWAN ABP session keys and the credential store that supplies them
//!
//! - NwkSKey signs every frame and encrypts FPort 0 (MAC command) payloads
//! - AppSKey encrypts application payloads (FPort 1..=255)
//! - Credentials are keyed by DevAddr as displayed (big-endian hex)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::CodecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub dev_addr: u32,
    pub nwk_s_key: [u8; 16],
    pub app_s_key: [u8; 16],
}

impl SessionKeys {
    pub fn from_hex(dev_addr: &str, nwk_s_key: &str, app_s_key: &str) -> Result<Self, CodecError> {
        let addr = parse_hex_array::<4>(dev_addr, "DevAddr")?;
        Ok(Self {
            dev_addr: u32::from_be_bytes(addr),
            nwk_s_key: parse_hex_array::<16>(nwk_s_key, "NwkSKey")?,
            app_s_key: parse_hex_array::<16>(app_s_key, "AppSKey")?,
        })
    }

    /// AppSKey for application ports, NwkSKey for FPort 0 or a missing FPort
    pub fn key_for_port(&self, f_port: Option<u8>) -> &[u8; 16] {
        match f_port {
            Some(0) | None => &self.nwk_s_key,
            Some(_) => &self.app_s_key,
        }
    }
}

/// Strip whitespace and the `:` / `-` separators people paste in hex values
pub fn clean_hex(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect()
}

pub fn parse_hex_array<const N: usize>(value: &str, field: &str) -> Result<[u8; N], CodecError> {
    let bytes = hex::decode(clean_hex(value)).map_err(|_| CodecError::InvalidHex {
        field: field.to_string(),
    })?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| CodecError::InvalidLength {
        field: field.to_string(),
        expected: N,
        actual,
    })
}

/// One stored credential, as the external key store hands it over
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nwk_skey: String,
    #[serde(default)]
    pub app_skey: String,
}

/// Session key store, keyed by DevAddr (big-endian hex).
///
/// Entries without two 32-hex-char keys count as missing.
#[derive(Debug, Default, Clone)]
pub struct KeyStore {
    credentials: HashMap<String, Credential>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            credentials: HashMap::new(),
        }
    }

    /// Load a JSON credentials file: `{"26011BDA": {"nwk_skey": "...", "app_skey": "..."}}`
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read credentials {:?}: {}", path, e))?;
        let credentials: BTreeMap<String, Credential> = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse credentials: {}", e))?;

        let mut store = Self::new();
        for (dev_addr, credential) in credentials {
            store
                .credentials
                .insert(clean_hex(&dev_addr).to_uppercase(), credential);
        }
        Ok(store)
    }

    pub fn insert(&mut self, dev_addr: &str, nwk_skey: &str, app_skey: &str) {
        self.credentials.insert(
            clean_hex(dev_addr).to_uppercase(),
            Credential {
                name: None,
                nwk_skey: nwk_skey.to_string(),
                app_skey: app_skey.to_string(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Usable session keys for a DevAddr, or `None` if absent or malformed
    pub fn lookup(&self, dev_addr: &str) -> Option<SessionKeys> {
        let credential = self.credentials.get(&dev_addr.to_uppercase())?;
        let nwk = clean_hex(&credential.nwk_skey);
        let app = clean_hex(&credential.app_skey);
        if nwk.len() != 32 || app.len() != 32 {
            return None;
        }
        SessionKeys::from_hex(dev_addr, &nwk, &app).ok()
    }

    /// DevAddrs from `dev_addrs` that have no usable keys, in input order
    pub fn missing<'a, I>(&self, dev_addrs: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        dev_addrs
            .into_iter()
            .filter(|addr| self.lookup(addr).is_none())
            .cloned()
            .collect()
    }
}
