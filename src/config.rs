use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::module::Platform;
use crate::patcher::parse_replacement;
use crate::{PatchError, Result};

/// Signature and replacement bytes for one platform.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchEntry {
    /// Resolver pattern locating the patch site
    pub signature: String,
    /// Whitespace separated two-digit hex bytes written at the patch site
    pub patch: String,
}

impl PatchEntry {
    pub fn new<S: Into<String>, P: Into<String>>(signature: S, patch: P) -> Self {
        PatchEntry {
            signature: signature.into(),
            patch: patch.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signature.is_empty() && self.patch.is_empty()
    }
}

fn default_module() -> String {
    "server".to_string()
}

/// A named patch as configured by the operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDefinition {
    #[serde(default = "default_module")]
    pub module: String,
    #[serde(default)]
    pub windows: PatchEntry,
    #[serde(default)]
    pub linux: PatchEntry,
}

impl PatchDefinition {
    pub fn entry(&self, platform: Platform) -> &PatchEntry {
        match platform {
            Platform::Windows => &self.windows,
            Platform::Linux => &self.linux,
        }
    }
}

impl Default for PatchDefinition {
    fn default() -> Self {
        PatchDefinition {
            module: default_module(),
            windows: PatchEntry::default(),
            linux: PatchEntry::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PatcherConfig {
    #[serde(default)]
    pub patches: BTreeMap<String, PatchDefinition>,
    /// Patches applied by [`crate::Patcher::start`], in order
    #[serde(default)]
    pub enabled_patches: Vec<String>,
    #[serde(default = "default_true")]
    pub restore_when_unload: bool,
    /// Put the previous page protection back after every write
    #[serde(default)]
    pub restore_protection_after_write: bool,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        PatcherConfig {
            patches: BTreeMap::new(),
            enabled_patches: Vec::new(),
            restore_when_unload: true,
            restore_protection_after_write: false,
        }
    }
}

impl PatcherConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PatcherConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        trace!("Loading patcher config from {}", path.as_ref().display());
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Checks every entry that has a signature for well-formed, non-empty
    /// replacement bytes.
    pub fn validate(&self) -> Result<()> {
        for (name, definition) in &self.patches {
            if definition.module.is_empty() {
                return Err(PatchError::ConfigError(format!(
                    "patch '{}' has an empty module name",
                    name
                )));
            }
            for entry in [&definition.windows, &definition.linux] {
                if entry.signature.is_empty() {
                    continue;
                }
                parse_replacement(name, &entry.patch)?;
            }
        }
        debug!(
            "Config holds {} patches, {} enabled",
            self.patches.len(),
            self.enabled_patches.len()
        );
        Ok(())
    }
}
