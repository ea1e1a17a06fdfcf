use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};

use crate::config::{PatchDefinition, PatcherConfig};
use crate::memory::{flush_instruction_cache, read_bytes, write_bytes};
use crate::module::{ModulePaths, Platform};
use crate::protection::{NativeProtection, PriorProtection, ProtectionController};
use crate::resolver::SignatureResolver;
use crate::store::{PatchRecord, PatchStore};
use crate::{PatchError, Result};

/// Decodes a replacement string made of whitespace separated two-digit hex bytes.
///
/// Example
/// ```rust
/// let bytes = sigpatch::patcher::parse_replacement("nop", "90 90 C3").unwrap();
/// assert_eq!(bytes, vec![0x90, 0x90, 0xC3]);
/// assert!(sigpatch::patcher::parse_replacement("nop", "9 0").is_err());
/// ```
pub fn parse_replacement(name: &str, patch: &str) -> Result<Vec<u8>> {
    let malformed = |reason: String| PatchError::MalformedReplacementBytes {
        name: name.to_string(),
        reason,
    };
    // For each byte litteral in string, push it to the replacement.
    let mut bytes = Vec::new();
    for token in patch.split_whitespace() {
        if token.len() != 2 {
            return Err(malformed(format!("`{}` is not a two-digit hex byte", token)));
        }
        let byte = hex::decode(token).map_err(|err| malformed(format!("`{}`: {}", token, err)))?;
        bytes.push(byte[0]);
    }
    if bytes.is_empty() {
        return Err(malformed("no replacement bytes".into()));
    }
    Ok(bytes)
}

/// Applied state of one patch, as shown by `status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchStatus {
    pub name: String,
    /// Resolved address while the patch is applied
    pub address: Option<usize>,
}

impl PatchStatus {
    pub fn is_applied(&self) -> bool {
        self.address.is_some()
    }
}

impl std::fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Some(address) => write!(f, "{}: applied at {:#x}", self.name, address),
            None => write!(f, "{}: not applied", self.name),
        }
    }
}

/// Result of one item of a batch operation.
pub type Outcome<T> = (String, Result<T>);

pub struct Patcher<R, P = NativeProtection> {
    config: PatcherConfig,
    resolver: R,
    protection: P,
    module_paths: ModulePaths,
    platform: Platform,
    store: Mutex<PatchStore>,
}

impl<R: SignatureResolver> Patcher<R, NativeProtection> {
    pub fn new(config: PatcherConfig, resolver: R) -> Self {
        Patcher {
            config,
            resolver,
            protection: NativeProtection::new(),
            module_paths: ModulePaths::default(),
            platform: Platform::current(),
            store: Mutex::new(PatchStore::new()),
        }
    }
}

impl<R, P> Patcher<R, P>
where
    R: SignatureResolver,
    P: ProtectionController,
{
    pub fn with_protection<Q: ProtectionController>(self, protection: Q) -> Patcher<R, Q> {
        Patcher {
            config: self.config,
            resolver: self.resolver,
            protection,
            module_paths: self.module_paths,
            platform: self.platform,
            store: self.store,
        }
    }

    pub fn with_module_paths(mut self, module_paths: ModulePaths) -> Self {
        self.module_paths = module_paths;
        self
    }

    /// Overrides which platform entry of each definition is used.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn config(&self) -> &PatcherConfig {
        &self.config
    }

    pub fn protection(&self) -> &P {
        &self.protection
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    fn lock(&self) -> MutexGuard<'_, PatchStore> {
        // every store mutation is a single insert or remove, a panic cannot leave it half-updated
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies the configured patch `name` and returns the patched address.
    pub fn apply(&self, name: &str) -> Result<usize> {
        let result = self.apply_configured(name);
        log_apply(name, &result, "");
        result
    }

    /// Applies a definition supplied by the caller instead of the configuration.
    pub fn apply_definition(&self, name: &str, definition: &PatchDefinition) -> Result<usize> {
        let mut store = self.lock();
        let result = self.apply_locked(&mut store, name, definition);
        log_apply(name, &result, "");
        result
    }

    fn apply_configured(&self, name: &str) -> Result<usize> {
        let definition = self
            .config
            .patches
            .get(name)
            .ok_or_else(|| PatchError::UnknownPatchName(name.to_string()))?;
        let mut store = self.lock();
        self.apply_locked(&mut store, name, definition)
    }

    fn apply_locked(
        &self,
        store: &mut PatchStore,
        name: &str,
        definition: &PatchDefinition,
    ) -> Result<usize> {
        if store.contains(name) {
            return Err(PatchError::AlreadyApplied(name.to_string()));
        }
        let entry = definition.entry(self.platform);
        if entry.is_empty() {
            return Err(PatchError::ConfigError(format!(
                "patch '{}' has no {} entry",
                name, self.platform
            )));
        }
        let replacement = parse_replacement(name, &entry.patch)?;

        let module = self.module_paths.resolve(&definition.module);
        let address = self.resolve(name, &module, &entry.signature)?;
        debug!(
            "Patch '{}' resolved to {:#x} in {}",
            name,
            address,
            module.display()
        );

        // Safety: the resolver handed out an address inside a mapped module,
        // and the replacement length is the exact range we take over
        let original = unsafe { self.snapshot_and_write(address, &replacement)? };
        store.insert(PatchRecord {
            name: name.to_string(),
            address,
            original,
        })?;
        Ok(address)
    }

    fn resolve(&self, name: &str, module: &Path, signature: &str) -> Result<usize> {
        match self.resolver.resolve(module, signature) {
            Some(address) if address != 0 => Ok(address),
            _ => Err(PatchError::SignatureNotFound {
                name: name.to_string(),
                module: module.display().to_string(),
            }),
        }
    }

    /// Makes the range writable, snapshots it, then writes `bytes` over it.
    /// Returns the snapshot. Nothing is written unless every earlier step succeeded.
    unsafe fn snapshot_and_write(&self, address: usize, bytes: &[u8]) -> Result<Vec<u8>> {
        let prior = self.protection.set_writable(address, bytes.len())?;
        let original = read_bytes(address, bytes.len())?;
        self.write_writable(address, bytes, prior)?;
        Ok(original)
    }

    unsafe fn write_back(&self, address: usize, bytes: &[u8]) -> Result<()> {
        let prior = self.protection.set_writable(address, bytes.len())?;
        self.write_writable(address, bytes, prior)
    }

    /// Writes into a range already made writable, then re-protects it when hardening is on.
    unsafe fn write_writable(&self, address: usize, bytes: &[u8], prior: PriorProtection) -> Result<()> {
        write_bytes(address, bytes)?;
        flush_instruction_cache(address, bytes.len());
        if self.config.restore_protection_after_write {
            if let Err(err) = self.protection.restore(address, bytes.len(), prior) {
                warn!("Bytes at {:#x} written but protection left writable: {}", address, err);
            }
        }
        Ok(())
    }

    /// Writes the original bytes of `name` back and forgets the record.
    pub fn restore(&self, name: &str) -> Result<()> {
        let mut store = self.lock();
        let result = self.restore_locked(&mut store, name);
        log_restore(name, &result, "");
        result
    }

    fn restore_locked(&self, store: &mut PatchStore, name: &str) -> Result<()> {
        let record = match store.get(name) {
            Some(record) => record,
            None if self.config.patches.contains_key(name) => {
                return Err(PatchError::NotApplied(name.to_string()))
            }
            None => return Err(PatchError::UnknownPatchName(name.to_string())),
        };
        // Safety: the record was created by a successful apply on this range
        unsafe { self.write_back(record.address, &record.original)? };
        store.remove(name);
        Ok(())
    }

    /// Applies every name in order. A failure never stops the remaining names.
    pub fn apply_all<S: AsRef<str>>(&self, names: &[S]) -> Vec<Outcome<usize>> {
        let total = names.len();
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let name = name.as_ref();
                let result = self.apply_configured(name);
                log_apply(name, &result, &format!("[{}/{}] ", i + 1, total));
                (name.to_string(), result)
            })
            .collect()
    }

    /// Restores every live patch, then empties the store.
    pub fn restore_all(&self) -> Vec<Outcome<()>> {
        let mut store = self.lock();
        let names = store.names();
        let total = names.len();
        let outcomes: Vec<Outcome<()>> = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let result = self.restore_locked(&mut store, &name);
                log_restore(&name, &result, &format!("[{}/{}] ", i + 1, total));
                (name, result)
            })
            .collect();
        store.clear();
        outcomes
    }

    pub fn is_applied(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    pub fn record(&self, name: &str) -> Option<PatchRecord> {
        self.lock().get(name).cloned()
    }

    /// Number of live patches.
    pub fn applied_count(&self) -> usize {
        self.lock().len()
    }

    /// Every configured patch plus any live patch applied from an ad-hoc
    /// definition, sorted by name.
    pub fn status(&self) -> Vec<PatchStatus> {
        let store = self.lock();
        let mut statuses: Vec<PatchStatus> = self
            .config
            .patches
            .keys()
            .map(|name| PatchStatus {
                name: name.clone(),
                address: store.get(name).map(|record| record.address),
            })
            .collect();
        statuses.extend(
            store
                .iter()
                .filter(|record| !self.config.patches.contains_key(&record.name))
                .map(|record| PatchStatus {
                    name: record.name.clone(),
                    address: Some(record.address),
                }),
        );
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Load hook: applies the enabled patches unless this is a hot reload.
    pub fn start(&self, hot_reload: bool) -> Vec<Outcome<usize>> {
        if hot_reload {
            debug!("Hot reload, leaving patches untouched");
            return Vec::new();
        }
        self.apply_all(&self.config.enabled_patches)
    }

    /// Unload hook: restores everything when configured to, otherwise leaves
    /// the bytes patched and drops the records.
    pub fn stop(&self, hot_reload: bool) -> Vec<Outcome<()>> {
        if hot_reload {
            debug!("Hot reload, leaving patches untouched");
            return Vec::new();
        }
        if !self.config.restore_when_unload {
            let mut store = self.lock();
            info!("Leaving {} patches applied", store.len());
            store.clear();
            return Vec::new();
        }
        self.restore_all()
    }
}

fn log_apply(name: &str, result: &Result<usize>, progress: &str) {
    match result {
        Ok(address) => info!("{}Patch '{}' successfully patched at {:#x}.", progress, name, address),
        Err(err @ PatchError::AlreadyApplied(_)) => warn!("{}{}, skipping...", progress, err),
        Err(err @ PatchError::SignatureNotFound { .. }) => {
            error!("{}{}, skipping...", progress, err)
        }
        Err(err) => error!("{}Patch '{}' failed: {}", progress, name, err),
    }
}

fn log_restore(name: &str, result: &Result<()>, progress: &str) {
    match result {
        Ok(()) => info!("{}Patch '{}' successfully restored.", progress, name),
        Err(err @ PatchError::NotApplied(_)) => warn!("{}{}", progress, err),
        Err(err) => error!("{}Patch '{}' restore failed: {}", progress, name, err),
    }
}
