use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, error, trace};

use crate::pattern::Pattern;

/// Finds a signature inside a loaded module.
pub trait SignatureResolver {
    /// Returns the absolute address of the first match, or `None`.
    fn resolve(&self, module: &Path, pattern: &str) -> Option<usize>;
}

impl<F> SignatureResolver for F
where
    F: Fn(&Path, &str) -> Option<usize>,
{
    fn resolve(&self, module: &Path, pattern: &str) -> Option<usize> {
        self(module, pattern)
    }
}

/// Half-open address range `[start, end)` of a module mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleRange {
    pub start: usize,
    pub end: usize,
}

impl ModuleRange {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scans module memory of the current process for signatures.
#[derive(Debug, Default)]
pub struct ScanResolver {
    modules: HashMap<PathBuf, Vec<ModuleRange>>,
}

impl ScanResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a readable range belonging to `module`.
    ///
    /// # Safety
    /// `[base, base + size)` must stay mapped and readable for as long as the
    /// resolver is used.
    pub unsafe fn register<P: Into<PathBuf>>(&mut self, module: P, base: usize, size: usize) -> &mut Self {
        self.modules.entry(module.into()).or_default().push(ModuleRange {
            start: base,
            end: base + size,
        });
        self
    }

    fn ranges_for(&self, module: &Path) -> Vec<ModuleRange> {
        if let Some(ranges) = self.modules.get(module) {
            return ranges.clone();
        }
        mapped_ranges(module)
    }
}

impl SignatureResolver for ScanResolver {
    fn resolve(&self, module: &Path, pattern: &str) -> Option<usize> {
        let pattern = match Pattern::new(pattern) {
            Ok(pattern) => pattern,
            Err(err) => {
                error!("Invalid signature for {}: {}", module.display(), err);
                return None;
            }
        };
        let ranges = self.ranges_for(module);
        if ranges.is_empty() {
            debug!("Module {} is not mapped", module.display());
            return None;
        }
        for range in ranges.iter().filter(|range| range.len() >= pattern.len()) {
            // Safety: registered ranges are readable per `register`, discovered
            // ranges come from readable mappings of the module
            match unsafe { pattern.find(range.start, range.len()) } {
                Ok(address) => {
                    debug!("Found {} in {} at {:#x}", pattern, module.display(), address);
                    return Some(address);
                }
                Err(err) => trace!("{}", err),
            }
        }
        None
    }
}

fn same_module(mapped: &Path, module: &Path) -> bool {
    if module.is_absolute() {
        return mapped == module;
    }
    // bare or relative module paths are matched against the tail of the mapping
    mapped.ends_with(module)
}

/// One line of `/proc/<pid>/maps`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping<'a> {
    pub range: ModuleRange,
    /// Permission column, e.g. `r-xp`
    pub perms: &'a str,
    /// `None` for anonymous mappings
    pub path: Option<&'a str>,
}

impl Mapping<'_> {
    pub fn contains(&self, address: usize) -> bool {
        self.range.start <= address && address < self.range.end
    }
}

/// Parses `/proc/<pid>/maps` content, skipping malformed lines.
pub fn mappings(contents: &str) -> impl Iterator<Item = Mapping<'_>> {
    contents.lines().filter_map(|line| {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let perms = fields.next()?;
        // offset, device, inode
        let path = fields.nth(3);
        Some(Mapping {
            range: ModuleRange {
                start: usize::from_str_radix(start, 16).ok()?,
                end: usize::from_str_radix(end, 16).ok()?,
            },
            perms,
            path,
        })
    })
}

/// Extracts the readable mappings of `module` from `/proc/<pid>/maps` content.
pub fn parse_maps(contents: &str, module: &Path) -> Vec<ModuleRange> {
    mappings(contents)
        .filter(|mapping| mapping.perms.starts_with('r'))
        .filter(|mapping| matches!(mapping.path, Some(path) if same_module(Path::new(path), module)))
        .map(|mapping| mapping.range)
        .collect()
}

#[cfg(target_os = "linux")]
fn mapped_ranges(module: &Path) -> Vec<ModuleRange> {
    match std::fs::read_to_string("/proc/self/maps") {
        Ok(contents) => parse_maps(&contents, module),
        Err(err) => {
            error!("Unable to read /proc/self/maps: {}", err);
            Vec::new()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn mapped_ranges(_module: &Path) -> Vec<ModuleRange> {
    Vec::new()
}
