use std::path::{Path, PathBuf};

/// Modules living next to the game binaries rather than in the root binary directory.
pub const GAME_BINARY_MODULES: [&str; 4] = ["server", "host", "matchmaking", "client"];

/// Operating system family a patch entry is written for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
}

impl Platform {
    /// The platform this crate was compiled for.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    pub fn module_prefix(&self) -> &'static str {
        match self {
            Platform::Windows => "",
            Platform::Linux => "lib",
        }
    }

    pub fn module_suffix(&self) -> &'static str {
        match self {
            Platform::Windows => ".dll",
            Platform::Linux => ".so",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Windows => write!(f, "windows"),
            Platform::Linux => write!(f, "linux"),
        }
    }
}

/// Maps logical module names to the files the host loaded them from.
///
/// Example
/// ```rust
/// use sigpatch::module::{ModulePaths, Platform};
/// let paths = ModulePaths::new("/game/bin/linuxsteamrt64", "/bin/linuxsteamrt64", Platform::Linux);
/// assert_eq!(
///     paths.resolve("server"),
///     std::path::PathBuf::from("/game/bin/linuxsteamrt64/libserver.so")
/// );
/// assert_eq!(
///     paths.resolve("tier0"),
///     std::path::PathBuf::from("/bin/linuxsteamrt64/libtier0.so")
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModulePaths {
    pub game_binary_dir: PathBuf,
    pub root_binary_dir: PathBuf,
    pub prefix: String,
    pub suffix: String,
}

impl ModulePaths {
    pub fn new<G, R>(game_binary_dir: G, root_binary_dir: R, platform: Platform) -> Self
    where
        G: Into<PathBuf>,
        R: Into<PathBuf>,
    {
        ModulePaths {
            game_binary_dir: game_binary_dir.into(),
            root_binary_dir: root_binary_dir.into(),
            prefix: platform.module_prefix().to_string(),
            suffix: platform.module_suffix().to_string(),
        }
    }

    fn directory_for(&self, module: &str) -> &Path {
        if GAME_BINARY_MODULES.contains(&module) {
            &self.game_binary_dir
        } else {
            &self.root_binary_dir
        }
    }

    pub fn resolve(&self, module: &str) -> PathBuf {
        self.directory_for(module)
            .join(format!("{}{}{}", self.prefix, module, self.suffix))
    }
}

impl Default for ModulePaths {
    /// Both directories empty, so modules resolve to bare file names.
    fn default() -> Self {
        ModulePaths::new("", "", Platform::current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_modules_use_game_directory() {
        let paths = ModulePaths::new("game", "root", Platform::Windows);
        for module in GAME_BINARY_MODULES {
            assert_eq!(
                paths.resolve(module),
                Path::new("game").join(format!("{module}.dll"))
            );
        }
        assert_eq!(paths.resolve("engine2"), Path::new("root").join("engine2.dll"));
    }

    #[test]
    fn default_paths_are_bare_file_names() {
        let paths = ModulePaths::default();
        let expected = format!(
            "{}server{}",
            Platform::current().module_prefix(),
            Platform::current().module_suffix()
        );
        assert_eq!(paths.resolve("server"), PathBuf::from(expected));
    }
}
