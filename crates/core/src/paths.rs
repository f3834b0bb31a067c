use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".bastion"))
            .unwrap_or_else(|| PathBuf::from(".bastion"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn workspace(&self) -> PathBuf {
        self.base.join("workspace")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join("sessions")
    }

    pub fn session_file(&self, session_key: &str) -> PathBuf {
        let safe_key = session_key.replace([':', '/', '\\'], "_");
        self.sessions_dir().join(format!("{}.jsonl", safe_key))
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.base.join("audit")
    }

    pub fn memory_db(&self) -> PathBuf {
        self.base.join("memory.db")
    }

    /// User plugin tools, one subdirectory with a `tool.toml` each.
    pub fn plugins_dir(&self) -> PathBuf {
        self.base.join("tools")
    }

    /// Resolve a config path that may start with `~/` or be relative to the base dir.
    pub fn resolve(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            return dirs::home_dir()
                .map(|h| h.join(rest))
                .unwrap_or_else(|| PathBuf::from(path));
        }
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.base.join(p)
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.workspace())?;
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::create_dir_all(self.audit_dir())?;
        std::fs::create_dir_all(self.plugins_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_file_is_flat() {
        let paths = Paths::with_base(PathBuf::from("/tmp/b"));
        assert_eq!(
            paths.session_file("cli:default/x"),
            PathBuf::from("/tmp/b/sessions/cli_default_x.jsonl")
        );
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let paths = Paths::with_base(PathBuf::from("/tmp/b"));
        assert_eq!(paths.resolve("workspace"), PathBuf::from("/tmp/b/workspace"));
        assert_eq!(paths.resolve("/srv/data"), PathBuf::from("/srv/data"));
    }
}
