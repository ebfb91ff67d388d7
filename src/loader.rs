use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use bevy::log::debug;

use crate::errors::LoadError;

/// Source of script files. `modes` lists the archive layers to search, in order, one
/// character per layer.
pub trait ScriptLoader {
    fn load_file(&self, path: &str, modes: &str) -> Result<String, LoadError>;
}

/// Reads scripts from disk. Each mode character maps to a directory; characters without a
/// directory are skipped, and the root is searched when no mode matched at all.
pub struct DirectoryLoader {
    root: PathBuf,
    layers: Vec<(char, PathBuf)>,
}

impl DirectoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            layers: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: char, dir: impl Into<PathBuf>) -> Self {
        self.layers.retain(|(existing, _)| *existing != mode);
        self.layers.push((mode, dir.into()));
        self
    }

    fn search_dirs(&self, modes: &str) -> Vec<&Path> {
        let dirs: Vec<&Path> = modes
            .chars()
            .filter_map(|mode| {
                self.layers
                    .iter()
                    .find(|(layer, _)| *layer == mode)
                    .map(|(_, dir)| dir.as_path())
            })
            .collect();
        if dirs.is_empty() {
            vec![self.root.as_path()]
        } else {
            dirs
        }
    }
}

fn missing(path: &str, modes: &str, reason: impl Into<String>) -> LoadError {
    LoadError::MissingFile {
        path: path.to_string(),
        modes: modes.to_string(),
        reason: reason.into(),
    }
}

/// Script paths are relative and may not climb out of their layer.
fn relative_script_path(path: &str) -> Option<&Path> {
    let candidate = Path::new(path);
    let confined = !path.trim().is_empty()
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    confined.then_some(candidate)
}

impl ScriptLoader for DirectoryLoader {
    fn load_file(&self, path: &str, modes: &str) -> Result<String, LoadError> {
        let relative = relative_script_path(path)
            .ok_or_else(|| missing(path, modes, "path must stay inside the script directories"))?;
        for dir in self.search_dirs(modes) {
            let full = dir.join(relative);
            match std::fs::read_to_string(&full) {
                Ok(source) => {
                    debug!("[Lockstep scripts] Loaded {}", full.display());
                    return Ok(source);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(missing(path, modes, err.to_string())),
            }
        }
        Err(missing(path, modes, "file not found"))
    }
}

/// In-memory scripts keyed by path. Modes are ignored.
#[derive(Default, Clone)]
pub struct MemoryLoader {
    files: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.files.insert(path.into(), source.into());
        self
    }
}

impl ScriptLoader for MemoryLoader {
    fn load_file(&self, path: &str, modes: &str) -> Result<String, LoadError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| missing(path, modes, "file not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lockstep_loader_{name}_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn modes_are_searched_in_order() {
        let base = scratch_dir("modes");
        let game = base.join("game");
        let map = base.join("map");
        std::fs::create_dir_all(&game).expect("game dir");
        std::fs::create_dir_all(&map).expect("map dir");
        std::fs::write(game.join("rules.lua"), "-- game").expect("write");
        std::fs::write(map.join("rules.lua"), "-- map").expect("write");
        std::fs::write(game.join("only_game.lua"), "-- only").expect("write");

        let loader = DirectoryLoader::new(&base)
            .with_mode('M', &game)
            .with_mode('m', &map);
        assert_eq!(loader.load_file("rules.lua", "mM").expect("load"), "-- map");
        assert_eq!(loader.load_file("rules.lua", "Mm").expect("load"), "-- game");
        assert_eq!(loader.load_file("only_game.lua", "mM").expect("load"), "-- only");
        assert!(matches!(
            loader.load_file("absent.lua", "mM"),
            Err(LoadError::MissingFile { .. })
        ));
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn paths_cannot_escape_the_root() {
        let base = scratch_dir("escape");
        let loader = DirectoryLoader::new(&base);
        assert!(loader.load_file("../secret.lua", "").is_err());
        assert!(loader.load_file("/etc/passwd", "").is_err());
        assert!(loader.load_file("", "").is_err());
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn memory_loader_serves_registered_sources() {
        let loader = MemoryLoader::new().with_file("draw.lua", "return 1");
        assert_eq!(loader.load_file("draw.lua", "r").expect("load"), "return 1");
        assert!(loader.load_file("other.lua", "r").is_err());
    }
}
