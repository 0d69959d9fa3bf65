//! Symbol selection settings
//!
//! Remembers the last selected symbol between runs. The JSON file backend
//! rewrites only its own keys and leaves anything else in the file alone.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use terminal_core::{normalize_symbol, TerminalError, TerminalResult};
use tracing::{debug, warn};

use crate::symbol_catalog::SymbolCatalog;

/// Symbol used when nothing else is configured
pub const DEFAULT_SYMBOL: &str = "BTCUSDT";

const KEY_LAST_SYMBOL: &str = "last_symbol";
const KEY_DEFAULT_SYMBOL: &str = "default_symbol";

/// Where the selected symbol is remembered
pub trait SymbolSettings: Send + Sync {
    fn default_symbol(&self) -> String;

    fn last_symbol(&self) -> Option<String>;

    fn save_selected_symbol(&self, symbol: &str) -> TerminalResult<()>;
}

/// Symbol to select on startup
///
/// The last selected symbol wins if the catalog still lists it, then the
/// default symbol. An empty catalog (not loaded) accepts either.
pub fn resolve_initial_symbol(settings: &dyn SymbolSettings, catalog: &SymbolCatalog) -> String {
    let usable = |symbol: &str| catalog.is_empty() || catalog.contains(symbol);

    if let Some(last) = settings.last_symbol() {
        if usable(&last) {
            return last;
        }
        warn!("[Settings] Last symbol {} is no longer listed", last);
    }

    settings.default_symbol()
}

// ============================================================================
// JSON file
// ============================================================================

/// Settings persisted in a JSON object file
pub struct JsonFileSettings {
    path: PathBuf,
    default_symbol: String,
    write_lock: Mutex<()>,
}

impl JsonFileSettings {
    pub fn new(path: impl Into<PathBuf>, default_symbol: impl AsRef<str>) -> Self {
        Self {
            path: path.into(),
            default_symbol: normalize_symbol(default_symbol.as_ref()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file contents; a missing file is empty
    fn load_map(&self) -> TerminalResult<Map<String, Value>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(TerminalError::config(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => Err(TerminalError::config(format!(
                "{} is not a JSON object",
                self.path.display()
            ))),
        }
    }

    fn string_key(&self, key: &str) -> Option<String> {
        let map = match self.load_map() {
            Ok(map) => map,
            Err(e) => {
                warn!("[Settings] {}, using defaults", e);
                return None;
            }
        };
        map.get(key)
            .and_then(Value::as_str)
            .map(normalize_symbol)
            .filter(|s| !s.is_empty())
    }
}

impl SymbolSettings for JsonFileSettings {
    fn default_symbol(&self) -> String {
        self.string_key(KEY_DEFAULT_SYMBOL)
            .unwrap_or_else(|| self.default_symbol.clone())
    }

    fn last_symbol(&self) -> Option<String> {
        self.string_key(KEY_LAST_SYMBOL)
    }

    fn save_selected_symbol(&self, symbol: &str) -> TerminalResult<()> {
        let _guard = self.write_lock.lock();

        // Never overwrite a file we could not parse
        let mut map = self.load_map()?;
        map.insert(
            KEY_LAST_SYMBOL.to_string(),
            Value::String(normalize_symbol(symbol)),
        );

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                TerminalError::config(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let contents = serde_json::to_string_pretty(&Value::Object(map))
            .map_err(|e| TerminalError::internal(format!("Failed to encode settings: {}", e)))?;

        // Staged beside the target, then renamed over it in one step
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, contents).map_err(|e| {
            TerminalError::config(format!("Failed to write {}: {}", staging.display(), e))
        })?;
        std::fs::rename(&staging, &self.path).map_err(|e| {
            std::fs::remove_file(&staging).ok();
            TerminalError::config(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;

        debug!("[Settings] Saved last symbol {}", symbol);
        Ok(())
    }
}

// ============================================================================
// In memory
// ============================================================================

/// Settings that live for the process only
pub struct InMemorySettings {
    default_symbol: String,
    last_symbol: RwLock<Option<String>>,
}

impl InMemorySettings {
    pub fn new(default_symbol: impl AsRef<str>) -> Self {
        Self {
            default_symbol: normalize_symbol(default_symbol.as_ref()),
            last_symbol: RwLock::new(None),
        }
    }

    pub fn with_last_symbol(self, symbol: impl AsRef<str>) -> Self {
        *self.last_symbol.write() = Some(normalize_symbol(symbol.as_ref()));
        self
    }
}

impl Default for InMemorySettings {
    fn default() -> Self {
        Self::new(DEFAULT_SYMBOL)
    }
}

impl SymbolSettings for InMemorySettings {
    fn default_symbol(&self) -> String {
        self.default_symbol.clone()
    }

    fn last_symbol(&self) -> Option<String> {
        self.last_symbol.read().clone()
    }

    fn save_selected_symbol(&self, symbol: &str) -> TerminalResult<()> {
        *self.last_symbol.write() = Some(normalize_symbol(symbol));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use terminal_core::mock::MockExchange;
    use terminal_core::SymbolInfo;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("terminal-settings-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn test_json_settings_preserve_unrelated_keys() {
        let path = temp_path("preserve.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"theme":"dark","window":{"width":1280}}"#).unwrap();

        let settings = JsonFileSettings::new(&path, "BTCUSDT");
        assert_eq!(settings.last_symbol(), None);

        settings.save_selected_symbol("ethusdt").unwrap();
        assert_eq!(settings.last_symbol().as_deref(), Some("ETHUSDT"));

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["theme"], "dark");
        assert_eq!(saved["window"]["width"], 1280);
        assert_eq!(saved["last_symbol"], "ETHUSDT");
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_json_settings_missing_or_corrupt_file() {
        let path = temp_path("corrupt.json");
        let settings = JsonFileSettings::new(&path, "solusdt");
        assert_eq!(settings.default_symbol(), "SOLUSDT");

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(settings.last_symbol(), None);

        // The unreadable file is left for the user to repair
        let err = settings.save_selected_symbol("BTCUSDT").unwrap_err();
        assert!(matches!(err, TerminalError::Config(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json");
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_resolve_initial_symbol() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_instruments(vec![SymbolInfo::new("BTCUSDT"), SymbolInfo::new("ETHUSDT")]);
        let catalog = SymbolCatalog::new(exchange);

        // Catalog not loaded yet: last symbol taken as is
        let settings = InMemorySettings::default().with_last_symbol("XRPUSDT");
        assert_eq!(resolve_initial_symbol(&settings, &catalog), "XRPUSDT");

        catalog.load().await.unwrap();
        assert_eq!(resolve_initial_symbol(&settings, &catalog), "BTCUSDT");

        settings.save_selected_symbol("ethusdt").unwrap();
        assert_eq!(resolve_initial_symbol(&settings, &catalog), "ETHUSDT");
    }
}
