use std::fmt;
use std::path::{Path, PathBuf};
use std::{fs, io};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::error::Category;

use crate::error::AppError;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            unix_socket: None,
            host: Some("0.0.0.0:5000".to_string()),
            path: String::new(),
            timeout: 30,
        }
    }
}

/// Which kernel GPIO surface drives the relays.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMode {
    LineDescriptor,
    Path,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::LineDescriptor => f.write_str("line-descriptor"),
            BackendMode::Path => f.write_str("path"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    #[default]
    Auto,
    LineDescriptor,
    Path,
}

/// What a reload does with held lines that the new configuration no longer declares.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadPolicy {
    #[default]
    RetainUndeclared,
    ReleaseUndeclared,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GpioConfig {
    pub backend: BackendPreference,
    pub sysfs_root: PathBuf,
    pub reload_policy: ReloadPolicy,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            reload_policy: ReloadPolicy::RetainUndeclared,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    #[serde(rename = "high")]
    ActiveHigh,
    #[serde(rename = "low")]
    ActiveLow,
}

impl Polarity {
    pub fn is_active_low(self) -> bool {
        self == Polarity::ActiveLow
    }

    /// Physical line level for a logical relay state.
    pub fn to_physical(self, on: bool) -> bool {
        on != self.is_active_low()
    }

    /// Logical relay state for a physical line level.
    pub fn to_logical(self, level: bool) -> bool {
        level != self.is_active_low()
    }

    /// Contents of the sysfs `active_low` attribute.
    pub fn active_low_attr(self) -> &'static str {
        if self.is_active_low() { "1" } else { "0" }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Addressing {
    Line { chip: String, line: u32 },
    Path { pin: u32, path: PathBuf },
}

impl Addressing {
    pub fn mode(&self) -> BackendMode {
        match self {
            Addressing::Line { .. } => BackendMode::LineDescriptor,
            Addressing::Path { .. } => BackendMode::Path,
        }
    }
}

/// Identifies one physical line on one GPIO controller.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct LineKey {
    pub chip: String,
    pub offset: u32,
}

impl LineKey {
    /// Bare chip names such as `gpiochip0` resolve to `/dev/gpiochip0`, and
    /// chip numbers such as `0` to the same path. Chip labels are not looked up.
    pub fn new(chip: &str, offset: u32) -> Self {
        let chip = if chip.contains('/') {
            chip.to_string()
        } else if !chip.is_empty() && chip.bytes().all(|b| b.is_ascii_digit()) {
            format!("/dev/gpiochip{chip}")
        } else {
            format!("/dev/{chip}")
        };
        Self { chip, offset }
    }
}

impl fmt::Display for LineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chip, self.offset)
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub active: Polarity,
    #[serde(flatten)]
    pub addressing: Addressing,
}

impl RelayEntry {
    pub fn line_key(&self) -> Option<LineKey> {
        match &self.addressing {
            Addressing::Line { chip, line } => Some(LineKey::new(chip, *line)),
            Addressing::Path { .. } => None,
        }
    }
}

/// Validated relay table. Replaced wholesale on reload, never edited in place.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct RelayConfiguration {
    relays: FxHashMap<String, RelayEntry>,
}

impl RelayConfiguration {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        AppConfig::load_from_file(path).map(|cfg| cfg.relays)
    }

    pub fn get(&self, id: &str) -> Option<&RelayEntry> {
        self.relays.get(id)
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelayEntry> {
        self.relays.values()
    }

    /// Entries sorted by id, for stable listings.
    pub fn sorted(&self) -> Vec<&RelayEntry> {
        let mut entries: Vec<&RelayEntry> = self.relays.values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn line_keys(&self) -> FxHashSet<LineKey> {
        self.relays.values().filter_map(RelayEntry::line_key).collect()
    }

    /// Rejects entries whose addressing family does not match `mode`.
    pub fn ensure_addressable(&self, mode: BackendMode) -> Result<(), AppError> {
        let mut wrong: Vec<&str> = self
            .relays
            .values()
            .filter(|entry| entry.addressing.mode() != mode)
            .map(|entry| entry.id.as_str())
            .collect();
        if wrong.is_empty() {
            return Ok(());
        }
        wrong.sort_unstable();
        Err(AppError::ConfigInvalid(format!(
            "relays [{}] are not addressable by the {mode} backend",
            wrong.join(", ")
        )))
    }

    fn from_table(table: RelayTable) -> Result<Self, AppError> {
        let mut problems = Vec::new();
        let mut relays = FxHashMap::default();
        let mut lines: FxHashMap<LineKey, String> = FxHashMap::default();
        let mut pins: FxHashMap<u32, String> = FxHashMap::default();
        let mut paths: FxHashMap<PathBuf, String> = FxHashMap::default();

        for (id, raw) in table.0 {
            if id.trim().is_empty() {
                problems.push("relay id must not be empty".to_string());
                continue;
            }
            if relays.contains_key(&id) {
                problems.push(format!("relay {id} is declared more than once"));
                continue;
            }
            let entry = match raw.into_entry(&id) {
                Ok(entry) => entry,
                Err(problem) => {
                    problems.push(problem);
                    continue;
                }
            };

            match &entry.addressing {
                Addressing::Line { chip, line } => {
                    let key = LineKey::new(chip, *line);
                    if let Some(other) = lines.insert(key.clone(), id.clone()) {
                        problems.push(format!("relays {other} and {id} both use line {key}"));
                    }
                }
                Addressing::Path { pin, path } => {
                    if let Some(other) = pins.insert(*pin, id.clone()) {
                        problems.push(format!("relays {other} and {id} both use pin {pin}"));
                    }
                    if let Some(other) = paths.insert(path.clone(), id.clone()) {
                        problems.push(format!(
                            "relays {other} and {id} both use path {}",
                            path.display()
                        ));
                    }
                }
            }
            relays.insert(id, entry);
        }

        if problems.is_empty() {
            Ok(Self { relays })
        } else {
            Err(AppError::ConfigInvalid(problems.join("; ")))
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRelayEntry {
    pin: Option<u32>,
    path: Option<PathBuf>,
    chip: Option<String>,
    line: Option<u32>,
    #[serde(default)]
    active: Polarity,
    name: Option<String>,
}

impl RawRelayEntry {
    fn into_entry(self, id: &str) -> Result<RelayEntry, String> {
        let addressing = match (self.chip, self.line, self.pin, self.path) {
            (Some(chip), Some(line), None, None) => {
                if chip.trim().is_empty() {
                    return Err(format!("relay {id} has an empty `chip`"));
                }
                Addressing::Line { chip, line }
            }
            (None, None, Some(pin), Some(path)) => {
                if path.as_os_str().is_empty() {
                    return Err(format!("relay {id} has an empty `path`"));
                }
                Addressing::Path { pin, path }
            }
            (Some(_), Some(_), Some(_), Some(_)) => {
                return Err(format!(
                    "relay {id} mixes chip/line and pin/path addressing"
                ));
            }
            (chip, line, pin, path) => {
                let missing: Vec<&str> = match (chip.is_some() || line.is_some(), pin.is_some() || path.is_some()) {
                    (false, false) => {
                        return Err(format!(
                            "relay {id} must declare either pin+path or chip+line"
                        ));
                    }
                    (true, true) => {
                        return Err(format!(
                            "relay {id} mixes chip/line and pin/path addressing"
                        ));
                    }
                    (true, false) => [("chip", chip.is_none()), ("line", line.is_none())]
                        .into_iter()
                        .filter_map(|(field, absent)| absent.then_some(field))
                        .collect(),
                    (false, true) => [("pin", pin.is_none()), ("path", path.is_none())]
                        .into_iter()
                        .filter_map(|(field, absent)| absent.then_some(field))
                        .collect(),
                };
                return Err(format!(
                    "relay {id} has incomplete addressing, missing `{}`",
                    missing.join("`, `")
                ));
            }
        };

        Ok(RelayEntry {
            id: id.to_string(),
            name: self.name,
            active: self.active,
            addressing,
        })
    }
}

/// Relay map as written in the file, duplicates included.
struct RelayTable(Vec<(String, RawRelayEntry)>);

impl<'de> Deserialize<'de> for RelayTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = RelayTable;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of relay ids to relay entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((id, entry)) = map.next_entry::<String, RawRelayEntry>()? {
                    entries.push((id, entry));
                }
                Ok(RelayTable(entries))
            }
        }

        deserializer.deserialize_map(TableVisitor)
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    http: HttpConfig,
    #[serde(default)]
    gpio: GpioConfig,
    relays: RelayTable,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub gpio: GpioConfig,
    pub relays: RelayConfiguration,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AppError::ConfigNotFound(path.display().to_string()),
            _ => AppError::ConfigNotFound(format!("{}: {e}", path.display())),
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let file: ConfigFile = serde_json::from_str(contents).map_err(|e| match e.classify() {
            Category::Data => AppError::ConfigInvalid(e.to_string()),
            Category::Syntax | Category::Eof | Category::Io => {
                AppError::ConfigMalformed(e.to_string())
            }
        })?;

        Ok(Self {
            http: file.http,
            gpio: file.gpio,
            relays: RelayConfiguration::from_table(file.relays)?,
        })
    }
}
