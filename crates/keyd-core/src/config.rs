// Keyd Configuration
// Parses .conf files (TOML) into compiled remapping configurations

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::key;

/// Rank returned by [`Config::check_match`] when a device id is listed
/// explicitly. An explicit match extends the binding to pointer devices.
pub const RANK_ID: u8 = 2;

/// Rank returned for a wildcard match; covers keyboards only.
pub const RANK_WILDCARD: u8 = 1;

/// Configuration parser errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}: {message}")]
    Toml { path: PathBuf, message: String },

    #[error("invalid device id '{0}' (expected vendor:product in hex)")]
    BadDeviceId(String),

    #[error("unknown key '{0}'")]
    UnknownKey(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("reference to undefined layer '{0}'")]
    UnknownLayer(String),

    #[error("{0}: missing [layers.main]")]
    MissingMain(PathBuf),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MatchToml {
    /// Explicit vendor:product pairs, lowercase hex.
    #[serde(default)]
    ids: Vec<String>,

    /// Match any keyboard not claimed by an explicit id.
    #[serde(default)]
    wildcard: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeoutsToml {
    /// Milliseconds before a held overload key commits to its layer.
    #[serde(default = "default_overload_ms")]
    overload: u64,

    /// Milliseconds before an armed oneshot decays; 0 = never.
    #[serde(default)]
    oneshot: u64,
}

fn default_overload_ms() -> u64 {
    200
}

impl Default for TimeoutsToml {
    fn default() -> Self {
        Self {
            overload: default_overload_ms(),
            oneshot: 0,
        }
    }
}

/// Raw TOML shape of a .conf file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    #[serde(rename = "match", default)]
    matcher: MatchToml,

    #[serde(default)]
    timeouts: TimeoutsToml,

    /// Layer name -> key name -> action string. `main` must be present.
    layers: HashMap<String, HashMap<String, String>>,
}

/// A key's binding inside a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Emit a different key.
    Key(u8),
    /// Hold a layer while the key is down.
    Layer(String),
    /// Arm a layer for the next key press.
    Oneshot(String),
    /// Hold = layer, tap = key.
    Overload { layer: String, tap: u8 },
}

/// A compiled configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source path, used in match diagnostics.
    pub path: PathBuf,
    ids: Vec<u32>,
    wildcard: bool,
    pub overload_ms: u64,
    pub oneshot_ms: u64,
    /// Layer name -> compiled bindings. `main` is guaranteed present.
    pub layers: Vec<(String, HashMap<u8, Action>)>,
}

impl Config {
    /// Parse and compile a single configuration file.
    pub fn parse(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let raw: ConfigToml = toml::from_str(&content).map_err(|e| ConfigError::Toml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut ids = Vec::with_capacity(raw.matcher.ids.len());
        for id in &raw.matcher.ids {
            ids.push(parse_device_id(id)?);
        }

        if !raw.layers.contains_key("main") {
            return Err(ConfigError::MissingMain(path.to_path_buf()));
        }

        // Compile layers with `main` first and the rest in a stable order.
        let mut names: Vec<&String> = raw.layers.keys().collect();
        names.sort();
        let mut layers = Vec::with_capacity(names.len());
        layers.push(("main".to_string(), compile_layer(&raw.layers["main"])?));
        for name in names {
            if name != "main" {
                layers.push((name.clone(), compile_layer(&raw.layers[name])?));
            }
        }

        let config = Self {
            path: path.to_path_buf(),
            ids,
            wildcard: raw.matcher.wildcard,
            overload_ms: raw.timeouts.overload,
            oneshot_ms: raw.timeouts.oneshot,
            layers,
        };
        config.validate_layer_refs()?;
        Ok(config)
    }

    /// Score this configuration against a device id
    /// (`vendor << 16 | product`).
    ///
    /// 0 = no match, 1 = keyboard-only (wildcard), 2 = explicit id, which
    /// also extends the binding to pointer devices.
    pub fn check_match(&self, id: u32) -> u8 {
        if self.ids.contains(&id) {
            RANK_ID
        } else if self.wildcard {
            RANK_WILDCARD
        } else {
            0
        }
    }

    pub fn has_layer(&self, name: &str) -> bool {
        self.layers.iter().any(|(n, _)| n == name)
    }

    fn validate_layer_refs(&self) -> Result<(), ConfigError> {
        for (_, bindings) in &self.layers {
            for action in bindings.values() {
                let referenced = match action {
                    Action::Layer(l) | Action::Oneshot(l) => Some(l),
                    Action::Overload { layer, .. } => Some(layer),
                    Action::Key(_) => None,
                };
                if let Some(l) = referenced {
                    if !self.has_layer(l) {
                        return Err(ConfigError::UnknownLayer(l.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

fn compile_layer(raw: &HashMap<String, String>) -> Result<HashMap<u8, Action>, ConfigError> {
    let mut out = HashMap::with_capacity(raw.len());
    for (name, action) in raw {
        let code =
            key::lookup_keycode(name).ok_or_else(|| ConfigError::UnknownKey(name.clone()))?;
        out.insert(code, parse_action(action)?);
    }
    Ok(out)
}

/// Parse a `vendor:product` pair into the packed 32-bit id.
pub fn parse_device_id(s: &str) -> Result<u32, ConfigError> {
    let (vendor, product) = s
        .split_once(':')
        .ok_or_else(|| ConfigError::BadDeviceId(s.to_string()))?;
    let vendor =
        u16::from_str_radix(vendor, 16).map_err(|_| ConfigError::BadDeviceId(s.to_string()))?;
    let product =
        u16::from_str_radix(product, 16).map_err(|_| ConfigError::BadDeviceId(s.to_string()))?;
    Ok((vendor as u32) << 16 | product as u32)
}

/// Parse the right-hand side of a binding.
///
/// Accepted forms: a bare key name, `layer(name)`, `oneshot(name)` and
/// `overload(name, key)`.
pub fn parse_action(s: &str) -> Result<Action, ConfigError> {
    let s = s.trim();

    if let Some((func, rest)) = s.split_once('(') {
        let args = rest
            .strip_suffix(')')
            .ok_or_else(|| ConfigError::UnknownAction(s.to_string()))?;

        return match func.trim() {
            "layer" => Ok(Action::Layer(args.trim().to_string())),
            "oneshot" => Ok(Action::Oneshot(args.trim().to_string())),
            "overload" => {
                let (layer, tap) = args
                    .split_once(',')
                    .ok_or_else(|| ConfigError::UnknownAction(s.to_string()))?;
                let tap = key::lookup_keycode(tap.trim())
                    .ok_or_else(|| ConfigError::UnknownKey(tap.trim().to_string()))?;
                Ok(Action::Overload {
                    layer: layer.trim().to_string(),
                    tap,
                })
            }
            _ => Err(ConfigError::UnknownAction(s.to_string())),
        };
    }

    key::lookup_keycode(s)
        .map(Action::Key)
        .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "keyd-config-test-{}.conf",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        ));
        let mut f = fs::File::create(&path).expect("create conf");
        f.write_all(content.as_bytes()).expect("write conf");
        path
    }

    #[test]
    fn test_parse_basic_config() {
        let path = write_conf(
            r#"
            [match]
            ids = ["046d:c52b"]
            wildcard = true

            [layers.main]
            a = "b"
            capslock = "overload(nav, esc)"

            [layers.nav]
            h = "left"
            "#,
        );
        let config = Config::parse(&path).expect("parse");
        assert_eq!(config.layers[0].0, "main");
        assert_eq!(config.layers[0].1.get(&30), Some(&Action::Key(48)));
        assert_eq!(
            config.layers[0].1.get(&58),
            Some(&Action::Overload {
                layer: "nav".to_string(),
                tap: 1
            })
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_check_match_ranks() {
        let path = write_conf(
            r#"
            [match]
            ids = ["046d:c52b"]
            wildcard = true

            [layers.main]
            "#,
        );
        let config = Config::parse(&path).expect("parse");
        assert_eq!(config.check_match(0x046d_c52b), RANK_ID);
        assert_eq!(config.check_match(0x1234_5678), RANK_WILDCARD);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_check_match_no_wildcard() {
        let path = write_conf(
            r#"
            [match]
            ids = ["046d:c52b"]

            [layers.main]
            "#,
        );
        let config = Config::parse(&path).expect("parse");
        assert_eq!(config.check_match(0x1234_5678), 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_main_rejected() {
        let path = write_conf("[layers.nav]\nh = \"left\"\n");
        assert!(matches!(
            Config::parse(&path),
            Err(ConfigError::MissingMain(_))
        ));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_undefined_layer_rejected() {
        let path = write_conf("[layers.main]\na = \"layer(ghost)\"\n");
        assert!(matches!(
            Config::parse(&path),
            Err(ConfigError::UnknownLayer(l)) if l == "ghost"
        ));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_parse_device_id() {
        assert_eq!(parse_device_id("046d:c52b").expect("id"), 0x046d_c52b);
        assert!(parse_device_id("nonsense").is_err());
        assert!(parse_device_id("046d").is_err());
    }

    #[test]
    fn test_parse_action_forms() {
        assert_eq!(parse_action("b").expect("key"), Action::Key(48));
        assert_eq!(
            parse_action("layer(nav)").expect("layer"),
            Action::Layer("nav".to_string())
        );
        assert_eq!(
            parse_action("oneshot(sym)").expect("oneshot"),
            Action::Oneshot("sym".to_string())
        );
        assert_eq!(
            parse_action("overload(nav, esc)").expect("overload"),
            Action::Overload {
                layer: "nav".to_string(),
                tap: 1
            }
        );
    }

    #[test]
    fn test_parse_action_errors() {
        assert!(matches!(
            parse_action("frobnicate(q)"),
            Err(ConfigError::UnknownAction(_))
        ));
        assert!(matches!(
            parse_action("xyzzy"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            parse_action("overload(nav)"),
            Err(ConfigError::UnknownAction(_))
        ));
    }
}
