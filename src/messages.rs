//! Immutable registry of user-facing message templates.
//!
//! Templates are loaded once at startup (built-in defaults, optionally
//! overridden from a directory of `*.txt` files keyed by file stem) and
//! passed by `Arc` to whoever renders text. The registry is never mutated
//! after construction.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::errors::{EngineError, Result};

/// Template names the engine requires to exist.
const REQUIRED: &[&str] = &[
    "alert",
    "watch_confirmed",
    "watch_rejected",
    "watch_timeout",
];

const DEFAULT_ALERT: &str = "\u{1F514} <b>{name}</b> ({chain})\n\
Sender: {src}\n\
Receiver: {dst}\n\
Amount: {value} {token}\n\
Tx: {tx_hash}";

const DEFAULT_WATCH_CONFIRMED: &str =
    "\u{2705} Now watching <b>{wallet}</b> on {chain}.";

const DEFAULT_WATCH_REJECTED: &str =
    "\u{274C} Could not start watching <b>{wallet}</b> on {chain}. The address was removed.";

const DEFAULT_WATCH_TIMEOUT: &str =
    "\u{23F1} No reply from the {chain} checker for <b>{wallet}</b>. The request expired.";

/// Immutable map of template name to template text.
#[derive(Debug)]
pub struct MessageTemplates {
    templates: HashMap<String, String>,
}

impl MessageTemplates {
    /// Build the registry from built-in defaults, optionally overlaying
    /// `*.txt` files from `dir` (file stem becomes the template name).
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut templates: HashMap<String, String> = HashMap::new();
        templates.insert("alert".to_string(), DEFAULT_ALERT.to_string());
        templates.insert("watch_confirmed".to_string(), DEFAULT_WATCH_CONFIRMED.to_string());
        templates.insert("watch_rejected".to_string(), DEFAULT_WATCH_REJECTED.to_string());
        templates.insert("watch_timeout".to_string(), DEFAULT_WATCH_TIMEOUT.to_string());

        if let Some(dir) = dir {
            let entries = fs::read_dir(dir).map_err(|e| {
                EngineError::Config(format!("cannot read templates dir {}: {}", dir.display(), e))
            })?;
            for entry in entries {
                let entry = entry.map_err(|e| EngineError::Config(e.to_string()))?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let text = fs::read_to_string(&path).map_err(|e| {
                    EngineError::Config(format!("cannot read template {}: {}", path.display(), e))
                })?;
                templates.insert(stem.to_string(), text.trim_end().to_string());
            }
        }

        for name in REQUIRED {
            match templates.get(*name) {
                Some(text) if !text.trim().is_empty() => {}
                _ => {
                    return Err(EngineError::Config(format!(
                        "required message template '{}' is missing or empty",
                        name
                    )))
                }
            }
        }

        Ok(Self { templates })
    }

    /// Render a template, substituting `{key}` placeholders. Unknown
    /// template names are a configuration error, never a panic.
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> Result<String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| EngineError::Config(format!("unknown message template '{}'", name)))?;
        let mut text = template.clone();
        for (key, value) in vars {
            text = text.replace(&format!("{{{}}}", key), value);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_render() {
        let templates = MessageTemplates::load(None).unwrap();
        let text = templates
            .render(
                "watch_confirmed",
                &[("wallet", "0xDEF"), ("chain", "Everscale")],
            )
            .unwrap();
        assert!(text.contains("0xDEF"));
        assert!(text.contains("Everscale"));
    }

    #[test]
    fn test_unknown_template_is_error() {
        let templates = MessageTemplates::load(None).unwrap();
        assert!(templates.render("nope", &[]).is_err());
    }

    #[test]
    fn test_alert_placeholders() {
        let templates = MessageTemplates::load(None).unwrap();
        let text = templates
            .render(
                "alert",
                &[
                    ("name", "savings"),
                    ("chain", "ETH"),
                    ("src", "0xAAA"),
                    ("dst", "savings"),
                    ("value", "1.5"),
                    ("token", "ETH"),
                    ("tx_hash", "0xh"),
                ],
            )
            .unwrap();
        assert!(text.contains("Sender: 0xAAA"));
        assert!(text.contains("Receiver: savings"));
        assert!(!text.contains('{'));
    }
}
