//! Registry of user-settable plan config fields.
//!
//! Every key maps to a descriptor with a typed kind and explicit getter/setter
//! functions, so `set-config <key> <value>` dispatches without reflection.

use anyhow::{Result, anyhow, bail};

use crate::plan_config::{AutoMode, PlanConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    Int { min: i64, max: i64 },
    String {
        choices: &'static [&'static str],
        custom_allowed: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl SettingValue {
    pub fn display(&self) -> String {
        match self {
            SettingValue::Bool(v) => v.to_string(),
            SettingValue::Int(v) => v.to_string(),
            SettingValue::String(v) => v.clone(),
        }
    }
}

pub struct SettingDescriptor {
    pub key: &'static str,
    pub label: &'static str,
    pub kind: SettingKind,
    pub visible: fn(&PlanConfig) -> bool,
    pub get: fn(&PlanConfig) -> SettingValue,
    pub set: fn(&mut PlanConfig, SettingValue) -> Result<()>,
}

const AUTO_MODE_CHOICES: &[&str] = &["full", "semi", "basic-plus", "basic", "none"];
const EDITOR_CHOICES: &[&str] = &["vim", "nvim", "nano", "emacs", "code", "cursor", "zed"];

fn always(_: &PlanConfig) -> bool {
    true
}

fn when_can_exec(cfg: &PlanConfig) -> bool {
    cfg.can_exec
}

fn when_auto_debug(cfg: &PlanConfig) -> bool {
    cfg.auto_debug
}

fn expect_bool(value: SettingValue) -> Result<bool> {
    match value {
        SettingValue::Bool(v) => Ok(v),
        other => Err(anyhow!("expected a boolean, got {}", other.display())),
    }
}

macro_rules! bool_setting {
    ($key:literal, $label:literal, $field:ident, $setter:ident, $visible:expr) => {
        SettingDescriptor {
            key: $key,
            label: $label,
            kind: SettingKind::Bool,
            visible: $visible,
            get: |cfg| SettingValue::Bool(cfg.$field),
            set: |cfg, value| {
                cfg.$setter(expect_bool(value)?);
                Ok(())
            },
        }
    };
}

static REGISTRY: &[SettingDescriptor] = &[
    SettingDescriptor {
        key: "auto-mode",
        label: "Auto mode",
        kind: SettingKind::String {
            choices: AUTO_MODE_CHOICES,
            custom_allowed: false,
        },
        visible: always,
        get: |cfg| SettingValue::String(cfg.auto_mode.as_str().to_string()),
        set: |cfg, value| {
            let SettingValue::String(raw) = value else {
                bail!("expected an auto mode name");
            };
            let mode = AutoMode::parse(&raw)
                .filter(|m| *m != AutoMode::Custom)
                .ok_or_else(|| anyhow!("unknown auto mode '{raw}'"))?;
            cfg.set_auto_mode(mode);
            Ok(())
        },
    },
    bool_setting!("auto-continue", "Auto-continue plans", auto_continue, set_auto_continue, always),
    bool_setting!("auto-build", "Auto-build pending changes", auto_build, set_auto_build, always),
    bool_setting!(
        "auto-update-context",
        "Auto-update outdated context",
        auto_update_context,
        set_auto_update_context,
        always
    ),
    bool_setting!(
        "auto-load-context",
        "Auto-load context",
        auto_load_context,
        set_auto_load_context,
        always
    ),
    bool_setting!("smart-context", "Smart context", smart_context, set_smart_context, always),
    bool_setting!("auto-apply", "Auto-apply changes", auto_apply, set_auto_apply, always),
    bool_setting!("auto-commit", "Auto-commit applied changes", auto_commit, set_auto_commit, always),
    bool_setting!("skip-commit", "Never commit applied changes", skip_commit, set_skip_commit, always),
    bool_setting!("can-exec", "Allow command execution", can_exec, set_can_exec, always),
    bool_setting!("auto-exec", "Auto-execute commands", auto_exec, set_auto_exec, when_can_exec),
    bool_setting!("auto-debug", "Auto-debug failed commands", auto_debug, set_auto_debug, when_can_exec),
    SettingDescriptor {
        key: "auto-debug-tries",
        label: "Auto-debug attempts",
        kind: SettingKind::Int { min: 1, max: 100 },
        visible: when_auto_debug,
        get: |cfg| SettingValue::Int(i64::from(cfg.auto_debug_tries)),
        set: |cfg, value| {
            let SettingValue::Int(n) = value else {
                bail!("expected an integer");
            };
            cfg.set_auto_debug_tries(u32::try_from(n)?)
        },
    },
    SettingDescriptor {
        key: "editor",
        label: "Editor",
        kind: SettingKind::String {
            choices: EDITOR_CHOICES,
            custom_allowed: true,
        },
        visible: always,
        get: |cfg| SettingValue::String(cfg.editor.clone()),
        set: |cfg, value| {
            let SettingValue::String(raw) = value else {
                bail!("expected an editor command");
            };
            cfg.set_editor(&raw);
            Ok(())
        },
    },
];

pub fn registry() -> &'static [SettingDescriptor] {
    REGISTRY
}

fn normalize_key(key: &str) -> String {
    let mut out = String::new();
    for (i, ch) in key.trim().chars().enumerate() {
        if ch == '_' || ch == ' ' {
            out.push('-');
        } else if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Looks a descriptor up by kebab, snake or camel case key.
pub fn find(key: &str) -> Option<&'static SettingDescriptor> {
    let key = normalize_key(key);
    REGISTRY.iter().find(|d| d.key == key)
}

/// Nearest registered key, for typo hints.
pub fn suggest(key: &str) -> Option<&'static str> {
    let key = normalize_key(key);
    REGISTRY
        .iter()
        .map(|d| (strsim::levenshtein(&key, d.key), d.key))
        .filter(|(dist, _)| *dist <= 3)
        .min_by_key(|(dist, _)| *dist)
        .map(|(_, k)| k)
}

pub fn parse_value(kind: SettingKind, raw: &str) -> Result<SettingValue> {
    let raw = raw.trim();
    match kind {
        SettingKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" | "enabled" => Ok(SettingValue::Bool(true)),
            "false" | "no" | "off" | "0" | "disabled" => Ok(SettingValue::Bool(false)),
            _ => Err(anyhow!("'{raw}' is not a boolean")),
        },
        SettingKind::Int { min, max } => {
            let n: i64 = raw
                .parse()
                .map_err(|_| anyhow!("'{raw}' is not an integer"))?;
            if n < min || n > max {
                bail!("{n} is outside {min}..={max}");
            }
            Ok(SettingValue::Int(n))
        }
        SettingKind::String {
            choices,
            custom_allowed,
        } => {
            if raw.is_empty() {
                bail!("value cannot be empty");
            }
            if custom_allowed || choices.iter().any(|c| c.eq_ignore_ascii_case(raw)) {
                Ok(SettingValue::String(raw.to_string()))
            } else {
                Err(anyhow!("'{raw}' must be one of: {}", choices.join(", ")))
            }
        }
    }
}

/// Parses `raw` for `key` and applies it. Returns whether anything changed.
pub fn set_from_str(cfg: &mut PlanConfig, key: &str, raw: &str) -> Result<bool> {
    let Some(desc) = find(key) else {
        let hint = suggest(key)
            .map(|k| format!(" (did you mean '{k}'?)"))
            .unwrap_or_default();
        bail!("unknown setting '{key}'{hint}");
    };
    let value = parse_value(desc.kind, raw)?;
    let before = cfg.clone();
    (desc.set)(cfg, value)?;
    cfg.validate()?;
    Ok(*cfg != before)
}

/// Visible settings with their current values, in registry order.
pub fn visible_settings(cfg: &PlanConfig) -> Vec<(&'static str, &'static str, String)> {
    REGISTRY
        .iter()
        .filter(|d| (d.visible)(cfg))
        .map(|d| (d.key, d.label, (d.get)(cfg).display()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_accept_camel_and_snake_case() {
        assert_eq!(find("autoApply").map(|d| d.key), Some("auto-apply"));
        assert_eq!(find("auto_debug_tries").map(|d| d.key), Some("auto-debug-tries"));
        assert!(find("nonsense").is_none());
    }

    #[test]
    fn set_from_str_cascades_and_marks_custom() {
        let mut cfg = PlanConfig::default();
        let changed = set_from_str(&mut cfg, "auto-debug", "true").expect("set");
        assert!(changed);
        assert!(cfg.can_exec && cfg.auto_exec);
        assert_eq!(cfg.auto_mode, AutoMode::Custom);
    }

    #[test]
    fn auto_mode_setting_writes_preset() {
        let mut cfg = PlanConfig::default();
        set_from_str(&mut cfg, "auto-mode", "full").expect("set");
        assert!(cfg.auto_apply && cfg.auto_debug);
        assert!(set_from_str(&mut cfg, "auto-mode", "custom").is_err());
    }

    #[test]
    fn int_settings_are_range_checked() {
        let mut cfg = PlanConfig::default();
        assert!(set_from_str(&mut cfg, "auto-debug-tries", "0").is_err());
        assert!(set_from_str(&mut cfg, "auto-debug-tries", "abc").is_err());
        set_from_str(&mut cfg, "auto-debug-tries", "7").expect("set");
        assert_eq!(cfg.auto_debug_tries, 7);
    }

    #[test]
    fn editor_allows_custom_commands() {
        let mut cfg = PlanConfig::default();
        set_from_str(&mut cfg, "editor", "subl -w").expect("set");
        assert_eq!(cfg.editor, "subl -w");
    }

    #[test]
    fn unknown_key_suggests_nearest() {
        let mut cfg = PlanConfig::default();
        let err = set_from_str(&mut cfg, "auto-aply", "true").expect_err("unknown");
        assert!(err.to_string().contains("auto-apply"));
    }

    #[test]
    fn visibility_hides_exec_settings_when_disabled() {
        let mut cfg = PlanConfig::default();
        cfg.set_auto_mode(AutoMode::None);
        let keys: Vec<_> = visible_settings(&cfg).into_iter().map(|(k, _, _)| k).collect();
        assert!(!keys.contains(&"auto-exec"));
        assert!(!keys.contains(&"auto-debug-tries"));
        assert!(keys.contains(&"can-exec"));
    }
}
