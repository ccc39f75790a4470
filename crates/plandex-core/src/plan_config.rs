//! Plan-scoped switches and auto-mode presets.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoMode {
    Full,
    #[default]
    Semi,
    BasicPlus,
    Basic,
    None,
    Custom,
}

pub const ALL_AUTO_MODES: [AutoMode; 6] = [
    AutoMode::Full,
    AutoMode::Semi,
    AutoMode::BasicPlus,
    AutoMode::Basic,
    AutoMode::None,
    AutoMode::Custom,
];

impl AutoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoMode::Full => "full",
            AutoMode::Semi => "semi",
            AutoMode::BasicPlus => "basic-plus",
            AutoMode::Basic => "basic",
            AutoMode::None => "none",
            AutoMode::Custom => "custom",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        ALL_AUTO_MODES
            .iter()
            .copied()
            .find(|m| m.as_str() == normalized)
    }

    pub fn description(&self) -> &'static str {
        match self {
            AutoMode::Full => "Fully automatic: load context, build, apply, execute and debug",
            AutoMode::Semi => "Auto-load context and build; apply and execution need approval",
            AutoMode::BasicPlus => "Auto-update context and build; context loading is manual",
            AutoMode::Basic => "Auto-continue and build only",
            AutoMode::None => "Step-by-step: every phase is manual",
            AutoMode::Custom => "Individually configured settings",
        }
    }
}

impl fmt::Display for AutoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanConfig {
    pub auto_mode: AutoMode,
    pub auto_continue: bool,
    pub auto_build: bool,
    pub auto_update_context: bool,
    pub auto_load_context: bool,
    pub smart_context: bool,
    pub auto_apply: bool,
    pub auto_commit: bool,
    pub skip_commit: bool,
    pub can_exec: bool,
    pub auto_exec: bool,
    pub auto_debug: bool,
    pub auto_debug_tries: u32,
    pub editor: String,
}

pub const DEFAULT_AUTO_DEBUG_TRIES: u32 = 5;
pub const MAX_AUTO_DEBUG_TRIES: u32 = 100;

impl Default for PlanConfig {
    fn default() -> Self {
        let mut cfg = Self {
            auto_mode: AutoMode::Semi,
            auto_continue: false,
            auto_build: false,
            auto_update_context: false,
            auto_load_context: false,
            smart_context: false,
            auto_apply: false,
            auto_commit: false,
            skip_commit: false,
            can_exec: false,
            auto_exec: false,
            auto_debug: false,
            auto_debug_tries: DEFAULT_AUTO_DEBUG_TRIES,
            editor: default_editor(),
        };
        cfg.set_auto_mode(AutoMode::Semi);
        cfg
    }
}

fn default_editor() -> String {
    std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "vim".to_string())
}

struct Preset {
    auto_continue: bool,
    auto_build: bool,
    auto_update_context: bool,
    auto_load_context: bool,
    smart_context: bool,
    auto_apply: bool,
    auto_commit: bool,
    can_exec: bool,
    auto_exec: bool,
    auto_debug: bool,
}

const fn preset(flags: [bool; 10]) -> Preset {
    Preset {
        auto_continue: flags[0],
        auto_build: flags[1],
        auto_update_context: flags[2],
        auto_load_context: flags[3],
        smart_context: flags[4],
        auto_apply: flags[5],
        auto_commit: flags[6],
        can_exec: flags[7],
        auto_exec: flags[8],
        auto_debug: flags[9],
    }
}

fn preset_for(mode: AutoMode) -> Option<Preset> {
    let p = match mode {
        AutoMode::Full => preset([true; 10]),
        AutoMode::Semi => preset([
            true, true, true, true, true, false, true, true, false, false,
        ]),
        AutoMode::BasicPlus => preset([
            true, true, true, false, true, false, true, true, false, false,
        ]),
        AutoMode::Basic => preset([
            true, true, false, false, false, false, false, false, false, false,
        ]),
        AutoMode::None => preset([false; 10]),
        AutoMode::Custom => return None,
    };
    Some(p)
}

impl PlanConfig {
    /// Writes the preset for `mode`. `Custom` only changes the label.
    pub fn set_auto_mode(&mut self, mode: AutoMode) {
        self.auto_mode = mode;
        let Some(p) = preset_for(mode) else {
            return;
        };
        self.auto_continue = p.auto_continue;
        self.auto_build = p.auto_build;
        self.auto_update_context = p.auto_update_context;
        self.auto_load_context = p.auto_load_context;
        self.smart_context = p.smart_context;
        self.auto_apply = p.auto_apply;
        self.auto_commit = p.auto_commit;
        self.skip_commit = false;
        self.can_exec = p.can_exec;
        self.auto_exec = p.auto_exec;
        self.auto_debug = p.auto_debug;
    }

    fn mark_custom_if(&mut self, changed: bool) {
        if changed {
            self.auto_mode = AutoMode::Custom;
        }
    }

    pub fn set_auto_continue(&mut self, v: bool) {
        let changed = self.auto_continue != v;
        self.auto_continue = v;
        self.mark_custom_if(changed);
    }

    pub fn set_auto_build(&mut self, v: bool) {
        let changed = self.auto_build != v;
        self.auto_build = v;
        if !v {
            self.auto_apply = false;
        }
        self.mark_custom_if(changed);
    }

    pub fn set_auto_update_context(&mut self, v: bool) {
        let changed = self.auto_update_context != v;
        self.auto_update_context = v;
        self.mark_custom_if(changed);
    }

    pub fn set_auto_load_context(&mut self, v: bool) {
        let changed = self.auto_load_context != v;
        self.auto_load_context = v;
        self.mark_custom_if(changed);
    }

    pub fn set_smart_context(&mut self, v: bool) {
        let changed = self.smart_context != v;
        self.smart_context = v;
        self.mark_custom_if(changed);
    }

    pub fn set_auto_apply(&mut self, v: bool) {
        let changed = self.auto_apply != v;
        self.auto_apply = v;
        if v {
            self.auto_build = true;
        }
        self.mark_custom_if(changed);
    }

    pub fn set_auto_commit(&mut self, v: bool) {
        let changed = self.auto_commit != v;
        self.auto_commit = v;
        if v {
            self.skip_commit = false;
        }
        self.mark_custom_if(changed);
    }

    pub fn set_skip_commit(&mut self, v: bool) {
        let changed = self.skip_commit != v;
        self.skip_commit = v;
        if v {
            self.auto_commit = false;
        }
        self.mark_custom_if(changed);
    }

    pub fn set_can_exec(&mut self, v: bool) {
        let changed = self.can_exec != v;
        self.can_exec = v;
        if !v {
            self.auto_exec = false;
            self.auto_debug = false;
        }
        self.mark_custom_if(changed);
    }

    pub fn set_auto_exec(&mut self, v: bool) {
        let changed = self.auto_exec != v;
        self.auto_exec = v;
        if v {
            self.can_exec = true;
        } else {
            self.auto_debug = false;
        }
        self.mark_custom_if(changed);
    }

    pub fn set_auto_debug(&mut self, v: bool) {
        let changed = self.auto_debug != v;
        self.auto_debug = v;
        if v {
            self.can_exec = true;
            self.auto_exec = true;
        }
        self.mark_custom_if(changed);
    }

    pub fn set_auto_debug_tries(&mut self, tries: u32) -> Result<()> {
        if tries == 0 || tries > MAX_AUTO_DEBUG_TRIES {
            return Err(anyhow!(
                "autoDebugTries must be between 1 and {MAX_AUTO_DEBUG_TRIES}"
            ));
        }
        let changed = self.auto_debug_tries != tries;
        self.auto_debug_tries = tries;
        self.mark_custom_if(changed);
        Ok(())
    }

    pub fn set_editor(&mut self, editor: &str) {
        self.editor = editor.trim().to_string();
    }

    /// Checks the cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.auto_apply && !self.auto_build {
            return Err(anyhow!("autoApply requires autoBuild"));
        }
        if self.auto_debug && !(self.can_exec && self.auto_exec) {
            return Err(anyhow!("autoDebug requires canExec and autoExec"));
        }
        if self.auto_exec && !self.can_exec {
            return Err(anyhow!("autoExec requires canExec"));
        }
        if self.auto_commit && self.skip_commit {
            return Err(anyhow!("autoCommit and skipCommit are mutually exclusive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mode_strategy() -> impl Strategy<Value = AutoMode> {
        prop_oneof![
            Just(AutoMode::Full),
            Just(AutoMode::Semi),
            Just(AutoMode::BasicPlus),
            Just(AutoMode::Basic),
            Just(AutoMode::None),
        ]
    }

    #[derive(Debug, Clone)]
    enum Op {
        Continue(bool),
        Build(bool),
        Apply(bool),
        Commit(bool),
        Skip(bool),
        CanExec(bool),
        AutoExec(bool),
        Debug(bool),
        Mode(AutoMode),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(Op::Continue),
            any::<bool>().prop_map(Op::Build),
            any::<bool>().prop_map(Op::Apply),
            any::<bool>().prop_map(Op::Commit),
            any::<bool>().prop_map(Op::Skip),
            any::<bool>().prop_map(Op::CanExec),
            any::<bool>().prop_map(Op::AutoExec),
            any::<bool>().prop_map(Op::Debug),
            mode_strategy().prop_map(Op::Mode),
        ]
    }

    proptest! {
        #[test]
        fn setters_preserve_invariants(ops in prop::collection::vec(op_strategy(), 0..24)) {
            let mut cfg = PlanConfig::default();
            for op in ops {
                match op {
                    Op::Continue(v) => cfg.set_auto_continue(v),
                    Op::Build(v) => cfg.set_auto_build(v),
                    Op::Apply(v) => cfg.set_auto_apply(v),
                    Op::Commit(v) => cfg.set_auto_commit(v),
                    Op::Skip(v) => cfg.set_skip_commit(v),
                    Op::CanExec(v) => cfg.set_can_exec(v),
                    Op::AutoExec(v) => cfg.set_auto_exec(v),
                    Op::Debug(v) => cfg.set_auto_debug(v),
                    Op::Mode(m) => cfg.set_auto_mode(m),
                }
                prop_assert!(cfg.validate().is_ok(), "{:?}", cfg);
            }
        }

        #[test]
        fn presets_satisfy_invariants(mode in mode_strategy()) {
            let mut cfg = PlanConfig::default();
            cfg.set_auto_mode(mode);
            prop_assert_eq!(cfg.auto_mode, mode);
            prop_assert!(cfg.validate().is_ok());
        }
    }

    #[test]
    fn semi_preset_matches_table() {
        let mut cfg = PlanConfig::default();
        cfg.set_auto_mode(AutoMode::Full);
        cfg.set_auto_mode(AutoMode::Semi);
        assert!(cfg.auto_continue && cfg.auto_build && cfg.auto_load_context);
        assert!(!cfg.auto_apply && cfg.auto_commit && cfg.can_exec);
        assert!(!cfg.auto_exec && !cfg.auto_debug);
    }

    #[test]
    fn basic_plus_skips_context_loading() {
        let mut cfg = PlanConfig::default();
        cfg.set_auto_mode(AutoMode::BasicPlus);
        assert!(cfg.auto_update_context);
        assert!(!cfg.auto_load_context);
        assert!(cfg.smart_context);
    }

    #[test]
    fn changing_a_field_flips_to_custom() {
        let mut cfg = PlanConfig::default();
        cfg.set_auto_mode(AutoMode::Basic);
        cfg.set_auto_continue(true);
        assert_eq!(cfg.auto_mode, AutoMode::Basic, "no-op keeps the mode");
        cfg.set_auto_apply(true);
        assert_eq!(cfg.auto_mode, AutoMode::Custom);
        assert!(cfg.auto_build);
    }

    #[test]
    fn disabling_exec_cascades() {
        let mut cfg = PlanConfig::default();
        cfg.set_auto_mode(AutoMode::Full);
        cfg.set_can_exec(false);
        assert!(!cfg.auto_exec);
        assert!(!cfg.auto_debug);
        assert_eq!(cfg.auto_mode, AutoMode::Custom);
    }

    #[test]
    fn auto_debug_tries_is_bounded() {
        let mut cfg = PlanConfig::default();
        assert!(cfg.set_auto_debug_tries(0).is_err());
        assert!(cfg.set_auto_debug_tries(3).is_ok());
        assert_eq!(cfg.auto_debug_tries, 3);
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let cfg: PlanConfig =
            serde_json::from_str(r#"{"autoMode":"full","autoDebugTries":2}"#).expect("parse");
        assert_eq!(cfg.auto_mode, AutoMode::Full);
        assert_eq!(cfg.auto_debug_tries, 2);
    }
}
