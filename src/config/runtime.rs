use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Mode switches that can change while the process runs.
///
/// Shared as `Arc<RuntimeFlags>`; loops read the current value on every cycle.
#[derive(Debug, Default)]
pub struct RuntimeFlags {
    agentic_mode: AtomicBool,
    exploration_mode: AtomicBool,
    web_search: AtomicBool,
}

/// Point-in-time copy of the flags (API / stats).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RuntimeFlagsView {
    pub agentic_mode: bool,
    pub exploration_mode: bool,
    pub web_search: bool,
}

impl RuntimeFlags {
    pub fn new(agentic_mode: bool, exploration_mode: bool, web_search: bool) -> Self {
        Self {
            agentic_mode: AtomicBool::new(agentic_mode),
            exploration_mode: AtomicBool::new(exploration_mode),
            web_search: AtomicBool::new(web_search),
        }
    }

    /// Build from env vars, falling back to all-off.
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| parse_flag(&v))
                .unwrap_or(false)
        };

        Self::new(
            flag("ATLAS_AGENTIC_MODE"),
            flag("ATLAS_EXPLORATION_MODE"),
            flag("ATLAS_WEB_SEARCH"),
        )
    }

    pub fn agentic_mode(&self) -> bool {
        self.agentic_mode.load(Ordering::Relaxed)
    }

    pub fn set_agentic_mode(&self, on: bool) {
        self.agentic_mode.store(on, Ordering::Relaxed);
    }

    pub fn exploration_mode(&self) -> bool {
        self.exploration_mode.load(Ordering::Relaxed)
    }

    pub fn set_exploration_mode(&self, on: bool) {
        self.exploration_mode.store(on, Ordering::Relaxed);
    }

    pub fn web_search(&self) -> bool {
        self.web_search.load(Ordering::Relaxed)
    }

    pub fn set_web_search(&self, on: bool) {
        self.web_search.store(on, Ordering::Relaxed);
    }

    pub fn view(&self) -> RuntimeFlagsView {
        RuntimeFlagsView {
            agentic_mode: self.agentic_mode(),
            exploration_mode: self.exploration_mode(),
            web_search: self.web_search(),
        }
    }
}

/// Accepts `true/false`, `1/0`, `on/off`, `yes/no`.
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" => Some(false),
        _ => None,
    }
}
