//! Debug logging utilities for hvtvmm.
//!
//! Set the `HVTVMM_DEBUG` environment variable to enable verbose logging:
//! - `HVTVMM_DEBUG=1` - Enable all debug output
//! - `HVTVMM_DEBUG=setup` - Enable only guest bring-up logs
//! - `HVTVMM_DEBUG=fault` - Enable only trap decode and register dumps
//! - `HVTVMM_DEBUG=setup,fault` - Enable multiple categories
//!
//! Output goes through `log::debug!` with a per-category target, so a logger
//! must still be installed by the embedding process.

use std::sync::OnceLock;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Setup,
    Fault,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default, PartialEq, Eq)]
struct DebugConfig {
    enabled: bool,
    setup: bool,
    fault: bool,
}

impl DebugConfig {
    fn from_env() -> Self {
        Self::parse(std::env::var("HVTVMM_DEBUG").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(val) if val == "1" || val.eq_ignore_ascii_case("all") => Self {
                enabled: true,
                setup: true,
                fault: true,
            },
            Some(val) => {
                let val_lower = val.to_lowercase();
                Self {
                    enabled: true,
                    setup: val_lower.contains("setup"),
                    fault: val_lower.contains("fault"),
                }
            }
            None => Self::default(),
        }
    }

    fn allows(&self, category: DebugCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match category {
            DebugCategory::All => self.setup || self.fault,
            DebugCategory::Setup => self.setup,
            DebugCategory::Fault => self.fault,
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    get_config().allows(category)
}

/// Debug log macro for guest bring-up
#[macro_export]
macro_rules! debug_setup {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Setup) {
            $crate::__log::debug!(target: "hvtvmm::setup", $($arg)*);
        }
    };
}

/// Debug log macro for trap decoding and fault register dumps
#[macro_export]
macro_rules! debug_fault {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Fault) {
            $crate::__log::debug!(target: "hvtvmm::fault", $($arg)*);
        }
    };
}
