//! Process-wide settings.
//!
//! Two knobs: `RENDERGRAPH_GENERATE_DOT_FILES` (an integer countdown; every
//! positive value causes one `graph_<frame>.dot` to be written and
//! decrements) and `RENDERGRAPH_PRINT_EXTENDED_DEBUG_MESSAGES` (a boolean).
//! Both are process-wide, read through `config::Config`.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use config::Config;
use lazy_static::lazy_static;

pub struct Settings {
    dot_files_remaining: AtomicI32,
    print_extended_debug_messages: AtomicBool,
}

impl Settings {
    fn from_config(config: &Config) -> Settings {
        let dot_files = config
            .get_int("RENDERGRAPH_GENERATE_DOT_FILES")
            .unwrap_or(0) as i32;
        let debug_messages = config
            .get_bool("RENDERGRAPH_PRINT_EXTENDED_DEBUG_MESSAGES")
            .unwrap_or(false);
        Settings {
            dot_files_remaining: AtomicI32::new(dot_files),
            print_extended_debug_messages: AtomicBool::new(debug_messages),
        }
    }

    /// Returns `true` and decrements the counter if a dot file should be
    /// emitted for the current frame.
    pub fn take_dot_file_request(&self) -> bool {
        loop {
            let current = self.dot_files_remaining.load(Ordering::Relaxed);
            if current <= 0 {
                return false;
            }
            if self
                .dot_files_remaining
                .compare_exchange(current, current - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn set_dot_files_remaining(&self, count: i32) {
        self.dot_files_remaining.store(count, Ordering::Relaxed);
    }

    pub fn print_extended_debug_messages(&self) -> bool {
        self.print_extended_debug_messages.load(Ordering::Relaxed)
    }

    pub fn set_print_extended_debug_messages(&self, value: bool) {
        self.print_extended_debug_messages.store(value, Ordering::Relaxed);
    }
}

lazy_static! {
    static ref SETTINGS: Settings = {
        let mut config = Config::default();
        // Best-effort: environment overrides, no config file is required.
        let _ = config.merge(config::Environment::new());
        Settings::from_config(&config)
    };
}

/// Returns the process-wide settings instance.
pub fn settings() -> &'static Settings {
    &SETTINGS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_file_counter_decrements_and_stops_at_zero() {
        settings().set_dot_files_remaining(2);
        assert!(settings().take_dot_file_request());
        assert!(settings().take_dot_file_request());
        assert!(!settings().take_dot_file_request());
    }

    #[test]
    fn debug_messages_flag_round_trips() {
        settings().set_print_extended_debug_messages(true);
        assert!(settings().print_extended_debug_messages());
        settings().set_print_extended_debug_messages(false);
        assert!(!settings().print_extended_debug_messages());
    }
}
