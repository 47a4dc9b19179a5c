use std::collections::HashMap;

/// Name of the setting that forces explicit page-in after mapping.
pub const SETTING_POPULATE: &str = "mmapfiles-populate";
/// Name of the setting that selects `MAP_SHARED` over `MAP_PRIVATE`.
pub const SETTING_SHARED: &str = "mmapfiles-shared";

/// Named boolean settings, filled by the CLI and read by the worker body.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    flags: HashMap<String, bool>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bool(&mut self, name: &str, value: bool) {
        self.flags.insert(name.to_string(), value);
    }

    /// Returns the stored value, or `None` if the setting was never set.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.flags.get(name).copied()
    }
}

/// The two mapping switches, resolved once per worker invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapOptions {
    pub populate: bool,
    pub shared: bool,
}

impl MapOptions {
    /// Absent settings read as `false`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            populate: settings.get_bool(SETTING_POPULATE).unwrap_or(false),
            shared: settings.get_bool(SETTING_SHARED).unwrap_or(false),
        }
    }
}
