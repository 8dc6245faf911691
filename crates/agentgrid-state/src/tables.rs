//! Table names for the AgentGrid state tables.
//!
//! The same names are used for the JSON file stems (`placements.json`,
//! `capacity.json`) and for the redb table definitions.

use redb::TableDefinition;

/// Agent placements keyed by `{agent_id}`.
pub const PLACEMENTS: &str = "placements";

/// Device capacity profiles keyed by `{device_type}`.
pub const CAPACITY: &str = "capacity";

/// redb definition for a named table with `&str` keys and JSON values.
pub fn definition(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// JSON file name for a named table.
pub fn json_file_name(name: &str) -> String {
    format!("{name}.json")
}
