use std::collections::BTreeMap;

use mlua::{Function, Lua, RegistryKey};

struct FallbackEntry {
    id: u64,
    name: String,
    handler: RegistryKey,
}

/// Text commands registered by the deterministic script, and the ordered chain of handlers
/// consulted for chat/action input no engine command claimed.
#[derive(Default)]
pub struct ActionFallbacks {
    text_commands: BTreeMap<String, String>,
    chain: Vec<FallbackEntry>,
    next_id: u64,
}

pub struct ChainSnapshotEntry {
    pub id: u64,
    pub name: String,
    pub handler: Function,
}

impl ActionFallbacks {
    /// Returns false when the name is blank or already taken.
    pub fn add(&mut self, lua: &Lua, name: &str, help: &str, handler: Function) -> mlua::Result<bool> {
        let name = name.trim();
        if name.is_empty() || self.text_commands.contains_key(name) {
            return Ok(false);
        }
        let handler = lua.create_registry_value(handler)?;
        self.next_id += 1;
        self.chain.push(FallbackEntry {
            id: self.next_id,
            name: name.to_string(),
            handler,
        });
        self.text_commands.insert(name.to_string(), help.to_string());
        Ok(true)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let name = name.trim();
        if self.text_commands.remove(name).is_none() {
            return false;
        }
        self.chain.retain(|entry| entry.name != name);
        true
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.chain.iter().any(|entry| entry.id == id)
    }

    pub fn snapshot(&self, lua: &Lua) -> mlua::Result<Vec<ChainSnapshotEntry>> {
        self.chain
            .iter()
            .map(|entry| {
                Ok(ChainSnapshotEntry {
                    id: entry.id,
                    name: entry.name.clone(),
                    handler: lua.registry_value::<Function>(&entry.handler)?,
                })
            })
            .collect()
    }

    pub fn text_commands(&self) -> &BTreeMap<String, String> {
        &self.text_commands
    }

    pub fn chain_names(&self) -> Vec<String> {
        self.chain.iter().map(|entry| entry.name.clone()).collect()
    }
}
