//! Table traversal with an order that does not depend on the interpreter's hash layout.
//!
//! Keys sort booleans first (`false` < `true`), then numbers ascending, then strings bytewise.
//! Keys of any other type have no order that is stable across peers, so iterating a table that
//! contains one is an error.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;

use mlua::{Function, Lua, Table, Value};

pub(crate) enum OrderedKey {
    Boolean(bool),
    Number(f64),
    Bytes(Vec<u8>),
}

impl OrderedKey {
    fn rank(&self) -> u8 {
        match self {
            OrderedKey::Boolean(_) => 0,
            OrderedKey::Number(_) => 1,
            OrderedKey::Bytes(_) => 2,
        }
    }

    fn from_value(value: &Value) -> mlua::Result<Self> {
        match value {
            Value::Boolean(b) => Ok(OrderedKey::Boolean(*b)),
            Value::Integer(i) => Ok(OrderedKey::Number(*i as f64)),
            Value::Number(n) => Ok(OrderedKey::Number(*n)),
            Value::String(s) => Ok(OrderedKey::Bytes(s.as_bytes().to_vec())),
            other => Err(mlua::Error::RuntimeError(format!(
                "keys of type '{}' have no stable order",
                other.type_name()
            ))),
        }
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (OrderedKey::Boolean(a), OrderedKey::Boolean(b)) => a.cmp(b),
            (OrderedKey::Number(a), OrderedKey::Number(b)) => a.total_cmp(b),
            (OrderedKey::Bytes(a), OrderedKey::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

/// Every key of `table` in the stable order, with the raw key kept alongside for lookups.
pub(crate) fn sorted_keys(table: &Table) -> mlua::Result<Vec<(OrderedKey, Value)>> {
    let mut keys = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, _) = pair?;
        keys.push((OrderedKey::from_value(&key)?, key));
    }
    keys.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keys)
}

const NEXT_CURSOR_LIMIT: usize = 8;

struct NextCursor {
    table: Table,
    keys: Vec<(OrderedKey, Value)>,
}

/// Key orders for `next` traversals in progress, one per table. A traversal that starts with a
/// nil key takes a fresh snapshot; later calls resume from it, so a full walk sorts once.
#[derive(Default)]
pub(crate) struct NextCursors {
    cursors: Vec<NextCursor>,
}

impl NextCursors {
    fn position(&self, table: &Table) -> Option<usize> {
        let pointer = table.to_pointer();
        self.cursors
            .iter()
            .position(|cursor| cursor.table.to_pointer() == pointer)
    }

    fn snapshot(&mut self, table: &Table) -> mlua::Result<usize> {
        let keys = sorted_keys(table)?;
        if let Some(index) = self.position(table) {
            self.cursors.remove(index);
        }
        if self.cursors.len() >= NEXT_CURSOR_LIMIT {
            self.cursors.remove(0);
        }
        self.cursors.push(NextCursor {
            table: table.clone(),
            keys,
        });
        Ok(self.cursors.len() - 1)
    }
}

/// `next(t, k)` over the stable order. The position after `k` is found by order rather than by
/// membership, so `k` may already have been cleared from the table.
pub(crate) fn synced_next(
    cursors: &mut NextCursors,
    table: &Table,
    key: Value,
) -> mlua::Result<(Value, Value)> {
    let (index, start) = match key {
        Value::Nil => (cursors.snapshot(table)?, 0),
        key => {
            let target = OrderedKey::from_value(&key)?;
            let index = match cursors.position(table) {
                Some(index) => index,
                None => cursors.snapshot(table)?,
            };
            let start = cursors.cursors[index]
                .keys
                .partition_point(|(ordered, _)| *ordered <= target);
            (index, start)
        }
    };
    for (_, key) in cursors.cursors[index].keys.iter().skip(start) {
        let value: Value = table.raw_get(key.clone())?;
        if !value.is_nil() {
            return Ok((key.clone(), value));
        }
    }
    cursors.cursors.remove(index);
    Ok((Value::Nil, Value::Nil))
}

/// `pairs(t)`: the key order is fixed when the loop starts. Keys removed during the loop are
/// skipped; keys added during the loop are not visited.
pub(crate) fn synced_pairs(lua: &Lua, table: Table) -> mlua::Result<(Function, Table, Value)> {
    let keys: Vec<Value> = sorted_keys(&table)?
        .into_iter()
        .map(|(_, key)| key)
        .collect();
    let cursor = Cell::new(0usize);
    let iter = lua.create_function(move |_, (table, _prev): (Table, Value)| {
        loop {
            let index = cursor.get();
            let Some(key) = keys.get(index) else {
                return Ok((Value::Nil, Value::Nil));
            };
            cursor.set(index + 1);
            let value: Value = table.raw_get(key.clone())?;
            if !value.is_nil() {
                return Ok((key.clone(), value));
            }
        }
    })?;
    Ok((iter, table, Value::Nil))
}

pub(crate) fn install(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let cursors = RefCell::new(NextCursors::default());
    globals.set(
        "next",
        lua.create_function(move |_, (table, key): (Table, Value)| {
            synced_next(&mut cursors.borrow_mut(), &table, key)
        })?,
    )?;
    globals.set(
        "pairs",
        lua.create_function(|lua, table: Table| synced_pairs(lua, table))?,
    )?;
    Ok(())
}
