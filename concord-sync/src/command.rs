//! Command protocol: the one place every mutation is interpreted.
//!
//! On the wire a command is a flat string tuple:
//!
//! ```text
//! ["lins", docID, listID, afterID, newID, value]
//! ["mput", docID, mapID, key, value]
//! ```
//!
//! It is parsed once into [`Command`] at the boundary. Local mutations
//! (`run_*`) build a `Command` and feed it through [`apply`], the same
//! function used to replay forwarded commands, so there is exactly one
//! interpretation of each opcode.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::checkpoint::{escape, unescape, CheckpointError, DocumentCheckpoint};
use crate::crdt::{Anchor, CrdtError, LwwMap, NodeId, Rga};

// ───────────────────────────── Errors ─────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    /// Wrong argument count, unknown opcode or an unparsable field.
    #[error("Malformed command: {0}")]
    Protocol(String),

    /// A command reached an object it does not address.
    #[error("Command for '{doc}/{object}' routed to '{target_doc}/{target_object}'")]
    Routing {
        doc: String,
        object: String,
        target_doc: String,
        target_object: String,
    },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Crdt(CrdtError),
}

impl From<CrdtError> for CommandError {
    fn from(err: CrdtError) -> Self {
        match err {
            CrdtError::NotImplemented(what) => CommandError::NotImplemented(what),
            other => CommandError::Crdt(other),
        }
    }
}

impl From<CheckpointError> for CommandError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Crdt(inner) => inner.into(),
            other => CommandError::Protocol(other.to_string()),
        }
    }
}

// ───────────────────────────── Opcodes ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    ListCreate,
    ListInsert,
    ListInsertRef,
    ListPut,
    ListPutRef,
    ListDelete,
    MapCreate,
    MapPut,
    MapPutRef,
    MapDelete,
}

impl Opcode {
    pub const ALL: [Opcode; 10] = [
        Opcode::ListCreate,
        Opcode::ListInsert,
        Opcode::ListInsertRef,
        Opcode::ListPut,
        Opcode::ListPutRef,
        Opcode::ListDelete,
        Opcode::MapCreate,
        Opcode::MapPut,
        Opcode::MapPutRef,
        Opcode::MapDelete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::ListCreate => "lcreate",
            Opcode::ListInsert => "lins",
            Opcode::ListInsertRef => "linsref",
            Opcode::ListPut => "lput",
            Opcode::ListPutRef => "lputref",
            Opcode::ListDelete => "ldel",
            Opcode::MapCreate => "mcreate",
            Opcode::MapPut => "mput",
            Opcode::MapPutRef => "mputref",
            Opcode::MapDelete => "mdel",
        }
    }

    /// Total tuple length, opcode included.
    pub fn arity(self) -> usize {
        match self {
            Opcode::ListCreate | Opcode::MapCreate => 3,
            Opcode::ListDelete | Opcode::MapDelete => 4,
            Opcode::ListPut | Opcode::ListPutRef | Opcode::MapPut | Opcode::MapPutRef => 5,
            Opcode::ListInsert | Opcode::ListInsertRef => 6,
        }
    }

    pub fn is_list(self) -> bool {
        matches!(
            self,
            Opcode::ListCreate
                | Opcode::ListInsert
                | Opcode::ListInsertRef
                | Opcode::ListPut
                | Opcode::ListPutRef
                | Opcode::ListDelete
        )
    }
}

impl FromStr for Opcode {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| CommandError::Protocol(format!("unknown opcode '{s}'")))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────── Commands ─────────────────────────────

/// A parsed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ListCreate {
        doc: String,
        list: String,
    },
    ListInsert {
        doc: String,
        list: String,
        after: Anchor,
        id: NodeId,
        value: Value,
    },
    ListInsertRef {
        doc: String,
        list: String,
        after: Anchor,
        id: NodeId,
        target: String,
    },
    ListPut {
        doc: String,
        list: String,
        id: NodeId,
        value: Value,
    },
    ListPutRef {
        doc: String,
        list: String,
        id: NodeId,
        target: String,
    },
    ListDelete {
        doc: String,
        list: String,
        id: NodeId,
    },
    MapCreate {
        doc: String,
        map: String,
    },
    MapPut {
        doc: String,
        map: String,
        key: String,
        value: Value,
    },
    MapPutRef {
        doc: String,
        map: String,
        key: String,
        target: String,
    },
    MapDelete {
        doc: String,
        map: String,
        key: String,
    },
}

fn field<T>(args: &[String], index: usize, what: &str) -> Result<T, CommandError>
where
    T: FromStr,
{
    args[index]
        .parse()
        .map_err(|_| CommandError::Protocol(format!("invalid {what} '{}'", args[index])))
}

impl Command {
    /// Parse a wire tuple, validating opcode, arity and ids.
    pub fn parse(args: &[String]) -> Result<Self, CommandError> {
        let op: Opcode = args
            .first()
            .ok_or_else(|| CommandError::Protocol("empty command".into()))?
            .parse()?;
        if args.len() != op.arity() {
            return Err(CommandError::Protocol(format!(
                "'{op}' takes {} arguments, got {}",
                op.arity(),
                args.len()
            )));
        }

        let doc = args[1].clone();
        let object = args[2].clone();
        let cmd = match op {
            Opcode::ListCreate => Command::ListCreate { doc, list: object },
            Opcode::ListInsert => Command::ListInsert {
                doc,
                list: object,
                after: field(args, 3, "anchor")?,
                id: field(args, 4, "element id")?,
                value: unescape(&args[5]),
            },
            Opcode::ListInsertRef => Command::ListInsertRef {
                doc,
                list: object,
                after: field(args, 3, "anchor")?,
                id: field(args, 4, "element id")?,
                target: args[5].clone(),
            },
            Opcode::ListPut => Command::ListPut {
                doc,
                list: object,
                id: field(args, 3, "element id")?,
                value: unescape(&args[4]),
            },
            Opcode::ListPutRef => Command::ListPutRef {
                doc,
                list: object,
                id: field(args, 3, "element id")?,
                target: args[4].clone(),
            },
            Opcode::ListDelete => Command::ListDelete {
                doc,
                list: object,
                id: field(args, 3, "element id")?,
            },
            Opcode::MapCreate => Command::MapCreate { doc, map: object },
            Opcode::MapPut => Command::MapPut {
                doc,
                map: object,
                key: args[3].clone(),
                value: unescape(&args[4]),
            },
            Opcode::MapPutRef => Command::MapPutRef {
                doc,
                map: object,
                key: args[3].clone(),
                target: args[4].clone(),
            },
            Opcode::MapDelete => Command::MapDelete {
                doc,
                map: object,
                key: args[3].clone(),
            },
        };
        Ok(cmd)
    }

    /// Encode back to the wire tuple.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            self.opcode().as_str().to_string(),
            self.doc_id().to_string(),
            self.object_id().to_string(),
        ];
        match self {
            Command::ListCreate { .. } | Command::MapCreate { .. } => {}
            Command::ListInsert {
                after, id, value, ..
            } => {
                args.extend([after.to_string(), id.to_string(), escape(value)]);
            }
            Command::ListInsertRef {
                after, id, target, ..
            } => {
                args.extend([after.to_string(), id.to_string(), target.clone()]);
            }
            Command::ListPut { id, value, .. } => {
                args.extend([id.to_string(), escape(value)]);
            }
            Command::ListPutRef { id, target, .. } => {
                args.extend([id.to_string(), target.clone()]);
            }
            Command::ListDelete { id, .. } => args.push(id.to_string()),
            Command::MapPut { key, value, .. } => {
                args.extend([key.clone(), escape(value)]);
            }
            Command::MapPutRef { key, target, .. } => {
                args.extend([key.clone(), target.clone()]);
            }
            Command::MapDelete { key, .. } => args.push(key.clone()),
        }
        args
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Command::ListCreate { .. } => Opcode::ListCreate,
            Command::ListInsert { .. } => Opcode::ListInsert,
            Command::ListInsertRef { .. } => Opcode::ListInsertRef,
            Command::ListPut { .. } => Opcode::ListPut,
            Command::ListPutRef { .. } => Opcode::ListPutRef,
            Command::ListDelete { .. } => Opcode::ListDelete,
            Command::MapCreate { .. } => Opcode::MapCreate,
            Command::MapPut { .. } => Opcode::MapPut,
            Command::MapPutRef { .. } => Opcode::MapPutRef,
            Command::MapDelete { .. } => Opcode::MapDelete,
        }
    }

    pub fn doc_id(&self) -> &str {
        match self {
            Command::ListCreate { doc, .. }
            | Command::ListInsert { doc, .. }
            | Command::ListInsertRef { doc, .. }
            | Command::ListPut { doc, .. }
            | Command::ListPutRef { doc, .. }
            | Command::ListDelete { doc, .. }
            | Command::MapCreate { doc, .. }
            | Command::MapPut { doc, .. }
            | Command::MapPutRef { doc, .. }
            | Command::MapDelete { doc, .. } => doc,
        }
    }

    /// Id of the list or map the command addresses.
    pub fn object_id(&self) -> &str {
        match self {
            Command::ListCreate { list, .. }
            | Command::ListInsert { list, .. }
            | Command::ListInsertRef { list, .. }
            | Command::ListPut { list, .. }
            | Command::ListPutRef { list, .. }
            | Command::ListDelete { list, .. } => list,
            Command::MapCreate { map, .. }
            | Command::MapPut { map, .. }
            | Command::MapPutRef { map, .. }
            | Command::MapDelete { map, .. } => map,
        }
    }

    pub fn is_list(&self) -> bool {
        self.opcode().is_list()
    }
}

// ───────────────────────────── Stores ─────────────────────────────

/// Anything a command can be applied to.
pub trait Replica {
    fn doc_id(&self) -> &str;
    fn object_id(&self) -> &str;
    /// Whether this replica takes list commands (otherwise map commands).
    fn is_list(&self) -> bool;
    /// Apply a command already known to be routed here.
    fn apply_routed(&mut self, cmd: &Command) -> Result<(), CommandError>;
    /// Materialized view handed to subscribers.
    fn view(&self) -> Value;
}

/// Apply `cmd` to `store`.
///
/// Used for optimistic local writes and for forwarded commands alike.
pub fn apply<R: Replica + ?Sized>(store: &mut R, cmd: &Command) -> Result<(), CommandError> {
    if cmd.doc_id() != store.doc_id()
        || cmd.object_id() != store.object_id()
        || cmd.is_list() != store.is_list()
    {
        return Err(CommandError::Routing {
            doc: cmd.doc_id().to_string(),
            object: cmd.object_id().to_string(),
            target_doc: store.doc_id().to_string(),
            target_object: store.object_id().to_string(),
        });
    }
    store.apply_routed(cmd)
}

/// One list of one document.
#[derive(Debug, Clone)]
pub struct ListStore {
    doc_id: String,
    list_id: String,
    rga: Rga,
}

impl ListStore {
    pub fn new(doc_id: impl Into<String>, list_id: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            list_id: list_id.into(),
            rga: Rga::new(actor),
        }
    }

    /// Build a list seeded from `checkpoint`.
    ///
    /// Returns the store and whether the checkpoint knew the list.
    pub fn from_checkpoint(
        checkpoint: &DocumentCheckpoint,
        list_id: &str,
        actor: &str,
    ) -> Result<(Self, bool), CommandError> {
        let mut store = Self::new(checkpoint.id.clone(), list_id, actor);
        let known = store.merge_checkpoint(checkpoint)?;
        Ok((store, known))
    }

    /// Fill in what `checkpoint` has and this replica lacks.
    ///
    /// Returns whether the checkpoint contains this list at all.
    pub fn merge_checkpoint(&mut self, checkpoint: &DocumentCheckpoint) -> Result<bool, CommandError> {
        match checkpoint.list_entries(&self.list_id) {
            Some(entries) => {
                self.rga.merge(entries?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn rga(&self) -> &Rga {
        &self.rga
    }

    pub fn set_actor(&mut self, actor: &str) {
        self.rga.set_actor(actor);
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        let id = self.rga.id_at(index).ok()?;
        self.rga.get(&id).cloned()
    }

    pub fn to_array(&self) -> Vec<Value> {
        self.rga.to_array()
    }

    pub fn len(&self) -> usize {
        self.rga.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rga.is_empty()
    }

    fn run(&mut self, cmd: Command) -> Result<Command, CommandError> {
        apply(self, &cmd)?;
        Ok(cmd)
    }

    /// Insert so that `value` ends up at visible `index`.
    pub fn run_insert_at(&mut self, index: usize, value: Value) -> Result<Command, CommandError> {
        let len = self.rga.len();
        if index > len {
            return Err(CrdtError::IndexOutOfRange { index, len }.into());
        }
        let after = match index {
            0 => Anchor::Root,
            _ => Anchor::Node(self.rga.id_at(index - 1)?),
        };
        let id = self.rga.next_id();
        self.run(Command::ListInsert {
            doc: self.doc_id.clone(),
            list: self.list_id.clone(),
            after,
            id,
            value,
        })
    }

    /// Append each value after the rightmost element.
    pub fn run_push<I>(&mut self, values: I) -> Result<Vec<Command>, CommandError>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut cmds = Vec::new();
        for value in values {
            let after = self.rga.last_id();
            let id = self.rga.next_id();
            cmds.push(self.run(Command::ListInsert {
                doc: self.doc_id.clone(),
                list: self.list_id.clone(),
                after,
                id,
                value,
            })?);
        }
        Ok(cmds)
    }

    pub fn run_set(&mut self, index: usize, value: Value) -> Result<Command, CommandError> {
        let id = self.rga.id_at(index)?;
        self.run(Command::ListPut {
            doc: self.doc_id.clone(),
            list: self.list_id.clone(),
            id,
            value,
        })
    }

    pub fn run_delete(&mut self, index: usize) -> Result<Command, CommandError> {
        let id = self.rga.id_at(index)?;
        self.run(Command::ListDelete {
            doc: self.doc_id.clone(),
            list: self.list_id.clone(),
            id,
        })
    }
}

impl Replica for ListStore {
    fn doc_id(&self) -> &str {
        &self.doc_id
    }

    fn object_id(&self) -> &str {
        &self.list_id
    }

    fn is_list(&self) -> bool {
        true
    }

    fn apply_routed(&mut self, cmd: &Command) -> Result<(), CommandError> {
        match cmd {
            // The store exists, so creation is already done.
            Command::ListCreate { .. } => Ok(()),
            Command::ListInsert {
                after, id, value, ..
            } => {
                self.rga.insert(after.clone(), value.clone(), Some(id.clone()))?;
                Ok(())
            }
            Command::ListPut { id, value, .. } => {
                self.rga.put(id, value.clone());
                Ok(())
            }
            Command::ListDelete { id, .. } => {
                self.rga.delete(id);
                Ok(())
            }
            Command::ListInsertRef { target, .. } | Command::ListPutRef { target, .. } => Err(
                CommandError::NotImplemented(format!("list reference to '{target}'")),
            ),
            other => Err(CommandError::Protocol(format!(
                "'{}' is not a list command",
                other.opcode()
            ))),
        }
    }

    fn view(&self) -> Value {
        Value::Array(self.to_array())
    }
}

/// One map of one document.
#[derive(Debug, Clone)]
pub struct MapStore {
    doc_id: String,
    map_id: String,
    map: LwwMap,
}

impl MapStore {
    pub fn new(doc_id: impl Into<String>, map_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            map_id: map_id.into(),
            map: LwwMap::new(),
        }
    }

    /// Build a map seeded from `checkpoint`.
    pub fn from_checkpoint(checkpoint: &DocumentCheckpoint, map_id: &str) -> (Self, bool) {
        let mut store = Self::new(checkpoint.id.clone(), map_id);
        let known = store.merge_checkpoint(checkpoint);
        (store, known)
    }

    /// Fill in keys the replica lacks. Returns whether the checkpoint has
    /// this map.
    pub fn merge_checkpoint(&mut self, checkpoint: &DocumentCheckpoint) -> bool {
        match checkpoint.map_entries(&self.map_id) {
            Some(entries) => {
                self.map.merge(entries);
                true
            }
            None => false,
        }
    }

    pub fn map(&self) -> &LwwMap {
        &self.map
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.keys()
    }

    fn run(&mut self, cmd: Command) -> Result<Command, CommandError> {
        apply(self, &cmd)?;
        Ok(cmd)
    }

    /// Set `key`. `None` deletes it.
    pub fn run_set(&mut self, key: &str, value: Option<Value>) -> Result<Command, CommandError> {
        match value {
            Some(value) => self.run(Command::MapPut {
                doc: self.doc_id.clone(),
                map: self.map_id.clone(),
                key: key.to_string(),
                value,
            }),
            None => self.run_delete(key),
        }
    }

    pub fn run_delete(&mut self, key: &str) -> Result<Command, CommandError> {
        self.run(Command::MapDelete {
            doc: self.doc_id.clone(),
            map: self.map_id.clone(),
            key: key.to_string(),
        })
    }
}

impl Replica for MapStore {
    fn doc_id(&self) -> &str {
        &self.doc_id
    }

    fn object_id(&self) -> &str {
        &self.map_id
    }

    fn is_list(&self) -> bool {
        false
    }

    fn apply_routed(&mut self, cmd: &Command) -> Result<(), CommandError> {
        match cmd {
            Command::MapCreate { .. } => Ok(()),
            Command::MapPut { key, value, .. } => {
                self.map.put(key.clone(), value.clone());
                Ok(())
            }
            Command::MapDelete { key, .. } => {
                self.map.delete(key);
                Ok(())
            }
            Command::MapPutRef { target, .. } => Err(CommandError::NotImplemented(format!(
                "map reference to '{target}'"
            ))),
            other => Err(CommandError::Protocol(format!(
                "'{}' is not a map command",
                other.opcode()
            ))),
        }
    }

    fn view(&self) -> Value {
        Value::Object(self.map.to_object().into_iter().collect())
    }
}
