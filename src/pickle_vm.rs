//! Virtual machine for Python's pickle stack language.
//!
//! Executes pickle opcodes spanning protocols 0 through 5 and yields a
//! typed object tree, which the PyTorch reader walks to find tensor
//! reconstructions. No Python code is ever executed: `REDUCE`, `NEWOBJ`
//! and friends produce inert tree nodes recording what would have been
//! called.
//!
//! Items live in an arena and reference each other by index, so the
//! sharing that `PUT`/`GET`/`MEMOIZE` expresses survives as shared ids
//! rather than copies, and cyclic graphs need no ownership gymnastics.
//!
//! The machine is deliberately permissive where CPython's unpickler is
//! (for example `SETITEM` on a non-dict target), because real-world
//! checkpoint files exercise those corners.

use std::collections::HashMap;

use crate::compat::map_global;
use crate::error::PickleError;
use crate::storage::{ReadFlags, Storage};
use crate::utils;

/// Maximum size accepted for a single string/bytes payload (256 MiB).
const MAX_PICKLE_BYTES: u64 = 256 * 1024 * 1024;

/// Index of an [`Item`] within its [`ItemArena`].
pub type ItemId = usize;

/// Tag of a decoded pickle item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Unknown,
    None,
    Int,
    Float,
    Bool,
    Bytes,
    ByteArray,
    Str,
    List,
    Tuple,
    Buffer,
    FrozenSet,
    Set,
    Dict,
    Global,
    Reduce,
    Obj,
    PersId,
    Ext,
}

/// A node in the decoded object tree.
///
/// `data` holds the payload for leaves: raw bytes for string kinds,
/// stringified decimals for numeric kinds, and the dotted `module.name`
/// for globals. Containers keep ordered `children`; mappings keep
/// `dict_children` pairs. `build_state` is the side slot the `BUILD`
/// opcode fills.
#[derive(Debug, Clone)]
pub struct Item {
    pub item_type: ItemType,
    pub data: Vec<u8>,
    pub children: Vec<ItemId>,
    pub dict_children: Vec<(ItemId, ItemId)>,
    pub build_state: Option<ItemId>,
}

impl Item {
    fn empty(item_type: ItemType) -> Self {
        Item {
            item_type,
            data: Vec::new(),
            children: Vec::new(),
            dict_children: Vec::new(),
            build_state: None,
        }
    }

    fn leaf(item_type: ItemType, data: Vec<u8>) -> Self {
        Item {
            data,
            ..Item::empty(item_type)
        }
    }

    fn container(item_type: ItemType, children: Vec<ItemId>) -> Self {
        Item {
            children,
            ..Item::empty(item_type)
        }
    }

    /// The payload as UTF-8, for `Str` and `Global` items.
    pub fn as_str(&self) -> Option<&str> {
        match self.item_type {
            ItemType::Str | ItemType::Global => std::str::from_utf8(&self.data).ok(),
            _ => None,
        }
    }

    /// The payload parsed as a signed 64-bit integer.
    ///
    /// Returns `None` for non-numeric items and for bignums that do not
    /// fit; the decimal text in `data` is still exact in that case.
    pub fn as_int(&self) -> Option<i64> {
        match self.item_type {
            ItemType::Int | ItemType::Bool | ItemType::Ext => {
                std::str::from_utf8(&self.data).ok()?.parse().ok()
            }
            _ => None,
        }
    }

    /// The dotted `module.name` of a `Global` item.
    pub fn global(&self) -> Option<&str> {
        match self.item_type {
            ItemType::Global => std::str::from_utf8(&self.data).ok(),
            _ => None,
        }
    }
}

/// Arena owning every item of one decoded pickle.
#[derive(Debug, Default)]
pub struct ItemArena {
    items: Vec<Item>,
}

impl ItemArena {
    pub fn get(&self, id: ItemId) -> &Item {
        &self.items[id]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn alloc(&mut self, item: Item) -> ItemId {
        self.items.push(item);
        self.items.len() - 1
    }

    fn get_mut(&mut self, id: ItemId) -> &mut Item {
        &mut self.items[id]
    }
}

/// How the Python 2 string opcodes `S`/`T`/`U` are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringEncoding {
    /// Decode as text, like `pickle.load(..., encoding="utf-8")`.
    #[default]
    Utf8,
    /// Keep raw bytes, like `pickle.load(..., encoding="bytes")`.
    Bytes,
}

/// Caller-supplied interpreter options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PickleOptions {
    pub string_encoding: StringEncoding,
}

/// Opcode bytes, protocols 0-5.
mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const FLOAT: u8 = b'F';
    pub const BINFLOAT: u8 = b'G';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const EMPTY_LIST: u8 = b']';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const SETITEMS: u8 = b'u';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

/// Runs the pickle program in `storage` up to its `STOP` opcode.
///
/// Returns the arena and the id of the single item STOP left behind.
pub fn parse(
    storage: &mut dyn Storage,
    options: &PickleOptions,
) -> Result<(ItemArena, ItemId), PickleError> {
    let mut vm = Vm {
        storage,
        options: *options,
        arena: ItemArena::default(),
        stack: Vec::new(),
        marks: Vec::new(),
        memo: HashMap::new(),
        protocol: 0,
    };
    let root = vm.execute()?;
    Ok((vm.arena, root))
}

struct Vm<'a> {
    storage: &'a mut dyn Storage,
    options: PickleOptions,
    arena: ItemArena,
    stack: Vec<ItemId>,
    marks: Vec<usize>,
    memo: HashMap<u32, ItemId>,
    protocol: u8,
}

impl<'a> Vm<'a> {
    // ---- input primitives ----

    fn read_u8(&mut self) -> Result<u8, PickleError> {
        Ok(utils::read_u8(self.storage)?)
    }

    fn read_bytes(&mut self, count: u64) -> Result<Vec<u8>, PickleError> {
        if count > MAX_PICKLE_BYTES {
            return Err(PickleError::BadNumber(format!(
                "length {} exceeds the {} byte limit",
                count, MAX_PICKLE_BYTES
            )));
        }
        Ok(self.storage.read(count, ReadFlags::NONE)?.into_owned())
    }

    /// Reads up to and excluding the next newline; strips a trailing CR.
    fn read_line(&mut self) -> Result<Vec<u8>, PickleError> {
        let mut line = Vec::new();
        loop {
            let byte = utils::read_u8(self.storage)?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    // ---- stack primitives ----

    fn push(&mut self, item: Item) -> ItemId {
        let id = self.arena.alloc(item);
        self.stack.push(id);
        id
    }

    fn pop(&mut self) -> Result<ItemId, PickleError> {
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn top(&self) -> Result<ItemId, PickleError> {
        self.stack.last().copied().ok_or(PickleError::StackUnderflow)
    }

    fn pop_mark(&mut self) -> Result<Vec<ItemId>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark)?;
        Ok(self.stack.split_off(mark))
    }

    fn items_to_pairs(items: Vec<ItemId>) -> Result<Vec<(ItemId, ItemId)>, PickleError> {
        if items.len() % 2 != 0 {
            return Err(PickleError::StackUnderflow);
        }
        Ok(items
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
            .collect())
    }

    fn apply_compat(&self, module: String, name: String) -> (String, String) {
        if self.protocol < 3 {
            let (m, n) = map_global(&module, &name);
            (m.to_string(), n.to_string())
        } else {
            (module, name)
        }
    }

    fn global_item(module: &str, name: &str) -> Item {
        Item::leaf(ItemType::Global, format!("{}.{}", module, name).into_bytes())
    }

    // ---- main loop ----

    fn execute(&mut self) -> Result<ItemId, PickleError> {
        loop {
            let position = self.storage.current_position();
            let opcode = self.read_u8()?;
            match opcode {
                op::PROTO => {
                    self.protocol = self.read_u8()?;
                }
                op::FRAME => {
                    // Length prefix only; framing has no semantics here.
                    let _frame_len = utils::read_u64_le(self.storage)?;
                }
                op::STOP => {
                    if !self.marks.is_empty() {
                        return Err(PickleError::UnclosedMark);
                    }
                    if self.stack.len() != 1 {
                        return Err(PickleError::UnbalancedStack(self.stack.len()));
                    }
                    return Ok(self.stack[0]);
                }

                // -- stack plumbing --
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    if self.marks.last() == Some(&self.stack.len()) {
                        self.marks.pop();
                    } else {
                        self.pop()?;
                    }
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let id = self.top()?;
                    self.stack.push(id);
                }

                // -- memo --
                op::PUT => {
                    let key = self.read_decimal_line_u32()?;
                    let id = self.top()?;
                    self.memo.insert(key, id);
                }
                op::BINPUT => {
                    let key = self.read_u8()? as u32;
                    let id = self.top()?;
                    self.memo.insert(key, id);
                }
                op::LONG_BINPUT => {
                    let key = utils::read_u32_le(self.storage)?;
                    let id = self.top()?;
                    self.memo.insert(key, id);
                }
                op::MEMOIZE => {
                    let key = self.memo.len() as u32;
                    let id = self.top()?;
                    self.memo.insert(key, id);
                }
                op::GET => {
                    let key = self.read_decimal_line_u32()?;
                    self.push_memo(key)?;
                }
                op::BINGET => {
                    let key = self.read_u8()? as u32;
                    self.push_memo(key)?;
                }
                op::LONG_BINGET => {
                    let key = utils::read_u32_le(self.storage)?;
                    self.push_memo(key)?;
                }

                // -- numbers --
                op::INT => {
                    let line = self.read_line()?;
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    if text == "00" {
                        self.push(Item::leaf(ItemType::Bool, b"0".to_vec()));
                    } else if text == "01" {
                        self.push(Item::leaf(ItemType::Bool, b"1".to_vec()));
                    } else {
                        validate_decimal(&text)?;
                        self.push(Item::leaf(ItemType::Int, text.into_bytes()));
                    }
                }
                op::LONG => {
                    let line = self.read_line()?;
                    let mut text = String::from_utf8_lossy(&line).trim().to_string();
                    if text.ends_with('L') || text.ends_with('l') {
                        text.pop();
                    }
                    validate_decimal(&text)?;
                    self.push(Item::leaf(ItemType::Int, text.into_bytes()));
                }
                op::BININT => {
                    let value = utils::read_u32_le(self.storage)? as i32;
                    self.push(Item::leaf(ItemType::Int, value.to_string().into_bytes()));
                }
                op::BININT1 => {
                    let value = self.read_u8()?;
                    self.push(Item::leaf(ItemType::Int, value.to_string().into_bytes()));
                }
                op::BININT2 => {
                    let value = utils::read_u16_le(self.storage)?;
                    self.push(Item::leaf(ItemType::Int, value.to_string().into_bytes()));
                }
                op::LONG1 => {
                    let count = self.read_u8()? as u64;
                    let bytes = self.read_bytes(count)?;
                    let text = long_to_decimal(&bytes);
                    self.push(Item::leaf(ItemType::Int, text.into_bytes()));
                }
                op::LONG4 => {
                    let count = utils::read_u32_le(self.storage)? as u64;
                    let bytes = self.read_bytes(count)?;
                    let text = long_to_decimal(&bytes);
                    self.push(Item::leaf(ItemType::Int, text.into_bytes()));
                }
                op::FLOAT => {
                    let line = self.read_line()?;
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    text.parse::<f64>()
                        .map_err(|_| PickleError::BadNumber(text.clone()))?;
                    self.push(Item::leaf(ItemType::Float, text.into_bytes()));
                }
                op::BINFLOAT => {
                    let bytes = self.read_bytes(8)?;
                    let value = f64::from_be_bytes(bytes.as_slice().try_into().unwrap());
                    self.push(Item::leaf(ItemType::Float, value.to_string().into_bytes()));
                }

                // -- constants --
                op::NONE => {
                    self.push(Item::empty(ItemType::None));
                }
                op::NEWTRUE => {
                    self.push(Item::leaf(ItemType::Bool, b"1".to_vec()));
                }
                op::NEWFALSE => {
                    self.push(Item::leaf(ItemType::Bool, b"0".to_vec()));
                }

                // -- strings and bytes --
                op::STRING => {
                    let line = self.read_line()?;
                    let bytes = unescape_string(&line)?;
                    self.push_py2_string(bytes);
                }
                op::BINSTRING => {
                    let count = utils::read_u32_le(self.storage)? as u64;
                    let bytes = self.read_bytes(count)?;
                    self.push_py2_string(bytes);
                }
                op::SHORT_BINSTRING => {
                    let count = self.read_u8()? as u64;
                    let bytes = self.read_bytes(count)?;
                    self.push_py2_string(bytes);
                }
                op::UNICODE => {
                    let line = self.read_line()?;
                    let bytes = unescape_raw_unicode(&line)?;
                    self.push(Item::leaf(ItemType::Str, bytes));
                }
                op::BINUNICODE => {
                    let count = utils::read_u32_le(self.storage)? as u64;
                    let bytes = self.read_bytes(count)?;
                    self.push(Item::leaf(ItemType::Str, bytes));
                }
                op::SHORT_BINUNICODE => {
                    let count = self.read_u8()? as u64;
                    let bytes = self.read_bytes(count)?;
                    self.push(Item::leaf(ItemType::Str, bytes));
                }
                op::BINUNICODE8 => {
                    let count = utils::read_u64_le(self.storage)?;
                    let bytes = self.read_bytes(count)?;
                    self.push(Item::leaf(ItemType::Str, bytes));
                }
                op::SHORT_BINBYTES => {
                    let count = self.read_u8()? as u64;
                    let bytes = self.read_bytes(count)?;
                    self.push(Item::leaf(ItemType::Bytes, bytes));
                }
                op::BINBYTES => {
                    let count = utils::read_u32_le(self.storage)? as u64;
                    let bytes = self.read_bytes(count)?;
                    self.push(Item::leaf(ItemType::Bytes, bytes));
                }
                op::BINBYTES8 => {
                    let count = utils::read_u64_le(self.storage)?;
                    let bytes = self.read_bytes(count)?;
                    self.push(Item::leaf(ItemType::Bytes, bytes));
                }
                op::BYTEARRAY8 => {
                    let count = utils::read_u64_le(self.storage)?;
                    let bytes = self.read_bytes(count)?;
                    self.push(Item::leaf(ItemType::ByteArray, bytes));
                }

                // -- containers --
                op::EMPTY_LIST => {
                    self.push(Item::empty(ItemType::List));
                }
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.push(Item::container(ItemType::List, items));
                }
                op::EMPTY_TUPLE => {
                    self.push(Item::empty(ItemType::Tuple));
                }
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.push(Item::container(ItemType::Tuple, items));
                }
                op::TUPLE1 => {
                    let a = self.pop()?;
                    self.push(Item::container(ItemType::Tuple, vec![a]));
                }
                op::TUPLE2 => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Item::container(ItemType::Tuple, vec![a, b]));
                }
                op::TUPLE3 => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Item::container(ItemType::Tuple, vec![a, b, c]));
                }
                op::EMPTY_DICT => {
                    self.push(Item::empty(ItemType::Dict));
                }
                op::DICT => {
                    let items = self.pop_mark()?;
                    let pairs = Self::items_to_pairs(items)?;
                    let mut item = Item::empty(ItemType::Dict);
                    item.dict_children = pairs;
                    self.push(item);
                }
                op::EMPTY_SET => {
                    self.push(Item::empty(ItemType::Set));
                }
                op::FROZENSET => {
                    let items = self.pop_mark()?;
                    self.push(Item::container(ItemType::FrozenSet, items));
                }
                op::ADDITEMS => {
                    let items = self.pop_mark()?;
                    let target = self.top()?;
                    self.arena.get_mut(target).children.extend(items);
                }

                // -- graph building --
                op::APPEND => {
                    let value = self.pop()?;
                    let target = self.top()?;
                    if self.arena.get(target).item_type != ItemType::List {
                        return Err(PickleError::TypeMismatch {
                            opcode: "APPEND",
                            expected: "list",
                        });
                    }
                    self.arena.get_mut(target).children.push(value);
                }
                op::APPENDS => {
                    let items = self.pop_mark()?;
                    let target = self.top()?;
                    if self.arena.get(target).item_type != ItemType::List {
                        return Err(PickleError::TypeMismatch {
                            opcode: "APPENDS",
                            expected: "list",
                        });
                    }
                    self.arena.get_mut(target).children.extend(items);
                }
                // SETITEM(S) accept any target item, matching the lenient
                // handling real checkpoint files rely on (OrderedDict
                // reduces receive their entries this way).
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    let target = self.top()?;
                    self.arena.get_mut(target).dict_children.push((key, value));
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = Self::items_to_pairs(items)?;
                    let target = self.top()?;
                    self.arena.get_mut(target).dict_children.extend(pairs);
                }
                op::BUILD => {
                    let state = self.pop()?;
                    let target = self.top()?;
                    self.arena.get_mut(target).build_state = Some(state);
                }

                // -- construction --
                op::GLOBAL => {
                    let module_line = self.read_line()?;
                    let name_line = self.read_line()?;
                    let module = String::from_utf8_lossy(&module_line).into_owned();
                    let name = String::from_utf8_lossy(&name_line).into_owned();
                    let (module, name) = self.apply_compat(module, name);
                    self.push(Self::global_item(&module, &name));
                }
                op::STACK_GLOBAL => {
                    let name_id = self.pop()?;
                    let module_id = self.pop()?;
                    let module = self
                        .arena
                        .get(module_id)
                        .as_str()
                        .ok_or(PickleError::TypeMismatch {
                            opcode: "STACK_GLOBAL",
                            expected: "str",
                        })?
                        .to_string();
                    let name = self
                        .arena
                        .get(name_id)
                        .as_str()
                        .ok_or(PickleError::TypeMismatch {
                            opcode: "STACK_GLOBAL",
                            expected: "str",
                        })?
                        .to_string();
                    let (module, name) = self.apply_compat(module, name);
                    self.push(Self::global_item(&module, &name));
                }
                op::INST => {
                    let module_line = self.read_line()?;
                    let name_line = self.read_line()?;
                    let module = String::from_utf8_lossy(&module_line).into_owned();
                    let name = String::from_utf8_lossy(&name_line).into_owned();
                    let (module, name) = self.apply_compat(module, name);
                    let args = self.pop_mark()?;
                    let global_id = self.arena.alloc(Self::global_item(&module, &name));
                    let mut children = vec![global_id];
                    children.extend(args);
                    self.push(Item::container(ItemType::Obj, children));
                }
                op::OBJ => {
                    let items = self.pop_mark()?;
                    if items.is_empty() {
                        return Err(PickleError::StackUnderflow);
                    }
                    self.push(Item::container(ItemType::Obj, items));
                }
                op::NEWOBJ => {
                    // The class argument is not validated as callable.
                    let args = self.pop()?;
                    let class = self.pop()?;
                    self.push(Item::container(ItemType::Obj, vec![class, args]));
                }
                op::NEWOBJ_EX => {
                    let kwargs = self.pop()?;
                    let args = self.pop()?;
                    let class = self.pop()?;
                    self.push(Item::container(ItemType::Obj, vec![class, args, kwargs]));
                }
                op::REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let item = self.reduce(callable, args);
                    let id = self.arena.alloc(item);
                    self.stack.push(id);
                }
                op::PERSID => {
                    let line = self.read_line()?;
                    let pid = self.arena.alloc(Item::leaf(ItemType::Str, line));
                    self.push(Item::container(ItemType::PersId, vec![pid]));
                }
                op::BINPERSID => {
                    let pid = self.pop()?;
                    self.push(Item::container(ItemType::PersId, vec![pid]));
                }
                op::EXT1 => {
                    let code = self.read_u8()? as u32;
                    self.push(Item::leaf(ItemType::Ext, code.to_string().into_bytes()));
                }
                op::EXT2 => {
                    let code = utils::read_u16_le(self.storage)? as u32;
                    self.push(Item::leaf(ItemType::Ext, code.to_string().into_bytes()));
                }
                op::EXT4 => {
                    let code = utils::read_u32_le(self.storage)?;
                    self.push(Item::leaf(ItemType::Ext, code.to_string().into_bytes()));
                }

                // -- out-of-band buffers --
                op::NEXT_BUFFER => {
                    self.push(Item::empty(ItemType::Buffer));
                }
                op::READONLY_BUFFER => {
                    // Wraps the top of stack in a fresh buffer item, with
                    // no type checking on what is being wrapped.
                    let inner = self.pop()?;
                    self.push(Item::container(ItemType::Buffer, vec![inner]));
                }

                other => {
                    return Err(PickleError::UnknownOpcode {
                        opcode: other,
                        position,
                    });
                }
            }
        }
    }

    fn push_memo(&mut self, key: u32) -> Result<(), PickleError> {
        let id = *self.memo.get(&key).ok_or(PickleError::MissingMemo(key))?;
        self.stack.push(id);
        Ok(())
    }

    fn push_py2_string(&mut self, bytes: Vec<u8>) {
        let item_type = match self.options.string_encoding {
            StringEncoding::Utf8 => ItemType::Str,
            StringEncoding::Bytes => ItemType::Bytes,
        };
        self.push(Item::leaf(item_type, bytes));
    }

    fn read_decimal_line_u32(&mut self) -> Result<u32, PickleError> {
        let line = self.read_line()?;
        let text = String::from_utf8_lossy(&line);
        text.trim()
            .parse::<u32>()
            .map_err(|_| PickleError::BadNumber(text.into_owned()))
    }

    /// Builds the item for a `REDUCE`.
    ///
    /// `copyreg._reconstructor(cls, builtins.object, None)` is rewritten
    /// to a plain `Obj` of `cls` with no arguments; every other reduce is
    /// kept as-is.
    fn reduce(&mut self, callable: ItemId, args: ItemId) -> Item {
        if self.arena.get(callable).global() == Some("copyreg._reconstructor") {
            let arg_item = self.arena.get(args);
            if arg_item.item_type == ItemType::Tuple && arg_item.children.len() == 3 {
                let class_id = arg_item.children[0];
                let base = self.arena.get(arg_item.children[1]);
                let state = self.arena.get(arg_item.children[2]);
                if self.arena.get(class_id).item_type == ItemType::Global
                    && base.global() == Some("builtins.object")
                    && state.item_type == ItemType::None
                {
                    let empty_args = self.arena.alloc(Item::empty(ItemType::Tuple));
                    return Item::container(ItemType::Obj, vec![class_id, empty_args]);
                }
            }
        }
        Item::container(ItemType::Reduce, vec![callable, args])
    }
}

fn validate_decimal(text: &str) -> Result<(), PickleError> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PickleError::BadNumber(text.to_string()));
    }
    Ok(())
}

/// Decodes a little-endian two's-complement bignum of arbitrary width to
/// its decimal representation.
fn long_to_decimal(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }
    let negative = bytes[bytes.len() - 1] & 0x80 != 0;
    let mut magnitude = bytes.to_vec();
    if negative {
        // Two's complement: magnitude = !x + 1 over the byte vector.
        for byte in &mut magnitude {
            *byte = !*byte;
        }
        let mut carry = 1u8;
        for byte in &mut magnitude {
            let (sum, overflow) = byte.overflowing_add(carry);
            *byte = sum;
            carry = u8::from(overflow);
            if carry == 0 {
                break;
            }
        }
    }
    while magnitude.last() == Some(&0) {
        magnitude.pop();
    }
    // Repeated division by 10 over the base-256 digits.
    let mut digits = Vec::new();
    while !magnitude.is_empty() {
        let mut remainder = 0u32;
        for byte in magnitude.iter_mut().rev() {
            let current = (remainder << 8) | *byte as u32;
            *byte = (current / 10) as u8;
            remainder = current % 10;
        }
        digits.push(b'0' + remainder as u8);
        while magnitude.last() == Some(&0) {
            magnitude.pop();
        }
    }
    if digits.is_empty() {
        digits.push(b'0');
    }
    let mut out = String::with_capacity(digits.len() + 1);
    if negative && digits != [b'0'] {
        out.push('-');
    }
    for digit in digits.iter().rev() {
        out.push(*digit as char);
    }
    out
}

/// Undoes the escaping of a protocol-0 `S` string literal.
fn unescape_string(line: &[u8]) -> Result<Vec<u8>, PickleError> {
    if line.len() < 2 {
        return Err(PickleError::BadString(
            "string literal shorter than its quotes".to_string(),
        ));
    }
    let quote = line[0];
    if quote != b'\'' && quote != b'"' {
        return Err(PickleError::BadString(
            "string literal is not quoted".to_string(),
        ));
    }
    if line[line.len() - 1] != quote {
        return Err(PickleError::BadString(
            "unterminated string literal".to_string(),
        ));
    }
    let inner = &line[1..line.len() - 1];
    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        let byte = inner[i];
        if byte == quote {
            return Err(PickleError::BadString(
                "unescaped quote inside string literal".to_string(),
            ));
        }
        if byte != b'\\' {
            out.push(byte);
            i += 1;
            continue;
        }
        let escape = *inner
            .get(i + 1)
            .ok_or_else(|| PickleError::BadString("dangling backslash".to_string()))?;
        match escape {
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'0' => out.push(0),
            b'x' => {
                let hex = inner.get(i + 2..i + 4).ok_or_else(|| {
                    PickleError::BadString("truncated \\x escape".to_string())
                })?;
                let text = std::str::from_utf8(hex)
                    .ok()
                    .filter(|t| t.bytes().all(|b| b.is_ascii_hexdigit()))
                    .ok_or_else(|| {
                        PickleError::BadString("invalid \\x escape".to_string())
                    })?;
                out.push(u8::from_str_radix(text, 16).unwrap());
                i += 4;
                continue;
            }
            other => {
                return Err(PickleError::BadString(format!(
                    "unsupported escape \\{}",
                    other as char
                )));
            }
        }
        i += 2;
    }
    Ok(out)
}

/// Decodes a `V` line in raw-unicode-escape: only `\uXXXX` and
/// `\UXXXXXXXX` are escapes, a lone backslash stays literal.
fn unescape_raw_unicode(line: &[u8]) -> Result<Vec<u8>, PickleError> {
    let mut out = Vec::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let byte = line[i];
        if byte == b'\\' && i + 1 < line.len() {
            let (digits, skip) = match line[i + 1] {
                b'u' => (4usize, 6usize),
                b'U' => (8, 10),
                _ => {
                    out.push(byte);
                    i += 1;
                    continue;
                }
            };
            let hex = line.get(i + 2..i + 2 + digits).ok_or_else(|| {
                PickleError::BadString("truncated unicode escape".to_string())
            })?;
            let text = std::str::from_utf8(hex)
                .ok()
                .filter(|t| t.bytes().all(|b| b.is_ascii_hexdigit()))
                .ok_or_else(|| PickleError::BadString("invalid unicode escape".to_string()))?;
            let code = u32::from_str_radix(text, 16).unwrap();
            let ch = char::from_u32(code).ok_or_else(|| {
                PickleError::BadString(format!("invalid code point {:#x}", code))
            })?;
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            i += skip;
        } else {
            out.push(byte);
            i += 1;
        }
    }
    Ok(out)
}
