//! PyTorch checkpoint parser.
//!
//! A `.pt` file is a stored-only ZIP whose first member
//! `<prefix>/data.pkl` pickles the saved object graph; raw tensor bytes
//! live in sibling members `<prefix>/data/<storage_key>`. This reader
//! runs the pickle VM over the first member, walks the resulting tree for
//! `torch._utils._rebuild_tensor_v2`/`_v3` reductions, groups the tensors
//! by storage key, and then surfaces one buffer per storage member in the
//! ZIP's own order.

use std::borrow::Cow;
use std::collections::HashMap;

use log::debug;

use crate::error::{Error, StorageError};
use crate::models::{TensorInfo, ValueType};
use crate::pickle_vm::{self, Item, ItemArena, ItemId, ItemType, PickleOptions};
use crate::reader::TensorReader;
use crate::storage::{ReadFlags, Storage};
use crate::zip_reader::ZipReader;

const MAX_WALK_DEPTH: usize = 128;

/// Element type for a `torch.*Storage` class name.
fn storage_class_to_value_type(global: &str) -> ValueType {
    let class = global.rsplit('.').next().unwrap_or(global);
    match class {
        "DoubleStorage" => ValueType::F64,
        "FloatStorage" => ValueType::F32,
        "HalfStorage" => ValueType::F16,
        "BFloat16Storage" => ValueType::BF16,
        "LongStorage" => ValueType::I64,
        "IntStorage" => ValueType::I32,
        "ShortStorage" => ValueType::I16,
        "CharStorage" => ValueType::I8,
        "ByteStorage" => ValueType::U8,
        "BoolStorage" => ValueType::Bool,
        "ComplexFloatStorage" => ValueType::ComplexF32,
        "ComplexDoubleStorage" => ValueType::ComplexF64,
        "ComplexHalfStorage" => ValueType::ComplexF16,
        _ => ValueType::Unknown,
    }
}

/// Element type for a `torch.<dtype>` global, as passed to
/// `_rebuild_tensor_v3`.
fn dtype_global_to_value_type(global: &str) -> ValueType {
    match global {
        "torch.float64" | "torch.double" => ValueType::F64,
        "torch.float32" | "torch.float" => ValueType::F32,
        "torch.float16" | "torch.half" => ValueType::F16,
        "torch.bfloat16" => ValueType::BF16,
        "torch.uint8" => ValueType::U8,
        "torch.uint16" => ValueType::U16,
        "torch.uint32" => ValueType::U32,
        "torch.uint64" => ValueType::U64,
        "torch.int8" => ValueType::I8,
        "torch.int16" | "torch.short" => ValueType::I16,
        "torch.int32" | "torch.int" => ValueType::I32,
        "torch.int64" | "torch.long" => ValueType::I64,
        "torch.bool" => ValueType::Bool,
        "torch.float8_e4m3fn" => ValueType::F8E4M3,
        "torch.float8_e5m2" => ValueType::F8E5M2,
        "torch.complex32" | "torch.chalf" => ValueType::ComplexF16,
        "torch.complex64" | "torch.cfloat" => ValueType::ComplexF32,
        "torch.complex128" | "torch.cdouble" => ValueType::ComplexF64,
        _ => ValueType::Unknown,
    }
}

/// Tensors grouped under one pickle storage key.
struct StorageGroup {
    key: String,
    size: u64,
    tensors: Vec<TensorInfo>,
    seen: bool,
}

impl std::fmt::Debug for PyTorchReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyTorchReader").finish_non_exhaustive()
    }
}

/// Reader for PyTorch `.pt` checkpoints.
pub struct PyTorchReader {
    zip: ZipReader,
    prefix: String,
    groups: Vec<StorageGroup>,
    index: HashMap<String, usize>,
    current: Option<usize>,
    member_size: u64,
    finished: bool,
}

impl PyTorchReader {
    /// Opens a checkpoint with UTF-8 interpretation of legacy strings.
    pub fn new(storage: Box<dyn Storage>) -> Result<Self, Error> {
        Self::with_options(storage, &PickleOptions::default())
    }

    /// Opens a checkpoint with explicit pickle options.
    pub fn with_options(
        storage: Box<dyn Storage>,
        options: &PickleOptions,
    ) -> Result<Self, Error> {
        let mut zip = ZipReader::new(storage)?;
        let first = zip
            .read_next_file()?
            .ok_or_else(|| Error::InvalidFileStructure("empty PyTorch archive".to_string()))?;
        let filename = first.filename.clone();
        let prefix = match filename.strip_suffix("data.pkl") {
            Some(head) if head.is_empty() || head.ends_with('/') => head.to_string(),
            _ => return Err(Error::UnexpectedPickleEntry(filename)),
        };
        debug!("pytorch: archive prefix '{}'", prefix);

        let (arena, root) = pickle_vm::parse(&mut zip, options)?;

        let mut walker = Walker {
            arena: &arena,
            groups: Vec::new(),
            index: HashMap::new(),
        };
        walker.walk(root, String::new(), 0)?;
        let mut groups = walker.groups;
        let index = walker.index;
        for group in &mut groups {
            group.tensors.sort_by_key(|t| t.offset_start);
        }
        debug!(
            "pytorch: {} storages, {} tensors",
            groups.len(),
            groups.iter().map(|g| g.tensors.len()).sum::<usize>()
        );

        Ok(PyTorchReader {
            zip,
            prefix,
            groups,
            index,
            current: None,
            member_size: 0,
            finished: false,
        })
    }
}

/// Pickle-tree traversal collecting tensor reductions.
struct Walker<'a> {
    arena: &'a ItemArena,
    groups: Vec<StorageGroup>,
    index: HashMap<String, usize>,
}

impl<'a> Walker<'a> {
    fn item(&self, id: ItemId) -> &'a Item {
        self.arena.get(id)
    }

    fn child_name(prefix: &str, component: &str) -> String {
        if prefix.is_empty() {
            component.to_string()
        } else {
            format!("{}.{}", prefix, component)
        }
    }

    fn walk(&mut self, id: ItemId, name: String, depth: usize) -> Result<(), Error> {
        if depth > MAX_WALK_DEPTH {
            return Err(Error::InvalidFileStructure(format!(
                "pickle object graph deeper than {} levels",
                MAX_WALK_DEPTH
            )));
        }
        let item = self.item(id);
        match item.item_type {
            ItemType::Dict => self.walk_entries(item, name, depth),
            ItemType::Reduce => {
                let callable = item
                    .children
                    .first()
                    .map(|&c| self.item(c).global().unwrap_or(""))
                    .unwrap_or("");
                match callable {
                    "collections.OrderedDict" => self.walk_entries(item, name, depth),
                    "torch._utils._rebuild_tensor_v2" => self.register_tensor(item, name, false),
                    "torch._utils._rebuild_tensor_v3" => self.register_tensor(item, name, true),
                    _ => Ok(()),
                }
            }
            ItemType::List | ItemType::Tuple => {
                for (position, &child) in item.children.iter().enumerate() {
                    let child_name = Self::child_name(&name, &position.to_string());
                    self.walk(child, child_name, depth + 1)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn walk_entries(&mut self, item: &'a Item, name: String, depth: usize) -> Result<(), Error> {
        for &(key, value) in &item.dict_children {
            let key_item = self.item(key);
            let key_text = key_item.as_str().ok_or_else(|| {
                Error::InvalidFileStructure(format!(
                    "non-string key in saved dict under '{}'",
                    if name.is_empty() { "<root>" } else { &name }
                ))
            })?;
            let child_name = Self::child_name(&name, key_text);
            self.walk(value, child_name, depth + 1)?;
        }
        Ok(())
    }

    /// Decodes one `_rebuild_tensor_v2`/`_v3` reduction.
    fn register_tensor(&mut self, item: &'a Item, name: String, v3: bool) -> Result<(), Error> {
        let malformed = |detail: &str| {
            Error::InvalidFileStructure(format!("tensor '{}': {}", name, detail))
        };
        let args_id = *item
            .children
            .get(1)
            .ok_or_else(|| malformed("reduce has no argument tuple"))?;
        let args = self.item(args_id);
        if args.item_type != ItemType::Tuple || args.children.len() < 4 {
            return Err(malformed("argument tuple is too short"));
        }

        // Argument 0 is a persistent id carrying the storage tuple
        // ("storage", element_global, storage_key, device, num_elements).
        let persid = self.item(args.children[0]);
        if persid.item_type != ItemType::PersId {
            return Err(malformed("first argument is not a persistent id"));
        }
        let storage_tuple = self.item(
            *persid
                .children
                .first()
                .ok_or_else(|| malformed("empty persistent id"))?,
        );
        if storage_tuple.children.len() < 5
            || self.item(storage_tuple.children[0]).as_str() != Some("storage")
        {
            return Err(malformed("persistent id is not a storage tuple"));
        }
        let element_global = self
            .item(storage_tuple.children[1])
            .global()
            .ok_or_else(|| malformed("storage tuple has no element type global"))?;
        let storage_key = self
            .item(storage_tuple.children[2])
            .as_str()
            .ok_or_else(|| malformed("storage key is not a string"))?
            .to_string();
        let num_elements = self
            .item(storage_tuple.children[4])
            .as_int()
            .filter(|&n| n >= 0)
            .ok_or_else(|| malformed("storage element count is not an integer"))?
            as u64;

        let mut value_type = storage_class_to_value_type(element_global);
        if v3 {
            // _rebuild_tensor_v3 carries the real dtype as argument 7.
            let dtype_global = self
                .item(
                    *args
                        .children
                        .get(6)
                        .ok_or_else(|| malformed("v3 reduce has no dtype argument"))?,
                )
                .global()
                .ok_or_else(|| malformed("v3 dtype argument is not a global"))?;
            value_type = dtype_global_to_value_type(dtype_global);
        }

        let element_offset = self
            .item(args.children[1])
            .as_int()
            .filter(|&n| n >= 0)
            .ok_or_else(|| malformed("storage offset is not an integer"))? as u64;
        let shape = self.int_tuple(args.children[2], &name)?;
        let stride = self.int_tuple(args.children[3], &name)?;

        let offset_start = element_offset
            .checked_mul(value_type.element_size())
            .ok_or_else(|| Error::SizeOverflow { name: name.clone() })?;
        let info = TensorInfo::from_strides(name.clone(), value_type, shape, stride, offset_start)?;

        let group_index = match self.index.get(&storage_key) {
            Some(&existing) => existing,
            None => {
                let size = num_elements
                    .checked_mul(value_type.element_size())
                    .ok_or_else(|| Error::SizeOverflow { name: name.clone() })?;
                self.groups.push(StorageGroup {
                    key: storage_key.clone(),
                    size,
                    tensors: Vec::new(),
                    seen: false,
                });
                self.index.insert(storage_key.clone(), self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        let group = &mut self.groups[group_index];
        if info.end_offset() > group.size {
            return Err(Error::InvalidFileStructure(format!(
                "tensor '{}' ends at byte {} but storage '{}' holds {}",
                info.name,
                info.end_offset(),
                group.key,
                group.size
            )));
        }
        group.tensors.push(info);
        Ok(())
    }

    fn int_tuple(&self, id: ItemId, name: &str) -> Result<Vec<u64>, Error> {
        let item = self.item(id);
        if item.item_type != ItemType::Tuple {
            return Err(Error::InvalidFileStructure(format!(
                "tensor '{}': expected a tuple of integers",
                name
            )));
        }
        item.children
            .iter()
            .map(|&child| {
                self.item(child).as_int().filter(|&n| n >= 0).map(|n| n as u64)
            })
            .collect::<Option<Vec<u64>>>()
            .ok_or_else(|| {
                Error::InvalidFileStructure(format!(
                    "tensor '{}': tuple holds a non-integer",
                    name
                ))
            })
    }
}

impl TensorReader for PyTorchReader {
    fn read_next_buffer(&mut self) -> Result<bool, Error> {
        if self.finished {
            return Ok(false);
        }
        let data_prefix = format!("{}data/", self.prefix);
        loop {
            let next = match self.zip.read_next_file()? {
                Some(entry) => Some((
                    entry.filename.clone(),
                    entry.has_length,
                    entry.uncompressed_size,
                )),
                None => None,
            };
            let Some((filename, has_length, member_size)) = next else {
                break;
            };
            let Some(key) = filename.strip_prefix(&data_prefix) else {
                continue;
            };
            let Some(&group_index) = self.index.get(key) else {
                continue;
            };
            self.groups[group_index].seen = true;
            self.current = Some(group_index);
            self.member_size = if has_length {
                member_size
            } else {
                self.groups[group_index].size
            };
            return Ok(true);
        }
        self.finished = true;
        self.current = None;
        if let Some(missing) = self.groups.iter().find(|g| !g.seen) {
            return Err(Error::MissingStorage(missing.key.clone()));
        }
        Ok(false)
    }

    fn tensors_in_buffer(&self) -> &[TensorInfo] {
        match self.current {
            Some(index) => &self.groups[index].tensors,
            None => &[],
        }
    }

    fn buffer_size(&self) -> u64 {
        match self.current {
            Some(_) => self.member_size,
            None => 0,
        }
    }

    fn read(&mut self, length: u64, flags: ReadFlags) -> Result<Cow<'_, [u8]>, Error> {
        let remaining = match self.current {
            Some(_) => self.member_size.saturating_sub(self.zip.current_position()),
            None => 0,
        };
        let clamped = length.min(remaining);
        if clamped == 0 {
            if length > 0 && !flags.allow_empty && !flags.allow_partial {
                return Err(StorageError::UnexpectedEof.into());
            }
            return Ok(Cow::Borrowed(&[]));
        }
        Ok(self.zip.read(clamped, flags)?)
    }

    fn read_all_tensor_infos(&mut self) -> Result<Vec<TensorInfo>, Error> {
        let mut infos = Vec::new();
        while self.read_next_buffer()? {
            let index = self.current.expect("buffer is current");
            infos.extend(
                self.groups[index]
                    .tensors
                    .iter()
                    .map(TensorInfo::with_unknown_offset),
            );
        }
        Ok(infos)
    }
}
