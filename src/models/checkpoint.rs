//! Reader for `torch.save` checkpoints
//!
//! Both containers PyTorch has written are understood: the zip archive used
//! since 1.6 (`<prefix>/data.pkl` plus one `<prefix>/data/<key>` entry per
//! storage) and the older flat stream (magic number, protocol version,
//! system info, the pickled object, the list of storage keys, then each
//! storage as an element count followed by its raw bytes).
//!
//! Dictionaries keep their pickled order, which positional renaming of
//! off-the-shelf weights relies on.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use candle_core::{Device, Tensor};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const PICKLE_PROTO: u8 = 0x80;
/// 0x1950a86a20f9469cfc6c as written by LONG1
const LEGACY_MAGIC: [u8; 10] = [0x6c, 0xfc, 0x9c, 0x46, 0xf9, 0x20, 0x6a, 0xa8, 0x50, 0x19];
const LEGACY_PROTOCOL: i64 = 1001;

/// Element type of a pickled storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageKind {
	F32,
	F64,
	F16,
	BF16,
	I64,
	I32,
	I16,
	I8,
	U8,
	Bool,
}

impl StorageKind {
	fn from_class(name: &str) -> Option<Self> {
		Some(match name {
			"FloatStorage" => Self::F32,
			"DoubleStorage" => Self::F64,
			"HalfStorage" => Self::F16,
			"BFloat16Storage" => Self::BF16,
			"LongStorage" => Self::I64,
			"IntStorage" => Self::I32,
			"ShortStorage" => Self::I16,
			"CharStorage" => Self::I8,
			"ByteStorage" => Self::U8,
			"BoolStorage" => Self::Bool,
			_ => return None,
		})
	}

	fn size(self) -> usize {
		match self {
			Self::F64 | Self::I64 => 8,
			Self::F32 | Self::I32 => 4,
			Self::F16 | Self::BF16 | Self::I16 => 2,
			Self::I8 | Self::U8 | Self::Bool => 1,
		}
	}

	fn is_float(self) -> bool {
		matches!(self, Self::F32 | Self::F64 | Self::F16 | Self::BF16)
	}
}

#[derive(Debug, Clone, PartialEq)]
struct Storage {
	key: String,
	kind: StorageKind,
	/// Element offset of a legacy storage view into its root storage
	view_offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct TensorRef {
	storage: Storage,
	offset: usize,
	shape: Vec<usize>,
	stride: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
enum Object {
	Mark,
	Class { module: String, name: String },
	Str(String),
	Bytes(Vec<u8>),
	Int(i64),
	/// Integer wider than 64 bits, little-endian two's complement
	Long(Vec<u8>),
	Float(f64),
	Bool(bool),
	None,
	Tuple(Vec<Object>),
	List(Vec<Object>),
	Dict(Vec<(Object, Object)>),
	Storage(Storage),
	Tensor(TensorRef),
	Reduce { callable: Box<Object>, args: Box<Object> },
	Build { target: Box<Object>, state: Box<Object> },
}

impl Object {
	fn int(&self) -> Option<i64> {
		match self {
			Self::Int(v) => Some(*v),
			Self::Bool(v) => Some(*v as i64),
			_ => None,
		}
	}

	fn usizes(&self) -> Option<Vec<usize>> {
		match self {
			Self::Tuple(items) | Self::List(items) => items
				.iter()
				.map(|o| o.int().and_then(|v| usize::try_from(v).ok()))
				.collect(),
			_ => None,
		}
	}

	fn into_items(self) -> Option<Vec<Object>> {
		match self {
			Self::Tuple(items) | Self::List(items) => Some(items),
			_ => None,
		}
	}
}

/// Pickle virtual machine, restricted to what `torch.save` emits
#[derive(Default)]
struct Unpickler {
	stack: Vec<Object>,
	memo: HashMap<u32, Object>,
}

impl Unpickler {
	/// Run one pickle up to its STOP opcode and return the top object
	fn load<R: BufRead>(r: &mut R) -> Result<Object> {
		let mut machine = Self::default();
		loop {
			let op = r.read_u8().context("Pickle ended before STOP")?;
			if !machine.step(op, r)? {
				break;
			}
		}
		machine.pop()
	}

	fn pop(&mut self) -> Result<Object> {
		self.stack.pop().context("Pickle stack underflow")
	}

	fn top(&mut self) -> Result<&mut Object> {
		self.stack.last_mut().context("Pickle stack underflow")
	}

	/// Objects pushed since the last MARK, which is removed
	fn pop_to_mark(&mut self) -> Result<Vec<Object>> {
		let mark = self
			.stack
			.iter()
			.rposition(|o| matches!(o, Object::Mark))
			.context("Pickle MARK not found")?;
		let items = self.stack.split_off(mark + 1);
		self.stack.pop();
		Ok(items)
	}

	fn memoize(&mut self, index: u32) -> Result<()> {
		let top = self.stack.last().context("Pickle stack underflow")?.clone();
		self.memo.insert(index, top);
		Ok(())
	}

	fn recall(&mut self, index: u32) -> Result<()> {
		let object = self
			.memo
			.get(&index)
			.with_context(|| format!("Pickle memo {} is unset", index))?
			.clone();
		self.stack.push(object);
		Ok(())
	}

	/// Execute one opcode; false once STOP is reached
	fn step<R: BufRead>(&mut self, op: u8, r: &mut R) -> Result<bool> {
		match op {
			b'.' => return Ok(false),
			0x80 => {
				r.read_u8()?;
			}
			0x95 => {
				r.read_u64::<LittleEndian>()?;
			}
			b'(' => self.stack.push(Object::Mark),
			b'0' => {
				self.pop()?;
			}
			b'1' => {
				self.pop_to_mark()?;
			}
			b'c' => {
				let module = read_line(r)?;
				let name = read_line(r)?;
				self.stack.push(Object::Class { module, name });
			}
			0x93 => {
				let name = self.pop()?;
				let module = self.pop()?;
				match (module, name) {
					(Object::Str(module), Object::Str(name)) => self.stack.push(Object::Class { module, name }),
					_ => bail!("STACK_GLOBAL expects two strings"),
				}
			}
			b'N' => self.stack.push(Object::None),
			0x88 => self.stack.push(Object::Bool(true)),
			0x89 => self.stack.push(Object::Bool(false)),
			b'J' => self.stack.push(Object::Int(r.read_i32::<LittleEndian>()? as i64)),
			b'K' => self.stack.push(Object::Int(r.read_u8()? as i64)),
			b'M' => self.stack.push(Object::Int(r.read_u16::<LittleEndian>()? as i64)),
			b'I' => {
				let line = read_line(r)?;
				let value = match line.as_str() {
					"00" => Object::Bool(false),
					"01" => Object::Bool(true),
					text => Object::Int(text.parse().with_context(|| format!("Invalid INT '{}'", text))?),
				};
				self.stack.push(value);
			}
			0x8a => {
				let len = r.read_u8()? as usize;
				self.stack.push(read_long(r, len)?);
			}
			0x8b => {
				let len = r.read_i32::<LittleEndian>()? as usize;
				self.stack.push(read_long(r, len)?);
			}
			b'G' => self.stack.push(Object::Float(r.read_f64::<BigEndian>()?)),
			b'X' => {
				let len = r.read_u32::<LittleEndian>()? as usize;
				self.stack.push(Object::Str(read_text(r, len)?));
			}
			0x8c => {
				let len = r.read_u8()? as usize;
				self.stack.push(Object::Str(read_text(r, len)?));
			}
			0x8d => {
				let len = r.read_u64::<LittleEndian>()? as usize;
				self.stack.push(Object::Str(read_text(r, len)?));
			}
			b'T' => {
				let len = r.read_i32::<LittleEndian>()? as usize;
				self.stack.push(Object::Str(read_text(r, len)?));
			}
			b'U' => {
				let len = r.read_u8()? as usize;
				self.stack.push(Object::Str(read_text(r, len)?));
			}
			b'C' => {
				let len = r.read_u8()? as usize;
				self.stack.push(Object::Bytes(read_bytes(r, len)?));
			}
			b'B' => {
				let len = r.read_u32::<LittleEndian>()? as usize;
				self.stack.push(Object::Bytes(read_bytes(r, len)?));
			}
			b')' => self.stack.push(Object::Tuple(Vec::new())),
			b't' => {
				let items = self.pop_to_mark()?;
				self.stack.push(Object::Tuple(items));
			}
			0x85..=0x87 => {
				let count = (op - 0x84) as usize;
				if self.stack.len() < count {
					bail!("Pickle stack underflow");
				}
				let items = self.stack.split_off(self.stack.len() - count);
				self.stack.push(Object::Tuple(items));
			}
			b']' => self.stack.push(Object::List(Vec::new())),
			b'l' => {
				let items = self.pop_to_mark()?;
				self.stack.push(Object::List(items));
			}
			b'a' => {
				let item = self.pop()?;
				self.append(vec![item])?;
			}
			b'e' => {
				let items = self.pop_to_mark()?;
				self.append(items)?;
			}
			b'}' => self.stack.push(Object::Dict(Vec::new())),
			b'd' => {
				let items = self.pop_to_mark()?;
				self.stack.push(Object::Dict(pairs(items)?));
			}
			b's' => {
				let value = self.pop()?;
				let key = self.pop()?;
				self.set_items(vec![(key, value)])?;
			}
			b'u' => {
				let items = self.pop_to_mark()?;
				self.set_items(pairs(items)?)?;
			}
			b'q' => {
				let index = r.read_u8()? as u32;
				self.memoize(index)?;
			}
			b'r' => {
				let index = r.read_u32::<LittleEndian>()?;
				self.memoize(index)?;
			}
			0x94 => {
				let index = self.memo.len() as u32;
				self.memoize(index)?;
			}
			b'h' => {
				let index = r.read_u8()? as u32;
				self.recall(index)?;
			}
			b'j' => {
				let index = r.read_u32::<LittleEndian>()?;
				self.recall(index)?;
			}
			b'Q' => {
				let pid = self.pop()?;
				self.stack.push(persistent_load(pid)?);
			}
			b'R' | 0x81 => {
				let args = self.pop()?;
				let callable = self.pop()?;
				self.stack.push(reduce(callable, args)?);
			}
			b'b' => {
				let state = self.pop()?;
				let target = self.top()?;
				match target {
					// Instance attributes such as `_metadata` on an OrderedDict
					Object::Dict(_) | Object::Tensor(_) => {}
					other => {
						let inner = std::mem::replace(other, Object::None);
						*other = Object::Build {
							target: Box::new(inner),
							state: Box::new(state),
						};
					}
				}
			}
			other => bail!("Unsupported pickle opcode 0x{:02x}", other),
		}
		Ok(true)
	}

	fn append(&mut self, items: Vec<Object>) -> Result<()> {
		match self.top()? {
			Object::List(list) => {
				list.extend(items);
				Ok(())
			}
			other => bail!("APPEND on a non-list {:?}", other),
		}
	}

	fn set_items(&mut self, items: Vec<(Object, Object)>) -> Result<()> {
		match self.top()? {
			Object::Dict(entries) => entries.extend(items),
			// Dict subclasses rebuilt through REDUCE
			other => *other = Object::Dict(items),
		}
		Ok(())
	}
}

fn read_line<R: BufRead>(r: &mut R) -> Result<String> {
	let mut line = Vec::with_capacity(32);
	r.read_until(b'\n', &mut line)?;
	line.pop();
	if line.last() == Some(&b'\r') {
		line.pop();
	}
	String::from_utf8(line).context("Pickle line is not UTF-8")
}

fn read_bytes<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
	let mut data = vec![0u8; len];
	r.read_exact(&mut data)?;
	Ok(data)
}

fn read_text<R: Read>(r: &mut R, len: usize) -> Result<String> {
	let data = read_bytes(r, len)?;
	Ok(String::from_utf8_lossy(&data).into_owned())
}

/// LONG1/LONG4 payload; values that fit stay plain integers
fn read_long<R: Read>(r: &mut R, len: usize) -> Result<Object> {
	let data = read_bytes(r, len)?;
	if len > 8 {
		return Ok(Object::Long(data));
	}
	let mut value = 0i64;
	for (i, &byte) in data.iter().enumerate() {
		value |= (byte as i64) << (8 * i);
	}
	if len > 0 && len < 8 && data[len - 1] & 0x80 != 0 {
		value |= -1i64 << (8 * len);
	}
	Ok(Object::Int(value))
}

fn pairs(items: Vec<Object>) -> Result<Vec<(Object, Object)>> {
	if items.len() % 2 != 0 {
		bail!("Odd number of items for a dictionary");
	}
	let mut items = items.into_iter();
	let mut out = Vec::new();
	while let (Some(key), Some(value)) = (items.next(), items.next()) {
		out.push((key, value));
	}
	Ok(out)
}

/// `('storage', <class>, key, location, numel[, view_metadata])`
fn persistent_load(pid: Object) -> Result<Object> {
	let items = pid.into_items().context("Persistent id is not a tuple")?;
	let [Object::Str(tag), Object::Class { name, .. }, Object::Str(key), _location, _numel, rest @ ..] = items.as_slice()
	else {
		bail!("Unsupported persistent id {:?}", items);
	};
	if tag != "storage" {
		bail!("Unsupported persistent id tag '{}'", tag);
	}
	let kind = StorageKind::from_class(name).with_context(|| format!("Unsupported storage type {}", name))?;

	// Legacy views: (view_key, offset, size)
	let view_offset = match rest.first() {
		Some(Object::Tuple(view)) => view
			.get(1)
			.and_then(Object::int)
			.and_then(|v| usize::try_from(v).ok())
			.context("Malformed storage view")?,
		_ => 0,
	};

	Ok(Object::Storage(Storage {
		key: key.clone(),
		kind,
		view_offset,
	}))
}

fn reduce(callable: Object, args: Object) -> Result<Object> {
	let target = match &callable {
		Object::Class { module, name } => format!("{}.{}", module, name),
		_ => String::new(),
	};

	match target.as_str() {
		"collections.OrderedDict" => Ok(Object::Dict(Vec::new())),
		"torch._utils._rebuild_tensor_v2" | "torch._utils._rebuild_tensor" => rebuild_tensor(args),
		"torch._utils._rebuild_parameter" | "torch._utils._rebuild_parameter_with_state" => args
			.into_items()
			.and_then(|items| items.into_iter().next())
			.context("_rebuild_parameter without arguments"),
		_ => Ok(Object::Reduce {
			callable: Box::new(callable),
			args: Box::new(args),
		}),
	}
}

/// `(storage, offset, size, stride, ...)`
fn rebuild_tensor(args: Object) -> Result<Object> {
	let items = args.into_items().context("Tensor arguments are not a tuple")?;
	let [Object::Storage(storage), offset, shape, stride, ..] = items.as_slice() else {
		bail!("Unsupported tensor arguments {:?}", items);
	};
	let offset = offset
		.int()
		.and_then(|v| usize::try_from(v).ok())
		.context("Tensor offset is not an integer")?;
	let shape = shape.usizes().context("Tensor size is not a tuple of integers")?;
	let stride = stride.usizes().context("Tensor stride is not a tuple of integers")?;
	if shape.len() != stride.len() {
		bail!("Tensor size {:?} and stride {:?} differ in rank", shape, stride);
	}

	Ok(Object::Tensor(TensorRef {
		storage: storage.clone(),
		offset,
		shape,
		stride,
	}))
}

/// Read the named tensors of a `torch.save` checkpoint in stored order.
/// With `key`, only that entry of the top-level dictionary is read.
pub fn read(path: &Path, key: Option<&str>) -> Result<Vec<(String, Tensor)>> {
	let mut head = [0u8; 4];
	let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
	let filled = file.read(&mut head)?;

	if filled == 4 && &head == ZIP_MAGIC {
		read_zip(path, key)
	} else if filled > 0 && head[0] == PICKLE_PROTO {
		read_legacy(path, key)
	} else {
		bail!("{} is not a torch.save checkpoint", path.display())
	}
}

fn read_zip(path: &Path, key: Option<&str>) -> Result<Vec<(String, Tensor)>> {
	let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
	let mut archive = zip::ZipArchive::new(BufReader::new(file))
		.with_context(|| format!("Failed to read archive {}", path.display()))?;

	let pickle_name = archive
		.file_names()
		.find(|name| name.ends_with("data.pkl"))
		.map(str::to_string)
		.with_context(|| format!("No data.pkl in {}", path.display()))?;
	let prefix = pickle_name.trim_end_matches("data.pkl").to_string();

	let root = {
		let entry = archive.by_name(&pickle_name)?;
		Unpickler::load(&mut BufReader::new(entry))?
	};
	let tensors = select(root, key)?;

	let mut storages: HashMap<String, Vec<u8>> = HashMap::new();
	for (_, tensor) in &tensors {
		let storage_key = &tensor.storage.key;
		if storages.contains_key(storage_key) {
			continue;
		}
		let name = format!("{}data/{}", prefix, storage_key);
		let mut entry = archive
			.by_name(&name)
			.with_context(|| format!("Storage {} missing from {}", name, path.display()))?;
		let mut bytes = Vec::with_capacity(entry.size() as usize);
		entry.read_to_end(&mut bytes)?;
		storages.insert(storage_key.clone(), bytes);
	}

	materialize_all(tensors, &storages)
}

fn read_legacy(path: &Path, key: Option<&str>) -> Result<Vec<(String, Tensor)>> {
	let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
	let mut r = BufReader::new(file);

	match Unpickler::load(&mut r)? {
		Object::Long(bytes) if bytes == LEGACY_MAGIC => {}
		_ => bail!("{} is a plain pickle, not a torch.save checkpoint", path.display()),
	}
	match Unpickler::load(&mut r)?.int() {
		Some(LEGACY_PROTOCOL) => {}
		other => bail!("Unsupported torch.save protocol {:?} in {}", other, path.display()),
	}
	// System info: endianness and type sizes, always little-endian in practice
	Unpickler::load(&mut r)?;
	let root = Unpickler::load(&mut r)?;
	let order = Unpickler::load(&mut r)?
		.into_items()
		.context("Storage keys are not a list")?
		.into_iter()
		.map(|k| match k {
			Object::Str(s) => Ok(s),
			other => bail!("Storage key {:?} is not a string", other),
		})
		.collect::<Result<Vec<String>>>()?;

	let mut kinds = HashMap::new();
	collect_storages(&root, &mut kinds);
	let tensors = select(root, key)?;
	let wanted: HashSet<&str> = tensors.iter().map(|(_, t)| t.storage.key.as_str()).collect();

	let mut storages = HashMap::new();
	for storage_key in &order {
		let kind = kinds
			.get(storage_key)
			.copied()
			.with_context(|| format!("Storage {} is not referenced by the checkpoint", storage_key))?;
		let numel = r.read_i64::<LittleEndian>()?;
		let len = usize::try_from(numel).context("Negative storage size")? * kind.size();
		if wanted.contains(storage_key.as_str()) {
			storages.insert(storage_key.clone(), read_bytes(&mut r, len)?);
		} else {
			let skipped = io::copy(&mut (&mut r).take(len as u64), &mut io::sink())?;
			if skipped as usize != len {
				bail!("Storage {} is truncated", storage_key);
			}
		}
	}

	materialize_all(tensors, &storages)
}

fn collect_storages(object: &Object, kinds: &mut HashMap<String, StorageKind>) {
	match object {
		Object::Storage(s) => {
			kinds.insert(s.key.clone(), s.kind);
		}
		Object::Tensor(t) => {
			kinds.insert(t.storage.key.clone(), t.storage.kind);
		}
		Object::Tuple(items) | Object::List(items) => items.iter().for_each(|o| collect_storages(o, kinds)),
		Object::Dict(entries) => entries.iter().for_each(|(k, v)| {
			collect_storages(k, kinds);
			collect_storages(v, kinds);
		}),
		Object::Reduce { callable, args } => {
			collect_storages(callable, kinds);
			collect_storages(args, kinds);
		}
		Object::Build { target, state } => {
			collect_storages(target, kinds);
			collect_storages(state, kinds);
		}
		_ => {}
	}
}

/// Tensor entries of the root dictionary, or of its `key` entry
fn select(root: Object, key: Option<&str>) -> Result<Vec<(String, TensorRef)>> {
	let dict = match key {
		None => root,
		Some(key) => {
			let Object::Dict(entries) = root else {
				bail!("Checkpoint is not a dictionary, cannot select '{}'", key);
			};
			let available: Vec<String> = entries
				.iter()
				.filter_map(|(k, _)| match k {
					Object::Str(s) => Some(s.clone()),
					_ => None,
				})
				.collect();
			entries
				.into_iter()
				.find(|(k, _)| matches!(k, Object::Str(s) if s == key))
				.map(|(_, v)| v)
				.with_context(|| format!("Checkpoint has no '{}' entry (found: {})", key, available.join(", ")))?
		}
	};

	let Object::Dict(entries) = dict else {
		bail!("Expected a dictionary of tensors");
	};
	Ok(entries
		.into_iter()
		.filter_map(|(k, v)| match (k, v) {
			(Object::Str(name), Object::Tensor(t)) => Some((name, t)),
			_ => None,
		})
		.collect())
}

fn materialize_all(tensors: Vec<(String, TensorRef)>, storages: &HashMap<String, Vec<u8>>) -> Result<Vec<(String, Tensor)>> {
	tensors
		.into_iter()
		.map(|(name, t)| {
			let bytes = storages
				.get(&t.storage.key)
				.with_context(|| format!("Storage {} of '{}' was not read", t.storage.key, name))?;
			let tensor = materialize(&t, bytes).with_context(|| format!("Failed to rebuild '{}'", name))?;
			Ok((name, tensor))
		})
		.collect()
}

/// Element offsets of a strided view, in row-major order
fn element_offsets(start: usize, shape: &[usize], stride: &[usize]) -> Vec<usize> {
	let numel: usize = shape.iter().product();
	let mut offsets = Vec::with_capacity(numel);
	let mut index = vec![0usize; shape.len()];
	for _ in 0..numel {
		offsets.push(start + index.iter().zip(stride).map(|(i, s)| i * s).sum::<usize>());
		for d in (0..shape.len()).rev() {
			index[d] += 1;
			if index[d] < shape[d] {
				break;
			}
			index[d] = 0;
		}
	}
	offsets
}

/// Floating storages become F32 tensors, integer and boolean ones I64
fn materialize(t: &TensorRef, bytes: &[u8]) -> Result<Tensor> {
	let kind = t.storage.kind;
	let size = kind.size();
	let available = bytes.len() / size;
	let offsets = element_offsets(t.offset + t.storage.view_offset, &t.shape, &t.stride);
	if let Some(&last) = offsets.iter().max() {
		if last >= available {
			bail!("Storage {} holds {} elements, element {} requested", t.storage.key, available, last);
		}
	}

	let at = |i: usize| &bytes[i * size..(i + 1) * size];
	let tensor = if kind.is_float() {
		let values: Vec<f32> = offsets
			.iter()
			.map(|&i| {
				let b = at(i);
				match kind {
					StorageKind::F32 => LittleEndian::read_f32(b),
					StorageKind::F64 => LittleEndian::read_f64(b) as f32,
					StorageKind::F16 => half::f16::from_bits(LittleEndian::read_u16(b)).to_f32(),
					_ => half::bf16::from_bits(LittleEndian::read_u16(b)).to_f32(),
				}
			})
			.collect();
		Tensor::from_vec(values, t.shape.as_slice(), &Device::Cpu)?
	} else {
		let values: Vec<i64> = offsets
			.iter()
			.map(|&i| {
				let b = at(i);
				match kind {
					StorageKind::I64 => LittleEndian::read_i64(b),
					StorageKind::I32 => LittleEndian::read_i32(b) as i64,
					StorageKind::I16 => LittleEndian::read_i16(b) as i64,
					StorageKind::I8 => b[0] as i8 as i64,
					_ => b[0] as i64,
				}
			})
			.collect();
		Tensor::from_vec(values, t.shape.as_slice(), &Device::Cpu)?
	};
	Ok(tensor)
}
