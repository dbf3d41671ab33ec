//! Flat key-value codec shared with contract SDKs.
//!
//! Every blob crossing the guest boundary (call parameters, syscall headers
//! and bodies, nested call results) is a sequence of items:
//!
//! ```text
//! key_type:i32le | key_len:i32le | key | value_type:i32le | value_len:i32le | value
//! ```
//!
//! The layout is fixed by deployed contracts and must not change.

use std::collections::BTreeMap;

use crate::CodecError;

/// Maximum number of items in one blob.
pub const MAX_ITEMS: usize = 128;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 64;

/// Maximum value length in bytes.
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

/// Namespace of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Keys set by the runtime (handles, method names).
    System,
    /// Keys supplied by users and contracts.
    User,
}

impl KeyType {
    fn tag(self) -> i32 {
        match self {
            KeyType::System => 0,
            KeyType::User => 1,
        }
    }

    fn from_tag(tag: i32) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(KeyType::System),
            1 => Ok(KeyType::User),
            other => Err(CodecError::UnknownKeyType(other)),
        }
    }
}

/// A typed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// 32-bit signed integer, encoded as 4 little-endian bytes.
    Int32(i32),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Value {
    fn tag(&self) -> i32 {
        match self {
            Value::Int32(_) => 0,
            Value::String(_) => 1,
            Value::Bytes(_) => 2,
        }
    }

    fn as_bytes(&self) -> Vec<u8> {
        match self {
            Value::Int32(v) => v.to_le_bytes().to_vec(),
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
        }
    }
}

/// One encoded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Key namespace.
    pub key_type: KeyType,
    /// Key.
    pub key: String,
    /// Value.
    pub value: Value,
}

/// An ordered list of key-value items.
///
/// Lookups return the first item with a matching key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvCodec {
    items: Vec<Item>,
}

impl KvCodec {
    /// Create an empty codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the parameter blob handed to a contract method.
    ///
    /// The context handle goes first as a user bytes item holding its
    /// decimal text, the form contract SDKs parse it from. User parameters
    /// follow in key order; a user parameter named like the handle key is
    /// dropped.
    pub fn with_params(handle_key: &str, handle: i32, params: &BTreeMap<String, Vec<u8>>) -> Self {
        let mut codec = Self::new();
        codec.push_bytes(KeyType::User, handle_key, handle.to_string().into_bytes());
        for (key, value) in params.iter().filter(|(key, _)| *key != handle_key) {
            codec.push_bytes(KeyType::User, key, value.clone());
        }
        codec
    }

    /// Build a codec of user bytes items from a map.
    pub fn from_map(params: &BTreeMap<String, Vec<u8>>) -> Self {
        let mut codec = Self::new();
        for (key, value) in params {
            codec.push_bytes(KeyType::User, key, value.clone());
        }
        codec
    }

    /// Append an int32 item.
    pub fn push_int32(&mut self, key_type: KeyType, key: &str, value: i32) -> &mut Self {
        self.push(key_type, key, Value::Int32(value))
    }

    /// Append a string item.
    pub fn push_string(&mut self, key_type: KeyType, key: &str, value: impl Into<String>) -> &mut Self {
        self.push(key_type, key, Value::String(value.into()))
    }

    /// Append a bytes item.
    pub fn push_bytes(&mut self, key_type: KeyType, key: &str, value: impl Into<Vec<u8>>) -> &mut Self {
        self.push(key_type, key, Value::Bytes(value.into()))
    }

    fn push(&mut self, key_type: KeyType, key: &str, value: Value) -> &mut Self {
        self.items.push(Item {
            key_type,
            key: key.to_string(),
            value,
        });
        self
    }

    /// All items in encoding order.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if there are no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.items.iter().find(|i| i.key == key).map(|i| &i.value)
    }

    /// Look up a required int32 value.
    pub fn get_i32(&self, key: &str) -> Result<i32, CodecError> {
        match self.get(key) {
            Some(Value::Int32(v)) => Ok(*v),
            Some(_) => Err(CodecError::TypeMismatch {
                key: key.to_string(),
                expected: "int32",
            }),
            None => Err(CodecError::MissingKey {
                key: key.to_string(),
            }),
        }
    }

    /// Look up a required string value.
    pub fn get_string(&self, key: &str) -> Result<&str, CodecError> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(CodecError::TypeMismatch {
                key: key.to_string(),
                expected: "string",
            }),
            None => Err(CodecError::MissingKey {
                key: key.to_string(),
            }),
        }
    }

    /// Look up an optional string value, treating absence as empty.
    pub fn get_string_or_default(&self, key: &str) -> Result<&str, CodecError> {
        match self.get(key) {
            None => Ok(""),
            Some(_) => self.get_string(key),
        }
    }

    /// Look up a required byte value. String values are accepted as bytes.
    pub fn get_bytes(&self, key: &str) -> Result<Vec<u8>, CodecError> {
        match self.get(key) {
            Some(Value::Bytes(b)) => Ok(b.clone()),
            Some(Value::String(s)) => Ok(s.as_bytes().to_vec()),
            Some(Value::Int32(_)) => Err(CodecError::TypeMismatch {
                key: key.to_string(),
                expected: "bytes",
            }),
            None => Err(CodecError::MissingKey {
                key: key.to_string(),
            }),
        }
    }

    /// Collect user items as a byte map. Int32 values become LE bytes.
    pub fn to_map(&self) -> BTreeMap<String, Vec<u8>> {
        self.items
            .iter()
            .filter(|i| i.key_type == KeyType::User)
            .map(|i| (i.key.clone(), i.value.as_bytes()))
            .collect()
    }

    /// Encode into the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for item in &self.items {
            let value = item.value.as_bytes();
            out.extend_from_slice(&item.key_type.tag().to_le_bytes());
            out.extend_from_slice(&len_i32(item.key.len()).to_le_bytes());
            out.extend_from_slice(item.key.as_bytes());
            out.extend_from_slice(&item.value.tag().to_le_bytes());
            out.extend_from_slice(&len_i32(value.len()).to_le_bytes());
            out.extend_from_slice(&value);
        }
        out
    }

    /// Decode from the wire format.
    ///
    /// # Errors
    ///
    /// Returns an error on truncated input, unknown type tags, lengths above
    /// the codec limits, or invalid UTF-8 in keys and string values.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader { bytes, pos: 0 };
        let mut items = Vec::new();

        while !reader.is_done() {
            if items.len() >= MAX_ITEMS {
                return Err(CodecError::TooManyItems {
                    count: items.len() + 1,
                });
            }

            let key_type = KeyType::from_tag(reader.read_i32()?)?;
            let key_len = reader.read_len(MAX_KEY_LEN)?;
            let key_offset = reader.pos;
            let key = std::str::from_utf8(reader.read_slice(key_len)?)
                .map_err(|_| CodecError::InvalidUtf8 { offset: key_offset })?
                .to_string();

            let value_type = reader.read_i32()?;
            let value_len = reader.read_len(MAX_VALUE_LEN)?;
            let value_offset = reader.pos;
            let raw = reader.read_slice(value_len)?;
            let value = match value_type {
                0 => {
                    let arr: [u8; 4] = raw.try_into().map_err(|_| CodecError::InvalidLength {
                        len: value_len as i64,
                        offset: value_offset,
                    })?;
                    Value::Int32(i32::from_le_bytes(arr))
                }
                1 => Value::String(
                    std::str::from_utf8(raw)
                        .map_err(|_| CodecError::InvalidUtf8 {
                            offset: value_offset,
                        })?
                        .to_string(),
                ),
                2 => Value::Bytes(raw.to_vec()),
                other => return Err(CodecError::UnknownValueType(other)),
            };

            items.push(Item {
                key_type,
                key,
                value,
            });
        }

        Ok(Self { items })
    }
}

/// Byte offset of the first value byte of the leading item of a blob whose
/// first key is `key`.
///
/// The value length sits in the four bytes before it. For a parameter blob
/// built by [`KvCodec::with_params`] this locates the handle text.
pub fn handle_value_offset(key: &str) -> usize {
    4 + 4 + key.len() + 4 + 4
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn len_i32(len: usize) -> i32 {
    len as i32
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(CodecError::Truncated { offset: self.pos })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        let raw = self.read_slice(4)?;
        let arr: [u8; 4] = raw
            .try_into()
            .map_err(|_| CodecError::Truncated { offset: self.pos })?;
        Ok(i32::from_le_bytes(arr))
    }

    fn read_len(&mut self, max: usize) -> Result<usize, CodecError> {
        let offset = self.pos;
        let len = self.read_i32()?;
        usize::try_from(len)
            .ok()
            .filter(|len| *len <= max)
            .ok_or(CodecError::InvalidLength {
                len: i64::from(len),
                offset,
            })
    }
}
