//! Registry data model -- typed values and in-memory hive snapshots.
use super::entry::Diagnostic;
use compact_str::CompactString;
use std::collections::BTreeMap;
use std::fmt;

/// Registry value type, as stored in the hive's `vk` record.
///
/// Unknown type codes are preserved verbatim so that a type change between
/// two snapshots is still detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    None,
    Sz,
    ExpandSz,
    Binary,
    Dword,
    DwordBigEndian,
    Link,
    MultiSz,
    ResourceList,
    FullResourceDescriptor,
    ResourceRequirementsList,
    Qword,
    Unknown(u32),
}

impl ValueType {
    /// Map a raw type code to a value type.
    pub fn from_raw(code: u32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::Sz,
            2 => Self::ExpandSz,
            3 => Self::Binary,
            4 => Self::Dword,
            5 => Self::DwordBigEndian,
            6 => Self::Link,
            7 => Self::MultiSz,
            8 => Self::ResourceList,
            9 => Self::FullResourceDescriptor,
            10 => Self::ResourceRequirementsList,
            11 => Self::Qword,
            other => Self::Unknown(other),
        }
    }

    /// The raw type code.
    pub fn raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Sz => 1,
            Self::ExpandSz => 2,
            Self::Binary => 3,
            Self::Dword => 4,
            Self::DwordBigEndian => 5,
            Self::Link => 6,
            Self::MultiSz => 7,
            Self::ResourceList => 8,
            Self::FullResourceDescriptor => 9,
            Self::ResourceRequirementsList => 10,
            Self::Qword => 11,
            Self::Unknown(code) => code,
        }
    }

    /// Conventional `REG_*` name.
    pub fn name(self) -> CompactString {
        let name = match self {
            Self::None => "REG_NONE",
            Self::Sz => "REG_SZ",
            Self::ExpandSz => "REG_EXPAND_SZ",
            Self::Binary => "REG_BINARY",
            Self::Dword => "REG_DWORD",
            Self::DwordBigEndian => "REG_DWORD_BIG_ENDIAN",
            Self::Link => "REG_LINK",
            Self::MultiSz => "REG_MULTI_SZ",
            Self::ResourceList => "REG_RESOURCE_LIST",
            Self::FullResourceDescriptor => "REG_FULL_RESOURCE_DESCRIPTOR",
            Self::ResourceRequirementsList => "REG_RESOURCE_REQUIREMENTS_LIST",
            Self::Qword => "REG_QWORD",
            Self::Unknown(code) => return compact_str::format_compact!("REG_UNKNOWN_{code:#x}"),
        };
        CompactString::const_new(name)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// One `(name, type, data)` registry value.
///
/// Two values with the same name are equal only if both type and raw bytes
/// match -- the type is part of the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryValue {
    /// Value name. The unnamed default value has an empty name.
    pub name: CompactString,
    pub value_type: ValueType,
    /// Raw data bytes, compared byte-exactly.
    pub data: Vec<u8>,
}

impl RegistryValue {
    pub fn new(name: impl Into<CompactString>, value_type: ValueType, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            value_type,
            data,
        }
    }

    /// A `REG_SZ` value holding `text` encoded as NUL-terminated UTF-16LE.
    pub fn string(name: impl Into<CompactString>, text: &str) -> Self {
        Self::new(name, ValueType::Sz, encode_utf16z(text))
    }

    /// A `REG_DWORD` value.
    pub fn dword(name: impl Into<CompactString>, value: u32) -> Self {
        Self::new(name, ValueType::Dword, value.to_le_bytes().to_vec())
    }

    /// A `REG_QWORD` value.
    pub fn qword(name: impl Into<CompactString>, value: u64) -> Self {
        Self::new(name, ValueType::Qword, value.to_le_bytes().to_vec())
    }

    /// A `REG_MULTI_SZ` value.
    pub fn multi_string(name: impl Into<CompactString>, items: &[&str]) -> Self {
        let mut data = Vec::new();
        for item in items {
            data.extend(encode_utf16z(item));
        }
        data.extend([0, 0]);
        Self::new(name, ValueType::MultiSz, data)
    }

    /// A `REG_BINARY` value.
    pub fn binary(name: impl Into<CompactString>, data: Vec<u8>) -> Self {
        Self::new(name, ValueType::Binary, data)
    }

    /// `true` if type and data match (names are not compared).
    pub fn same_content(&self, other: &Self) -> bool {
        self.value_type == other.value_type && self.data == other.data
    }

    /// Render the data according to its type.
    ///
    /// Strings decode from UTF-16LE, multi-strings become arrays and integer
    /// types become numbers. Binary, unknown and malformed data fall back to
    /// a lowercase hex string.
    pub fn render(&self) -> serde_json::Value {
        use serde_json::Value;
        let hex_fallback = || Value::String(hex::encode(&self.data));
        match self.value_type {
            ValueType::Sz | ValueType::ExpandSz | ValueType::Link => decode_utf16(&self.data)
                .map(|s| Value::String(s.trim_end_matches('\0').to_string()))
                .unwrap_or_else(hex_fallback),
            ValueType::MultiSz => decode_utf16(&self.data)
                .map(|s| {
                    Value::Array(
                        s.split('\0')
                            .filter(|part| !part.is_empty())
                            .map(|part| Value::String(part.to_string()))
                            .collect(),
                    )
                })
                .unwrap_or_else(hex_fallback),
            ValueType::Dword => <[u8; 4]>::try_from(self.data.as_slice())
                .map(|b| Value::from(u32::from_le_bytes(b)))
                .unwrap_or_else(|_| hex_fallback()),
            ValueType::DwordBigEndian => <[u8; 4]>::try_from(self.data.as_slice())
                .map(|b| Value::from(u32::from_be_bytes(b)))
                .unwrap_or_else(|_| hex_fallback()),
            ValueType::Qword => <[u8; 8]>::try_from(self.data.as_slice())
                .map(|b| Value::from(u64::from_le_bytes(b)))
                .unwrap_or_else(|_| hex_fallback()),
            _ => hex_fallback(),
        }
    }
}

fn encode_utf16z(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .chain(std::iter::once(0u16))
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// Decode UTF-16LE. Odd-length or unpaired-surrogate data yields `None`.
fn decode_utf16(data: &[u8]) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// One key in a hive snapshot: its values keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryKey {
    pub values: BTreeMap<CompactString, RegistryValue>,
}

impl RegistryKey {
    /// Values in ascending name order.
    pub fn values(&self) -> impl Iterator<Item = &RegistryValue> {
        self.values.values()
    }
}

/// A read-only, in-memory copy of one or more registry hives.
///
/// Keys are stored flat under their full path (`\HKLM\SOFTWARE\...`). A key
/// whose subtree could not be read is simply absent; `is_partial` tells the
/// caller that absence may be spurious.
#[derive(Debug, Clone, Default)]
pub struct HiveSnapshot {
    keys: BTreeMap<String, RegistryKey>,
    diagnostics: Vec<Diagnostic>,
}

impl HiveSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key. Returns `false` (and leaves the snapshot untouched) if
    /// the path is already present.
    pub(crate) fn insert_key(&mut self, path: String, key: RegistryKey) -> bool {
        if self.keys.contains_key(&path) {
            return false;
        }
        self.keys.insert(path, key);
        true
    }

    pub(crate) fn push_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub(crate) fn finish(mut self) -> Self {
        self.diagnostics.sort();
        self
    }

    /// Build a snapshot directly from keyed values.
    pub fn from_keys(keys: impl IntoIterator<Item = (String, Vec<RegistryValue>)>) -> Self {
        let mut snapshot = Self::new();
        for (path, values) in keys {
            let mut key = RegistryKey::default();
            for value in values {
                key.values.entry(value.name.clone()).or_insert(value);
            }
            snapshot.insert_key(path, key);
        }
        snapshot
    }

    pub fn get(&self, path: &str) -> Option<&RegistryKey> {
        self.keys.get(path)
    }

    /// Keys in ascending path order.
    pub fn keys(&self) -> &BTreeMap<String, RegistryKey> {
        &self.keys
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn is_partial(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_codes_round_trip_including_unknown() {
        for code in [0, 1, 4, 7, 11, 0x20] {
            assert_eq!(ValueType::from_raw(code).raw(), code);
        }
        assert_eq!(ValueType::from_raw(0x20).name(), "REG_UNKNOWN_0x20");
        assert_eq!(ValueType::Sz.name(), "REG_SZ");
    }

    #[test]
    fn render_by_type() {
        assert_eq!(RegistryValue::string("a", "hello").render(), json!("hello"));
        assert_eq!(RegistryValue::dword("b", 42).render(), json!(42));
        assert_eq!(RegistryValue::qword("c", 1 << 40).render(), json!(1u64 << 40));
        assert_eq!(
            RegistryValue::multi_string("d", &["x", "y"]).render(),
            json!(["x", "y"])
        );
        assert_eq!(
            RegistryValue::binary("e", vec![0xde, 0xad]).render(),
            json!("dead")
        );
        let be = RegistryValue::new("f", ValueType::DwordBigEndian, vec![0, 0, 1, 0]);
        assert_eq!(be.render(), json!(256));
    }

    #[test]
    fn malformed_data_falls_back_to_hex() {
        let short_dword = RegistryValue::new("x", ValueType::Dword, vec![1, 2]);
        assert_eq!(short_dword.render(), json!("0102"));

        let odd_string = RegistryValue::new("y", ValueType::Sz, vec![0x41]);
        assert_eq!(odd_string.render(), json!("41"));
    }

    #[test]
    fn same_bytes_different_type_is_not_same_content() {
        let a = RegistryValue::new("v", ValueType::Binary, vec![1, 0, 0, 0]);
        let b = RegistryValue::new("v", ValueType::Dword, vec![1, 0, 0, 0]);
        assert!(!a.same_content(&b));
    }

    #[test]
    fn snapshot_rejects_duplicate_key_paths() {
        let mut snap = HiveSnapshot::new();
        assert!(snap.insert_key("\\HKLM\\A".into(), RegistryKey::default()));
        assert!(!snap.insert_key("\\HKLM\\A".into(), RegistryKey::default()));
        assert_eq!(snap.len(), 1);
    }
}
