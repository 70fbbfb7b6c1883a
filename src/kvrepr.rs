//! Line-position-indexed key/value parser for `/proc` pseudo-files.
//!
//! Files like `/proc/meminfo` keep a stable layout between reads, so the
//! line position of every interesting key is memoized once at construction.
//! Each subsequent [`KvRepr::parse_once`] performs a single pass over the
//! file, skipping entire lines that carry no mapped key and reading only the
//! value field on lines that do.
//!
//! The line shape is described by a two-conversion scanf-style format
//! (key first, value second, e.g. `"%64[^:]: %32s"`). A derived "fast"
//! format with the key conversion suppressed is used on the hot path.
//!
//! Parsed values land in typed record fields through the [`KvFields`]
//! setter; the field kinds come from each record's [`KvDescriptor`]. Only
//! numeric kinds exist, so unsupported destination types are rejected when
//! the schema is defined rather than at parse time.

use crate::error::{Error, Result};
use crate::fsx::FileSystem;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Numeric kind of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U32,
    U64,
    I32,
    I64,
    F32,
    F64,
}

/// A parsed field value, matching the declared [`FieldKind`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl FieldValue {
    pub fn as_u32(self) -> u32 {
        match self {
            FieldValue::U32(v) => v,
            _ => 0,
        }
    }
    pub fn as_u64(self) -> u64 {
        match self {
            FieldValue::U64(v) => v,
            _ => 0,
        }
    }
    pub fn as_i32(self) -> i32 {
        match self {
            FieldValue::I32(v) => v,
            _ => 0,
        }
    }
    pub fn as_i64(self) -> i64 {
        match self {
            FieldValue::I64(v) => v,
            _ => 0,
        }
    }
    pub fn as_f32(self) -> f32 {
        match self {
            FieldValue::F32(v) => v,
            _ => 0.0,
        }
    }
    pub fn as_f64(self) -> f64 {
        match self {
            FieldValue::F64(v) => v,
            _ => 0.0,
        }
    }
}

/// Typed setter exposed by every record the parser can fill.
pub trait KvFields {
    /// Assigns `value` to the field at `idx`. The caller guarantees the
    /// value kind matches the descriptor at the same index.
    fn set_field(&mut self, idx: usize, value: FieldValue);
}

/// Static schema of one record: its name and per-field numeric kinds,
/// positionally aligned with a key list.
#[derive(Debug, Clone, Copy)]
pub struct KvDescriptor {
    pub name: &'static str,
    pub kinds: &'static [FieldKind],
}

// === scanf-shaped line format ===

#[derive(Debug, Clone, PartialEq)]
enum ConvKind {
    /// `%s`: skip leading whitespace, then a non-whitespace token.
    Str,
    /// `%[...]` / `%[^...]`: a run of characters (not) in the set.
    ScanSet { negated: bool, set: Vec<char> },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Literal characters that must match the line.
    Literal(String),
    /// Whitespace in the format: matches any run of whitespace, or none.
    Whitespace,
    Conv {
        width: Option<usize>,
        kind: ConvKind,
        suppressed: bool,
    },
}

/// A validated two-conversion line format.
#[derive(Debug, Clone)]
pub struct LineFormat {
    source: String,
    tokens: Vec<Token>,
}

impl LineFormat {
    /// Parses and validates a format string.
    ///
    /// Exactly two non-suppressed string-class conversions are required and
    /// newlines are rejected: line counting determines key positions, so a
    /// format must never consume line boundaries.
    pub fn parse(format: &str) -> Result<Self> {
        if format.contains('\n') {
            return Err(Error::InvalidConfig(format!(
                "newline not allowed in line format {:?}",
                format
            )));
        }

        let tokens = Self::tokenize(format)?;
        let captures = tokens
            .iter()
            .filter(|t| matches!(t, Token::Conv { suppressed, .. } if !suppressed))
            .count();
        if captures != 2 {
            return Err(Error::InvalidConfig(format!(
                "expected exactly two string conversions in {:?}, found {}",
                format, captures
            )));
        }

        Ok(Self {
            source: format.to_string(),
            tokens,
        })
    }

    fn tokenize(format: &str) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut chars = format.chars().peekable();
        let mut literal = String::new();

        while let Some(c) = chars.next() {
            if c == '%' {
                if chars.peek() == Some(&'%') {
                    chars.next();
                    literal.push('%');
                    continue;
                }
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }

                let suppressed = if chars.peek() == Some(&'*') {
                    chars.next();
                    true
                } else {
                    false
                };

                let mut width_digits = String::new();
                while let Some(d) = chars.peek() {
                    if d.is_ascii_digit() {
                        width_digits.push(*d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let width = if width_digits.is_empty() {
                    None
                } else {
                    Some(width_digits.parse::<usize>().map_err(|_| {
                        Error::InvalidConfig(format!("bad width in format {:?}", format))
                    })?)
                };

                let kind = match chars.next() {
                    Some('s') => ConvKind::Str,
                    Some('[') => {
                        let negated = chars.peek() == Some(&'^');
                        if negated {
                            chars.next();
                        }
                        let mut set = Vec::new();
                        let mut closed = false;
                        for sc in chars.by_ref() {
                            if sc == ']' && !set.is_empty() {
                                closed = true;
                                break;
                            }
                            set.push(sc);
                        }
                        if !closed {
                            return Err(Error::InvalidConfig(format!(
                                "unterminated scanset in format {:?}",
                                format
                            )));
                        }
                        ConvKind::ScanSet { negated, set }
                    }
                    other => {
                        return Err(Error::InvalidConfig(format!(
                            "unsupported conversion {:?} in format {:?}; only string-class \
                             conversions are allowed",
                            other, format
                        )));
                    }
                };

                tokens.push(Token::Conv {
                    width,
                    kind,
                    suppressed,
                });
            } else if c.is_whitespace() {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                if tokens.last() != Some(&Token::Whitespace) {
                    tokens.push(Token::Whitespace);
                }
            } else {
                literal.push(c);
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Ok(tokens)
    }

    /// Derives the fast variant: the first capturing conversion (the key)
    /// becomes suppressed so only the value is extracted on the hot path.
    pub fn derive_fast(&self) -> Result<Self> {
        let mut tokens = self.tokens.clone();
        let first = tokens
            .iter_mut()
            .find(|t| matches!(t, Token::Conv { suppressed: false, .. }));
        match first {
            Some(Token::Conv { suppressed, .. }) => *suppressed = true,
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "cannot derive fast format from {:?}",
                    self.source
                )));
            }
        }
        Ok(Self {
            source: format!("{} (fast)", self.source),
            tokens,
        })
    }

    /// Human-readable source of this format.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Applies the format to one line, returning the captured conversions
    /// in order. Matching stops at the first failing directive; captures
    /// made before the failure are kept, mirroring scanf.
    pub fn extract<'a>(&self, line: &'a str) -> Vec<&'a str> {
        let mut captures = Vec::new();
        let mut rest = line;

        for token in &self.tokens {
            match token {
                Token::Whitespace => {
                    rest = rest.trim_start();
                }
                Token::Literal(lit) => match rest.strip_prefix(lit.as_str()) {
                    Some(r) => rest = r,
                    None => return captures,
                },
                Token::Conv {
                    width,
                    kind,
                    suppressed,
                } => {
                    // %s skips leading whitespace; scansets do not.
                    let base = match kind {
                        ConvKind::Str => rest.trim_start(),
                        ConvKind::ScanSet { .. } => rest,
                    };
                    let mut end = match kind {
                        ConvKind::Str => base
                            .char_indices()
                            .find(|(_, c)| c.is_whitespace())
                            .map(|(i, _)| i)
                            .unwrap_or(base.len()),
                        ConvKind::ScanSet { negated, set } => base
                            .char_indices()
                            .find(|(_, c)| set.contains(c) == *negated)
                            .map(|(i, _)| i)
                            .unwrap_or(base.len()),
                    };
                    if let Some(w) = width {
                        if end > *w {
                            end = *w;
                            while !base.is_char_boundary(end) {
                                end -= 1;
                            }
                        }
                    }
                    let matched = &base[..end];
                    if matched.is_empty() {
                        return captures;
                    }
                    if !*suppressed {
                        captures.push(matched);
                    }
                    rest = &base[end..];
                }
            }
        }
        captures
    }
}

fn parse_field_value(kind: FieldKind, text: &str) -> Result<FieldValue> {
    let bad = || Error::Parse(format!("bad {:?} value {:?}", kind, text));
    Ok(match kind {
        FieldKind::U32 => FieldValue::U32(text.parse().map_err(|_| bad())?),
        FieldKind::U64 => FieldValue::U64(text.parse().map_err(|_| bad())?),
        FieldKind::I32 => FieldValue::I32(text.parse().map_err(|_| bad())?),
        FieldKind::I64 => FieldValue::I64(text.parse().map_err(|_| bad())?),
        FieldKind::F32 => FieldValue::F32(text.parse().map_err(|_| bad())?),
        FieldKind::F64 => FieldValue::F64(text.parse().map_err(|_| bad())?),
    })
}

/// The memoized parser bound to one `/proc`-style file.
pub struct KvRepr<F: FileSystem> {
    fs: F,
    path: PathBuf,
    descriptors: Vec<KvDescriptor>,
    key_lists: Vec<Vec<String>>,
    format: LineFormat,
    fast_format: LineFormat,
    /// line index -> (descriptor index, field index), ordered by line.
    kv_map: BTreeMap<usize, (usize, usize)>,
    /// (descriptor index, field index) of keys absent from the file.
    missing_fields: Vec<(usize, usize)>,
}

impl<F: FileSystem> KvRepr<F> {
    /// Builds the parser: validates the format, scans the file once to map
    /// each key to its line, and derives the fast format.
    ///
    /// Keys missing from the file are logged and remembered but are not
    /// fatal; structural mismatches between descriptors and key lists are.
    pub fn new(
        fs: F,
        path: impl Into<PathBuf>,
        descriptors: Vec<KvDescriptor>,
        key_lists: Vec<Vec<String>>,
        format: &str,
    ) -> Result<Self> {
        let path = path.into();
        let format = LineFormat::parse(format)?;

        if descriptors.len() != key_lists.len() {
            return Err(Error::InvalidConfig(format!(
                "{} descriptors but {} key lists for {:?}",
                descriptors.len(),
                key_lists.len(),
                path
            )));
        }
        for (idx, (desc, keys)) in descriptors.iter().zip(&key_lists).enumerate() {
            if desc.kinds.len() != keys.len() {
                return Err(Error::InvalidConfig(format!(
                    "descriptor {} ({}) has {} fields but {} keys",
                    idx,
                    desc.name,
                    desc.kinds.len(),
                    keys.len()
                )));
            }
        }

        let content = fs.read_to_string(&path)?;
        let mut key_to_line: HashMap<&str, usize> = HashMap::new();
        for (line_idx, line) in content.lines().enumerate() {
            let captures = format.extract(line);
            match captures.first() {
                // Last occurrence wins when a key repeats.
                Some(&key) => {
                    key_to_line.insert(key, line_idx);
                }
                None => debug!(line = line_idx, path = ?path, "line did not match key format"),
            }
        }

        let mut kv_map = BTreeMap::new();
        let mut missing_fields = Vec::new();
        for (desc_idx, (desc, keys)) in descriptors.iter().zip(&key_lists).enumerate() {
            for (field_idx, key) in keys.iter().enumerate() {
                match key_to_line.get(key.as_str()) {
                    Some(&line_idx) => {
                        kv_map.insert(line_idx, (desc_idx, field_idx));
                    }
                    None => {
                        warn!(
                            key = key.as_str(),
                            record = desc.name,
                            path = ?path,
                            "key not found in file"
                        );
                        missing_fields.push((desc_idx, field_idx));
                    }
                }
            }
        }

        let fast_format = format.derive_fast()?;

        Ok(Self {
            fs,
            path,
            descriptors,
            key_lists,
            format,
            fast_format,
            kv_map,
            missing_fields,
        })
    }

    /// One sampling pass: fills the mapped fields of `targets` from the
    /// current file contents. `targets` must align with the descriptor list.
    pub fn parse_once(&self, targets: &mut [&mut dyn KvFields]) -> Result<()> {
        if targets.len() != self.descriptors.len() {
            return Err(Error::InvalidConfig(format!(
                "{} targets but {} descriptors",
                targets.len(),
                self.descriptors.len()
            )));
        }

        let content = self.fs.read_to_string(&self.path)?;
        let mut lines = content.lines().enumerate();

        for (&line_idx, &(desc_idx, field_idx)) in &self.kv_map {
            // Unmapped lines are skipped wholesale.
            let line = loop {
                match lines.next() {
                    Some((idx, line)) if idx == line_idx => break line,
                    Some(_) => continue,
                    None => {
                        return Err(Error::Parse(format!(
                            "unexpected end of {:?} before line {}",
                            self.path, line_idx
                        )));
                    }
                }
            };

            let captures = self.fast_format.extract(line);
            let value_text = captures.first().ok_or_else(|| {
                Error::Parse(format!(
                    "no value on line {} of {:?} for {}[{}]",
                    line_idx, self.path, self.descriptors[desc_idx].name, field_idx
                ))
            })?;

            let kind = self.descriptors[desc_idx].kinds[field_idx];
            let value = parse_field_value(kind, value_text)?;
            targets[desc_idx].set_field(field_idx, value);
        }

        Ok(())
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fields whose keys were absent at construction time.
    pub fn missing_fields(&self) -> &[(usize, usize)] {
        &self.missing_fields
    }

    /// Number of fields that were located.
    pub fn located_fields(&self) -> usize {
        self.kv_map.len()
    }

    /// Human-readable description of the mapping.
    pub fn status_report(&self) -> String {
        let mut report = format!(
            "KvRepr on input file {:?}\n  Formats: {:?} / {:?}\n  Records: {}\n  Fields ({} found, {} missing):",
            self.path,
            self.format.source(),
            self.fast_format.source(),
            self.descriptors.len(),
            self.kv_map.len(),
            self.missing_fields.len(),
        );
        for (&line_idx, &(desc_idx, field_idx)) in &self.kv_map {
            report.push_str(&format!(
                "\n  - {}[{}] (key {:?}) at line {}",
                self.descriptors[desc_idx].name,
                field_idx,
                self.key_lists[desc_idx][field_idx],
                line_idx
            ));
        }
        for &(desc_idx, field_idx) in &self.missing_fields {
            report.push_str(&format!(
                "\n  - {}[{}] (key {:?}) missing",
                self.descriptors[desc_idx].name, field_idx, self.key_lists[desc_idx][field_idx]
            ));
        }
        report
    }
}

/// Defines a key/value record: a serde struct whose fields align
/// positionally with a list of textual keys, plus its [`KvFields`] setter
/// and [`KvDescriptor`]. Only numeric field types are accepted.
macro_rules! kv_record {
    ($(#[$meta:meta])* pub struct $name:ident {
        $($field:ident : $ty:tt => $key:literal),+ $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
        pub struct $name {
            $(pub $field: $ty,)+
        }

        impl $crate::kvrepr::KvFields for $name {
            fn set_field(&mut self, idx: usize, value: $crate::kvrepr::FieldValue) {
                let mut cursor = 0usize;
                $(
                    if idx == cursor {
                        self.$field = kv_record!(@extract $ty, value);
                        return;
                    }
                    cursor += 1;
                )+
                let _ = cursor;
            }
        }

        impl $name {
            /// Textual keys, positionally aligned with the struct fields.
            pub const KEYS: &'static [&'static str] = &[$($key),+];
            /// Field kinds, positionally aligned with the struct fields.
            pub const KINDS: &'static [$crate::kvrepr::FieldKind] =
                &[$(kv_record!(@kind $ty)),+];

            /// Schema descriptor for [`KvRepr`](crate::kvrepr::KvRepr).
            pub fn descriptor() -> $crate::kvrepr::KvDescriptor {
                $crate::kvrepr::KvDescriptor {
                    name: stringify!($name),
                    kinds: Self::KINDS,
                }
            }
        }
    };

    (@kind u32) => { $crate::kvrepr::FieldKind::U32 };
    (@kind u64) => { $crate::kvrepr::FieldKind::U64 };
    (@kind i32) => { $crate::kvrepr::FieldKind::I32 };
    (@kind i64) => { $crate::kvrepr::FieldKind::I64 };
    (@kind f32) => { $crate::kvrepr::FieldKind::F32 };
    (@kind f64) => { $crate::kvrepr::FieldKind::F64 };

    (@extract u32, $v:expr) => { $v.as_u32() };
    (@extract u64, $v:expr) => { $v.as_u64() };
    (@extract i32, $v:expr) => { $v.as_i32() };
    (@extract i64, $v:expr) => { $v.as_i64() };
    (@extract f32, $v:expr) => { $v.as_f32() };
    (@extract f64, $v:expr) => { $v.as_f64() };
}

pub(crate) use kv_record;
