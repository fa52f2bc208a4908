//! Heap object representation.
//!
//! Every object carries its class, the 4-bit format code it was created with,
//! a 12-bit identity hash and exactly one [`Body`] shape matching the format.

use crate::Value;

// ── Format codes ─────────────────────────────────────────────────────

pub const FORMAT_EMPTY: u8 = 0;
pub const FORMAT_FIXED: u8 = 1;
pub const FORMAT_INDEXABLE: u8 = 2;
pub const FORMAT_FIXED_INDEXABLE: u8 = 3;
pub const FORMAT_WEAK: u8 = 4;
pub const FORMAT_WORDS: u8 = 6;
pub const FORMAT_BYTES: u8 = 8;
pub const FORMAT_METHOD: u8 = 12;

#[inline]
pub const fn is_pointer_format(format: u8) -> bool {
    format < 5
}

#[inline]
pub const fn is_word_format(format: u8) -> bool {
    format >= 5 && format < 8
}

#[inline]
pub const fn is_byte_format(format: u8) -> bool {
    format >= 8 && format < 12
}

#[inline]
pub const fn is_method_format(format: u8) -> bool {
    format >= 12
}

/// Byte formats keep the number of unused bytes of the last word in their low bits.
#[inline]
pub const fn byte_format_for(base: u8, len: usize) -> u8 {
    base | ((4 - (len % 4) as u8) & 3)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Pointers(Vec<Value>),
    Words(Vec<u32>),
    Bytes(Vec<u8>),
    /// `literals[0]` is the method header.
    Method {
        literals: Vec<Value>,
        bytecode: Vec<u8>,
    },
    Float(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    pub class: Value,
    pub format: u8,
    pub hash: u16,
    pub body: Body,
}

impl HeapObject {
    pub fn new(class: Value, format: u8, body: Body) -> Self {
        Self {
            class,
            format,
            hash: 0,
            body,
        }
    }

    pub fn pointers(&self) -> Option<&[Value]> {
        match &self.body {
            Body::Pointers(fields) => Some(fields),
            Body::Method { literals, .. } => Some(literals),
            _ => None,
        }
    }

    pub fn pointers_mut(&mut self) -> Option<&mut Vec<Value>> {
        match &mut self.body {
            Body::Pointers(fields) => Some(fields),
            Body::Method { literals, .. } => Some(literals),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Bytes(bytes) => Some(bytes),
            Body::Method { bytecode, .. } => Some(bytecode),
            _ => None,
        }
    }

    pub fn bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.body {
            Body::Bytes(bytes) => Some(bytes),
            Body::Method { bytecode, .. } => Some(bytecode),
            _ => None,
        }
    }

    pub fn words(&self) -> Option<&[u32]> {
        match &self.body {
            Body::Words(words) => Some(words),
            _ => None,
        }
    }

    pub fn float(&self) -> Option<f64> {
        match self.body {
            Body::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn pointer_len(&self) -> usize {
        self.pointers().map_or(0, <[Value]>::len)
    }

    /// Length of the raw (non-pointer) part in its natural unit.
    pub fn bits_len(&self) -> usize {
        match &self.body {
            Body::Words(words) => words.len(),
            Body::Bytes(bytes) => bytes.len(),
            Body::Method { bytecode, .. } => bytecode.len(),
            Body::Float(_) => 2,
            Body::Pointers(_) => 0,
        }
    }

    pub fn method_header(&self) -> Option<MethodHeader> {
        match &self.body {
            Body::Method { literals, .. } => literals
                .first()
                .and_then(|header| header.as_small())
                .map(MethodHeader),
            _ => None,
        }
    }
}

// ── Method header ────────────────────────────────────────────────────

/// The SmallInteger stored as literal 0 of every compiled method.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MethodHeader(pub i32);

impl MethodHeader {
    pub fn new(
        num_args: u32,
        num_temps: u32,
        num_literals: u32,
        primitive: u32,
        large: bool,
    ) -> Self {
        let bits = (primitive & 0x1FF)
            | ((num_literals & 0xFF) << 9)
            | (u32::from(large) << 17)
            | ((num_temps & 0x3F) << 18)
            | ((num_args & 0xF) << 24)
            | (((primitive >> 9) & 0x3) << 28);
        Self(bits as i32)
    }

    pub const fn num_literals(self) -> usize {
        ((self.0 >> 9) & 0xFF) as usize
    }

    pub const fn num_args(self) -> usize {
        ((self.0 >> 24) & 0xF) as usize
    }

    /// Includes the arguments.
    pub const fn num_temps(self) -> usize {
        ((self.0 >> 18) & 0x3F) as usize
    }

    pub const fn large_context(self) -> bool {
        self.0 & 0x20000 != 0
    }

    pub const fn primitive(self) -> u32 {
        ((self.0 & 0x1FF) + ((self.0 & 0x3000_0000) >> 19)) as u32
    }

    pub fn value(self) -> Value {
        Value::small(self.0).unwrap_or(Value::from_raw(1))
    }
}

// ── Class format word ────────────────────────────────────────────────

/// Decoded `format` instance variable of a class.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClassFormat(pub i32);

impl ClassFormat {
    pub fn new(inst_size: usize, format: u8) -> Self {
        let size = inst_size as i32 + 1;
        Self(((size & 0x3F) << 1) | ((size & 0xC0) << 10) | (i32::from(format & 0xF) << 7))
    }

    pub const fn inst_size(self) -> usize {
        let size = ((self.0 >> 1) & 0x3F) + ((self.0 >> 10) & 0xC0) - 1;
        if size < 0 { 0 } else { size as usize }
    }

    pub const fn format(self) -> u8 {
        ((self.0 >> 7) & 0xF) as u8
    }

    pub const fn is_indexable(self) -> bool {
        let format = self.format();
        format == FORMAT_INDEXABLE
            || format == FORMAT_FIXED_INDEXABLE
            || format == FORMAT_WEAK
            || format >= 6
    }

    pub fn value(self) -> Value {
        Value::small(self.0).unwrap_or(Value::from_raw(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_header_fields() {
        let header = MethodHeader::new(2, 5, 7, 600, true);
        assert_eq!(header.num_args(), 2);
        assert_eq!(header.num_temps(), 5);
        assert_eq!(header.num_literals(), 7);
        assert_eq!(header.primitive(), 600);
        assert!(header.large_context());
        assert!(Value::small(header.0).is_some());
    }

    #[test]
    fn class_format_fields() {
        let format = ClassFormat::new(3, FORMAT_FIXED_INDEXABLE);
        assert_eq!(format.inst_size(), 3);
        assert_eq!(format.format(), FORMAT_FIXED_INDEXABLE);
        assert!(format.is_indexable());

        let wide = ClassFormat::new(100, FORMAT_FIXED);
        assert_eq!(wide.inst_size(), 100);
        assert!(!wide.is_indexable());
    }

    #[test]
    fn byte_format_records_padding() {
        assert_eq!(byte_format_for(FORMAT_BYTES, 4), 8);
        assert_eq!(byte_format_for(FORMAT_BYTES, 5), 11);
        assert_eq!(byte_format_for(FORMAT_METHOD, 2), 14);
    }
}
