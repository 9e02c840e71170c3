//! A canonical, type-tagged encoding of the serde data model.
//!
//! Every value is prefixed with a tag naming its serde type, so values that are numerically
//! equal but differently typed (`5_i64`, `5_u64`, `5.0_f64`) encode differently. The encoding
//! is self-delimiting, which makes the concatenation of encoded values unambiguous.
//!
//! Map entries are sorted by their encoded key, so the iteration order of a `HashMap` never
//! leaks into the encoding. Everything else keeps the order in which serde visits it.
//! Serde serializes sets as plain sequences, so a `HashSet` argument encodes in its hash
//! order. Pass sets as a `BTreeSet` or as a sorted sequence instead.

use std::fmt;

use serde::ser::{self, Serialize};

mod tag {
    pub const BOOL: u8 = 0x01;
    pub const I8: u8 = 0x02;
    pub const I16: u8 = 0x03;
    pub const I32: u8 = 0x04;
    pub const I64: u8 = 0x05;
    pub const I128: u8 = 0x06;
    pub const U8: u8 = 0x07;
    pub const U16: u8 = 0x08;
    pub const U32: u8 = 0x09;
    pub const U64: u8 = 0x0a;
    pub const U128: u8 = 0x0b;
    pub const F32: u8 = 0x0c;
    pub const F64: u8 = 0x0d;
    pub const CHAR: u8 = 0x0e;
    pub const STR: u8 = 0x0f;
    pub const BYTES: u8 = 0x10;
    pub const NONE: u8 = 0x11;
    pub const SOME: u8 = 0x12;
    pub const UNIT: u8 = 0x13;
    pub const UNIT_STRUCT: u8 = 0x14;
    pub const UNIT_VARIANT: u8 = 0x15;
    pub const NEWTYPE_STRUCT: u8 = 0x16;
    pub const NEWTYPE_VARIANT: u8 = 0x17;
    pub const SEQ: u8 = 0x18;
    pub const TUPLE: u8 = 0x19;
    pub const TUPLE_STRUCT: u8 = 0x1a;
    pub const TUPLE_VARIANT: u8 = 0x1b;
    pub const MAP: u8 = 0x1c;
    pub const STRUCT: u8 = 0x1d;
    pub const STRUCT_VARIANT: u8 = 0x1e;
}

pub(crate) use tag::SEQ as SEQ_TAG;

/// An argument that cannot be canonically encoded.
#[derive(Debug)]
pub struct EncodeError(String);

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EncodeError {}

impl ser::Error for EncodeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Canonically encodes `value`.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    value.serialize(Canonical { out: &mut out })?;
    Ok(out)
}

pub(crate) fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_le_bytes());
}

pub(crate) fn write_str(out: &mut Vec<u8>, s: &str) {
    write_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

struct Canonical<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> Canonical<'a> {
    fn tagged(self, tag: u8, bytes: &[u8]) -> Result<(), EncodeError> {
        self.out.push(tag);
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn compound(
        self,
        tag: u8,
        name: Option<&'static str>,
        variant: Option<&'static str>,
    ) -> Compound<'a> {
        self.out.push(tag);
        if let Some(name) = name {
            write_str(self.out, name);
        }
        if let Some(variant) = variant {
            write_str(self.out, variant);
        }
        Compound {
            out: self.out,
            items: Vec::new(),
            count: 0,
        }
    }
}

impl<'a> ser::Serializer for Canonical<'a> {
    type Ok = ();
    type Error = EncodeError;

    type SerializeSeq = Compound<'a>;
    type SerializeTuple = Compound<'a>;
    type SerializeTupleStruct = Compound<'a>;
    type SerializeTupleVariant = Compound<'a>;
    type SerializeMap = MapCompound<'a>;
    type SerializeStruct = Compound<'a>;
    type SerializeStructVariant = Compound<'a>;

    fn serialize_bool(self, v: bool) -> Result<(), EncodeError> {
        self.tagged(tag::BOOL, &[v as u8])
    }

    fn serialize_i8(self, v: i8) -> Result<(), EncodeError> {
        self.tagged(tag::I8, &v.to_le_bytes())
    }

    fn serialize_i16(self, v: i16) -> Result<(), EncodeError> {
        self.tagged(tag::I16, &v.to_le_bytes())
    }

    fn serialize_i32(self, v: i32) -> Result<(), EncodeError> {
        self.tagged(tag::I32, &v.to_le_bytes())
    }

    fn serialize_i64(self, v: i64) -> Result<(), EncodeError> {
        self.tagged(tag::I64, &v.to_le_bytes())
    }

    fn serialize_i128(self, v: i128) -> Result<(), EncodeError> {
        self.tagged(tag::I128, &v.to_le_bytes())
    }

    fn serialize_u8(self, v: u8) -> Result<(), EncodeError> {
        self.tagged(tag::U8, &v.to_le_bytes())
    }

    fn serialize_u16(self, v: u16) -> Result<(), EncodeError> {
        self.tagged(tag::U16, &v.to_le_bytes())
    }

    fn serialize_u32(self, v: u32) -> Result<(), EncodeError> {
        self.tagged(tag::U32, &v.to_le_bytes())
    }

    fn serialize_u64(self, v: u64) -> Result<(), EncodeError> {
        self.tagged(tag::U64, &v.to_le_bytes())
    }

    fn serialize_u128(self, v: u128) -> Result<(), EncodeError> {
        self.tagged(tag::U128, &v.to_le_bytes())
    }

    fn serialize_f32(self, v: f32) -> Result<(), EncodeError> {
        let v = if v.is_nan() { f32::NAN } else { v };
        self.tagged(tag::F32, &v.to_bits().to_le_bytes())
    }

    fn serialize_f64(self, v: f64) -> Result<(), EncodeError> {
        let v = if v.is_nan() { f64::NAN } else { v };
        self.tagged(tag::F64, &v.to_bits().to_le_bytes())
    }

    fn serialize_char(self, v: char) -> Result<(), EncodeError> {
        self.tagged(tag::CHAR, &(v as u32).to_le_bytes())
    }

    fn serialize_str(self, v: &str) -> Result<(), EncodeError> {
        self.out.push(tag::STR);
        write_str(self.out, v);
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), EncodeError> {
        self.out.push(tag::BYTES);
        write_len(self.out, v.len());
        self.out.extend_from_slice(v);
        Ok(())
    }

    fn serialize_none(self) -> Result<(), EncodeError> {
        self.tagged(tag::NONE, &[])
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), EncodeError> {
        self.out.push(tag::SOME);
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), EncodeError> {
        self.tagged(tag::UNIT, &[])
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<(), EncodeError> {
        self.out.push(tag::UNIT_STRUCT);
        write_str(self.out, name);
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<(), EncodeError> {
        self.out.push(tag::UNIT_VARIANT);
        write_str(self.out, name);
        write_str(self.out, variant);
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        self.out.push(tag::NEWTYPE_STRUCT);
        write_str(self.out, name);
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        self.out.push(tag::NEWTYPE_VARIANT);
        write_str(self.out, name);
        write_str(self.out, variant);
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Compound<'a>, EncodeError> {
        Ok(self.compound(tag::SEQ, None, None))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Compound<'a>, EncodeError> {
        Ok(self.compound(tag::TUPLE, None, None))
    }

    fn serialize_tuple_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Compound<'a>, EncodeError> {
        Ok(self.compound(tag::TUPLE_STRUCT, Some(name), None))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Compound<'a>, EncodeError> {
        Ok(self.compound(tag::TUPLE_VARIANT, Some(name), Some(variant)))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapCompound<'a>, EncodeError> {
        Ok(MapCompound {
            out: self.out,
            entries: Vec::new(),
            pending_key: None,
        })
    }

    fn serialize_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Compound<'a>, EncodeError> {
        Ok(self.compound(tag::STRUCT, Some(name), None))
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Compound<'a>, EncodeError> {
        Ok(self.compound(tag::STRUCT_VARIANT, Some(name), Some(variant)))
    }
}

/// Sequences, tuples and structs.
///
/// The header is written eagerly, the elements are buffered until the element count is known.
struct Compound<'a> {
    out: &'a mut Vec<u8>,
    items: Vec<u8>,
    count: usize,
}

impl Compound<'_> {
    fn element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        value.serialize(Canonical {
            out: &mut self.items,
        })?;
        self.count += 1;
        Ok(())
    }

    fn field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        write_str(&mut self.items, key);
        self.element(value)
    }

    fn finish(self) -> Result<(), EncodeError> {
        write_len(self.out, self.count);
        self.out.extend_from_slice(&self.items);
        Ok(())
    }
}

impl ser::SerializeSeq for Compound<'_> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.element(value)
    }

    fn end(self) -> Result<(), EncodeError> {
        self.finish()
    }
}

impl ser::SerializeTuple for Compound<'_> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.element(value)
    }

    fn end(self) -> Result<(), EncodeError> {
        self.finish()
    }
}

impl ser::SerializeTupleStruct for Compound<'_> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.element(value)
    }

    fn end(self) -> Result<(), EncodeError> {
        self.finish()
    }
}

impl ser::SerializeTupleVariant for Compound<'_> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.element(value)
    }

    fn end(self) -> Result<(), EncodeError> {
        self.finish()
    }
}

impl ser::SerializeStruct for Compound<'_> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        self.field(key, value)
    }

    fn end(self) -> Result<(), EncodeError> {
        self.finish()
    }
}

impl ser::SerializeStructVariant for Compound<'_> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        self.field(key, value)
    }

    fn end(self) -> Result<(), EncodeError> {
        self.finish()
    }
}

/// Maps, whose entries are sorted by their encoded key before being written out.
struct MapCompound<'a> {
    out: &'a mut Vec<u8>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pending_key: Option<Vec<u8>>,
}

impl ser::SerializeMap for MapCompound<'_> {
    type Ok = ();
    type Error = EncodeError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), EncodeError> {
        self.pending_key = Some(to_canonical_bytes(key)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| EncodeError("map value serialized without a key".into()))?;
        self.entries.push((key, to_canonical_bytes(value)?));
        Ok(())
    }

    fn end(mut self) -> Result<(), EncodeError> {
        self.entries.sort();
        self.out.push(tag::MAP);
        write_len(self.out, self.entries.len());
        for (key, value) in self.entries {
            self.out.extend_from_slice(&key);
            self.out.extend_from_slice(&value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use serde::Serialize;

    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_primitive_layout() {
        insta::assert_snapshot!(hex(&to_canonical_bytes(&5_i64).unwrap()), @"050500000000000000");
        insta::assert_snapshot!(hex(&to_canonical_bytes(&5.0_f64).unwrap()), @"0d0000000000001440");
        insta::assert_snapshot!(hex(&to_canonical_bytes("ab").unwrap()), @"0f02000000000000006162");
    }

    #[test]
    fn test_numeric_types_are_distinct() {
        let encodings = [
            to_canonical_bytes(&5_i32).unwrap(),
            to_canonical_bytes(&5_i64).unwrap(),
            to_canonical_bytes(&5_u64).unwrap(),
            to_canonical_bytes(&5.0_f32).unwrap(),
            to_canonical_bytes(&5.0_f64).unwrap(),
        ];
        for (i, a) in encodings.iter().enumerate() {
            for b in &encodings[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_owned_and_borrowed_strings_agree() {
        assert_eq!(
            to_canonical_bytes("hello").unwrap(),
            to_canonical_bytes(&String::from("hello")).unwrap()
        );
    }

    #[test]
    fn test_nan_is_canonical() {
        let quiet = f64::NAN;
        let other = f64::from_bits(f64::NAN.to_bits() | 1);
        assert!(other.is_nan());
        assert_eq!(
            to_canonical_bytes(&quiet).unwrap(),
            to_canonical_bytes(&other).unwrap()
        );
    }

    #[test]
    fn test_map_order_is_irrelevant() {
        let mut forward = HashMap::new();
        let mut backward = HashMap::new();
        for i in 0..64 {
            forward.insert(format!("key{i}"), i);
            backward.insert(format!("key{}", 63 - i), 63 - i);
        }
        let sorted: BTreeMap<_, _> = forward.clone().into_iter().collect();

        let encoded = to_canonical_bytes(&forward).unwrap();
        assert_eq!(encoded, to_canonical_bytes(&backward).unwrap());
        assert_eq!(encoded, to_canonical_bytes(&sorted).unwrap());
    }

    #[test]
    fn test_structure_is_significant() {
        #[derive(Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }
        #[derive(Serialize)]
        struct Swapped {
            y: i32,
            x: i32,
        }

        let point = to_canonical_bytes(&Point { x: 1, y: 2 }).unwrap();
        assert_ne!(point, to_canonical_bytes(&Swapped { y: 2, x: 1 }).unwrap());
        assert_ne!(point, to_canonical_bytes(&(1, 2)).unwrap());
        assert_ne!(
            to_canonical_bytes(&vec![1, 2]).unwrap(),
            to_canonical_bytes(&(1, 2)).unwrap()
        );
        assert_ne!(
            to_canonical_bytes(&Some(())).unwrap(),
            to_canonical_bytes(&()).unwrap()
        );
    }

    #[test]
    fn test_nested_sequences_are_unambiguous() {
        let a: Vec<Vec<u8>> = vec![vec![1], vec![2, 3]];
        let b: Vec<Vec<u8>> = vec![vec![1, 2], vec![3]];
        assert_ne!(to_canonical_bytes(&a).unwrap(), to_canonical_bytes(&b).unwrap());
    }

    #[test]
    fn test_serialize_errors_propagate() {
        struct Opaque;
        impl Serialize for Opaque {
            fn serialize<S: ser::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
                Err(ser::Error::custom("opaque handles cannot be serialized"))
            }
        }

        let err = to_canonical_bytes(&vec![Opaque]).unwrap_err();
        assert_eq!(err.to_string(), "opaque handles cannot be serialized");
    }
}
