//! Self-describing type information ("introspection") for PVA data

use std::collections::HashMap;

use nom::{
    Err, IResult,
    error::{Error, ErrorKind},
    number::complete as number,
};

use crate::messages::{ByteOrder, WireBuffer, parse_count, parse_size, parse_string, parse_u16};

/// Type codes of the introspection encoding
mod code {
    pub const KIND_MASK: u8 = 0xE0;
    pub const ARRAY_MASK: u8 = 0x18;
    pub const VARIABLE_ARRAY: u8 = 0x08;
    pub const BOUNDED_ARRAY: u8 = 0x10;
    pub const FIXED_ARRAY: u8 = 0x18;
    pub const COMPLEX: u8 = 0x80;
    pub const STRUCTURE: u8 = 0x80;
    pub const UNION: u8 = 0x81;
    pub const ANY: u8 = 0x82;
    pub const BOUNDED_STRING: u8 = 0x83;
    pub const STRUCTURE_ARRAY: u8 = 0x88;
    pub const UNION_ARRAY: u8 = 0x89;
    pub const ANY_ARRAY: u8 = 0x8A;
    pub const FULL_WITH_ID: u8 = 0xFD;
    pub const ONLY_ID: u8 = 0xFE;
    pub const NULL: u8 = 0xFF;
}

/// Deepest nesting of descriptions and values accepted from a peer
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    UByte,
    UShort,
    UInt,
    ULong,
    Float,
    Double,
    String,
}

impl ScalarType {
    pub fn code(self) -> u8 {
        match self {
            ScalarType::Boolean => 0x00,
            ScalarType::Byte => 0x20,
            ScalarType::Short => 0x21,
            ScalarType::Int => 0x22,
            ScalarType::Long => 0x23,
            ScalarType::UByte => 0x24,
            ScalarType::UShort => 0x25,
            ScalarType::UInt => 0x26,
            ScalarType::ULong => 0x27,
            ScalarType::Float => 0x42,
            ScalarType::Double => 0x43,
            ScalarType::String => 0x60,
        }
    }

    pub fn from_code(code: u8) -> Option<ScalarType> {
        Some(match code {
            0x00 => ScalarType::Boolean,
            0x20 => ScalarType::Byte,
            0x21 => ScalarType::Short,
            0x22 => ScalarType::Int,
            0x23 => ScalarType::Long,
            0x24 => ScalarType::UByte,
            0x25 => ScalarType::UShort,
            0x26 => ScalarType::UInt,
            0x27 => ScalarType::ULong,
            0x42 => ScalarType::Float,
            0x43 => ScalarType::Double,
            0x60 => ScalarType::String,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Boolean => "boolean",
            ScalarType::Byte => "byte",
            ScalarType::Short => "short",
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::UByte => "ubyte",
            ScalarType::UShort => "ushort",
            ScalarType::UInt => "uint",
            ScalarType::ULong => "ulong",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
            ScalarType::String => "string",
        }
    }
}

/// Named, ordered list of fields
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructureDesc {
    pub type_id: String,
    pub fields: Vec<(String, FieldDesc)>,
}

impl StructureDesc {
    pub fn new(type_id: impl Into<String>) -> Self {
        StructureDesc {
            type_id: type_id.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, desc: FieldDesc) -> Self {
        self.fields.push((name.into(), desc));
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldDesc> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    /// Find the type of a dotted sub-field path, e.g. `"alarm.severity"`
    pub fn locate(&self, path: &str) -> Option<&FieldDesc> {
        let (head, tail) = match path.split_once('.') {
            Some((head, tail)) => (head, Some(tail)),
            None => (path, None),
        };
        let field = self.get(head)?;
        match (tail, field) {
            (None, field) => Some(field),
            (Some(tail), FieldDesc::Structure(sub)) => sub.locate(tail),
            _ => None,
        }
    }

    fn write_body(&self, buffer: &mut WireBuffer) {
        buffer.put_string(&self.type_id);
        buffer.put_size(Some(self.fields.len()));
        for (name, desc) in &self.fields {
            buffer.put_string(name);
            desc.write(buffer);
        }
    }
}

/// Union of alternatives, of which one (or none) is selected at a time
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnionDesc {
    pub type_id: String,
    pub members: Vec<(String, FieldDesc)>,
}

/// Description of the type of one field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDesc {
    Scalar(ScalarType),
    ScalarArray(ScalarType),
    BoundedString(u32),
    Structure(StructureDesc),
    StructureArray(StructureDesc),
    Union(UnionDesc),
    UnionArray(UnionDesc),
    /// Variant union, i.e. "any"
    Any,
    AnyArray,
}

impl FieldDesc {
    /// Write the full description, without using the type cache
    pub fn write(&self, buffer: &mut WireBuffer) {
        match self {
            FieldDesc::Scalar(t) => buffer.put_u8(t.code()),
            FieldDesc::ScalarArray(t) => buffer.put_u8(t.code() | code::VARIABLE_ARRAY),
            FieldDesc::BoundedString(bound) => {
                buffer.put_u8(code::BOUNDED_STRING);
                buffer.put_size(Some(*bound as usize));
            }
            FieldDesc::Structure(s) => {
                buffer.put_u8(code::STRUCTURE);
                s.write_body(buffer);
            }
            FieldDesc::StructureArray(s) => {
                buffer.put_u8(code::STRUCTURE_ARRAY);
                buffer.put_u8(code::STRUCTURE);
                s.write_body(buffer);
            }
            FieldDesc::Union(u) => {
                buffer.put_u8(code::UNION);
                write_union_body(u, buffer);
            }
            FieldDesc::UnionArray(u) => {
                buffer.put_u8(code::UNION_ARRAY);
                buffer.put_u8(code::UNION);
                write_union_body(u, buffer);
            }
            FieldDesc::Any => buffer.put_u8(code::ANY),
            FieldDesc::AnyArray => buffer.put_u8(code::ANY_ARRAY),
        }
    }

    /// Write a possibly-missing description, as used by "any" values
    pub fn write_optional(desc: Option<&FieldDesc>, buffer: &mut WireBuffer) {
        match desc {
            Some(desc) => desc.write(buffer),
            None => buffer.put_u8(code::NULL),
        }
    }

    /// Human readable type name, e.g. for logging
    pub fn type_name(&self) -> String {
        match self {
            FieldDesc::Scalar(t) => t.name().to_string(),
            FieldDesc::ScalarArray(t) => format!("{}[]", t.name()),
            FieldDesc::BoundedString(n) => format!("string({n})"),
            FieldDesc::Structure(s) if s.type_id.is_empty() => "structure".to_string(),
            FieldDesc::Structure(s) => s.type_id.clone(),
            FieldDesc::StructureArray(s) if s.type_id.is_empty() => "structure[]".to_string(),
            FieldDesc::StructureArray(s) => format!("{}[]", s.type_id),
            FieldDesc::Union(_) => "union".to_string(),
            FieldDesc::UnionArray(_) => "union[]".to_string(),
            FieldDesc::Any => "any".to_string(),
            FieldDesc::AnyArray => "any[]".to_string(),
        }
    }

    /// Levels of nesting, counting this one
    pub fn depth(&self) -> usize {
        let deepest = |fields: &[(String, FieldDesc)]| {
            fields.iter().map(|(_, d)| d.depth()).max().unwrap_or(0)
        };
        match self {
            FieldDesc::Structure(s) | FieldDesc::StructureArray(s) => 1 + deepest(&s.fields),
            FieldDesc::Union(u) | FieldDesc::UnionArray(u) => 1 + deepest(&u.members),
            _ => 1,
        }
    }
}

fn write_union_body(desc: &UnionDesc, buffer: &mut WireBuffer) {
    buffer.put_string(&desc.type_id);
    buffer.put_size(Some(desc.members.len()));
    for (name, member) in &desc.members {
        buffer.put_string(name);
        member.write(buffer);
    }
}

/// Per-connection cache of type descriptions declared by the peer
///
/// A peer may send a full description tagged with an ID once, and afterwards refer
/// to it by the ID alone.
/// Nesting is limited to [`MAX_DEPTH`] levels, counted across descriptions and the
/// values parsed with them.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    types: HashMap<u16, FieldDesc>,
    depth: usize,
}

impl TypeRegistry {
    pub fn len(&self) -> usize {
        self.types.len()
    }
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
    pub fn get(&self, id: u16) -> Option<&FieldDesc> {
        self.types.get(&id)
    }

    /// Run a parser one nesting level deeper, failing past [`MAX_DEPTH`]
    pub(crate) fn nested<'a, T>(
        &mut self,
        input: &'a [u8],
        parser: impl FnOnce(&mut Self) -> IResult<&'a [u8], T>,
    ) -> IResult<&'a [u8], T> {
        if self.depth >= MAX_DEPTH {
            return Err(Err::Failure(Error::new(input, ErrorKind::TooLarge)));
        }
        self.depth += 1;
        let result = parser(self);
        self.depth -= 1;
        result
    }

    /// Parse a field description, which may be null
    pub fn parse_field_desc<'a>(
        &mut self,
        order: ByteOrder,
        input: &'a [u8],
    ) -> IResult<&'a [u8], Option<FieldDesc>> {
        self.nested(input, |types| types.parse_field_desc_inner(order, input))
    }

    fn parse_field_desc_inner<'a>(
        &mut self,
        order: ByteOrder,
        input: &'a [u8],
    ) -> IResult<&'a [u8], Option<FieldDesc>> {
        let (rest, type_code) = number::u8(input)?;
        match type_code {
            code::NULL => Ok((rest, None)),
            code::ONLY_ID => {
                let (rest, id) = parse_u16(order, rest)?;
                match self.types.get(&id) {
                    // A cached type nested inside this one must still fit
                    Some(desc) if self.depth + desc.depth() <= MAX_DEPTH + 1 => {
                        Ok((rest, Some(desc.clone())))
                    }
                    Some(_) => Err(Err::Failure(Error::new(input, ErrorKind::TooLarge))),
                    None => Err(Err::Failure(Error::new(input, ErrorKind::Verify))),
                }
            }
            code::FULL_WITH_ID => {
                let (rest, id) = parse_u16(order, rest)?;
                let (rest, desc) = self.parse_field_desc(order, rest)?;
                if let Some(desc) = &desc {
                    self.types.insert(id, desc.clone());
                }
                Ok((rest, desc))
            }
            _ => {
                let (rest, desc) = self.parse_typed(order, type_code, input, rest)?;
                Ok((rest, Some(desc)))
            }
        }
    }

    /// Parse a description that must be present
    fn parse_required<'a>(
        &mut self,
        order: ByteOrder,
        input: &'a [u8],
    ) -> IResult<&'a [u8], FieldDesc> {
        match self.parse_field_desc(order, input)? {
            (rest, Some(desc)) => Ok((rest, desc)),
            (_, None) => Err(Err::Failure(Error::new(input, ErrorKind::Verify))),
        }
    }

    fn parse_typed<'a>(
        &mut self,
        order: ByteOrder,
        type_code: u8,
        start: &'a [u8],
        rest: &'a [u8],
    ) -> IResult<&'a [u8], FieldDesc> {
        let fail = || Err::Failure(Error::new(start, ErrorKind::Verify));
        if type_code & code::KIND_MASK != code::COMPLEX {
            let scalar = ScalarType::from_code(type_code & !code::ARRAY_MASK).ok_or_else(fail)?;
            return match type_code & code::ARRAY_MASK {
                0 => Ok((rest, FieldDesc::Scalar(scalar))),
                code::VARIABLE_ARRAY => Ok((rest, FieldDesc::ScalarArray(scalar))),
                // Bounds are a hint only, values are sent like variable arrays
                code::BOUNDED_ARRAY => {
                    let (rest, _bound) = parse_count(order, rest)?;
                    Ok((rest, FieldDesc::ScalarArray(scalar)))
                }
                code::FIXED_ARRAY => Err(fail()),
                _ => unreachable!(),
            };
        }
        match type_code {
            code::STRUCTURE => {
                let (rest, s) = self.parse_structure_body(order, rest)?;
                Ok((rest, FieldDesc::Structure(s)))
            }
            code::STRUCTURE_ARRAY => match self.parse_required(order, rest)? {
                (rest, FieldDesc::Structure(s)) => Ok((rest, FieldDesc::StructureArray(s))),
                _ => Err(fail()),
            },
            code::UNION => {
                let (rest, u) = self.parse_union_body(order, rest)?;
                Ok((rest, FieldDesc::Union(u)))
            }
            code::UNION_ARRAY => match self.parse_required(order, rest)? {
                (rest, FieldDesc::Union(u)) => Ok((rest, FieldDesc::UnionArray(u))),
                _ => Err(fail()),
            },
            code::ANY => Ok((rest, FieldDesc::Any)),
            code::ANY_ARRAY => Ok((rest, FieldDesc::AnyArray)),
            code::BOUNDED_STRING => {
                let (rest, bound) = parse_count(order, rest)?;
                Ok((rest, FieldDesc::BoundedString(bound as u32)))
            }
            _ => Err(fail()),
        }
    }

    fn parse_members<'a>(
        &mut self,
        order: ByteOrder,
        input: &'a [u8],
    ) -> IResult<&'a [u8], (String, Vec<(String, FieldDesc)>)> {
        let (input, type_id) = parse_string(order, input)?;
        let (mut input, count) = parse_size(order, input)?;
        let count = count.unwrap_or(0);
        let mut members = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let (rest, name) = parse_string(order, input)?;
            let (rest, desc) = self.parse_required(order, rest)?;
            members.push((name, desc));
            input = rest;
        }
        Ok((input, (type_id, members)))
    }

    fn parse_structure_body<'a>(
        &mut self,
        order: ByteOrder,
        input: &'a [u8],
    ) -> IResult<&'a [u8], StructureDesc> {
        let (input, (type_id, fields)) = self.parse_members(order, input)?;
        Ok((input, StructureDesc { type_id, fields }))
    }

    fn parse_union_body<'a>(
        &mut self,
        order: ByteOrder,
        input: &'a [u8],
    ) -> IResult<&'a [u8], UnionDesc> {
        let (input, (type_id, members)) = self.parse_members(order, input)?;
        Ok((input, UnionDesc { type_id, members }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FieldDesc {
        FieldDesc::Structure(
            StructureDesc::new("epics:nt/NTScalar:1.0")
                .field("value", FieldDesc::Scalar(ScalarType::Double))
                .field(
                    "alarm",
                    FieldDesc::Structure(
                        StructureDesc::new("alarm_t")
                            .field("severity", FieldDesc::Scalar(ScalarType::Int))
                            .field("message", FieldDesc::Scalar(ScalarType::String)),
                    ),
                )
                .field("tags", FieldDesc::ScalarArray(ScalarType::String)),
        )
    }

    #[test]
    fn structure_description() {
        let mut buffer = WireBuffer::new(ByteOrder::Big);
        FieldDesc::Structure(
            StructureDesc::new("").field("x", FieldDesc::ScalarArray(ScalarType::UInt)),
        )
        .write(&mut buffer);
        assert_eq!(buffer.as_slice(), b"\x80\x00\x01\x01x\x2e");

        let mut buffer = WireBuffer::new(ByteOrder::Little);
        sample().write(&mut buffer);
        let mut types = TypeRegistry::default();
        let (rest, parsed) = types
            .parse_field_desc(ByteOrder::Little, buffer.as_slice())
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, Some(sample()));
    }

    #[test]
    fn cached_types() {
        let mut buffer = WireBuffer::new(ByteOrder::Big);
        buffer.put_u8(0xFD);
        buffer.put_u16(1);
        sample().write(&mut buffer);
        buffer.put_u8(0xFE);
        buffer.put_u16(1);

        let mut types = TypeRegistry::default();
        let (rest, first) = types
            .parse_field_desc(ByteOrder::Big, buffer.as_slice())
            .unwrap();
        let (rest, second) = types.parse_field_desc(ByteOrder::Big, rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(first, second);
        assert_eq!(types.len(), 1);

        // Unknown reference
        let mut fresh = TypeRegistry::default();
        assert!(fresh.parse_field_desc(ByteOrder::Big, b"\xfe\x00\x01").is_err());
    }

    /// `levels` structures, each holding the next as its only field "a"
    fn nested_structures(levels: usize) -> Vec<u8> {
        let mut data = b"\x80\x00\x01\x01a".repeat(levels);
        data.push(0x22);
        data
    }

    #[test]
    fn deep_nesting_is_refused() {
        let mut types = TypeRegistry::default();
        let shallow = nested_structures(MAX_DEPTH - 1);
        let (rest, desc) = types
            .parse_field_desc(ByteOrder::Big, &shallow)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(desc.unwrap().depth(), MAX_DEPTH);

        let deep = nested_structures(200_000);
        let result = types.parse_field_desc(ByteOrder::Big, &deep);
        assert!(matches!(result, Err(Err::Failure(_))));
        // The registry is still usable afterwards
        assert_eq!(types.depth, 0);
        assert!(types.parse_field_desc(ByteOrder::Big, b"\x22").is_ok());
    }

    #[test]
    fn cached_types_cannot_stack_past_the_limit() {
        let mut types = TypeRegistry::default();
        let mut data = vec![0xFD, 0x00, 0x01];
        data.extend(nested_structures(40));
        types.parse_field_desc(ByteOrder::Big, &data).unwrap();

        // One structure around the cached type is fine, forty are not
        let mut wrapped = b"\x80\x00\x01\x01a".to_vec();
        wrapped.extend([0xFE, 0x00, 0x01]);
        assert!(types.parse_field_desc(ByteOrder::Big, &wrapped).is_ok());

        let mut wrapped = b"\x80\x00\x01\x01a".repeat(40);
        wrapped.extend([0xFE, 0x00, 0x01]);
        assert!(matches!(
            types.parse_field_desc(ByteOrder::Big, &wrapped),
            Err(Err::Failure(_))
        ));
    }

    #[test]
    fn locate_sub_field() {
        let FieldDesc::Structure(s) = sample() else {
            panic!("Not a structure");
        };
        assert_eq!(
            s.locate("alarm.severity"),
            Some(&FieldDesc::Scalar(ScalarType::Int))
        );
        assert_eq!(s.locate("value.x"), None);
        assert_eq!(s.locate("nothing"), None);
    }
}
