//! Structured PV values and their encoding

use nom::{IResult, multi::count, number::complete as number};
use num::{NumCast, ToPrimitive};

use super::{
    BitSet, DataError,
    introspection::{FieldDesc, ScalarType, StructureDesc, TypeRegistry, UnionDesc},
};
use crate::messages::{
    ByteOrder, WireBuffer, parse_bool, parse_count, parse_f32, parse_f64, parse_i16, parse_i32,
    parse_i64, parse_size, parse_string, parse_u16, parse_u32, parse_u64,
};

/// Something with a fixed-size wire representation
trait WireScalar: Sized {
    fn parse(order: ByteOrder, input: &[u8]) -> IResult<&[u8], Self>;
    fn put(&self, buffer: &mut WireBuffer);
}

macro_rules! wire_scalar {
    ($typ:ty, $parse:ident, $put:ident) => {
        impl WireScalar for $typ {
            fn parse(order: ByteOrder, input: &[u8]) -> IResult<&[u8], Self> {
                $parse(order, input)
            }
            fn put(&self, buffer: &mut WireBuffer) {
                buffer.$put(*self)
            }
        }
    };
}
wire_scalar!(i16, parse_i16, put_i16);
wire_scalar!(u16, parse_u16, put_u16);
wire_scalar!(i32, parse_i32, put_i32);
wire_scalar!(u32, parse_u32, put_u32);
wire_scalar!(i64, parse_i64, put_i64);
wire_scalar!(u64, parse_u64, put_u64);
wire_scalar!(f32, parse_f32, put_f32);
wire_scalar!(f64, parse_f64, put_f64);

impl WireScalar for bool {
    fn parse(_order: ByteOrder, input: &[u8]) -> IResult<&[u8], Self> {
        parse_bool(input)
    }
    fn put(&self, buffer: &mut WireBuffer) {
        buffer.put_bool(*self)
    }
}
impl WireScalar for i8 {
    fn parse(_order: ByteOrder, input: &[u8]) -> IResult<&[u8], Self> {
        number::i8(input)
    }
    fn put(&self, buffer: &mut WireBuffer) {
        buffer.put_i8(*self)
    }
}
impl WireScalar for u8 {
    fn parse(_order: ByteOrder, input: &[u8]) -> IResult<&[u8], Self> {
        number::u8(input)
    }
    fn put(&self, buffer: &mut WireBuffer) {
        buffer.put_u8(*self)
    }
}
impl WireScalar for String {
    fn parse(order: ByteOrder, input: &[u8]) -> IResult<&[u8], Self> {
        parse_string(order, input)
    }
    fn put(&self, buffer: &mut WireBuffer) {
        buffer.put_string(self)
    }
}

fn parse_array<T: WireScalar>(order: ByteOrder, input: &[u8]) -> IResult<&[u8], Vec<T>> {
    let (input, n) = parse_count(order, input)?;
    count(|i| T::parse(order, i), n)(input)
}

fn put_array<T: WireScalar>(values: &[T], buffer: &mut WireBuffer) {
    buffer.put_size(Some(values.len()));
    for value in values {
        value.put(buffer);
    }
}

/// A value of a union: the member description and which member is selected
#[derive(Debug, Clone, PartialEq)]
pub struct PvUnion {
    pub desc: UnionDesc,
    pub selected: Option<(usize, Box<PvValue>)>,
}

impl PvUnion {
    pub fn new(desc: UnionDesc) -> Self {
        PvUnion {
            desc,
            selected: None,
        }
    }

    fn write(&self, buffer: &mut WireBuffer) {
        match &self.selected {
            Some((index, value)) => {
                buffer.put_size(Some(*index));
                value.write(buffer);
            }
            None => buffer.put_size(None),
        }
    }

    fn parse<'a>(
        desc: &UnionDesc,
        order: ByteOrder,
        types: &mut TypeRegistry,
        input: &'a [u8],
    ) -> IResult<&'a [u8], PvUnion> {
        let (input, selector) = parse_size(order, input)?;
        let mut union = PvUnion::new(desc.clone());
        let Some(selector) = selector else {
            return Ok((input, union));
        };
        let Some((_, member)) = desc.members.get(selector) else {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Verify,
            )));
        };
        let (input, value) = member.parse_value(order, types, input)?;
        union.selected = Some((selector, Box::new(value)));
        Ok((input, union))
    }
}

/// Value of a single field
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    UByte(u8),
    UShort(u16),
    UInt(u32),
    ULong(u64),
    Float(f32),
    Double(f64),
    String(String),
    BoundedString(u32, String),
    BooleanArray(Vec<bool>),
    ByteArray(Vec<i8>),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    UByteArray(Vec<u8>),
    UShortArray(Vec<u16>),
    UIntArray(Vec<u32>),
    ULongArray(Vec<u64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    Structure(PvStructure),
    StructureArray(StructureDesc, Vec<Option<PvStructure>>),
    Union(PvUnion),
    UnionArray(UnionDesc, Vec<Option<PvUnion>>),
    Any(Option<Box<PvValue>>),
    AnyArray(Vec<Option<PvValue>>),
}

impl PvValue {
    pub fn field_desc(&self) -> FieldDesc {
        use FieldDesc::{Scalar, ScalarArray};
        match self {
            PvValue::Boolean(_) => Scalar(ScalarType::Boolean),
            PvValue::Byte(_) => Scalar(ScalarType::Byte),
            PvValue::Short(_) => Scalar(ScalarType::Short),
            PvValue::Int(_) => Scalar(ScalarType::Int),
            PvValue::Long(_) => Scalar(ScalarType::Long),
            PvValue::UByte(_) => Scalar(ScalarType::UByte),
            PvValue::UShort(_) => Scalar(ScalarType::UShort),
            PvValue::UInt(_) => Scalar(ScalarType::UInt),
            PvValue::ULong(_) => Scalar(ScalarType::ULong),
            PvValue::Float(_) => Scalar(ScalarType::Float),
            PvValue::Double(_) => Scalar(ScalarType::Double),
            PvValue::String(_) => Scalar(ScalarType::String),
            PvValue::BoundedString(bound, _) => FieldDesc::BoundedString(*bound),
            PvValue::BooleanArray(_) => ScalarArray(ScalarType::Boolean),
            PvValue::ByteArray(_) => ScalarArray(ScalarType::Byte),
            PvValue::ShortArray(_) => ScalarArray(ScalarType::Short),
            PvValue::IntArray(_) => ScalarArray(ScalarType::Int),
            PvValue::LongArray(_) => ScalarArray(ScalarType::Long),
            PvValue::UByteArray(_) => ScalarArray(ScalarType::UByte),
            PvValue::UShortArray(_) => ScalarArray(ScalarType::UShort),
            PvValue::UIntArray(_) => ScalarArray(ScalarType::UInt),
            PvValue::ULongArray(_) => ScalarArray(ScalarType::ULong),
            PvValue::FloatArray(_) => ScalarArray(ScalarType::Float),
            PvValue::DoubleArray(_) => ScalarArray(ScalarType::Double),
            PvValue::StringArray(_) => ScalarArray(ScalarType::String),
            PvValue::Structure(s) => FieldDesc::Structure(s.desc()),
            PvValue::StructureArray(desc, _) => FieldDesc::StructureArray(desc.clone()),
            PvValue::Union(u) => FieldDesc::Union(u.desc.clone()),
            PvValue::UnionArray(desc, _) => FieldDesc::UnionArray(desc.clone()),
            PvValue::Any(_) => FieldDesc::Any,
            PvValue::AnyArray(_) => FieldDesc::AnyArray,
        }
    }

    pub fn write(&self, buffer: &mut WireBuffer) {
        match self {
            PvValue::Boolean(v) => v.put(buffer),
            PvValue::Byte(v) => v.put(buffer),
            PvValue::Short(v) => v.put(buffer),
            PvValue::Int(v) => v.put(buffer),
            PvValue::Long(v) => v.put(buffer),
            PvValue::UByte(v) => v.put(buffer),
            PvValue::UShort(v) => v.put(buffer),
            PvValue::UInt(v) => v.put(buffer),
            PvValue::ULong(v) => v.put(buffer),
            PvValue::Float(v) => v.put(buffer),
            PvValue::Double(v) => v.put(buffer),
            PvValue::String(v) | PvValue::BoundedString(_, v) => v.put(buffer),
            PvValue::BooleanArray(v) => put_array(v, buffer),
            PvValue::ByteArray(v) => put_array(v, buffer),
            PvValue::ShortArray(v) => put_array(v, buffer),
            PvValue::IntArray(v) => put_array(v, buffer),
            PvValue::LongArray(v) => put_array(v, buffer),
            PvValue::UByteArray(v) => put_array(v, buffer),
            PvValue::UShortArray(v) => put_array(v, buffer),
            PvValue::UIntArray(v) => put_array(v, buffer),
            PvValue::ULongArray(v) => put_array(v, buffer),
            PvValue::FloatArray(v) => put_array(v, buffer),
            PvValue::DoubleArray(v) => put_array(v, buffer),
            PvValue::StringArray(v) => put_array(v, buffer),
            PvValue::Structure(s) => s.write(buffer),
            PvValue::StructureArray(_, items) => {
                buffer.put_size(Some(items.len()));
                for item in items {
                    match item {
                        Some(s) => {
                            buffer.put_u8(1);
                            s.write(buffer);
                        }
                        None => buffer.put_u8(0),
                    }
                }
            }
            PvValue::Union(u) => u.write(buffer),
            PvValue::UnionArray(_, items) => {
                buffer.put_size(Some(items.len()));
                for item in items {
                    match item {
                        Some(u) => {
                            buffer.put_u8(1);
                            u.write(buffer);
                        }
                        None => buffer.put_u8(0),
                    }
                }
            }
            PvValue::Any(value) => write_any(value.as_deref(), buffer),
            PvValue::AnyArray(items) => {
                buffer.put_size(Some(items.len()));
                for item in items {
                    match item {
                        Some(v) => {
                            buffer.put_u8(1);
                            write_any(Some(v), buffer);
                        }
                        None => buffer.put_u8(0),
                    }
                }
            }
        }
    }

    /// Number of element indices this value occupies in its parent structure
    pub fn element_count(&self) -> usize {
        match self {
            PvValue::Structure(s) => s.element_count(),
            _ => 1,
        }
    }

    /// Do two values have exactly the same type?
    pub fn same_shape(&self, other: &PvValue) -> bool {
        match (self, other) {
            (PvValue::Structure(a), PvValue::Structure(b)) => a.same_shape(b),
            _ => self.field_desc() == other.field_desc(),
        }
    }

    pub fn as_structure(&self) -> Option<&PvStructure> {
        match self {
            PvValue::Structure(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_structure(self) -> Option<PvStructure> {
        match self {
            PvValue::Structure(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PvValue::String(s) | PvValue::BoundedString(_, s) => Some(s),
            _ => None,
        }
    }

    /// Numeric scalar value, converted to a double
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            PvValue::Byte(v) => v.to_f64(),
            PvValue::Short(v) => v.to_f64(),
            PvValue::Int(v) => v.to_f64(),
            PvValue::Long(v) => v.to_f64(),
            PvValue::UByte(v) => v.to_f64(),
            PvValue::UShort(v) => v.to_f64(),
            PvValue::UInt(v) => v.to_f64(),
            PvValue::ULong(v) => v.to_f64(),
            PvValue::Float(v) => v.to_f64(),
            PvValue::Double(v) => Some(*v),
            PvValue::String(s) | PvValue::BoundedString(_, s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Set a numeric scalar from a double, keeping the value's type
    pub fn set_from_f64(&mut self, value: f64) -> Result<(), DataError> {
        fn cast<T: NumCast>(value: f64) -> Result<T, DataError> {
            NumCast::from(value)
                .ok_or_else(|| DataError::TypeMismatch(format!("{value} is out of range")))
        }
        match self {
            PvValue::Boolean(v) => *v = value != 0.0,
            PvValue::Byte(v) => *v = cast(value)?,
            PvValue::Short(v) => *v = cast(value)?,
            PvValue::Int(v) => *v = cast(value)?,
            PvValue::Long(v) => *v = cast(value)?,
            PvValue::UByte(v) => *v = cast(value)?,
            PvValue::UShort(v) => *v = cast(value)?,
            PvValue::UInt(v) => *v = cast(value)?,
            PvValue::ULong(v) => *v = cast(value)?,
            PvValue::Float(v) => *v = cast(value)?,
            PvValue::Double(v) => *v = value,
            PvValue::String(s) | PvValue::BoundedString(_, s) => *s = value.to_string(),
            other => {
                return Err(DataError::TypeMismatch(format!(
                    "Cannot set {} from a number",
                    other.field_desc().type_name()
                )));
            }
        }
        Ok(())
    }

    /// Merge `new` into this value, recording changed indices starting at `index`.
    ///
    /// Returns the index following this value. Shapes must already be known to match.
    fn update_from(&mut self, index: usize, new: &PvValue, changes: &mut BitSet) -> usize {
        match (self, new) {
            (PvValue::Structure(mine), PvValue::Structure(theirs)) => {
                mine.update_from(index, theirs, changes)
            }
            (mine, theirs) => {
                if mine != theirs {
                    mine.clone_from(theirs);
                    changes.set(index);
                }
                index + 1
            }
        }
    }
}

fn write_any(value: Option<&PvValue>, buffer: &mut WireBuffer) {
    match value {
        Some(value) => {
            value.field_desc().write(buffer);
            value.write(buffer);
        }
        None => FieldDesc::write_optional(None, buffer),
    }
}

fn parse_any<'a>(
    order: ByteOrder,
    types: &mut TypeRegistry,
    input: &'a [u8],
) -> IResult<&'a [u8], Option<PvValue>> {
    let (input, desc) = types.parse_field_desc(order, input)?;
    match desc {
        Some(desc) => {
            let (input, value) = desc.parse_value(order, types, input)?;
            Ok((input, Some(value)))
        }
        None => Ok((input, None)),
    }
}

/// Parse a list where every element is preceded by a "present" flag
fn parse_nullable_items<'a, T>(
    order: ByteOrder,
    input: &'a [u8],
    mut item: impl FnMut(&'a [u8]) -> IResult<&'a [u8], T>,
) -> IResult<&'a [u8], Vec<Option<T>>> {
    let (mut input, n) = parse_count(order, input)?;
    let mut items = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        let (rest, present) = parse_bool(input)?;
        if present {
            let (rest, value) = item(rest)?;
            items.push(Some(value));
            input = rest;
        } else {
            items.push(None);
            input = rest;
        }
    }
    Ok((input, items))
}

impl FieldDesc {
    /// Default ("zero") value of this type
    pub fn default_value(&self) -> PvValue {
        match self {
            FieldDesc::Scalar(t) => match t {
                ScalarType::Boolean => PvValue::Boolean(false),
                ScalarType::Byte => PvValue::Byte(0),
                ScalarType::Short => PvValue::Short(0),
                ScalarType::Int => PvValue::Int(0),
                ScalarType::Long => PvValue::Long(0),
                ScalarType::UByte => PvValue::UByte(0),
                ScalarType::UShort => PvValue::UShort(0),
                ScalarType::UInt => PvValue::UInt(0),
                ScalarType::ULong => PvValue::ULong(0),
                ScalarType::Float => PvValue::Float(0.0),
                ScalarType::Double => PvValue::Double(0.0),
                ScalarType::String => PvValue::String(String::new()),
            },
            FieldDesc::ScalarArray(t) => match t {
                ScalarType::Boolean => PvValue::BooleanArray(Vec::new()),
                ScalarType::Byte => PvValue::ByteArray(Vec::new()),
                ScalarType::Short => PvValue::ShortArray(Vec::new()),
                ScalarType::Int => PvValue::IntArray(Vec::new()),
                ScalarType::Long => PvValue::LongArray(Vec::new()),
                ScalarType::UByte => PvValue::UByteArray(Vec::new()),
                ScalarType::UShort => PvValue::UShortArray(Vec::new()),
                ScalarType::UInt => PvValue::UIntArray(Vec::new()),
                ScalarType::ULong => PvValue::ULongArray(Vec::new()),
                ScalarType::Float => PvValue::FloatArray(Vec::new()),
                ScalarType::Double => PvValue::DoubleArray(Vec::new()),
                ScalarType::String => PvValue::StringArray(Vec::new()),
            },
            FieldDesc::BoundedString(bound) => PvValue::BoundedString(*bound, String::new()),
            FieldDesc::Structure(desc) => PvValue::Structure(PvStructure::from_desc(desc)),
            FieldDesc::StructureArray(desc) => PvValue::StructureArray(desc.clone(), Vec::new()),
            FieldDesc::Union(desc) => PvValue::Union(PvUnion::new(desc.clone())),
            FieldDesc::UnionArray(desc) => PvValue::UnionArray(desc.clone(), Vec::new()),
            FieldDesc::Any => PvValue::Any(None),
            FieldDesc::AnyArray => PvValue::AnyArray(Vec::new()),
        }
    }

    /// Parse a value of this type
    pub fn parse_value<'a>(
        &self,
        order: ByteOrder,
        types: &mut TypeRegistry,
        input: &'a [u8],
    ) -> IResult<&'a [u8], PvValue> {
        types.nested(input, |types| self.parse_value_inner(order, types, input))
    }

    fn parse_value_inner<'a>(
        &self,
        order: ByteOrder,
        types: &mut TypeRegistry,
        input: &'a [u8],
    ) -> IResult<&'a [u8], PvValue> {
        macro_rules! scalar {
            ($variant:ident, $typ:ty) => {{
                let (input, v) = <$typ>::parse(order, input)?;
                Ok((input, PvValue::$variant(v)))
            }};
        }
        macro_rules! array {
            ($variant:ident, $typ:ty) => {{
                let (input, v) = parse_array::<$typ>(order, input)?;
                Ok((input, PvValue::$variant(v)))
            }};
        }
        match self {
            FieldDesc::Scalar(t) => match t {
                ScalarType::Boolean => scalar!(Boolean, bool),
                ScalarType::Byte => scalar!(Byte, i8),
                ScalarType::Short => scalar!(Short, i16),
                ScalarType::Int => scalar!(Int, i32),
                ScalarType::Long => scalar!(Long, i64),
                ScalarType::UByte => scalar!(UByte, u8),
                ScalarType::UShort => scalar!(UShort, u16),
                ScalarType::UInt => scalar!(UInt, u32),
                ScalarType::ULong => scalar!(ULong, u64),
                ScalarType::Float => scalar!(Float, f32),
                ScalarType::Double => scalar!(Double, f64),
                ScalarType::String => scalar!(String, String),
            },
            FieldDesc::ScalarArray(t) => match t {
                ScalarType::Boolean => array!(BooleanArray, bool),
                ScalarType::Byte => array!(ByteArray, i8),
                ScalarType::Short => array!(ShortArray, i16),
                ScalarType::Int => array!(IntArray, i32),
                ScalarType::Long => array!(LongArray, i64),
                ScalarType::UByte => array!(UByteArray, u8),
                ScalarType::UShort => array!(UShortArray, u16),
                ScalarType::UInt => array!(UIntArray, u32),
                ScalarType::ULong => array!(ULongArray, u64),
                ScalarType::Float => array!(FloatArray, f32),
                ScalarType::Double => array!(DoubleArray, f64),
                ScalarType::String => array!(StringArray, String),
            },
            FieldDesc::BoundedString(bound) => {
                let (input, s) = parse_string(order, input)?;
                Ok((input, PvValue::BoundedString(*bound, s)))
            }
            FieldDesc::Structure(desc) => {
                let (input, s) = PvStructure::parse(desc, order, types, input)?;
                Ok((input, PvValue::Structure(s)))
            }
            FieldDesc::StructureArray(desc) => {
                let (input, items) = parse_nullable_items(order, input, |i| {
                    PvStructure::parse(desc, order, types, i)
                })?;
                Ok((input, PvValue::StructureArray(desc.clone(), items)))
            }
            FieldDesc::Union(desc) => {
                let (input, u) = PvUnion::parse(desc, order, types, input)?;
                Ok((input, PvValue::Union(u)))
            }
            FieldDesc::UnionArray(desc) => {
                let (input, items) =
                    parse_nullable_items(order, input, |i| PvUnion::parse(desc, order, types, i))?;
                Ok((input, PvValue::UnionArray(desc.clone(), items)))
            }
            FieldDesc::Any => {
                let (input, value) = parse_any(order, types, input)?;
                Ok((input, PvValue::Any(value.map(Box::new))))
            }
            FieldDesc::AnyArray => {
                let (input, items) = parse_nullable_items(order, input, |i| {
                    let (i, value) = parse_any(order, types, i)?;
                    Ok((i, value.unwrap_or(PvValue::Any(None))))
                })?;
                Ok((input, PvValue::AnyArray(items)))
            }
        }
    }
}

/// One named field of a structure
#[derive(Debug, Clone, PartialEq)]
pub struct PvField {
    pub name: String,
    pub value: PvValue,
}

/// Structured value: an optional type ID and an ordered list of named fields
///
/// Elements are addressed by index: 0 is the structure itself, then the fields in
/// depth-first order, so a sub-structure's index is followed by the indices of its
/// own fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PvStructure {
    pub type_id: String,
    pub fields: Vec<PvField>,
}

impl PvStructure {
    pub fn new(type_id: impl Into<String>) -> Self {
        PvStructure {
            type_id: type_id.into(),
            fields: Vec::new(),
        }
    }

    /// Structure with all fields at their default values
    pub fn from_desc(desc: &StructureDesc) -> Self {
        PvStructure {
            type_id: desc.type_id.clone(),
            fields: desc
                .fields
                .iter()
                .map(|(name, field)| PvField {
                    name: name.clone(),
                    value: field.default_value(),
                })
                .collect(),
        }
    }

    pub fn desc(&self) -> StructureDesc {
        StructureDesc {
            type_id: self.type_id.clone(),
            fields: self
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.value.field_desc()))
                .collect(),
        }
    }

    pub fn field_desc(&self) -> FieldDesc {
        FieldDesc::Structure(self.desc())
    }

    pub fn get(&self, name: &str) -> Option<&PvValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PvValue> {
        self.fields
            .iter_mut()
            .find(|f| f.name == name)
            .map(|f| &mut f.value)
    }

    /// Find a field by dotted path, e.g. `"alarm.severity"`
    pub fn locate(&self, path: &str) -> Option<&PvValue> {
        match path.split_once('.') {
            None => self.get(path),
            Some((head, tail)) => self.get(head)?.as_structure()?.locate(tail),
        }
    }

    pub fn locate_mut(&mut self, path: &str) -> Option<&mut PvValue> {
        match path.split_once('.') {
            None => self.get_mut(path),
            Some((head, tail)) => match self.get_mut(head)? {
                PvValue::Structure(s) => s.locate_mut(tail),
                _ => None,
            },
        }
    }

    /// Element index of a dotted path
    pub fn index_of(&self, path: &str) -> Option<usize> {
        let (head, tail) = match path.split_once('.') {
            Some((head, tail)) => (head, Some(tail)),
            None => (path, None),
        };
        let mut index = 1;
        for field in &self.fields {
            if field.name == head {
                return match (tail, &field.value) {
                    (None, _) => Some(index),
                    (Some(tail), PvValue::Structure(s)) => Some(index + s.index_of(tail)?),
                    _ => None,
                };
            }
            index += field.value.element_count();
        }
        None
    }

    /// Field at an element index. Index 0, the structure itself, is not a field.
    pub fn get_by_index(&self, index: usize) -> Option<&PvValue> {
        let mut current = 1;
        for field in &self.fields {
            let count = field.value.element_count();
            if index == current {
                return Some(&field.value);
            }
            if index < current + count {
                return field.value.as_structure()?.get_by_index(index - current);
            }
            current += count;
        }
        None
    }

    /// Number of element indices, including the structure itself
    pub fn element_count(&self) -> usize {
        1 + self
            .fields
            .iter()
            .map(|f| f.value.element_count())
            .sum::<usize>()
    }

    pub fn same_shape(&self, other: &PvStructure) -> bool {
        self.type_id == other.type_id
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(a, b)| a.name == b.name && a.value.same_shape(&b.value))
    }

    /// Copy the values of `new` into this structure
    ///
    /// Returns the indices of changed elements. When every element of a
    /// (sub)structure changed, only the bit of that structure is set. A structure
    /// of a different shape is rejected without modifying anything.
    pub fn update(&mut self, new: &PvStructure) -> Result<BitSet, DataError> {
        if !self.same_shape(new) {
            return Err(DataError::Incompatible(format!(
                "expected {} but got {}",
                self.field_desc().type_name(),
                new.field_desc().type_name()
            )));
        }
        let mut changes = BitSet::new();
        self.update_from(0, new, &mut changes);
        Ok(changes)
    }

    fn update_from(&mut self, index: usize, new: &PvStructure, changes: &mut BitSet) -> usize {
        if self.fields.is_empty() {
            return index + 1;
        }
        let mut changed = BitSet::new();
        let mut all_changed = true;
        let mut element = index + 1;
        for (mine, theirs) in self.fields.iter_mut().zip(&new.fields) {
            let next = mine.value.update_from(element, &theirs.value, &mut changed);
            if !changed.get(element) {
                all_changed = false;
            }
            element = next;
        }
        if all_changed {
            changes.set(index);
        } else {
            changes.union_with(&changed);
        }
        element
    }

    pub fn write(&self, buffer: &mut WireBuffer) {
        for field in &self.fields {
            field.value.write(buffer);
        }
    }

    /// Write the elements selected by `bits`
    ///
    /// A set structure bit covers all elements of that structure, which are then
    /// written only once.
    pub fn write_changed(&self, bits: &BitSet, buffer: &mut WireBuffer) {
        self.write_selected(0, bits, buffer);
    }

    fn write_selected(&self, index: usize, bits: &BitSet, buffer: &mut WireBuffer) {
        if bits.get(index) {
            self.write(buffer);
            return;
        }
        let mut element = index + 1;
        for field in &self.fields {
            match &field.value {
                PvValue::Structure(s) => s.write_selected(element, bits, buffer),
                value if bits.get(element) => value.write(buffer),
                _ => (),
            }
            element += field.value.element_count();
        }
    }

    pub fn parse<'a>(
        desc: &StructureDesc,
        order: ByteOrder,
        types: &mut TypeRegistry,
        mut input: &'a [u8],
    ) -> IResult<&'a [u8], PvStructure> {
        let mut fields = Vec::with_capacity(desc.fields.len());
        for (name, field) in &desc.fields {
            let (rest, value) = field.parse_value(order, types, input)?;
            fields.push(PvField {
                name: name.clone(),
                value,
            });
            input = rest;
        }
        Ok((
            input,
            PvStructure {
                type_id: desc.type_id.clone(),
                fields,
            },
        ))
    }

    /// Read the elements selected by `bits` into this structure, leaving the rest
    pub fn parse_changed<'a>(
        &mut self,
        bits: &BitSet,
        order: ByteOrder,
        types: &mut TypeRegistry,
        input: &'a [u8],
    ) -> IResult<&'a [u8], ()> {
        self.parse_selected(0, bits, order, types, input)
    }

    fn parse_selected<'a>(
        &mut self,
        index: usize,
        bits: &BitSet,
        order: ByteOrder,
        types: &mut TypeRegistry,
        mut input: &'a [u8],
    ) -> IResult<&'a [u8], ()> {
        let whole = bits.get(index);
        let mut element = index + 1;
        for field in self.fields.iter_mut() {
            let count = field.value.element_count();
            input = match &mut field.value {
                PvValue::Structure(s) if !whole => {
                    s.parse_selected(element, bits, order, types, input)?.0
                }
                value if whole || bits.get(element) => {
                    let desc = value.field_desc();
                    let (rest, parsed) = desc.parse_value(order, types, input)?;
                    *value = parsed;
                    rest
                }
                _ => input,
            };
            element += count;
        }
        Ok((input, ()))
    }
}

/// Fluent construction of a [`PvStructure`]
pub struct StructureBuilder {
    structure: PvStructure,
}

impl StructureBuilder {
    pub fn new(type_id: impl Into<String>) -> Self {
        StructureBuilder {
            structure: PvStructure::new(type_id),
        }
    }
    pub fn add(mut self, name: impl Into<String>, value: PvValue) -> Self {
        self.structure.fields.push(PvField {
            name: name.into(),
            value,
        });
        self
    }
    pub fn add_structure(self, name: impl Into<String>, value: PvStructure) -> Self {
        self.add(name, PvValue::Structure(value))
    }
    pub fn build(self) -> PvStructure {
        self.structure
    }
}
