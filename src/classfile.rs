//! Minimal reader for JVM class files.
//!
//! Only what construct discovery and probe insertion need is decoded: the
//! constant pool (names only), access flags, the class name, the method table
//! and the names of class-level attributes. All other structures are skipped
//! by length. Offsets into the original bytes are kept so that a class
//! attribute can be appended without re-encoding the rest of the file.

use crate::construct::{ConstructId, ConstructKind, package_of};
use crate::error::ClassFileError;

const MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;
pub const ACC_ANNOTATION: u16 = 0x2000;
pub const ACC_ENUM: u16 = 0x4000;
pub const ACC_BRIDGE: u16 = 0x0040;

#[derive(Debug, Clone)]
enum Constant {
    Unusable,
    Utf8(String),
    Class(u16),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
}

impl MemberInfo {
    pub fn is_synthetic(&self) -> bool {
        self.access_flags & (ACC_SYNTHETIC | ACC_BRIDGE) != 0
    }
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    bytes: Vec<u8>,
    pub major_version: u16,
    pub access_flags: u16,
    name: String,
    pub methods: Vec<MemberInfo>,
    attribute_names: Vec<String>,
    constant_pool_count: u16,
    constant_pool_end: usize,
    attributes_count_offset: usize,
    attributes_count: u16,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ClassFileError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(ClassFileError::Truncated(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ClassFileError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ClassFileError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ClassFileError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn skip(&mut self, n: usize) -> Result<(), ClassFileError> {
        self.take(n).map(|_| ())
    }
}

impl ClassFile {
    pub fn parse(bytes: Vec<u8>) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(&bytes);
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        let _minor = r.u16()?;
        let major_version = r.u16()?;

        let constant_pool_count = r.u16()?;
        let mut pool = vec![Constant::Unusable; constant_pool_count as usize];
        let mut index = 1u16;
        while index < constant_pool_count {
            let tag = r.u8()?;
            let mut width = 1u16;
            pool[index as usize] = match tag {
                1 => {
                    let len = r.u16()? as usize;
                    Constant::Utf8(String::from_utf8_lossy(r.take(len)?).into_owned())
                }
                7 => Constant::Class(r.u16()?),
                8 | 16 | 19 | 20 => {
                    r.skip(2)?;
                    Constant::Other
                }
                15 => {
                    r.skip(3)?;
                    Constant::Other
                }
                3 | 4 | 9 | 10 | 11 | 12 | 17 | 18 => {
                    r.skip(4)?;
                    Constant::Other
                }
                5 | 6 => {
                    r.skip(8)?;
                    width = 2;
                    Constant::Other
                }
                tag => return Err(ClassFileError::UnknownConstantTag { tag, index }),
            };
            index = index.saturating_add(width);
        }
        let constant_pool_end = r.pos;

        let access_flags = r.u16()?;
        let this_class = r.u16()?;
        let _super_class = r.u16()?;
        let interfaces = r.u16()? as usize;
        r.skip(interfaces * 2)?;

        let utf8 = |idx: u16| -> Result<String, ClassFileError> {
            match pool.get(idx as usize) {
                Some(Constant::Utf8(s)) => Ok(s.clone()),
                _ => Err(ClassFileError::BadConstantIndex(idx)),
            }
        };

        let name = match pool.get(this_class as usize) {
            Some(Constant::Class(name_idx)) => utf8(*name_idx)?.replace('/', "."),
            _ => return Err(ClassFileError::BadConstantIndex(this_class)),
        };

        let fields = r.u16()?;
        for _ in 0..fields {
            r.skip(6)?;
            skip_attributes(&mut r)?;
        }

        let method_count = r.u16()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            let access_flags = r.u16()?;
            let name = utf8(r.u16()?)?;
            let descriptor = utf8(r.u16()?)?;
            skip_attributes(&mut r)?;
            methods.push(MemberInfo {
                access_flags,
                name,
                descriptor,
            });
        }

        let attributes_count_offset = r.pos;
        let attributes_count = r.u16()?;
        let mut attribute_names = Vec::with_capacity(attributes_count as usize);
        for _ in 0..attributes_count {
            attribute_names.push(utf8(r.u16()?)?);
            let len = r.u32()? as usize;
            r.skip(len)?;
        }

        Ok(Self {
            bytes,
            major_version,
            access_flags,
            name,
            methods,
            attribute_names,
            constant_pool_count,
            constant_pool_end,
            attributes_count_offset,
            attributes_count,
        })
    }

    /// Binary name with `.` separators, e.g. `a.b.Outer$Inner`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & (ACC_INTERFACE | ACC_ANNOTATION) != 0
    }

    pub fn is_enum(&self) -> bool {
        self.access_flags & ACC_ENUM != 0
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute_names.iter().any(|a| a == name)
    }

    /// Returns a copy of this class with one more class-level attribute.
    ///
    /// The attribute name is appended to the end of the constant pool so no
    /// existing index moves.
    pub fn with_class_attribute(&self, name: &str, payload: &[u8]) -> Result<Vec<u8>, ClassFileError> {
        let new_count = self
            .constant_pool_count
            .checked_add(1)
            .ok_or(ClassFileError::BadConstantIndex(self.constant_pool_count))?;
        let name_len = u16::try_from(name.len())
            .map_err(|_| ClassFileError::BadConstantIndex(self.constant_pool_count))?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| ClassFileError::Truncated(self.bytes.len()))?;

        let b = &self.bytes;
        let mut out = Vec::with_capacity(b.len() + name.len() + payload.len() + 16);
        out.extend_from_slice(&b[..8]);
        out.extend_from_slice(&new_count.to_be_bytes());
        out.extend_from_slice(&b[10..self.constant_pool_end]);
        out.push(1);
        out.extend_from_slice(&name_len.to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&b[self.constant_pool_end..self.attributes_count_offset]);
        out.extend_from_slice(&(self.attributes_count + 1).to_be_bytes());
        out.extend_from_slice(&b[self.attributes_count_offset + 2..]);
        out.extend_from_slice(&self.constant_pool_count.to_be_bytes());
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// The class itself, its package and every non-synthetic method,
    /// constructor and static initializer. Interfaces yield nothing.
    pub fn constructs(&self) -> Vec<ConstructId> {
        if self.is_interface() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(self.methods.len() + 2);
        if let Some(pkg) = package_of(&self.name) {
            out.push(ConstructId::java(ConstructKind::Package, pkg));
        }
        let kind = if self.is_enum() {
            ConstructKind::Enum
        } else {
            ConstructKind::Class
        };
        out.push(ConstructId::java(kind, self.name.clone()));

        for method in self.methods.iter().filter(|m| !m.is_synthetic()) {
            let params = match parameter_types(&method.descriptor) {
                Some(p) => p.join(","),
                None => continue,
            };
            let id = match method.name.as_str() {
                "<clinit>" => ConstructId::java(
                    ConstructKind::StaticInit,
                    format!("{}.<clinit>", self.name),
                ),
                "<init>" => ConstructId::java(
                    ConstructKind::Constructor,
                    format!("{}({params})", self.name),
                ),
                name => ConstructId::java(
                    ConstructKind::Method,
                    format!("{}.{name}({params})", self.name),
                ),
            };
            out.push(id);
        }
        out
    }
}

fn skip_attributes(r: &mut Reader<'_>) -> Result<(), ClassFileError> {
    let count = r.u16()?;
    for _ in 0..count {
        r.skip(2)?;
        let len = r.u32()? as usize;
        r.skip(len)?;
    }
    Ok(())
}

/// Parameter types of a method descriptor as simple names, e.g.
/// `(Ljava/lang/String;[I)V` gives `["String", "int[]"]`.
pub fn parameter_types(descriptor: &str) -> Option<Vec<String>> {
    let inner = descriptor.strip_prefix('(')?.split_once(')')?.0;
    let mut chars = inner.chars().peekable();
    let mut out = Vec::new();
    while chars.peek().is_some() {
        let mut dims = 0;
        while chars.peek() == Some(&'[') {
            chars.next();
            dims += 1;
        }
        let base = match chars.next()? {
            'B' => "byte".to_string(),
            'C' => "char".to_string(),
            'D' => "double".to_string(),
            'F' => "float".to_string(),
            'I' => "int".to_string(),
            'J' => "long".to_string(),
            'S' => "short".to_string(),
            'Z' => "boolean".to_string(),
            'L' => {
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    name.push(c);
                }
                name.rsplit('/').next().unwrap_or(&name).to_string()
            }
            _ => return None,
        };
        out.push(format!("{base}{}", "[]".repeat(dims)));
    }
    Some(out)
}
