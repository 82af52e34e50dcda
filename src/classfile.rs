//! Default entity classifier: reads the header, constant pool and member
//! tables of a JVM classfile.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::entity::{Entity, EntityClassifier};
use crate::error::ClassificationError;

pub const CLASSFILE_MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    Field,
    Method,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ClassMember {
    pub kind: MemberKind,
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    pub owner: String,
}

impl ClassMember {
    pub fn is_public(&self) -> bool {
        self.access_flags & 0x0001 != 0
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & 0x0008 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JavaClass {
    /// Binary name with dots, e.g. `org.example.Foo$Bar`.
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub access_flags: u16,
    pub major_version: u16,
    pub members: Vec<ClassMember>,
    pub digest: String,
}

impl JavaClass {
    pub fn simple_name(&self) -> &str {
        self.name.rsplit(['.', '$']).next().unwrap_or(&self.name)
    }

    pub fn package(&self) -> &str {
        self.name.rsplit_once('.').map(|(pkg, _)| pkg).unwrap_or("")
    }

    /// `org/example/Foo$Bar.class` for `org.example.Foo$Bar`.
    pub fn class_file_path(&self) -> String {
        format!("{}.class", self.name.replace('.', "/"))
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & 0x0200 != 0
    }

    pub fn methods(&self) -> impl Iterator<Item = &ClassMember> {
        self.members.iter().filter(|m| m.kind == MemberKind::Method)
    }

    pub fn fields(&self) -> impl Iterator<Item = &ClassMember> {
        self.members.iter().filter(|m| m.kind == MemberKind::Field)
    }
}

impl Entity for JavaClass {
    type Member = ClassMember;

    fn key(&self) -> &str {
        &self.name
    }

    fn members(&self) -> &[ClassMember] {
        &self.members
    }

    fn relative_path(&self) -> Option<String> {
        Some(self.class_file_path())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ClassFileClassifier;

impl EntityClassifier for ClassFileClassifier {
    type Entity = JavaClass;

    fn classify(&self, bytes: &[u8], declared_path: &str) -> Result<JavaClass, ClassificationError> {
        parse_class(bytes).map_err(|reason| ClassificationError::new(declared_path, reason))
    }
}

pub fn hash_content(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
enum Constant {
    Utf8(String),
    Class(u16),
    Other,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(format!("truncated at byte {}", self.pos)),
        }
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

struct ConstantPool(Vec<Constant>);

impl ConstantPool {
    fn utf8(&self, index: u16) -> Result<&str, String> {
        match self.0.get(index as usize) {
            Some(Constant::Utf8(s)) => Ok(s),
            _ => Err(format!("constant #{index} is not a utf8 entry")),
        }
    }

    fn class_name(&self, index: u16) -> Result<String, String> {
        match self.0.get(index as usize) {
            Some(Constant::Class(name_index)) => Ok(self.utf8(*name_index)?.replace('/', ".")),
            _ => Err(format!("constant #{index} is not a class entry")),
        }
    }
}

pub fn parse_class(bytes: &[u8]) -> Result<JavaClass, String> {
    let mut r = Reader { bytes, pos: 0 };
    if r.take(4)? != CLASSFILE_MAGIC {
        return Err("missing classfile magic".to_string());
    }
    let _minor = r.u16()?;
    let major_version = r.u16()?;
    let pool = read_constant_pool(&mut r)?;

    let access_flags = r.u16()?;
    let name = pool.class_name(r.u16()?)?;
    let super_index = r.u16()?;
    let super_name = if super_index == 0 {
        None
    } else {
        Some(pool.class_name(super_index)?)
    };

    let interface_count = r.u16()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        interfaces.push(pool.class_name(r.u16()?)?);
    }

    let mut members = Vec::new();
    for kind in [MemberKind::Field, MemberKind::Method] {
        let count = r.u16()?;
        for _ in 0..count {
            let flags = r.u16()?;
            let member_name = pool.utf8(r.u16()?)?.to_string();
            let descriptor = pool.utf8(r.u16()?)?.to_string();
            skip_attributes(&mut r)?;
            members.push(ClassMember {
                kind,
                name: member_name,
                descriptor,
                access_flags: flags,
                owner: name.clone(),
            });
        }
    }

    Ok(JavaClass {
        name,
        super_name,
        interfaces,
        access_flags,
        major_version,
        members,
        digest: hash_content(bytes),
    })
}

fn read_constant_pool(r: &mut Reader<'_>) -> Result<ConstantPool, String> {
    let count = r.u16()? as usize;
    let mut entries = vec![Constant::Other; count.max(1)];
    let mut index = 1;
    while index < count {
        let tag = r.u8()?;
        match tag {
            1 => {
                let len = r.u16()? as usize;
                entries[index] = Constant::Utf8(String::from_utf8_lossy(r.take(len)?).into_owned());
            }
            7 => entries[index] = Constant::Class(r.u16()?),
            8 | 16 | 19 | 20 => {
                r.take(2)?;
            }
            15 => {
                r.take(3)?;
            }
            3 | 4 | 9 | 10 | 11 | 12 | 17 | 18 => {
                r.take(4)?;
            }
            5 | 6 => {
                r.take(8)?;
                // long and double occupy two slots
                index += 1;
            }
            other => return Err(format!("unknown constant tag {other} at #{index}")),
        }
        index += 1;
    }
    Ok(ConstantPool(entries))
}

fn skip_attributes(r: &mut Reader<'_>) -> Result<(), String> {
    let count = r.u16()?;
    for _ in 0..count {
        let _name = r.u16()?;
        let len = r.u32()? as usize;
        r.take(len)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(pool: &mut Vec<u8>, s: &str) {
        pool.push(1);
        pool.extend_from_slice(&(s.len() as u16).to_be_bytes());
        pool.extend_from_slice(s.as_bytes());
    }

    /// `name` with one public method per entry of `methods`.
    fn class_bytes(name: &str, methods: &[&str]) -> Vec<u8> {
        let mut pool = Vec::new();
        utf8(&mut pool, &name.replace('.', "/")); // #1
        pool.extend_from_slice(&[7, 0, 1]); // #2
        utf8(&mut pool, "java/lang/Object"); // #3
        pool.extend_from_slice(&[7, 0, 3]); // #4
        utf8(&mut pool, "()V"); // #5
        pool.extend_from_slice(&[5, 0, 0, 0, 0, 0, 0, 0, 1]); // #6, #7
        for m in methods {
            utf8(&mut pool, m);
        }
        let count = 8 + methods.len() as u16;

        let mut out = CLASSFILE_MAGIC.to_vec();
        out.extend_from_slice(&[0, 0, 0, 52]);
        out.extend_from_slice(&count.to_be_bytes());
        out.extend_from_slice(&pool);
        out.extend_from_slice(&[0x00, 0x21, 0, 2, 0, 4, 0, 0, 0, 0]);
        out.extend_from_slice(&(methods.len() as u16).to_be_bytes());
        for i in 0..methods.len() as u16 {
            out.extend_from_slice(&[0, 1]);
            out.extend_from_slice(&(8 + i).to_be_bytes());
            out.extend_from_slice(&[0, 5, 0, 0]);
        }
        out.extend_from_slice(&[0, 0]);
        out
    }

    #[test]
    fn parses_names_and_members() {
        let class = parse_class(&class_bytes("org.example.Foo", &["run", "stop"])).unwrap();
        assert_eq!(class.name, "org.example.Foo");
        assert_eq!(class.simple_name(), "Foo");
        assert_eq!(class.package(), "org.example");
        assert_eq!(class.super_name.as_deref(), Some("java.lang.Object"));
        assert_eq!(class.major_version, 52);
        let names: Vec<&str> = class.methods().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["run", "stop"]);
        assert!(class.methods().all(|m| m.is_public() && m.descriptor == "()V" && m.owner == class.name));
        assert_eq!(class.fields().count(), 0);
        assert_eq!(class.digest.len(), 64);
    }

    #[test]
    fn rejects_truncated_and_foreign_bytes() {
        let bytes = class_bytes("A", &[]);
        let classifier = ClassFileClassifier;
        let err = classifier.classify(&bytes[..bytes.len() - 3], "/r/A.class").unwrap_err();
        assert_eq!(err.path, "/r/A.class");
        assert!(classifier.classify(b"PK\x03\x04", "/r/x.class").is_err());
    }

    #[test]
    fn digest_is_stable() {
        let bytes = class_bytes("A", &["m"]);
        assert_eq!(parse_class(&bytes).unwrap().digest, hash_content(&bytes));
    }
}
