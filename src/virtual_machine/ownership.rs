//! Persistent identity and ownership metadata carried by every heap object.

use crate::types::hash::Hash;
use crate::virtual_machine::values::ObjRef;
use gnovm_derive::BinaryCodec;
use std::fmt;

/// Realm identifier, derived from the package path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BinaryCodec)]
pub struct PkgId(pub Hash);

impl PkgId {
    pub fn from_path(path: &str) -> Self {
        PkgId(Hash::digest(path.as_bytes()))
    }
}

impl fmt::Debug for PkgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.short())
    }
}

/// Realm id plus the realm's monotonic ordinal at creation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BinaryCodec)]
pub struct ObjectId {
    pub pkg: PkgId,
    pub time: u64,
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pkg.0.short(), self.time)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Ownership and persistence state of one object.
///
/// An object is real once it has an id. `owner` is the single strong owner;
/// other references to an escaped object resolve through its id.
#[derive(Clone, Debug, Default)]
pub struct ObjectInfo {
    pub id: Option<ObjectId>,
    pub hash: Hash,
    pub owner: Option<ObjRef>,
    pub ref_count: u32,
    pub mod_time: u64,
    pub is_new_real: bool,
    pub is_dirty: bool,
    pub is_deleted: bool,
    pub is_new_deleted: bool,
    pub is_escaped: bool,
    pub is_new_escaped: bool,
}

impl ObjectInfo {
    pub fn is_real(&self) -> bool {
        self.id.is_some()
    }

    pub fn clear_marks(&mut self) {
        self.is_new_real = false;
        self.is_dirty = false;
        self.is_new_deleted = false;
        self.is_new_escaped = false;
    }
}

/// Hashed part of an object's metadata. The content hash itself is
/// excluded so it can be computed over this image.
#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct InfoImage {
    pub id: ObjectId,
    pub owner: Option<ObjectId>,
    pub ref_count: u32,
    pub mod_time: u64,
    pub is_escaped: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::{Decode, Encode};

    #[test]
    fn pkg_id_is_deterministic() {
        assert_eq!(
            PkgId::from_path("gno.land/r/demo"),
            PkgId::from_path("gno.land/r/demo")
        );
        assert_ne!(
            PkgId::from_path("gno.land/r/demo"),
            PkgId::from_path("gno.land/r/other")
        );
    }

    #[test]
    fn object_id_orders_by_time_within_realm() {
        let pkg = PkgId::from_path("gno.land/r/demo");
        let a = ObjectId { pkg, time: 1 };
        let b = ObjectId { pkg, time: 2 };
        assert!(a < b);
        assert!(a.to_string().ends_with(":1"));
    }

    #[test]
    fn info_image_codec() {
        let pkg = PkgId::from_path("p");
        let image = InfoImage {
            id: ObjectId { pkg, time: 3 },
            owner: Some(ObjectId { pkg, time: 1 }),
            ref_count: 1,
            mod_time: 4,
            is_escaped: false,
        };
        assert_eq!(InfoImage::from_bytes(&image.to_bytes()).unwrap(), image);
    }

    #[test]
    fn realness_follows_id() {
        let mut info = ObjectInfo::default();
        assert!(!info.is_real());
        info.id = Some(ObjectId::default());
        info.is_dirty = true;
        info.clear_marks();
        assert!(info.is_real());
        assert!(!info.is_dirty);
    }
}
