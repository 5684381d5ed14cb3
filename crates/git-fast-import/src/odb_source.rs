//! Adapts [`git_odb::ObjectDatabase`] to [`git_pack::ObjectSource`] so the
//! engine can resolve objects that already exist on disk (thin-pack bases,
//! `from`/`merge` parents, `M`/`N` entries referencing objects by hex id)
//! through the same interface `ThinPackCompleter` and the indexer use.

use git_hash::ObjectId;
use git_object::ObjectType;
use git_pack::{ObjectSource, PackError};

pub struct OdbSource<'a>(pub &'a git_odb::ObjectDatabase);

impl ObjectSource for OdbSource<'_> {
    fn contains(&self, id: &ObjectId) -> bool {
        self.0.contains(id)
    }

    fn read(&self, id: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError> {
        match self.0.read(id) {
            Ok(Some(obj)) => Ok(Some((obj.object_type(), obj.serialize_content()))),
            Ok(None) => Ok(None),
            Err(err) => Err(PackError::ResourceLimit(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git_object::{Blob, Object};

    #[test]
    fn reads_through_to_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let objects_dir = dir.path().join("objects");
        std::fs::create_dir_all(&objects_dir).unwrap();
        let odb = git_odb::ObjectDatabase::open(&objects_dir).unwrap();

        let blob = Object::Blob(Blob::new(b"hello".to_vec()));
        let id = odb.write(&blob).unwrap();

        let source = OdbSource(&odb);
        assert!(source.contains(&id));
        let (obj_type, data) = source.read(&id).unwrap().unwrap();
        assert_eq!(obj_type, ObjectType::Blob);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn missing_object_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let objects_dir = dir.path().join("objects");
        std::fs::create_dir_all(&objects_dir).unwrap();
        let odb = git_odb::ObjectDatabase::open(&objects_dir).unwrap();
        let source = OdbSource(&odb);
        let missing = ObjectId::from_hex("0000000000000000000000000000000000000001").unwrap();
        assert!(!source.contains(&missing));
        assert_eq!(source.read(&missing).unwrap(), None);
    }
}
