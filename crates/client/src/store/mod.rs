pub mod annotation_index;
pub mod meta_db;

pub use annotation_index::{
    AnnotationIndex, LocalAnnotationRecord, PutOutcome, SqliteAnnotationIndex,
};
