// annosync-common: shared types for the annosync workspace

pub mod event;
pub mod protocol;
pub mod types;
pub mod xfdf;
