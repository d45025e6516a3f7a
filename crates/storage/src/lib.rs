#![forbid(unsafe_code)]

pub mod repository;
pub mod sqlite;

pub use repository::{
    ChapterLookup, ChapterRepository, InMemoryRepository, ProgressRepository, Storage,
    StorageError,
};
