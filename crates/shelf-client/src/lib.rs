//! Task submission & polling client for the shelf processing backend.

pub mod api;
pub mod cleanup;
pub mod error;
pub mod poller;

pub use api::{GenerationApi, HttpApi, HttpApiBuilder};
pub use cleanup::CleanupPolicy;
pub use error::{Error, Result};
pub use poller::{
    NoticeLevel, PollEvent, PollHandle, PollSet, PollSettings, Poller, RequestSlot, RequestState,
};
