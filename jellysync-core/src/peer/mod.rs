//! Typed REST client for one peer media server.

pub mod client;
pub mod error;
pub mod types;

pub use client::{PeerClient, LIBRARY_PAGE_SIZE};
pub use error::{check_response, PeerError};
pub use types::{
    ItemDto, ItemsPage, PublicSystemInfo, UserDataDto, UserDataUpdate, UserDto, UserPolicy,
};
