pub mod credentials;
pub mod events;
pub mod items;
pub mod names;
pub mod session;
