pub mod domain;
pub mod event;
pub mod store;
