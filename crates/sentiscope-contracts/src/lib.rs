pub mod credentials;
pub mod csv;
pub mod errors;
pub mod events;
pub mod records;
pub mod runs;
pub mod store;
