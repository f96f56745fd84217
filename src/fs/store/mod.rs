pub mod attr;
pub mod name;

pub use attr::AttrStore;
pub use name::NameIndexStore;
