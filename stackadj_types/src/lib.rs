pub mod id;
pub mod kind;
pub mod layout;
pub mod region;
pub mod shadow;
